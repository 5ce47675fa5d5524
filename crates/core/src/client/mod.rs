mod circuit;
mod clock;
mod limiter;
mod provider;
mod retry;

pub use circuit::{Admission, CircuitBreaker, CircuitState, ProviderState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{RateLimiter, RatePermit};
pub use provider::{ProviderAdapter, ProviderError};
pub use retry::{RetryOutcome, RetryPolicy};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, ConfigError, RateLimitConfig};
use crate::logging::{GenerationEvent, LogLevel, LogRecord, NullLogSink, SharedLogSink};
use crate::request::{GenerationOutput, GenerationRequest, ModelClass};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// Not attempted: circuit open or a probe already running.
    Skipped { reason: String },
    Failed {
        attempts: u32,
        last_error: ProviderError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderReport {
    pub provider: String,
    pub outcome: ProviderOutcome,
}

impl fmt::Display for ProviderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ProviderOutcome::Skipped { reason } => write!(f, "{} skipped ({reason})", self.provider),
            ProviderOutcome::Failed {
                attempts,
                last_error,
            } => write!(
                f,
                "{} failed after {attempts} attempt(s): {last_error}",
                self.provider
            ),
        }
    }
}

fn describe_reports(reports: &[ProviderReport]) -> String {
    reports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no providers routed for model class `{0}`")]
    NoRoute(ModelClass),
    #[error("all providers exhausted for model class `{model_class}`: {}", describe_reports(.reports))]
    AllProvidersExhausted {
        model_class: ModelClass,
        reports: Vec<ProviderReport>,
    },
}

/// Result of probing one provider.
#[derive(Clone, Debug)]
pub struct HealthReport {
    pub provider: String,
    pub model: String,
    pub circuit: CircuitState,
    pub result: Result<Duration, ProviderError>,
}

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    timeout: Duration,
}

/// Per-provider call options.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderOptions {
    pub timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

pub struct GenerationClientBuilder {
    retry: RetryPolicy,
    failure_threshold: u32,
    open_duration: Duration,
    routing: BTreeMap<ModelClass, Vec<String>>,
    options: BTreeMap<String, ProviderOptions>,
    adapters: Vec<(String, Arc<dyn ProviderAdapter>)>,
    clock: Arc<dyn Clock>,
    sink: SharedLogSink,
}

impl Default for GenerationClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClientBuilder {
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            retry: RetryPolicy::from_settings(&config.retry),
            failure_threshold: config.circuit.failure_threshold,
            open_duration: Duration::from_secs(config.circuit.open_seconds),
            routing: BTreeMap::new(),
            options: BTreeMap::new(),
            adapters: Vec::new(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(NullLogSink),
        }
    }

    /// Retry, circuit, routing and per-provider options from `config`.
    /// Adapters are registered separately.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new();
        builder.retry = RetryPolicy::from_settings(&config.retry);
        builder.failure_threshold = config.circuit.failure_threshold;
        builder.open_duration = Duration::from_secs(config.circuit.open_seconds);
        builder.routing = config.routing.clone();
        for (name, provider) in &config.providers {
            builder.options.insert(
                name.clone(),
                ProviderOptions {
                    timeout: config.timeout_for(name),
                    rate_limit: provider.rate_limit.clone(),
                },
            );
        }
        builder
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn circuit(mut self, failure_threshold: u32, open_duration: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.open_duration = open_duration;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(mut self, sink: SharedLogSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn route<I, S>(mut self, class: ModelClass, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing
            .insert(class, providers.into_iter().map(Into::into).collect());
        self
    }

    pub fn provider(mut self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push((name.into(), adapter));
        self
    }

    pub fn provider_options(mut self, name: impl Into<String>, options: ProviderOptions) -> Self {
        self.options.insert(name.into(), options);
        self
    }

    pub fn build(self) -> Result<GenerationClient, ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvariantViolation(
                "circuit failure threshold must be >= 1".to_string(),
            ));
        }

        let mut providers = BTreeMap::new();
        for (name, adapter) in self.adapters {
            let options = self.options.get(&name).cloned().unwrap_or_default();
            providers.insert(
                name,
                ProviderSlot {
                    adapter,
                    breaker: CircuitBreaker::new(self.failure_threshold, self.open_duration),
                    limiter: RateLimiter::from_config(&options.rate_limit, Arc::clone(&self.clock)),
                    timeout: options.timeout,
                },
            );
        }

        for (class, route) in &self.routing {
            if route.is_empty() {
                return Err(ConfigError::InvariantViolation(format!(
                    "no providers configured for model class `{class}`"
                )));
            }
            if let Some(missing) = route.iter().find(|name| !providers.contains_key(*name)) {
                return Err(ConfigError::InvariantViolation(format!(
                    "model class `{class}` routes to unregistered provider `{missing}`"
                )));
            }
        }

        Ok(GenerationClient {
            providers,
            routing: self.routing,
            retry: self.retry,
            clock: self.clock,
            sink: self.sink,
        })
    }
}

/// Routes requests across providers with retry, circuit breaking, fallback
/// and rate limiting. Provider state lives here and nowhere else.
pub struct GenerationClient {
    providers: BTreeMap<String, ProviderSlot>,
    routing: BTreeMap<ModelClass, Vec<String>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    sink: SharedLogSink,
}

impl GenerationClient {
    pub fn builder() -> GenerationClientBuilder {
        GenerationClientBuilder::new()
    }

    pub fn route(&self, class: ModelClass) -> &[String] {
        self.routing.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn provider_state(&self, name: &str) -> Option<ProviderState> {
        self.providers.get(name).map(|slot| slot.breaker.snapshot())
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let class = request.model_class;
        let route = self.route(class);
        if route.is_empty() {
            return Err(GenerationError::NoRoute(class));
        }

        let mut reports = Vec::with_capacity(route.len());
        for name in route {
            let Some(slot) = self.providers.get(name) else {
                continue;
            };

            let (admission, transition) = slot.breaker.admit(self.clock.now());
            self.report_transition(name, transition);
            let policy = match admission {
                Admission::Allowed => self.retry,
                Admission::Probe => self.retry.single_attempt(),
                Admission::Rejected { remaining } => {
                    let reason = if remaining.is_zero() {
                        "circuit half-open, probe in flight".to_string()
                    } else {
                        format!("circuit open for another {}s", remaining.as_secs())
                    };
                    self.sink.event(GenerationEvent::ProviderSkipped {
                        provider: name.clone(),
                        reason: reason.clone(),
                    });
                    reports.push(ProviderReport {
                        provider: name.clone(),
                        outcome: ProviderOutcome::Skipped { reason },
                    });
                    continue;
                }
            };

            let outcome = self.call_provider(name, slot, request, policy);
            match outcome.result {
                Ok(text) => {
                    let transition = slot.breaker.record_success();
                    self.report_transition(name, transition);
                    return Ok(GenerationOutput {
                        text,
                        provider: name.clone(),
                        model: slot.adapter.model(class),
                        attempts: outcome.attempts as usize,
                    });
                }
                Err(error) => {
                    let transition = slot.breaker.record_failure(self.clock.now());
                    self.sink.event(GenerationEvent::ProviderExhausted {
                        provider: name.clone(),
                        attempts: outcome.attempts as usize,
                        error: error.to_string(),
                    });
                    self.report_transition(name, transition);
                    reports.push(ProviderReport {
                        provider: name.clone(),
                        outcome: ProviderOutcome::Failed {
                            attempts: outcome.attempts,
                            last_error: error,
                        },
                    });
                }
            }
        }

        Err(GenerationError::AllProvidersExhausted {
            model_class: class,
            reports,
        })
    }

    fn call_provider(
        &self,
        name: &str,
        slot: &ProviderSlot,
        request: &GenerationRequest,
        policy: RetryPolicy,
    ) -> RetryOutcome<String> {
        let max_attempts = policy.max_attempts() as usize;
        policy.execute_observed(
            self.clock.as_ref(),
            |attempt| {
                self.sink.event(GenerationEvent::ProviderAttempt {
                    provider: name.to_string(),
                    model_class: request.model_class.to_string(),
                    attempt: attempt as usize + 1,
                    max_attempts,
                });
                let _permit = slot.limiter.acquire();
                let text = slot.adapter.invoke(request, slot.timeout)?;
                if text.trim().is_empty() {
                    return Err(ProviderError::retryable("provider returned empty content"));
                }
                Ok(text)
            },
            |attempt, delay, error| {
                self.sink.event(GenerationEvent::Retry {
                    provider: name.to_string(),
                    attempt: attempt as usize + 1,
                    delay,
                    error: error.to_string(),
                });
            },
        )
    }

    fn report_transition(&self, provider: &str, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.sink.event(GenerationEvent::CircuitStateChange {
                provider: provider.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    /// Probes every registered provider once, outside the circuit logic.
    pub fn health_check(&self, probe: &GenerationRequest) -> Vec<HealthReport> {
        self.providers
            .iter()
            .map(|(name, slot)| self.probe_slot(name, slot, probe))
            .collect()
    }

    /// Probes one provider; `None` when no provider of that name is
    /// registered. No other provider is contacted.
    pub fn health_check_provider(
        &self,
        name: &str,
        probe: &GenerationRequest,
    ) -> Option<HealthReport> {
        let slot = self.providers.get(name)?;
        Some(self.probe_slot(name, slot, probe))
    }

    fn probe_slot(
        &self,
        name: &str,
        slot: &ProviderSlot,
        probe: &GenerationRequest,
    ) -> HealthReport {
        let started = self.clock.now();
        let result = {
            let _permit = slot.limiter.acquire();
            slot.adapter.health_probe(probe, slot.timeout)
        }
        .map(|()| self.clock.now().saturating_duration_since(started));

        let level = if result.is_ok() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let message = match &result {
            Ok(elapsed) => format!("provider `{name}` healthy ({}ms)", elapsed.as_millis()),
            Err(error) => format!("provider `{name}` unhealthy: {error}"),
        };
        self.sink.log(LogRecord::new(level, message));

        HealthReport {
            provider: name.to_string(),
            model: slot.adapter.model(probe.model_class),
            circuit: slot.breaker.snapshot().circuit,
            result,
        }
    }
}
