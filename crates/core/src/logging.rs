use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    /// Stable event name for records produced from a [`GenerationEvent`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            event: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}

/// Structured events the generation core reports. Sinks receive them as
/// [`LogRecord`]s tagged with [`GenerationEvent::name`]; the core never
/// formats log lines for a particular output.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    ProviderAttempt {
        provider: String,
        model_class: String,
        attempt: usize,
        max_attempts: usize,
    },
    Retry {
        provider: String,
        attempt: usize,
        delay: Duration,
        error: String,
    },
    ProviderSkipped {
        provider: String,
        reason: String,
    },
    ProviderExhausted {
        provider: String,
        attempts: usize,
        error: String,
    },
    CircuitStateChange {
        provider: String,
        from: String,
        to: String,
    },
    CheckpointAdvance {
        stage: String,
        index: u32,
    },
    UnitCompleted {
        stage: String,
        index: u32,
    },
    UnitFailure {
        stage: String,
        index: u32,
        reason: String,
    },
    BackupWritten {
        path: String,
    },
}

impl GenerationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProviderAttempt { .. } => "provider_attempt",
            Self::Retry { .. } => "retry",
            Self::ProviderSkipped { .. } => "provider_skipped",
            Self::ProviderExhausted { .. } => "provider_exhausted",
            Self::CircuitStateChange { .. } => "circuit_state_change",
            Self::CheckpointAdvance { .. } => "checkpoint_advance",
            Self::UnitCompleted { .. } => "unit_completed",
            Self::UnitFailure { .. } => "unit_failure",
            Self::BackupWritten { .. } => "backup_written",
        }
    }

    pub fn level(&self) -> LogLevel {
        match self {
            Self::ProviderAttempt { .. } | Self::BackupWritten { .. } => LogLevel::Debug,
            Self::CheckpointAdvance { .. } | Self::UnitCompleted { .. } => LogLevel::Info,
            Self::Retry { .. }
            | Self::ProviderSkipped { .. }
            | Self::ProviderExhausted { .. }
            | Self::CircuitStateChange { .. } => LogLevel::Warn,
            Self::UnitFailure { .. } => LogLevel::Error,
        }
    }

    pub fn to_record(&self) -> LogRecord {
        LogRecord::new(self.level(), self.to_string()).with_event(self.name())
    }
}

impl fmt::Display for GenerationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderAttempt {
                provider,
                model_class,
                attempt,
                max_attempts,
            } => write!(
                f,
                "[{model_class}] calling provider `{provider}` (attempt {attempt}/{max_attempts})"
            ),
            Self::Retry {
                provider,
                attempt,
                delay,
                error,
            } => write!(
                f,
                "provider `{provider}` attempt {attempt} failed: {error}; retrying in {delay:?}"
            ),
            Self::ProviderSkipped { provider, reason } => {
                write!(f, "skipping provider `{provider}`: {reason}")
            }
            Self::ProviderExhausted {
                provider,
                attempts,
                error,
            } => write!(
                f,
                "provider `{provider}` gave up after {attempts} attempt(s): {error}"
            ),
            Self::CircuitStateChange { provider, from, to } => {
                write!(f, "circuit for `{provider}` changed {from} -> {to}")
            }
            Self::CheckpointAdvance { stage, index } => {
                write!(f, "{stage} checkpoint advanced to unit {index}")
            }
            Self::UnitCompleted { stage, index } => write!(f, "{stage} unit {index} completed"),
            Self::UnitFailure {
                stage,
                index,
                reason,
            } => write!(f, "{stage} unit {index} failed: {reason}"),
            Self::BackupWritten { path } => write!(f, "backup written to {path}"),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);

    fn event(&self, event: GenerationEvent) {
        self.log(event.to_record());
    }
}

pub type SharedLogSink = Arc<dyn LogSink>;

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records tagged with the given event name, in emission order.
    pub fn events(&self, name: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.event.as_deref() == Some(name))
            .collect()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        self.push(record);
    }
}

#[derive(Default, Clone)]
pub struct StdoutLogSink {
    min_level: Option<LogLevel>,
}

impl StdoutLogSink {
    pub fn new() -> Self {
        Self { min_level: None }
    }

    pub fn with_min_level(level: LogLevel) -> Self {
        Self {
            min_level: Some(level),
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        match self.min_level {
            Some(min) => rank(level) >= rank(min),
            None => true,
        }
    }
}

impl LogSink for StdoutLogSink {
    fn log(&self, record: LogRecord) {
        if self.enabled(record.level) {
            println!("[{}] {}", record.level, record.message);
        }
    }
}

fn rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warn => 3,
        LogLevel::Error => 4,
    }
}
