use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::request::ModelClass;

const CONTEXT_BUDGET_FACTOR: usize = 3;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    60
}

fn default_timeout() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_seconds() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    2
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_context_chapters() -> i64 {
    10
}

fn default_batch_size() -> u32 {
    30
}

fn default_word_count() -> u32 {
    1500
}

fn default_max_validation_retries() -> u32 {
    2
}

fn default_min_length_ratio() -> f32 {
    0.5
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    /// Per-class model overrides; falls back to `model_name`.
    #[serde(default)]
    pub models: BTreeMap<ModelClass, String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-provider timeout override in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            models: BTreeMap::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn model_for(&self, class: ModelClass) -> &str {
        self.models
            .get(&class)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.model_name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            max_delay: default_max_delay(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_seconds")]
    pub open_seconds: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_seconds: default_open_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    /// Context window size `k`; signed so a negative value can be rejected.
    #[serde(default = "default_context_chapters")]
    pub context_chapters: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_word_count")]
    pub default_word_count: u32,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_max_validation_retries")]
    pub max_validation_retries: u32,
    #[serde(default = "default_min_length_ratio")]
    pub min_length_ratio: f32,
    #[serde(default)]
    pub style_guide: BTreeMap<String, String>,
    /// Character budget of the rendered context window; three times the
    /// default word count when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            context_chapters: default_context_chapters(),
            batch_size: default_batch_size(),
            default_word_count: default_word_count(),
            fail_fast: false,
            max_validation_retries: default_max_validation_retries(),
            min_length_ratio: default_min_length_ratio(),
            style_guide: BTreeMap::new(),
            max_context_chars: None,
        }
    }
}

impl GenerationSettings {
    pub fn context_budget(&self) -> usize {
        self.max_context_chars
            .unwrap_or(CONTEXT_BUDGET_FACTOR * self.default_word_count as usize)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    pub project_root: PathBuf,
    pub core_setting_file: PathBuf,
    pub overall_outline_file: PathBuf,
    pub outline_dir: PathBuf,
    pub draft_dir: PathBuf,
    pub outline_history_dir: PathBuf,
    pub draft_history_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            core_setting_file: PathBuf::from("01_source/core_setting.yaml"),
            overall_outline_file: PathBuf::from("01_source/overall_outline.yaml"),
            outline_dir: PathBuf::from("02_outline"),
            draft_dir: PathBuf::from("03_draft"),
            outline_history_dir: PathBuf::from("02_outline/outline_history"),
            draft_history_dir: PathBuf::from("03_draft/draft_history"),
            state_dir: PathBuf::from("05_state"),
        }
    }
}

impl PathSettings {
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: root.into(),
            ..Self::default()
        }
    }

    /// Joins a configured path onto the project root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
    #[serde(default)]
    pub enable_hot_reload: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: BTreeMap<ModelClass, Vec<String>>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub prompts: PromptConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn upsert_provider<S: Into<String>>(&mut self, name: S, provider: ProviderConfig) {
        self.providers.insert(name.into(), provider);
    }

    pub fn route(&self, class: ModelClass) -> &[String] {
        self.routing.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Timeout applied to one call against `provider`.
    pub fn timeout_for(&self, provider: &str) -> Duration {
        let seconds = self
            .get_provider(provider)
            .and_then(|config| config.timeout)
            .unwrap_or(self.retry.timeout);
        Duration::from_secs(seconds.max(1))
    }

    /// Checks every invariant the core relies on. Violations are fatal at
    /// construction time and never recovered at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.context_chapters < 0 {
            return Err(ConfigError::InvariantViolation(format!(
                "generation.context_chapters must be >= 0, got {}",
                self.generation.context_chapters
            )));
        }
        if self.generation.batch_size == 0 {
            return Err(ConfigError::InvariantViolation(
                "generation.batch_size must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.generation.min_length_ratio) {
            return Err(ConfigError::InvariantViolation(format!(
                "generation.min_length_ratio must be within [0, 1], got {}",
                self.generation.min_length_ratio
            )));
        }
        if self.generation.max_context_chars == Some(0) {
            return Err(ConfigError::InvariantViolation(
                "generation.max_context_chars must be >= 1".to_string(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::InvariantViolation(
                "circuit.failure_threshold must be >= 1".to_string(),
            ));
        }
        for class in ModelClass::ALL {
            let route = self.route(class);
            if route.is_empty() {
                return Err(ConfigError::InvariantViolation(format!(
                    "no providers configured for model class `{class}`"
                )));
            }
            for name in route {
                if !self.providers.contains_key(name) {
                    return Err(ConfigError::InvariantViolation(format!(
                        "model class `{class}` routes to unknown provider `{name}`"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if value.get("providers").is_some()
            || value.get("routing").is_some()
            || value.get("generation").is_some()
            || value.get("paths").is_some()
        {
            Ok(serde_json::from_value(value)?)
        } else {
            let legacy: LegacyConfig = serde_json::from_value(value)?;
            Ok(Self::from_legacy(legacy))
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Loads and validates in one step; the usual entry point.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    fn from_legacy(legacy: LegacyConfig) -> Self {
        let mut config = Self::default();

        let mut order = Vec::new();
        if let Some(provider) = legacy.zhipu_provider() {
            config.providers.insert("zhipu".to_string(), provider);
            order.push("zhipu".to_string());
        }
        if let Some(provider) = legacy.doubao_provider() {
            config.providers.insert("doubao".to_string(), provider);
            order.push("doubao".to_string());
        }

        if let Some(preferred) = legacy.default_model.as_deref() {
            if let Some(position) = order.iter().position(|name| name == preferred) {
                let name = order.remove(position);
                order.insert(0, name);
            }
        }

        for class in ModelClass::ALL {
            config.routing.insert(class, order.clone());
        }

        if let Some(api) = legacy.system.and_then(|system| system.api) {
            if let Some(max_retries) = api.max_retries {
                config.retry.max_retries = max_retries;
            }
            if let Some(retry_delay) = api.retry_delay {
                config.retry.retry_delay = retry_delay;
            }
            if let Some(timeout) = api.timeout {
                config.retry.timeout = timeout;
            }
        }

        config
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    models: BTreeMap<String, String>,
    #[serde(default)]
    doubao_api_key: Option<String>,
    #[serde(default)]
    doubao_api_base_url: Option<String>,
    #[serde(default)]
    doubao_models: BTreeMap<String, String>,
    #[serde(default)]
    default_model: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    system: Option<LegacySystem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct LegacySystem {
    #[serde(default)]
    api: Option<LegacyApi>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct LegacyApi {
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay: Option<u64>,
    #[serde(default)]
    timeout: Option<u64>,
}

impl LegacyConfig {
    fn zhipu_provider(&self) -> Option<ProviderConfig> {
        let api_key = self.api_key.clone().filter(|key| !key.trim().is_empty())?;
        Some(self.legacy_provider(
            "zhipu",
            api_key,
            self.api_base_url
                .clone()
                .unwrap_or_else(|| "https://open.bigmodel.cn/api/paas/v4".to_string()),
            &self.models,
            ("glm-4-long", "glm-4.5-flash"),
        ))
    }

    fn doubao_provider(&self) -> Option<ProviderConfig> {
        let api_key = self
            .doubao_api_key
            .clone()
            .filter(|key| !key.trim().is_empty())?;
        Some(self.legacy_provider(
            "doubao",
            api_key,
            self.doubao_api_base_url
                .clone()
                .unwrap_or_else(|| "https://ark.cn-beijing.volces.com/api/v3".to_string()),
            &self.doubao_models,
            ("doubao-seed-1-6-250615", "doubao-seed-1-6-250615"),
        ))
    }

    fn legacy_provider(
        &self,
        interface_format: &str,
        api_key: String,
        base_url: String,
        models: &BTreeMap<String, String>,
        fallback: (&str, &str),
    ) -> ProviderConfig {
        let planning = models
            .get("major_chapters_model")
            .cloned()
            .unwrap_or_else(|| fallback.0.to_string());
        let drafting = models
            .get("expansion_model")
            .cloned()
            .unwrap_or_else(|| fallback.1.to_string());
        let default_model = models
            .get("default_model")
            .cloned()
            .unwrap_or_else(|| drafting.clone());

        ProviderConfig {
            api_key,
            base_url,
            interface_format: interface_format.to_string(),
            model_name: default_model,
            models: BTreeMap::from([
                (ModelClass::Planning, planning),
                (ModelClass::Drafting, drafting),
            ]),
            temperature: self.temperature.unwrap_or_else(default_temperature),
            max_tokens: self.max_tokens.unwrap_or(4000),
            timeout: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}
