use std::collections::BTreeMap;
use thiserror::Error;

use crate::client::{GenerationClient, GenerationError};
use crate::context::ContextWindow;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::PromptError;
use crate::request::GenerationRequest;
use crate::unit::UnitSummary;

mod expansion;
mod outline;

pub use expansion::{DraftExpander, ExpansionWorker};
pub use outline::OutlineGenerator;

const NO_STYLE_GUIDE: &str = "无特殊要求";

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("failed to render prompt for unit {index}: {source}")]
    Prompt {
        index: u32,
        #[source]
        source: PromptError,
    },
    #[error("generation failed for unit {index}: {source}")]
    Generation {
        index: u32,
        #[source]
        source: GenerationError,
    },
    #[error("unit {index} failed validation after {attempts} attempt(s): {reason}")]
    Validation {
        index: u32,
        attempts: u32,
        reason: String,
    },
    #[error("unit {index} input unavailable: {reason}")]
    Input { index: u32, reason: String },
}

impl UnitError {
    pub fn index(&self) -> u32 {
        match self {
            Self::Prompt { index, .. }
            | Self::Generation { index, .. }
            | Self::Validation { index, .. }
            | Self::Input { index, .. } => *index,
        }
    }
}

/// Artifact text plus the summary appended once the unit is finalized.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitProduct {
    pub content: String,
    pub summary: UnitSummary,
}

/// Stage-specific unit producer driven by the batch pipeline.
pub trait UnitWorker: Sync {
    fn produce(&self, index: u32, window: &ContextWindow) -> Result<UnitProduct, UnitError>;

    /// Rebuilds the summary of an artifact already on disk.
    fn summarize(&self, index: u32, artifact: &str) -> Result<UnitSummary, UnitError>;
}

pub(crate) fn render_style_guide(style: &BTreeMap<String, String>) -> String {
    if style.is_empty() {
        return NO_STYLE_GUIDE.to_string();
    }
    style
        .iter()
        .map(|(key, value)| format!("{key}：{value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Calls the client and validates the text, re-asking with a corrective
/// instruction up to `max_validation_retries` times.
pub(crate) fn generate_validated<T, V, C>(
    client: &GenerationClient,
    sink: &dyn LogSink,
    index: u32,
    request: &GenerationRequest,
    max_validation_retries: u32,
    validate: V,
    corrective: C,
) -> Result<T, UnitError>
where
    V: Fn(&str) -> Result<T, String>,
    C: Fn(&str) -> Result<String, PromptError>,
{
    let mut current = request.clone();
    let mut attempt = 0;
    loop {
        let output = client
            .generate(&current)
            .map_err(|source| UnitError::Generation { index, source })?;

        match validate(&output.text) {
            Ok(value) => return Ok(value),
            Err(problem) if attempt >= max_validation_retries => {
                return Err(UnitError::Validation {
                    index,
                    attempts: attempt + 1,
                    reason: problem,
                })
            }
            Err(problem) => {
                sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!(
                        "第{index}章输出未通过校验（{problem}），追加修正指令重试（{}/{}）",
                        attempt + 1,
                        max_validation_retries
                    ),
                ));
                let instruction = corrective(&problem)
                    .map_err(|source| UnitError::Prompt { index, source })?;
                current = request.clone();
                current.push_user(instruction);
                attempt += 1;
            }
        }
    }
}
