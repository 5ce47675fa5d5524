use crate::client::GenerationClient;
use crate::config::GenerationSettings;
use crate::context::ContextWindow;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::Project;
use crate::prompts::{PromptRegistry, CORRECTIVE_OUTLINE, OUTLINE_UNIT};
use crate::request::{ChatMessage, GenerationRequest};
use crate::unit::{Stage, UnitOutline, UnitSummary};

use super::{generate_validated, render_style_guide, UnitError, UnitProduct, UnitWorker};

/// Plans one unit at a time on the `planning` model class.
pub struct OutlineGenerator<'a> {
    client: &'a GenerationClient,
    prompts: &'a PromptRegistry,
    project: &'a Project,
    sink: &'a dyn LogSink,
    settings: GenerationSettings,
}

impl<'a> OutlineGenerator<'a> {
    pub fn new(
        client: &'a GenerationClient,
        prompts: &'a PromptRegistry,
        project: &'a Project,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            client,
            prompts,
            project,
            sink,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: &GenerationSettings) -> Self {
        self.settings = settings.clone();
        self
    }

    pub fn with_max_validation_retries(mut self, retries: u32) -> Self {
        self.settings.max_validation_retries = retries;
        self
    }

    pub fn build_request(
        &self,
        index: u32,
        window: &ContextWindow,
    ) -> Result<GenerationRequest, UnitError> {
        let prompt = self
            .prompts
            .format_with(
                OUTLINE_UNIT,
                [
                    ("unit_index", index.to_string()),
                    ("core_setting", self.project.setting.render()),
                    ("act_span", self.project.outline.span_for_unit(index)),
                    ("context", window.render()),
                    ("style_guide", render_style_guide(&self.settings.style_guide)),
                    ("word_count", self.settings.default_word_count.to_string()),
                ],
            )
            .map_err(|source| UnitError::Prompt { index, source })?;
        Ok(GenerationRequest::new(
            Stage::Outline.model_class(),
            vec![ChatMessage::user(prompt)],
        ))
    }

    pub fn generate(&self, index: u32, window: &ContextWindow) -> Result<UnitOutline, UnitError> {
        self.sink.log(LogRecord::new(
            LogLevel::Info,
            format!("生成第{index}章大纲（参考前文 {} 章）", window.len()),
        ));
        let request = self.build_request(index, window)?;
        let default_word_count = self.settings.default_word_count;

        generate_validated(
            self.client,
            self.sink,
            index,
            &request,
            self.settings.max_validation_retries,
            |text| {
                UnitOutline::parse(text, index, default_word_count).map_err(|err| err.to_string())
            },
            |problem| {
                self.prompts
                    .format_with(CORRECTIVE_OUTLINE, [("problem", problem)])
            },
        )
    }
}

impl UnitWorker for OutlineGenerator<'_> {
    fn produce(&self, index: u32, window: &ContextWindow) -> Result<UnitProduct, UnitError> {
        let outline = self.generate(index, window)?;
        let content = outline.to_yaml().map_err(|err| UnitError::Validation {
            index,
            attempts: 1,
            reason: err.to_string(),
        })?;
        Ok(UnitProduct {
            content,
            summary: UnitSummary::from_outline(&outline),
        })
    }

    fn summarize(&self, index: u32, artifact: &str) -> Result<UnitSummary, UnitError> {
        UnitOutline::parse(artifact, index, self.settings.default_word_count)
            .map(|outline| UnitSummary::from_outline(&outline))
            .map_err(|err| UnitError::Input {
                index,
                reason: err.to_string(),
            })
    }
}
