use std::path::PathBuf;

use crate::client::GenerationClient;
use crate::config::GenerationSettings;
use crate::context::ContextWindow;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::project::Project;
use crate::prompts::{PromptRegistry, CORRECTIVE_DRAFT, EXPAND_UNIT};
use crate::request::{ChatMessage, GenerationRequest};
use crate::store::ArtifactStore;
use crate::unit::{content_length, strip_code_fences, Stage, UnitOutline, UnitSummary};

use super::{generate_validated, render_style_guide, UnitError, UnitProduct, UnitWorker};

const LOWER_WARN_RATIO: f32 = 0.8;
const UPPER_WARN_RATIO: f32 = 1.2;

/// Turns a unit outline into prose on the `drafting` model class.
pub struct DraftExpander<'a> {
    client: &'a GenerationClient,
    prompts: &'a PromptRegistry,
    project: &'a Project,
    sink: &'a dyn LogSink,
    settings: GenerationSettings,
}

impl<'a> DraftExpander<'a> {
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

    /// Shortest acceptable draft, in non-whitespace characters.
    pub fn minimum_length(&self, outline: &UnitOutline) -> usize {
        (outline.word_count as f32 * self.settings.min_length_ratio).ceil() as usize
    }

    pub fn build_request(
        &self,
        outline: &UnitOutline,
        window: &ContextWindow,
    ) -> Result<GenerationRequest, UnitError> {
        let index = outline.index;
        let outline_text = outline.to_yaml().map_err(|err| UnitError::Input {
            index,
            reason: err.to_string(),
        })?;
        let prompt = self
            .prompts
            .format_with(
                EXPAND_UNIT,
                [
                    ("core_setting", self.project.setting.render()),
                    ("context", window.render()),
                    ("unit_index", index.to_string()),
                    ("outline", outline_text),
                    ("style_guide", render_style_guide(&self.settings.style_guide)),
                    ("word_count", outline.word_count.to_string()),
                ],
            )
            .map_err(|source| UnitError::Prompt { index, source })?;
        Ok(GenerationRequest::new(
            Stage::Expansion.model_class(),
            vec![ChatMessage::user(prompt)],
        ))
    }

    pub fn expand(&self, outline: &UnitOutline, window: &ContextWindow) -> Result<String, UnitError> {
        let index = outline.index;
        self.sink.log(LogRecord::new(
            LogLevel::Info,
            format!("扩写第{index}章《{}》，目标 {} 字", outline.title, outline.word_count),
        ));
        let request = self.build_request(outline, window)?;
        let minimum = self.minimum_length(outline);

        let draft = generate_validated(
            self.client,
            self.sink,
            index,
            &request,
            self.settings.max_validation_retries,
            |text| {
                let draft = strip_code_fences(text).trim().to_string();
                let length = content_length(&draft);
                if length < minimum {
                    Err(format!("正文仅 {length} 字，低于最低要求 {minimum} 字"))
                } else {
                    Ok(draft)
                }
            },
            |problem| {
                self.prompts.format_with(
                    CORRECTIVE_DRAFT,
                    [
                        ("problem", problem.to_string()),
                        ("word_count", outline.word_count.to_string()),
                    ],
                )
            },
        )?;

        let length = content_length(&draft) as f32;
        let target = outline.word_count as f32;
        if length < target * LOWER_WARN_RATIO || length > target * UPPER_WARN_RATIO {
            self.sink.log(LogRecord::new(
                LogLevel::Warn,
                format!("第{index}章字数 {} 与目标 {} 偏差较大", length as usize, outline.word_count),
            ));
        }
        Ok(draft)
    }
}

/// Expansion stage worker: reads the unit's outline artifact, then expands it.
pub struct ExpansionWorker<'a> {
    expander: DraftExpander<'a>,
    store: &'a dyn ArtifactStore,
    outline_dir: PathBuf,
}

impl<'a> ExpansionWorker<'a> {
    pub fn new(
        expander: DraftExpander<'a>,
        store: &'a dyn ArtifactStore,
        outline_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            expander,
            store,
            outline_dir: outline_dir.into(),
        }
    }

    pub fn load_outline(&self, index: u32) -> Result<UnitOutline, UnitError> {
        let path = self.outline_dir.join(Stage::Outline.artifact_name(index));
        let text = self
            .store
            .load(&path)
            .map_err(|err| UnitError::Input {
                index,
                reason: err.to_string(),
            })?
            .ok_or_else(|| UnitError::Input {
                index,
                reason: format!("大纲文件不存在: {}", path.display()),
            })?;
        UnitOutline::parse(&text, index, self.expander.settings.default_word_count).map_err(|err| {
            UnitError::Input {
                index,
                reason: format!("大纲无法解析: {err}"),
            }
        })
    }
}

impl UnitWorker for ExpansionWorker<'_> {
    fn produce(&self, index: u32, window: &ContextWindow) -> Result<UnitProduct, UnitError> {
        let outline = self.load_outline(index)?;
        let draft = self.expander.expand(&outline, window)?;
        let summary = UnitSummary::from_draft(&outline, &draft);
        Ok(UnitProduct {
            content: format!("{draft}\n"),
            summary,
        })
    }

    fn summarize(&self, index: u32, artifact: &str) -> Result<UnitSummary, UnitError> {
        let outline = self.load_outline(index)?;
        Ok(UnitSummary::from_draft(&outline, artifact))
    }
}
