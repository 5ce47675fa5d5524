use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub const OUTLINE_UNIT: &str = "outline_unit";
pub const EXPAND_UNIT: &str = "expand_unit";
pub const CORRECTIVE_OUTLINE: &str = "corrective_outline";
pub const CORRECTIVE_DRAFT: &str = "corrective_draft";
pub const HEALTH_PROBE: &str = "health_probe";

/// Keys the generation core renders; a registry missing any of them is unusable.
pub const REQUIRED_KEYS: [&str; 5] = [
    OUTLINE_UNIT,
    EXPAND_UNIT,
    CORRECTIVE_OUTLINE,
    CORRECTIVE_DRAFT,
    HEALTH_PROBE,
];

pub type PromptArguments = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    description: Option<String>,
    source: PromptSource,
    segments: Vec<Segment>,
    required: BTreeSet<String>,
}

impl PromptTemplate {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !arguments.contains_key(name.as_str()))
        {
            return Err(PromptError::MissingArgument {
                key: self.key.clone(),
                argument: missing.clone(),
            });
        }

        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Slot(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output.trim().to_string())
    }

    fn compile(key: String, raw: RawPrompt, source: PromptSource) -> Result<Self, PromptError> {
        let segments = tokenize(&raw.template);
        let slots: BTreeSet<String> = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Slot(name) => Some(name.clone()),
                Segment::Text(_) => None,
            })
            .collect();

        let required = if raw.required.is_empty() {
            slots
        } else {
            let mut declared = BTreeSet::new();
            for argument in raw.required {
                let argument = argument.trim().to_string();
                if !slots.contains(&argument) {
                    return Err(PromptError::InvalidRequired { key, argument });
                }
                declared.insert(argument);
            }
            declared
        };

        Ok(Self {
            key,
            description: raw.description,
            source,
            segments,
            required,
        })
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(#[source] toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("prompt `{key}` declares required argument `{argument}` without a placeholder")]
    InvalidRequired { key: String, argument: String },
}

/// Named prompt templates: the built-in document overlaid by files from the
/// configured directories, later directories winning.
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
    hot_reload: bool,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::from_prompt_config(&PromptConfig::default())
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: config.custom_directories.clone(),
            hot_reload: config.enable_hot_reload,
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        Self::from_prompt_config(&PromptConfig {
            custom_directories: directories
                .iter()
                .map(|dir| dir.as_ref().to_path_buf())
                .collect(),
            enable_hot_reload: false,
        })
    }

    pub fn hot_reload_enabled(&self) -> bool {
        self.hot_reload
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        let built_in: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut prompts, built_in, PromptSource::BuiltIn)?;
        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }
        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    /// Fails on the first of `keys` the registry cannot render.
    pub fn require(&self, keys: &[&str]) -> Result<(), PromptError> {
        match keys.iter().find(|key| !self.prompts.contains_key(**key)) {
            Some(missing) => Err(PromptError::NotFound((*missing).to_string())),
            None => Ok(()),
        }
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let args: PromptArguments = arguments
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.format(key, &args)
    }
}

fn insert_document(
    prompts: &mut BTreeMap<String, PromptTemplate>,
    document: PromptDocument,
    source: PromptSource,
) -> Result<(), PromptError> {
    for (key, raw) in document.prompts {
        let template = PromptTemplate::compile(key.clone(), raw, source.clone())?;
        prompts.insert(key, template);
    }
    Ok(())
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let document: PromptDocument = match ext.as_deref() {
            Some("toml") => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            Some("yaml") | Some("yml") => {
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => continue,
        };
        insert_document(prompts, document, PromptSource::File(path.clone()))?;
    }

    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PromptError {
    let path = path.to_path_buf();
    move |source| PromptError::Io { path, source }
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Text(String),
    Slot(String),
}

/// Splits `{name}` placeholders out of a template; `{{` and `}}` escape braces.
fn tokenize(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                let trimmed = name.trim();
                if closed && !trimmed.is_empty() {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Slot(trimmed.to_string()));
                } else {
                    text.push('{');
                    text.push_str(&name);
                    if closed {
                        text.push('}');
                    }
                }
            }
            _ => text.push(ch),
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn built_in_document_covers_required_keys() {
        let registry = PromptRegistry::new().expect("registry");
        registry.require(&REQUIRED_KEYS).expect("all keys present");
        let template = registry.get(OUTLINE_UNIT).unwrap();
        assert_eq!(template.source(), &PromptSource::BuiltIn);
        let required: Vec<&str> = template.required_arguments().collect();
        assert!(required.contains(&"context"));
        assert!(required.contains(&"unit_index"));
    }

    #[test]
    fn renders_outline_prompt() {
        let registry = PromptRegistry::new().unwrap();
        let output = registry
            .format_with(
                OUTLINE_UNIT,
                [
                    ("unit_index", "7"),
                    ("core_setting", "雾城"),
                    ("act_span", "第一幕：第1-10章"),
                    ("context", "第6章：潜入"),
                    ("style_guide", "冷峻"),
                    ("word_count", "1500"),
                ],
            )
            .unwrap();
        assert!(output.contains("第7章"));
        assert!(output.contains("第6章：潜入"));
        assert!(output.contains("字数目标: 1500"));
    }

    #[test]
    fn missing_argument_fails() {
        let registry = PromptRegistry::new().unwrap();
        let error = registry
            .format_with(CORRECTIVE_DRAFT, [("problem", "太短")])
            .expect_err("word_count missing");
        match error {
            PromptError::MissingArgument { argument, .. } => assert_eq!(argument, "word_count"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn custom_directory_overrides_built_in() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("custom.yaml"),
            "prompts:\n  corrective_outline:\n    template: \"重试 {problem}\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let output = registry
            .format_with(CORRECTIVE_OUTLINE, [("problem", "缺少标题")])
            .unwrap();
        assert_eq!(output, "重试 缺少标题");
        assert!(matches!(
            registry.get(CORRECTIVE_OUTLINE).unwrap().source(),
            PromptSource::File(_)
        ));
        registry.require(&REQUIRED_KEYS).unwrap();
        assert!(matches!(
            registry.require(&[OUTLINE_UNIT, "chapter_finalize"]),
            Err(PromptError::NotFound(key)) if key == "chapter_finalize"
        ));
    }

    #[test]
    fn reload_reflects_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[prompts.health_probe]\ntemplate = \"ping\"\n").unwrap();

        let mut registry = PromptRegistry::from_prompt_config(&PromptConfig {
            custom_directories: vec![dir.path().to_path_buf()],
            enable_hot_reload: true,
        })
        .unwrap();
        assert!(registry.hot_reload_enabled());
        assert_eq!(registry.format(HEALTH_PROBE, &PromptArguments::new()).unwrap(), "ping");

        fs::write(&path, "[prompts.health_probe]\ntemplate = \"pong\"\n").unwrap();
        registry.reload().unwrap();
        assert_eq!(registry.format(HEALTH_PROBE, &PromptArguments::new()).unwrap(), "pong");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let segments = tokenize("{{a}} {b}");
        assert_eq!(
            segments,
            vec![Segment::Text("{a} ".into()), Segment::Slot("b".into())]
        );
    }
}
