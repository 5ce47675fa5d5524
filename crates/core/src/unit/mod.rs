use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

use crate::request::ModelClass;

const TITLE_KEYS: &[&str] = &["标题", "title", "章节标题"];
const EVENT_KEYS: &[&str] = &["核心事件", "key_events", "事件", "主要事件"];
const LOCATION_KEYS: &[&str] = &["场景", "location", "地点"];
const PARTICIPANT_KEYS: &[&str] = &["人物行动", "participants", "人物", "角色"];
const WORD_COUNT_KEYS: &[&str] = &["字数目标", "word_count", "目标字数", "字数"];
const FORESHADOW_KEYS: &[&str] = &["伏笔回收", "resolved_foreshadowing", "伏笔"];
const CLOSING_EXCERPT_CHARS: usize = 200;

/// Generation stage a unit artifact belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Outline,
    Expansion,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Outline => "章节大纲",
            Self::Expansion => "章节扩写",
        }
    }

    /// Stable key used in state file names.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Outline => "outline",
            Self::Expansion => "expansion",
        }
    }

    pub fn model_class(&self) -> ModelClass {
        match self {
            Self::Outline => ModelClass::Planning,
            Self::Expansion => ModelClass::Drafting,
        }
    }

    pub fn artifact_name(&self, index: u32) -> String {
        match self {
            Self::Outline => format!("chapter_{index:02}.yaml"),
            Self::Expansion => format!("chapter_{index:02}.md"),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum OutlineParseError {
    #[error("model returned empty content")]
    Empty,
    #[error("outline is not valid YAML: {0}")]
    Yaml(#[source] serde_yaml::Error),
    #[error("outline must be a mapping of fields")]
    NotAMapping,
    #[error("outline is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("expected outline for unit {expected} but got unit {found}")]
    WrongUnit { expected: u32, found: u32 },
}

/// One unit's plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitOutline {
    pub index: u32,
    pub title: String,
    pub key_events: String,
    pub location: String,
    pub participants: String,
    pub word_count: u32,
    pub resolved_foreshadowing: Vec<String>,
}

impl UnitOutline {
    /// Parses model output or a stored artifact. Markdown fences are stripped,
    /// a `第N章` / `chapter_N` wrapper is unwrapped and field aliases are
    /// normalised. `default_word_count` fills a missing word-count target.
    pub fn parse(
        text: &str,
        index: u32,
        default_word_count: u32,
    ) -> Result<Self, OutlineParseError> {
        let cleaned = strip_code_fences(text);
        if cleaned.trim().is_empty() {
            return Err(OutlineParseError::Empty);
        }

        let mapping = match serde_yaml::from_str::<Value>(&cleaned) {
            Ok(Value::Mapping(mapping)) => mapping,
            Ok(_) => line_fields(&cleaned).ok_or(OutlineParseError::NotAMapping)?,
            Err(err) => line_fields(&cleaned).ok_or(OutlineParseError::Yaml(err))?,
        };
        let fields = unwrap_unit(mapping, index)?;
        Self::from_fields(&fields, index, default_word_count)
    }

    fn from_fields(
        fields: &Mapping,
        index: u32,
        default_word_count: u32,
    ) -> Result<Self, OutlineParseError> {
        let title = lookup(fields, TITLE_KEYS).ok_or(OutlineParseError::MissingField("标题"))?;
        let key_events =
            lookup(fields, EVENT_KEYS).ok_or(OutlineParseError::MissingField("核心事件"))?;
        let word_count = lookup(fields, WORD_COUNT_KEYS)
            .and_then(|text| first_number(&text))
            .unwrap_or(default_word_count);
        let resolved_foreshadowing = lookup_value(fields, FORESHADOW_KEYS)
            .map(tags)
            .unwrap_or_default();

        Ok(Self {
            index,
            title,
            key_events,
            location: lookup(fields, LOCATION_KEYS).unwrap_or_default(),
            participants: lookup(fields, PARTICIPANT_KEYS).unwrap_or_default(),
            word_count,
            resolved_foreshadowing,
        })
    }

    /// Canonical YAML artifact, wrapped in the `第N章` key.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut fields = Mapping::new();
        fields.insert("标题".into(), self.title.clone().into());
        fields.insert("核心事件".into(), self.key_events.clone().into());
        fields.insert("场景".into(), self.location.clone().into());
        fields.insert("人物行动".into(), self.participants.clone().into());
        let foreshadowing = if self.resolved_foreshadowing.is_empty() {
            Value::from("无")
        } else {
            Value::Sequence(
                self.resolved_foreshadowing
                    .iter()
                    .cloned()
                    .map(Value::from)
                    .collect(),
            )
        };
        fields.insert("伏笔回收".into(), foreshadowing);
        fields.insert("字数目标".into(), self.word_count.into());

        let mut wrapper = Mapping::new();
        wrapper.insert(format!("第{}章", self.index).into(), Value::Mapping(fields));
        serde_yaml::to_string(&wrapper)
    }
}

/// Compact continuity record of a finalized unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub index: u32,
    pub title: String,
    pub key_events: String,
    #[serde(default)]
    pub participant_deltas: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing: Option<String>,
}

impl UnitSummary {
    pub fn from_outline(outline: &UnitOutline) -> Self {
        Self {
            index: outline.index,
            title: outline.title.clone(),
            key_events: outline.key_events.clone(),
            participant_deltas: outline.participants.clone(),
            closing: None,
        }
    }

    /// Outline facts plus the tail of the draft, so the next unit can pick up
    /// where the prose actually stopped.
    pub fn from_draft(outline: &UnitOutline, draft: &str) -> Self {
        let mut summary = Self::from_outline(outline);
        let draft = draft.trim();
        if !draft.is_empty() {
            let chars: Vec<char> = draft.chars().collect();
            let start = chars.len().saturating_sub(CLOSING_EXCERPT_CHARS);
            summary.closing = Some(chars[start..].iter().collect());
        }
        summary
    }

    pub fn render(&self) -> String {
        let mut text = self.render_compact();
        if let Some(closing) = &self.closing {
            text.push_str(&format!("\n  结尾：{closing}"));
        }
        text
    }

    /// Title, events and participants without the closing excerpt.
    pub fn render_compact(&self) -> String {
        let mut text = format!("第{}章《{}》：{}", self.index, self.title, self.key_events);
        if !self.participant_deltas.is_empty() {
            text.push_str(&format!("\n  人物：{}", self.participant_deltas));
        }
        text
    }

    pub fn render_headline(&self) -> String {
        format!("第{}章《{}》", self.index, self.title)
    }
}

/// Removes Markdown fence lines such as "```yaml" and "```".
pub fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Number of non-whitespace characters, the length measure used for drafts.
pub fn content_length(text: &str) -> usize {
    text.chars().filter(|ch| !ch.is_whitespace()).count()
}

fn unwrap_unit(mapping: Mapping, index: u32) -> Result<Mapping, OutlineParseError> {
    let mut wrapped: Vec<(u32, Value)> = mapping
        .iter()
        .filter_map(|(key, value)| Some((unit_key_number(key.as_str()?)?, value.clone())))
        .collect();

    if wrapped.is_empty() {
        return Ok(mapping);
    }

    let position = wrapped
        .iter()
        .position(|(number, _)| *number == index)
        .or((wrapped.len() == 1).then_some(0));
    let Some(position) = position else {
        return Err(OutlineParseError::MissingField("标题"));
    };
    match wrapped.swap_remove(position) {
        (number, _) if number != index => Err(OutlineParseError::WrongUnit {
            expected: index,
            found: number,
        }),
        (_, Value::Mapping(fields)) => Ok(fields),
        _ => Err(OutlineParseError::NotAMapping),
    }
}

fn unit_key_number(key: &str) -> Option<u32> {
    unit_key_regex()
        .captures(key.trim())
        .and_then(|caps| caps.iter().skip(1).flatten().next())
        .and_then(|m| m.as_str().parse().ok())
}

fn lookup_value<'a>(fields: &'a Mapping, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn lookup(fields: &Mapping, keys: &[&str]) -> Option<String> {
    lookup_value(fields, keys)
        .map(flatten)
        .filter(|text| !text.trim().is_empty())
}

fn flatten(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Sequence(items) => items
            .iter()
            .map(flatten)
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .join("；"),
        Value::Mapping(entries) => entries
            .iter()
            .map(|(key, value)| format!("{}：{}", flatten(key), flatten(value)))
            .collect::<Vec<_>>()
            .join("；"),
        Value::Tagged(tagged) => flatten(&tagged.value),
    }
}

fn tags(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Sequence(items) => items.iter().map(flatten).collect(),
        other => flatten(other)
            .split(&['，', ',', '、', '；', ';'][..])
            .map(str::to_string)
            .collect(),
    };
    raw.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty() && tag != "无" && !tag.eq_ignore_ascii_case("none"))
        .collect()
}

fn first_number(text: &str) -> Option<u32> {
    number_regex()
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

/// Fallback for output that is not valid YAML: `key：value` lines, optionally
/// bulleted, under an optional `第N章` heading line.
fn line_fields(text: &str) -> Option<Mapping> {
    let mut fields = Mapping::new();
    let mut heading = None;
    for line in text.lines() {
        let line = line.trim().trim_start_matches("- ").trim();
        let Some((key, value)) = line.split_once('：').or_else(|| line.split_once(':')) else {
            continue;
        };
        let key = key.trim();
        if unit_key_number(key).is_some() && value.trim().is_empty() {
            heading = Some(key.to_string());
            continue;
        }
        fields.insert(key.into(), value.trim().into());
    }
    if lookup(&fields, TITLE_KEYS).is_none() {
        return None;
    }
    match heading {
        Some(heading) => {
            let mut wrapper = Mapping::new();
            wrapper.insert(heading.into(), Value::Mapping(fields));
            Some(wrapper)
        }
        None => Some(fields),
    }
}

fn unit_key_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:第\s*(\d+)\s*章|(?i:chapter)[_\s]*(\d+))$").expect("invalid unit key regex")
    })
}

fn number_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\d+").expect("invalid number regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_wrapped_outline_with_aliases() {
        let response = "```yaml\n第7章:\n  标题: 雨夜\n  核心事件: 主角潜入档案馆\n  场景: 旧城区\n  人物: 林舟\n  目标字数: 2000字左右\n  伏笔回收: 钥匙、旧照片\n```\n";
        let outline = UnitOutline::parse(response, 7, 1500).unwrap();
        assert_eq!(outline.index, 7);
        assert_eq!(outline.title, "雨夜");
        assert_eq!(outline.participants, "林舟");
        assert_eq!(outline.word_count, 2000);
        assert_eq!(outline.resolved_foreshadowing, ["钥匙", "旧照片"]);
    }

    #[test]
    fn parses_bare_mapping_with_english_keys() {
        let response = "title: Rain\nkey_events:\n  - break in\n  - escape\nresolved_foreshadowing: none\n";
        let outline = UnitOutline::parse(response, 3, 1500).unwrap();
        assert_eq!(outline.key_events, "break in；escape");
        assert_eq!(outline.word_count, 1500);
        assert!(outline.resolved_foreshadowing.is_empty());
    }

    #[test]
    fn falls_back_to_line_fields() {
        let response = "第2章：\n- 标题：启程\n- 核心事件：离开故乡\n- 字数：1200";
        let outline = UnitOutline::parse(response, 2, 1500).unwrap();
        assert_eq!(outline.title, "启程");
        assert_eq!(outline.word_count, 1200);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let err = UnitOutline::parse("标题: 只有标题\n", 1, 1500).unwrap_err();
        assert!(matches!(err, OutlineParseError::MissingField("核心事件")));
        assert!(matches!(
            UnitOutline::parse("```\n```", 1, 1500),
            Err(OutlineParseError::Empty)
        ));
    }

    #[test]
    fn rejects_outline_for_another_unit() {
        let err = UnitOutline::parse("第9章:\n  标题: a\n  核心事件: b\n", 8, 1500).unwrap_err();
        assert!(matches!(
            err,
            OutlineParseError::WrongUnit {
                expected: 8,
                found: 9
            }
        ));
    }

    #[test]
    fn stored_yaml_parses_back() {
        let outline = UnitOutline {
            index: 12,
            title: "归途".into(),
            key_events: "船队返航".into(),
            location: "港口".into(),
            participants: "林舟".into(),
            word_count: 1800,
            resolved_foreshadowing: vec!["灯塔".into()],
        };
        let yaml = outline.to_yaml().unwrap();
        assert!(yaml.contains("第12章"));
        assert_eq!(UnitOutline::parse(&yaml, 12, 1500).unwrap(), outline);
    }

    #[test]
    fn draft_summary_keeps_closing_excerpt() {
        let outline = UnitOutline {
            index: 4,
            title: "余烬".into(),
            key_events: "火灾".into(),
            ..UnitOutline::default()
        };
        let draft = "开头。".repeat(100) + "最后一句。";
        let summary = UnitSummary::from_draft(&outline, &draft);
        let closing = summary.closing.as_deref().unwrap();
        assert_eq!(closing.chars().count(), CLOSING_EXCERPT_CHARS);
        assert!(closing.ends_with("最后一句。"));
        assert!(summary.render().starts_with("第4章《余烬》：火灾"));
    }

    #[test]
    fn stage_names_artifacts() {
        assert_eq!(Stage::Outline.artifact_name(3), "chapter_03.yaml");
        assert_eq!(Stage::Expansion.artifact_name(120), "chapter_120.md");
        assert_eq!(Stage::Expansion.model_class(), ModelClass::Drafting);
    }
}
