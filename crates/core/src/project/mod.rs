use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::PathSettings;

const CHINESE_NUMERALS: [&str; 20] = [
    "一", "二", "三", "四", "五", "六", "七", "八", "九", "十", "十一", "十二", "十三", "十四",
    "十五", "十六", "十七", "十八", "十九", "二十",
];

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse `{path}` as YAML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("`{path}` must contain a YAML mapping")]
    NotAMapping { path: PathBuf },
    #[error("overall outline contains no acts")]
    NoActs,
    #[error("unable to derive the unit count from the overall outline")]
    NoUnitCount,
}

/// World, characters and conflict facts. Read-only for the whole run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoreSetting {
    fields: Mapping,
}

impl CoreSetting {
    pub fn from_mapping(fields: Mapping) -> Self {
        Self { fields }
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, serde_yaml::Error> {
        let value: Value = serde_yaml::from_str(input)?;
        Ok(match value {
            Value::Mapping(fields) => Self { fields },
            _ => Self::default(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let mapping = read_mapping(path)?;
        Ok(Self { fields: mapping })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Prompt-ready YAML text.
    pub fn render(&self) -> String {
        if self.fields.is_empty() {
            return String::new();
        }
        serde_yaml::to_string(&self.fields)
            .map(|text| text.trim().to_string())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Act {
    pub number: u32,
    pub label: String,
    pub text: String,
}

impl Act {
    /// Lowest and highest chapter numbers the act text mentions.
    pub fn unit_range(&self) -> Option<(u32, u32)> {
        let numbers = chapter_numbers(&self.text);
        let min = numbers.iter().copied().min()?;
        let max = numbers.iter().copied().max()?;
        Some((min, max))
    }

    pub fn render(&self) -> String {
        format!("{}：{}", self.label, self.text.trim())
    }
}

/// Ordered acts plus any non-act notes such as key turning points.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverallOutline {
    acts: Vec<Act>,
    notes: Vec<(String, String)>,
}

impl OverallOutline {
    pub fn from_mapping(mapping: &Mapping) -> Self {
        let mut acts = Vec::new();
        let mut consumed = Vec::new();

        let mut number = 1u32;
        loop {
            let Some((key, text)) = act_entry(mapping, number) else {
                break;
            };
            consumed.push(key.clone());
            acts.push(Act {
                number,
                label: key,
                text,
            });
            number += 1;
        }

        let notes = mapping
            .iter()
            .filter_map(|(key, value)| {
                let key = key.as_str()?;
                if consumed.iter().any(|used| used.as_str() == key) || parse_act_key(key).is_some() {
                    return None;
                }
                Some((key.to_string(), value_text(value)))
            })
            .filter(|(_, text)| !text.is_empty())
            .collect();

        Self { acts, notes }
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, serde_yaml::Error> {
        let value: Value = serde_yaml::from_str(input)?;
        Ok(match value {
            Value::Mapping(mapping) => Self::from_mapping(&mapping),
            _ => Self::default(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let mapping = read_mapping(path)?;
        let outline = Self::from_mapping(&mapping);
        if outline.acts.is_empty() {
            return Err(ProjectError::NoActs);
        }
        Ok(outline)
    }

    pub fn acts(&self) -> &[Act] {
        &self.acts
    }

    pub fn notes(&self) -> &[(String, String)] {
        &self.notes
    }

    /// Highest chapter number mentioned by any act.
    pub fn total_units(&self) -> Result<u32, ProjectError> {
        self.acts
            .iter()
            .filter_map(Act::unit_range)
            .map(|(_, max)| max)
            .max()
            .filter(|total| *total > 0)
            .ok_or(ProjectError::NoUnitCount)
    }

    /// The act whose declared range covers `index`, falling back to the first
    /// act ending after it and then to the last act.
    pub fn act_for_unit(&self, index: u32) -> Option<&Act> {
        self.acts
            .iter()
            .find(|act| {
                act.unit_range()
                    .is_some_and(|(start, end)| (start..=end).contains(&index))
            })
            .or_else(|| {
                self.acts
                    .iter()
                    .find(|act| act.unit_range().is_some_and(|(_, end)| end >= index))
            })
            .or_else(|| self.acts.last())
    }

    /// Act text relevant to `index` together with the outline-wide notes.
    pub fn span_for_unit(&self, index: u32) -> String {
        let mut lines = Vec::new();
        if let Some(act) = self.act_for_unit(index) {
            lines.push(act.render());
        }
        for (key, text) in &self.notes {
            lines.push(format!("{key}：{text}"));
        }
        lines.join("\n")
    }
}

impl fmt::Display for OverallOutline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let acts: Vec<String> = self.acts.iter().map(Act::render).collect();
        f.write_str(&acts.join("\n"))
    }
}

/// Static inputs of one project, loaded once per run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Project {
    pub setting: CoreSetting,
    pub outline: OverallOutline,
}

impl Project {
    pub fn load(paths: &PathSettings) -> Result<Self, ProjectError> {
        let setting = CoreSetting::load(&paths.resolve(&paths.core_setting_file))?;
        let outline = OverallOutline::load(&paths.resolve(&paths.overall_outline_file))?;
        Ok(Self { setting, outline })
    }
}

fn read_mapping(path: &Path) -> Result<Mapping, ProjectError> {
    let contents = fs::read_to_string(path).map_err(|source| ProjectError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&contents).map_err(|source| ProjectError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ProjectError::NotAMapping {
            path: path.to_path_buf(),
        }),
    }
}

fn act_entry(mapping: &Mapping, number: u32) -> Option<(String, String)> {
    let mut candidates = vec![format!("第{number}幕"), format!("Act {number}")];
    if let Some(numeral) = CHINESE_NUMERALS.get(number as usize - 1) {
        candidates.push(format!("第{numeral}幕"));
    }

    for (key, value) in mapping {
        let Some(key) = key.as_str() else {
            continue;
        };
        let normalized = key.trim();
        let matches = candidates
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(normalized));
        if matches {
            let text = value_text(value);
            if !text.is_empty() {
                return Some((normalized.to_string(), text));
            }
        }
    }
    None
}

fn parse_act_key(key: &str) -> Option<u32> {
    let key = key.trim();
    if let Some(caps) = act_key_regex().captures(key) {
        let token = caps.get(1).or_else(|| caps.get(2))?.as_str();
        if let Ok(number) = token.parse::<u32>() {
            return Some(number);
        }
        return CHINESE_NUMERALS
            .iter()
            .position(|numeral| *numeral == token)
            .map(|position| position as u32 + 1);
    }
    None
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

fn chapter_numbers(text: &str) -> Vec<u32> {
    let mut numbers = Vec::new();
    for regex in chapter_patterns() {
        for caps in regex.captures_iter(text) {
            numbers.extend(
                caps.iter()
                    .skip(1)
                    .flatten()
                    .filter_map(|m| m.as_str().parse::<u32>().ok()),
            );
        }
    }
    numbers
}

fn chapter_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"第\s*(\d+)\s*[-~～—至]\s*(\d+)\s*章",
            r"第\s*(\d+)\s*章\s*(?:到|至)\s*第\s*(\d+)\s*章",
            r"(\d+)\s*[-~～—]\s*(\d+)\s*章",
            r"第\s*(\d+)\s*章",
            r"(?i)chapters?\s*(\d+)(?:\s*(?:-|to)\s*(\d+))?",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("invalid chapter range regex"))
        .collect()
    })
}

fn act_key_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:第\s*([0-9一二三四五六七八九十]+)\s*幕|(?i:act)\s*(\d+))$")
            .expect("invalid act key regex")
    })
}
