use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical task category used purely to pick a provider preference list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    /// Long-context planning work (unit outlines).
    Planning,
    /// Fast drafting work (unit expansion).
    Drafting,
}

impl ModelClass {
    pub const ALL: [ModelClass; 2] = [ModelClass::Planning, ModelClass::Drafting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Drafting => "drafting",
        }
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Opaque generation payload. The model class only drives routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model_class: ModelClass,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(model_class: ModelClass, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_class,
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Appends a user turn, used for corrective re-prompts.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Concatenated user content; handy for single-prompt transports.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Successful generation payload as returned by the client.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub attempts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_class_round_trips_as_lowercase() {
        let json = serde_json::to_string(&ModelClass::Drafting).unwrap();
        assert_eq!(json, "\"drafting\"");
        let parsed: ModelClass = serde_json::from_str("\"planning\"").unwrap();
        assert_eq!(parsed, ModelClass::Planning);
    }

    #[test]
    fn user_and_system_text_are_split_by_role() {
        let mut request = GenerationRequest::new(
            ModelClass::Planning,
            vec![ChatMessage::system("be terse"), ChatMessage::user("outline 3")],
        );
        request.push_user("fix the format");

        assert_eq!(request.system_text().as_deref(), Some("be terse"));
        assert_eq!(request.user_text(), "outline 3\n\nfix the format");
    }
}
