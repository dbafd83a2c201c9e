//! Message types
//!
//! Chat roles and the prompt templates that turn a conversation into the
//! text a model was trained to continue.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Prompt template used to wrap a conversation before tokenization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>` markers
    ChatMl,
    /// DeepSeek `<｜User｜>` / `<｜Assistant｜>` markers
    DeepSeek,
    /// No markers; message contents are joined by blank lines
    Raw,
}

impl ChatTemplate {
    /// Renders `messages` and opens an assistant turn for the model to complete
    pub fn render(&self, messages: &[Message]) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for message in messages {
                    out.push_str("<|im_start|>");
                    out.push_str(message.role.as_str());
                    out.push('\n');
                    out.push_str(&message.content);
                    out.push_str("<|im_end|>\n");
                }
                out.push_str("<|im_start|>assistant\n");
            }
            ChatTemplate::DeepSeek => {
                for message in messages {
                    match message.role {
                        Role::System => out.push_str(&message.content),
                        Role::User => {
                            out.push_str("<｜User｜>");
                            out.push_str(&message.content);
                        }
                        Role::Assistant => {
                            out.push_str("<｜Assistant｜>");
                            out.push_str(&message.content);
                            out.push_str("<｜end▁of▁sentence｜>");
                        }
                    }
                }
                out.push_str("<｜Assistant｜>");
            }
            ChatTemplate::Raw => {
                let parts: Vec<&str> = messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .filter(|c| !c.is_empty())
                    .collect();
                out.push_str(&parts.join("\n\n"));
            }
        }
        out
    }

    /// Renders a single-turn prompt with an optional system message
    pub fn render_prompt(&self, system_prompt: Option<&str>, prompt: &str) -> String {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(Message::new(Role::System, system));
        }
        messages.push(Message::new(Role::User, prompt));
        self.render(&messages)
    }
}
