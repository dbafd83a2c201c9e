//! Model types
//!
//! Defines model metadata and the model family tag passed by the host.

use serde::{Deserialize, Serialize};

use crate::types::message::ChatTemplate;

/// System prompt used for DeepSeek-R1 distilled models
pub const DEEPSEEK_R1_SYSTEM_PROMPT: &str =
    "You are DeepSeek-R1, created by Nexa AI. You are a helpful assistant.";

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Path to the GGUF file
    pub path: String,
    /// Model family the host asked for
    pub kind: ModelKind,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Model family, parsed from the type tag given to `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// DeepSeek-R1 distilled into a Qwen/Llama base; ChatML prompts
    DeepSeekR1Distill,
    /// Native DeepSeek chat format
    DeepSeek,
    /// Any ChatML model
    ChatMl,
    /// Completion model, prompt passed through untouched
    Raw,
    /// Unrecognized tag, treated like ChatML
    Other(String),
}

impl ModelKind {
    /// Parses a host type tag (case-insensitive)
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "deepseek-r1-distill" | "deepseek-r1" | "deepseek_r1_distill" => {
                ModelKind::DeepSeekR1Distill
            }
            "deepseek" => ModelKind::DeepSeek,
            "chatml" | "qwen" => ModelKind::ChatMl,
            "raw" | "completion" => ModelKind::Raw,
            _ => ModelKind::Other(tag.to_string()),
        }
    }

    /// Template used when the configuration does not name one
    pub fn default_template(&self) -> ChatTemplate {
        match self {
            ModelKind::DeepSeek => ChatTemplate::DeepSeek,
            ModelKind::Raw => ChatTemplate::Raw,
            ModelKind::DeepSeekR1Distill | ModelKind::ChatMl | ModelKind::Other(_) => {
                ChatTemplate::ChatMl
            }
        }
    }

    /// System prompt used when the configuration does not name one
    pub fn default_system_prompt(&self) -> Option<&'static str> {
        match self {
            ModelKind::DeepSeekR1Distill => Some(DEEPSEEK_R1_SYSTEM_PROMPT),
            _ => None,
        }
    }
}
