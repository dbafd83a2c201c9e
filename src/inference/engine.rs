//! Inference engine abstraction
//!
//! The bridge never touches tensors or sampling math itself. Everything it
//! needs from an inference library is expressed by [`InferenceBackend`]:
//! load a model, create a context, tokenize, run a forward pass, sample and
//! detokenize. [`crate::inference::llama::LlamaCppBackend`] implements it on
//! top of llama.cpp.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::inference::model::ModelError;
use crate::types::config::SamplingConfig;

/// Vocabulary id of a token
pub type Token = i32;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    LoadFailure(String),

    #[error("Failed to create context: {0}")]
    ContextCreationFailure(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt has {tokens} tokens but the context window holds {n_ctx}")]
    PromptTooLong { tokens: usize, n_ctx: u32 },

    #[error("Forward pass failed: {0}")]
    ForwardPassFailure(String),

    #[error("Malformed token text: {0}")]
    DecodeFailure(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::LoadFailure(e.to_string())
    }
}

/// Parameters for loading a model
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Parameters for creating an inference context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Maximum number of tokens per decode call
    pub n_batch: u32,
    /// Threads used for both generation and batch processing
    pub n_threads: u32,
}

/// Metadata reported by the engine for a loaded model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub vocab_size: i32,
    pub embedding_dim: i32,
    pub context_length: u32,
    pub param_count: u64,
    pub size_bytes: u64,
}

/// An inference library the bridge can drive
///
/// Contexts keep their model alive through the `Arc` they are created
/// from. Implementations may hold raw pointers, so none of the associated
/// types are required to be `Send`; the bridge confines them to one thread.
pub trait InferenceBackend: Sized {
    type Model;
    type Context;
    type Sampler;

    /// One-time global initialization of the library
    fn init() -> Result<Self, EngineError>;

    /// Loads model weights from a file
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn describe_model(&self, model: &Self::Model) -> ModelStats;

    /// Allocates a context (KV cache and batch buffers) for `model`
    fn create_context(
        &self,
        model: &Arc<Self::Model>,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;

    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<Token>, EngineError>;

    /// Runs a forward pass over `tokens`, placed at positions `start..`
    ///
    /// `tokens` never exceeds the context's batch size. When `want_logits` is
    /// set, logits for the last token are kept for the next [`sample`] call.
    ///
    /// [`sample`]: InferenceBackend::sample
    fn decode(
        &self,
        ctx: &mut Self::Context,
        tokens: &[Token],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError>;

    /// Builds a sampler chain from `config`
    fn create_sampler(
        &self,
        model: &Self::Model,
        config: &SamplingConfig,
    ) -> Result<Self::Sampler, EngineError>;

    /// Picks the next token from the latest logits and records it in the
    /// sampler's history
    fn sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context)
        -> Result<Token, EngineError>;

    fn is_end_of_generation(&self, model: &Self::Model, token: Token) -> bool;

    /// Raw bytes of a token's text; may be part of a multi-byte character
    fn token_to_bytes(&self, model: &Self::Model, token: Token) -> Result<Vec<u8>, EngineError>;
}

/// Generates a random seed using system entropy
pub fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
