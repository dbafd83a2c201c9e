//! Bridge runtime
//!
//! The runtime is the explicit owner of everything the host can refer to:
//! the engine backend, the loaded model, cursors and generation sessions.
//! Cursors and sessions live in handle tables so the host only ever holds
//! generation-checked handles.
//!
//! Teardown order is fixed by field order and by [`Runtime::shutdown`]:
//! sessions (sampler, then context), cursors, model, backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bridge::error::BridgeError;
use crate::bridge::handle::{Handle, HandleKind, HandleTable, Tagged};
use crate::inference::engine::{ContextParams, EngineError, InferenceBackend, ModelParams};
use crate::inference::model::validate_gguf;
use crate::inference::session::{Session, SessionState};
use crate::inference::streaming::{Completion, StepOutcome};
use crate::types::config::{BridgeConfig, GenerationLimits, SamplingConfig};
use crate::types::message::ChatTemplate;
use crate::types::model::{ModelInfo, ModelKind};

/// Token counter lent to a session on every step
#[derive(Debug, Default)]
pub struct Cursor {
    n_past: u32,
    bound: bool,
}

impl Tagged for Cursor {
    const KIND: HandleKind = HandleKind::Cursor;
}

/// A session together with the cursor it was primed with
pub struct SessionSlot<B: InferenceBackend> {
    session: Session<B>,
    cursor: CursorHandle,
}

impl<B: InferenceBackend> Tagged for SessionSlot<B> {
    const KIND: HandleKind = HandleKind::Sampler;
}

pub type CursorHandle = Handle<Cursor>;
pub type SamplerHandle<B> = Handle<SessionSlot<B>>;

/// Per-session overrides of the runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub sampling: Option<SamplingConfig>,
    pub limits: Option<GenerationLimits>,
    pub system_prompt: Option<String>,
    pub chat_template: Option<ChatTemplate>,
}

struct LoadedModel<B: InferenceBackend> {
    model: Arc<B::Model>,
    info: ModelInfo,
}

/// Owner of the backend, model, cursors and sessions
pub struct Runtime<B: InferenceBackend> {
    config: BridgeConfig,
    // Field order is drop order.
    sessions: HandleTable<SessionSlot<B>>,
    cursors: HandleTable<Cursor>,
    model: Option<LoadedModel<B>>,
    backend: Option<B>,
}

impl<B: InferenceBackend> Runtime<B> {
    /// Creates a runtime with no backend and no model
    pub fn new(mut config: BridgeConfig) -> Self {
        config.validate();
        Self {
            config,
            sessions: HandleTable::new(),
            cursors: HandleTable::new(),
            model: None,
            backend: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Replaces the configuration; applies to sessions created afterwards
    pub fn set_config(&mut self, mut config: BridgeConfig) {
        config.validate();
        self.config = config;
        tracing::debug!("Runtime configuration updated");
    }

    pub fn model_info(&self) -> Option<&ModelInfo> {
        self.model.as_ref().map(|m| &m.info)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Initializes the backend (once) and loads the model at `model_path`
    ///
    /// On failure no model is kept, so a later call starts from a clean state.
    pub fn init(&mut self, model_path: &Path, type_tag: &str) -> Result<ModelInfo, BridgeError> {
        if self.model.is_some() {
            return Err(BridgeError::AlreadyLoaded);
        }

        let kind = ModelKind::from_tag(type_tag);
        if let ModelKind::Other(tag) = &kind {
            tracing::warn!("Unknown model type tag {:?}, using ChatML prompts", tag);
        }

        let header = validate_gguf(model_path).map_err(|e| {
            tracing::error!("Failed to load model {:?}: {}", model_path, e);
            BridgeError::from(EngineError::from(e))
        })?;
        tracing::debug!(
            "GGUF v{} with {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => B::init()?,
        };
        let backend = self.backend.insert(backend);

        let params = ModelParams {
            gpu_layers: self.config.gpu_layers,
        };
        let model = backend.load_model(model_path, &params).map_err(|e| {
            tracing::error!("Failed to load model {:?}: {}", model_path, e);
            e
        })?;

        let stats = backend.describe_model(&model);
        let info = ModelInfo {
            path: model_path.to_string_lossy().to_string(),
            kind,
            vocab_size: stats.vocab_size,
            embedding_dim: stats.embedding_dim,
            context_length: stats.context_length,
            param_count: stats.param_count,
            size_bytes: stats.size_bytes,
        };

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            info.path,
            info.param_count,
            info.vocab_size,
            info.context_length
        );

        self.model = Some(LoadedModel {
            model: Arc::new(model),
            info: info.clone(),
        });
        Ok(info)
    }

    /// Allocates a zeroed cursor
    pub fn new_cursor(&mut self) -> CursorHandle {
        self.cursors.insert(Cursor::default())
    }

    /// Current `n_past` of a cursor
    pub fn cursor_position(&self, cursor: CursorHandle) -> Result<u32, BridgeError> {
        self.cursors
            .get(cursor)
            .map(|c| c.n_past)
            .ok_or_else(BridgeError::invalid_cursor)
    }

    /// Releases a cursor that is not bound to a live session
    pub fn free_cursor(&mut self, cursor: CursorHandle) -> Result<(), BridgeError> {
        let slot = self
            .cursors
            .get(cursor)
            .ok_or_else(BridgeError::invalid_cursor)?;
        if slot.bound {
            return Err(BridgeError::CursorInUse);
        }
        self.cursors.remove(cursor);
        Ok(())
    }

    /// Creates a context, primes it with `prompt` and returns the sampler handle
    /// using the runtime configuration
    pub fn create_sampler_for_prompt(
        &mut self,
        prompt: &str,
        cursor: CursorHandle,
    ) -> Result<SamplerHandle<B>, BridgeError> {
        self.create_session(prompt, cursor, &SessionOptions::default())
    }

    /// Like [`create_sampler_for_prompt`](Self::create_sampler_for_prompt) with
    /// per-session overrides
    ///
    /// The cursor is reset to zero for the new context and then advanced by
    /// the prompt's token count. A cursor already bound to a live session is
    /// rejected.
    pub fn create_session(
        &mut self,
        prompt: &str,
        cursor: CursorHandle,
        options: &SessionOptions,
    ) -> Result<SamplerHandle<B>, BridgeError> {
        let loaded = self.model.as_ref().ok_or(BridgeError::ModelNotLoaded)?;
        let backend = self.backend.as_ref().ok_or(BridgeError::ModelNotLoaded)?;
        let cursor_slot = self
            .cursors
            .get_mut(cursor)
            .ok_or_else(BridgeError::invalid_cursor)?;
        if cursor_slot.bound {
            return Err(BridgeError::CursorInUse);
        }

        let kind = &loaded.info.kind;
        let template = options
            .chat_template
            .or(self.config.chat_template)
            .unwrap_or_else(|| kind.default_template());
        let system_prompt = options
            .system_prompt
            .as_deref()
            .or(self.config.system_prompt.as_deref())
            .or_else(|| kind.default_system_prompt());
        let text = template.render_prompt(system_prompt, prompt);

        let mut sampling = options
            .sampling
            .clone()
            .unwrap_or_else(|| self.config.sampling.clone());
        sampling.validate();
        let mut limits = options
            .limits
            .clone()
            .unwrap_or_else(|| self.config.limits.clone());
        limits.validate();

        let params = ContextParams {
            n_ctx: self.config.n_ctx,
            n_batch: self.config.n_batch,
            n_threads: self.config.thread_count(),
        };

        let mut n_past = 0;
        let session = Session::start(
            backend,
            &loaded.model,
            &params,
            &text,
            &sampling,
            &limits,
            &mut n_past,
        )
        .map_err(|e| {
            tracing::error!("Failed to start session: {}", e);
            e
        })?;

        cursor_slot.n_past = n_past;
        cursor_slot.bound = true;

        let handle = self.sessions.insert(SessionSlot { session, cursor });
        tracing::info!(
            "Session {:?} primed with {} tokens (n_ctx={}, n_batch={}, threads={})",
            handle,
            n_past,
            params.n_ctx,
            params.n_batch,
            params.n_threads
        );
        Ok(handle)
    }

    /// Runs one generation step of `sampler`, advancing `cursor`
    ///
    /// A failure inside the step tears the session down; its handle is
    /// invalid afterwards.
    pub fn generate_next_token(
        &mut self,
        cursor: CursorHandle,
        sampler: SamplerHandle<B>,
    ) -> Result<StepOutcome, BridgeError> {
        let slot = self
            .sessions
            .get_mut(sampler)
            .ok_or_else(BridgeError::invalid_sampler)?;
        if slot.cursor != cursor {
            return Err(BridgeError::CursorMismatch);
        }
        let cursor_slot = self
            .cursors
            .get_mut(cursor)
            .ok_or_else(BridgeError::invalid_cursor)?;
        let backend = self.backend.as_ref().ok_or(BridgeError::ModelNotLoaded)?;

        match slot.session.step(backend, &mut cursor_slot.n_past) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("Generation step failed, closing session {:?}: {}", sampler, e);
                cursor_slot.bound = false;
                self.sessions.remove(sampler);
                Err(e.into())
            }
        }
    }

    /// Lifecycle state of a session
    pub fn session_state(&self, sampler: SamplerHandle<B>) -> Result<SessionState, BridgeError> {
        self.sessions
            .get(sampler)
            .map(|slot| slot.session.state())
            .ok_or_else(BridgeError::invalid_sampler)
    }

    /// Frees a session's sampler and context
    ///
    /// Freeing an already-freed handle returns
    /// [`BridgeError::InvalidHandle`] and changes nothing.
    pub fn free_sampler(&mut self, sampler: SamplerHandle<B>) -> Result<(), BridgeError> {
        let slot = self
            .sessions
            .remove(sampler)
            .ok_or_else(BridgeError::invalid_sampler)?;
        if let Some(cursor) = self.cursors.get_mut(slot.cursor) {
            cursor.bound = false;
        }
        tracing::debug!(
            "Session {:?} freed after {} tokens",
            sampler,
            slot.session.generated_tokens()
        );
        Ok(())
    }

    /// Runs a whole completion, calling `on_token` for every non-empty fragment
    ///
    /// Cursor and session are created for the call and always released.
    pub fn complete(
        &mut self,
        prompt: &str,
        options: &SessionOptions,
        mut on_token: impl FnMut(&str),
    ) -> Result<Completion, BridgeError> {
        let started = Instant::now();
        let cursor = self.new_cursor();
        let result = self.run_completion(prompt, cursor, options, started, &mut on_token);
        self.free_cursor(cursor).ok();
        result
    }

    fn run_completion(
        &mut self,
        prompt: &str,
        cursor: CursorHandle,
        options: &SessionOptions,
        started: Instant,
        on_token: &mut impl FnMut(&str),
    ) -> Result<Completion, BridgeError> {
        let sampler = self.create_session(prompt, cursor, options)?;
        let prompt_tokens = self.cursor_position(cursor)?;

        let mut text = String::new();
        let mut time_to_first_token = None;
        let outcome = loop {
            match self.generate_next_token(cursor, sampler) {
                Ok(StepOutcome::Token(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    time_to_first_token.get_or_insert_with(|| started.elapsed());
                    on_token(&fragment);
                    text.push_str(&fragment);
                }
                Ok(StepOutcome::End(reason)) => break Ok(reason),
                Err(e) => break Err(e),
            }
        };

        let generated_tokens = self
            .sessions
            .get(sampler)
            .map(|slot| slot.session.generated_tokens())
            .unwrap_or(0);
        // Already gone if the step failed.
        self.free_sampler(sampler).ok();

        let stop_reason = outcome?;
        let completion = Completion {
            text,
            prompt_tokens,
            generated_tokens,
            stop_reason,
            time_to_first_token,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Completion finished ({}): {} tokens, {:.1} tok/s ({:.1} tok/s after first token)",
            completion.stop_reason,
            completion.generated_tokens,
            completion.tokens_per_second(),
            completion.decoding_speed()
        );
        Ok(completion)
    }

    /// Frees every session, cursor, the model and the backend
    ///
    /// Safe to call more than once. `init` may be called again afterwards.
    pub fn shutdown(&mut self) {
        let sessions = self.sessions.len();
        self.sessions.clear();
        self.cursors.clear();
        self.model = None;
        let had_backend = self.backend.take().is_some();
        if had_backend || sessions > 0 {
            tracing::info!("Runtime shut down ({} sessions closed)", sessions);
        }
    }
}

impl<B: InferenceBackend> Drop for Runtime<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
