//! Generation session
//!
//! A session owns one context and one sampler built for it, and drives the
//! token loop:
//!
//! ```text
//! Primed --step--> Generating --step--> ... --EOS / limit--> Ended
//! ```
//!
//! The caller keeps the cursor (`n_past`, tokens already in the KV cache) and
//! lends it to every call. Priming advances it by the prompt's token count;
//! each generated token advances it by exactly one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::inference::engine::{ContextParams, EngineError, InferenceBackend};
use crate::inference::streaming::{StepOutcome, StopReason, Utf8Accumulator};
use crate::types::config::{GenerationLimits, SamplingConfig};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Prompt consumed, nothing generated yet
    Primed,
    /// At least one step has run
    Generating,
    /// No further tokens will be produced
    Ended(StopReason),
}

/// Tokenizes `text` and feeds it through the context in `n_batch` chunks
///
/// Positions start at `*n_past`, which is advanced by the number of tokens
/// consumed. Logits are requested for the final token only. BOS is added on
/// the initial fill of an empty context. Returns the token count.
pub fn prime_context<B: InferenceBackend>(
    backend: &B,
    model: &B::Model,
    ctx: &mut B::Context,
    text: &str,
    params: &ContextParams,
    n_past: &mut u32,
    initial_fill: bool,
) -> Result<u32, EngineError> {
    let tokens = backend.tokenize(model, text, initial_fill)?;
    if tokens.is_empty() {
        return Err(EngineError::Tokenization(
            "prompt produced no tokens".to_string(),
        ));
    }

    // Leave room for at least one generated token.
    if *n_past as usize + tokens.len() >= params.n_ctx as usize {
        return Err(EngineError::PromptTooLong {
            tokens: tokens.len(),
            n_ctx: params.n_ctx,
        });
    }

    let n_batch = params.n_batch.max(1) as usize;
    let n_chunks = tokens.len().div_ceil(n_batch);
    for (i, chunk) in tokens.chunks(n_batch).enumerate() {
        backend.decode(ctx, chunk, *n_past, i + 1 == n_chunks)?;
        *n_past += chunk.len() as u32;
    }

    tracing::debug!("Primed context with {} tokens in {} batches", tokens.len(), n_chunks);
    Ok(tokens.len() as u32)
}

/// One conversation turn: context, sampler and stop conditions
pub struct Session<B: InferenceBackend> {
    // Field order is drop order: sampler, then context, then the model reference.
    sampler: B::Sampler,
    context: B::Context,
    model: Arc<B::Model>,
    state: SessionState,
    n_ctx: u32,
    prompt_tokens: u32,
    generated_tokens: u32,
    max_new_tokens: Option<u32>,
    /// Lowercased
    stop_words: Vec<String>,
    /// Lowercased output, kept only when stop words are set
    generated_text: String,
    deadline: Option<Instant>,
    utf8: Utf8Accumulator,
}

impl<B: InferenceBackend> Session<B> {
    /// Creates a context, primes it with the formatted `prompt` and builds the sampler
    ///
    /// `n_past` is reset to zero for the new context and left at the
    /// prompt's token count. Nothing is allocated on failure.
    pub fn start(
        backend: &B,
        model: &Arc<B::Model>,
        params: &ContextParams,
        prompt: &str,
        sampling: &SamplingConfig,
        limits: &GenerationLimits,
        n_past: &mut u32,
    ) -> Result<Self, EngineError> {
        let started = Instant::now();
        let mut context = backend.create_context(model, params)?;

        let mut cursor = 0;
        let prompt_tokens = prime_context(
            backend,
            model.as_ref(),
            &mut context,
            prompt,
            params,
            &mut cursor,
            true,
        )?;
        let sampler = backend.create_sampler(model.as_ref(), sampling)?;
        *n_past = cursor;

        Ok(Self {
            sampler,
            context,
            model: Arc::clone(model),
            state: SessionState::Primed,
            n_ctx: params.n_ctx,
            prompt_tokens,
            generated_tokens: 0,
            max_new_tokens: limits.max_new_tokens,
            stop_words: limits.stop_words.iter().map(|w| w.to_lowercase()).collect(),
            generated_text: String::new(),
            deadline: limits
                .timeout_ms
                .map(|ms| started + Duration::from_millis(ms)),
            utf8: Utf8Accumulator::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    pub fn generated_tokens(&self) -> u32 {
        self.generated_tokens
    }

    pub fn context(&self) -> &B::Context {
        &self.context
    }

    /// Produces the next text fragment
    ///
    /// Samples from the current logits, feeds the token back into the
    /// context at position `*n_past` and advances `*n_past` by one. Once the
    /// session has ended every call returns the same [`StepOutcome::End`]
    /// without touching the engine. Errors are fatal to the session.
    pub fn step(&mut self, backend: &B, n_past: &mut u32) -> Result<StepOutcome, EngineError> {
        if let SessionState::Ended(reason) = self.state {
            return Ok(StepOutcome::End(reason));
        }
        if let Some(reason) = self.limit_reached(*n_past) {
            return Ok(self.end(reason));
        }
        self.state = SessionState::Generating;

        let token = backend.sample(&mut self.sampler, &mut self.context)?;
        if backend.is_end_of_generation(self.model.as_ref(), token) {
            self.utf8.finish()?;
            return Ok(self.end(StopReason::EndOfSequence));
        }

        let bytes = backend.token_to_bytes(self.model.as_ref(), token)?;
        backend.decode(&mut self.context, &[token], *n_past, true)?;
        *n_past += 1;
        self.generated_tokens += 1;

        let fragment = self.utf8.push(&bytes)?;
        tracing::trace!("token {} -> {:?}", token, fragment);

        if !self.stop_words.is_empty() {
            self.generated_text.push_str(&fragment.to_lowercase());
            if self
                .stop_words
                .iter()
                .any(|w| self.generated_text.contains(w.as_str()))
            {
                return Ok(self.end(StopReason::StopWord));
            }
        }

        Ok(StepOutcome::Token(fragment))
    }

    fn limit_reached(&self, n_past: u32) -> Option<StopReason> {
        if self
            .max_new_tokens
            .is_some_and(|max| self.generated_tokens >= max)
        {
            return Some(StopReason::MaxTokens);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::Timeout);
        }
        if n_past >= self.n_ctx {
            return Some(StopReason::ContextFull);
        }
        None
    }

    fn end(&mut self, reason: StopReason) -> StepOutcome {
        if self.utf8.has_pending() {
            tracing::debug!("Dropping an unfinished character at end of session");
        }
        tracing::debug!(
            "Session ended ({}) after {} tokens",
            reason,
            self.generated_tokens
        );
        self.state = SessionState::Ended(reason);
        StepOutcome::End(reason)
    }
}
