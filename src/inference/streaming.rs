//! Streaming output types
//!
//! What a generation step hands back to the caller, plus the UTF-8
//! reassembly that turns token bytes into well-formed text fragments.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inference::engine::EngineError;

/// Why a session stopped producing tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model emitted an end-of-generation token
    EndOfSequence,
    /// `max_new_tokens` was reached
    MaxTokens,
    /// A stop word appeared in the output
    StopWord,
    /// The context window is full
    ContextFull,
    /// The session ran past its time budget
    Timeout,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::EndOfSequence => "end of sequence",
            StopReason::MaxTokens => "token limit",
            StopReason::StopWord => "stop word",
            StopReason::ContextFull => "context full",
            StopReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Result of one successful generation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Text of the sampled token; empty while a multi-byte character is
    /// still incomplete
    Token(String),
    /// The session has ended
    End(StopReason),
}

/// Reassembles token bytes into valid UTF-8
///
/// A token may carry only part of a multi-byte character. Incomplete
/// trailing bytes are kept until a later token completes them; bytes that can
/// never form valid UTF-8 are reported as [`EngineError::DecodeFailure`].
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends token bytes and returns the longest complete text available
    pub fn push(&mut self, bytes: &[u8]) -> Result<String, EngineError> {
        self.pending.extend_from_slice(bytes);

        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_owned();
                self.pending.clear();
                Ok(out)
            }
            // Incomplete sequence at the end: emit the valid prefix, keep the rest.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                Ok(out)
            }
            Err(e) => {
                let bad = self.pending[e.valid_up_to()..].to_vec();
                self.pending.clear();
                Err(EngineError::DecodeFailure(format!(
                    "invalid UTF-8 sequence {:02x?}",
                    bad
                )))
            }
        }
    }

    /// True if bytes of an unfinished character are buffered
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Called at end of generation; dangling bytes are malformed output
    pub fn finish(&mut self) -> Result<(), EngineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bad = std::mem::take(&mut self.pending);
        Err(EngineError::DecodeFailure(format!(
            "output ended inside a UTF-8 sequence {:02x?}",
            bad
        )))
    }
}

/// A finished completion with timing figures
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Concatenated token fragments
    pub text: String,
    /// Tokens consumed by the formatted prompt
    pub prompt_tokens: u32,
    /// Tokens generated after the prompt
    pub generated_tokens: u32,
    pub stop_reason: StopReason,
    /// Time until the first non-empty fragment
    pub time_to_first_token: Option<Duration>,
    /// Wall-clock time of the whole completion, prompt included
    pub elapsed: Duration,
}

impl Completion {
    /// Generated tokens per second over the whole completion
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        f64::from(self.generated_tokens) / secs
    }

    /// Tokens per second after the first token
    pub fn decoding_speed(&self) -> f64 {
        let Some(ttft) = self.time_to_first_token else {
            return 0.0;
        };
        let secs = self.elapsed.saturating_sub(ttft).as_secs_f64();
        if secs <= 0.0 || self.generated_tokens < 2 {
            return 0.0;
        }
        f64::from(self.generated_tokens - 1) / secs
    }
}
