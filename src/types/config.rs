//! Configuration types
//!
//! Bridge, sampling and generation-limit configuration. Every field has a
//! documented default and range; `validate` clamps out-of-range values.

use serde::{Deserialize, Serialize};

use crate::types::message::ChatTemplate;

/// Context window used when the configuration does not override it
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
/// Prompt batch size used when the configuration does not override it
pub const DEFAULT_BATCH_SIZE: u32 = 512;

const MIN_CONTEXT_SIZE: u32 = 256;
const MAX_CONTEXT_SIZE: u32 = 131072;

/// Mirostat sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirostatMode {
    #[default]
    Disabled,
    V1,
    V2,
}

/// Sampler configuration
///
/// The defaults are llama.cpp's common sampling defaults with `top_k = 1` and
/// `top_p = 1.0`, i.e. greedy decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Top-k cutoff (default 1, 0 disables)
    pub top_k: i32,
    /// Nucleus cutoff (default 1.0, range 0.0 - 1.0, 1.0 disables)
    pub top_p: f32,
    /// Minimum probability relative to the best token (default 0.05, range 0.0 - 1.0)
    pub min_p: f32,
    /// Temperature (default 0.8, range 0.0 - 2.0, 0.0 = greedy)
    pub temperature: f32,
    /// Number of recent tokens penalized (default 64, -1 = whole context, 0 disables)
    pub repeat_last_n: i32,
    /// Repetition penalty (default 1.0 = off, range 0.0 - 2.0)
    pub repeat_penalty: f32,
    /// Frequency penalty (default 0.0, range -2.0 - 2.0)
    pub frequency_penalty: f32,
    /// Presence penalty (default 0.0, range -2.0 - 2.0)
    pub presence_penalty: f32,
    /// Mirostat mode (default disabled)
    pub mirostat: MirostatMode,
    /// Mirostat target entropy (default 5.0, > 0)
    pub mirostat_tau: f32,
    /// Mirostat learning rate (default 0.1, > 0)
    pub mirostat_eta: f32,
    /// Sampling seed (default random)
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 1,
            top_p: 1.0,
            min_p: 0.05,
            temperature: 0.8,
            repeat_last_n: 64,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: MirostatMode::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// True when the configuration always picks the most likely token
    pub fn is_greedy(&self) -> bool {
        self.mirostat == MirostatMode::Disabled && (self.top_k == 1 || self.temperature <= 0.0)
    }

    /// True when any repetition penalty is active
    pub fn has_penalties(&self) -> bool {
        self.repeat_last_n != 0
            && (self.repeat_penalty != 1.0
                || self.frequency_penalty != 0.0
                || self.presence_penalty != 0.0)
    }

    /// Clamp values into their valid ranges
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.top_k < 0 {
            tracing::warn!("top_k {} is negative, disabling top-k", self.top_k);
            self.top_k = 0;
        }
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if self.repeat_last_n < -1 {
            self.repeat_last_n = -1;
        }
        self.repeat_penalty = self.repeat_penalty.clamp(0.0, 2.0);
        self.frequency_penalty = self.frequency_penalty.clamp(-2.0, 2.0);
        self.presence_penalty = self.presence_penalty.clamp(-2.0, 2.0);

        if !(self.mirostat_tau > 0.0) {
            tracing::warn!("mirostat_tau must be positive, resetting");
            self.mirostat_tau = defaults.mirostat_tau;
        }
        if !(self.mirostat_eta > 0.0) {
            tracing::warn!("mirostat_eta must be positive, resetting");
            self.mirostat_eta = defaults.mirostat_eta;
        }
    }
}

/// Limits that end a session before the model emits end-of-sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationLimits {
    /// Maximum number of generated tokens (default unlimited)
    pub max_new_tokens: Option<u32>,
    /// Case-insensitive strings that end generation when they appear in the output
    pub stop_words: Vec<String>,
    /// Wall-clock budget for one session in milliseconds (default unlimited)
    pub timeout_ms: Option<u64>,
}

impl GenerationLimits {
    pub fn validate(&mut self) {
        if self.max_new_tokens == Some(0) {
            tracing::warn!("max_new_tokens of 0 ignored");
            self.max_new_tokens = None;
        }
        if self.timeout_ms == Some(0) {
            tracing::warn!("timeout_ms of 0 ignored");
            self.timeout_ms = None;
        }
        self.stop_words.retain(|w| !w.is_empty());
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Context window in tokens (default 2048, range 256 - 131072)
    pub n_ctx: u32,
    /// Prompt batch size (default 512, range 1 - n_ctx)
    pub n_batch: u32,
    /// Threads for generation and batch processing (default min(4, cores))
    pub n_threads: Option<u32>,
    /// Number of layers offloaded to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Prompt template (default chosen from the model kind)
    pub chat_template: Option<ChatTemplate>,
    /// System prompt (default chosen from the model kind)
    pub system_prompt: Option<String>,
    /// Sampler used by sessions that do not override it
    pub sampling: SamplingConfig,
    /// Limits used by sessions that do not override them
    pub limits: GenerationLimits,
    /// Upper bound on how long a host call waits for the engine thread
    pub call_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            n_ctx: DEFAULT_CONTEXT_SIZE,
            n_batch: DEFAULT_BATCH_SIZE,
            n_threads: None,
            gpu_layers: 0,
            chat_template: None,
            system_prompt: None,
            sampling: SamplingConfig::default(),
            limits: GenerationLimits::default(),
            call_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        if !(MIN_CONTEXT_SIZE..=MAX_CONTEXT_SIZE).contains(&self.n_ctx) {
            let clamped = self.n_ctx.clamp(MIN_CONTEXT_SIZE, MAX_CONTEXT_SIZE);
            tracing::warn!("Context size {} out of range, using {}", self.n_ctx, clamped);
            self.n_ctx = clamped;
        }

        self.n_batch = self.n_batch.clamp(1, self.n_ctx);

        if self.n_threads == Some(0) {
            self.n_threads = None;
        }
        if self.call_timeout_ms == Some(0) {
            self.call_timeout_ms = None;
        }

        self.sampling.validate();
        self.limits.validate();
    }

    /// Thread count passed to the engine
    pub fn thread_count(&self) -> u32 {
        self.n_threads
            .unwrap_or_else(crate::system::default_thread_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.n_ctx, 2048);
        assert_eq!(config.n_batch, 512);
        assert_eq!(config.gpu_layers, 0);
        assert!(config.n_threads.is_none());
        assert!(config.sampling.is_greedy());
        assert_eq!(config.sampling.top_k, 1);
        assert_eq!(config.sampling.top_p, 1.0);
    }

    #[test]
    fn test_thread_count_bounds() {
        let config = BridgeConfig::default();
        let threads = config.thread_count();
        assert!((1..=4).contains(&threads));

        let config = BridgeConfig {
            n_threads: Some(8),
            ..Default::default()
        };
        assert_eq!(config.thread_count(), 8);
    }

    #[test]
    fn test_config_validation() {
        let mut config = BridgeConfig {
            n_ctx: 10,
            n_batch: 100_000,
            n_threads: Some(0),
            ..Default::default()
        };
        config.sampling.top_p = 3.0;
        config.sampling.temperature = -1.0;
        config.sampling.top_k = -5;
        config.sampling.mirostat_tau = 0.0;
        config.limits.max_new_tokens = Some(0);
        config.limits.stop_words = vec![String::new(), "</s>".to_string()];

        config.validate();

        assert_eq!(config.n_ctx, 256);
        assert_eq!(config.n_batch, 256);
        assert!(config.n_threads.is_none());
        assert_eq!(config.sampling.top_p, 1.0);
        assert_eq!(config.sampling.temperature, 0.0);
        assert_eq!(config.sampling.top_k, 0);
        assert_eq!(config.sampling.mirostat_tau, 5.0);
        assert!(config.limits.max_new_tokens.is_none());
        assert_eq!(config.limits.stop_words, vec!["</s>".to_string()]);
    }

    #[test]
    fn test_penalties_detection() {
        let mut sampling = SamplingConfig::default();
        assert!(!sampling.has_penalties());
        sampling.repeat_penalty = 1.1;
        assert!(sampling.has_penalties());
        sampling.repeat_last_n = 0;
        assert!(!sampling.has_penalties());
    }

    #[test]
    fn test_partial_json() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"n_ctx": 4096, "sampling": {"top_k": 40}}"#)
                .expect("Failed to deserialize");
        assert_eq!(config.n_ctx, 4096);
        assert_eq!(config.n_batch, 512);
        assert_eq!(config.sampling.top_k, 40);
        assert_eq!(config.sampling.top_p, 1.0);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = BridgeConfig::default();
        config.chat_template = Some(ChatTemplate::DeepSeek);
        config.sampling.mirostat = MirostatMode::V2;
        let json = serde_json::to_string(&config).expect("Failed to serialize");
        let deserialized: BridgeConfig = serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(config, deserialized);
    }
}
