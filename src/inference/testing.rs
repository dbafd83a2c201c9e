//! Scripted backend for tests
//!
//! A deterministic stand-in for llama.cpp. Tokens are bytes (`0..=255`) plus
//! BOS and EOS. A model file is a GGUF header followed by a JSON script that
//! says what the "model" replies; a greedy sampler emits the reply one byte
//! per step and then EOS, any other sampler emits as many seeded random
//! letters. Contexts check positions the way a KV cache would, so
//! cursor bookkeeping errors surface as forward-pass failures.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inference::engine::{
    rand_seed, ContextParams, EngineError, InferenceBackend, ModelParams, ModelStats, Token,
};
use crate::inference::model::gguf_header_bytes;
use crate::inference::sampling::{plan_sampler_chain, SamplerStage};
use crate::types::config::SamplingConfig;

pub const BOS: Token = 256;
pub const EOS: Token = 257;

/// Contents of a scripted model file after the GGUF header
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    /// Bytes emitted after the prompt, one per step
    pub reply: Vec<u8>,
    /// Fail any decode once this many tokens are cached
    pub fail_at: Option<usize>,
    /// Fail context creation
    pub fail_context: bool,
    /// Stall the first sample of every sampler
    pub sample_delay_ms: Option<u64>,
}

impl Script {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }
}

/// Writes a scripted model file into `dir` and returns its path
pub fn write_model(dir: &Path, name: &str, script: &Script) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&gguf_header_bytes(0, 0)).unwrap();
    file.write_all(&serde_json::to_vec(script).unwrap()).unwrap();
    path
}

pub struct ScriptedBackend;

pub struct ScriptedModel {
    script: Script,
    sampler_configs: Mutex<Vec<SamplingConfig>>,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self::from_script(script))
    }

    fn from_script(script: Script) -> Self {
        Self {
            script,
            sampler_configs: Mutex::new(Vec::new()),
        }
    }

    /// Configurations passed to `create_sampler`, oldest first
    pub fn sampler_configs(&self) -> Vec<SamplingConfig> {
        self.sampler_configs.lock().unwrap().clone()
    }
}

pub struct ScriptedContext {
    model: Arc<ScriptedModel>,
    n_ctx: u32,
    n_batch: u32,
    history: Vec<Token>,
    has_logits: bool,
}

impl ScriptedContext {
    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn model(&self) -> &ScriptedModel {
        &self.model
    }
}

pub struct ScriptedSampler {
    chain: Vec<SamplerStage>,
    rng: u32,
    emitted: usize,
}

impl ScriptedSampler {
    fn next_letter(&mut self) -> Token {
        // xorshift32
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        Token::from(b'a') + (self.rng % 26) as Token
    }
}

impl InferenceBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;
    type Sampler = ScriptedSampler;

    fn init() -> Result<Self, EngineError> {
        Ok(ScriptedBackend)
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<ScriptedModel, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| EngineError::LoadFailure(e.to_string()))?;
        let script = serde_json::from_slice(&bytes[24..])
            .map_err(|e| EngineError::LoadFailure(format!("bad script: {}", e)))?;
        Ok(ScriptedModel::from_script(script))
    }

    fn describe_model(&self, _model: &ScriptedModel) -> ModelStats {
        ModelStats {
            vocab_size: 258,
            embedding_dim: 8,
            context_length: 4096,
            param_count: 1000,
            size_bytes: 4000,
        }
    }

    fn create_context(
        &self,
        model: &Arc<ScriptedModel>,
        params: &ContextParams,
    ) -> Result<ScriptedContext, EngineError> {
        if model.script.fail_context {
            return Err(EngineError::ContextCreationFailure(
                "out of memory".to_string(),
            ));
        }
        Ok(ScriptedContext {
            model: Arc::clone(model),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            history: Vec::new(),
            has_logits: false,
        })
    }

    fn tokenize(
        &self,
        _model: &ScriptedModel,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(Token::from));
        Ok(tokens)
    }

    fn decode(
        &self,
        ctx: &mut ScriptedContext,
        tokens: &[Token],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        ctx.has_logits = false;
        if tokens.len() > ctx.n_batch as usize {
            return Err(EngineError::ForwardPassFailure(format!(
                "batch of {} exceeds n_batch {}",
                tokens.len(),
                ctx.n_batch
            )));
        }
        if start as usize != ctx.history.len() {
            return Err(EngineError::ForwardPassFailure(format!(
                "position {} does not follow cache of {}",
                start,
                ctx.history.len()
            )));
        }
        if ctx.history.len() + tokens.len() > ctx.n_ctx as usize {
            return Err(EngineError::ForwardPassFailure("KV cache full".to_string()));
        }
        if let Some(limit) = ctx.model.script.fail_at {
            if ctx.history.len() >= limit {
                return Err(EngineError::ForwardPassFailure("injected failure".to_string()));
            }
        }
        ctx.history.extend_from_slice(tokens);
        ctx.has_logits = want_logits;
        Ok(())
    }

    fn create_sampler(
        &self,
        model: &ScriptedModel,
        config: &SamplingConfig,
    ) -> Result<ScriptedSampler, EngineError> {
        model.sampler_configs.lock().unwrap().push(config.clone());
        let seed = config.seed.unwrap_or_else(rand_seed);
        Ok(ScriptedSampler {
            chain: plan_sampler_chain(config, seed),
            // xorshift state must be non-zero
            rng: seed | 1,
            emitted: 0,
        })
    }

    fn sample(
        &self,
        sampler: &mut ScriptedSampler,
        ctx: &mut ScriptedContext,
    ) -> Result<Token, EngineError> {
        if !ctx.has_logits {
            return Err(EngineError::ForwardPassFailure("no logits".to_string()));
        }
        let script = &ctx.model.script;
        if sampler.emitted == 0 {
            if let Some(ms) = script.sample_delay_ms {
                std::thread::sleep(Duration::from_millis(ms));
            }
        }
        let token = match script.reply.get(sampler.emitted) {
            None => EOS,
            Some(b) if sampler.chain.contains(&SamplerStage::Greedy) => Token::from(*b),
            Some(_) => sampler.next_letter(),
        };
        sampler.emitted += 1;
        Ok(token)
    }

    fn is_end_of_generation(&self, _model: &ScriptedModel, token: Token) -> bool {
        token == EOS
    }

    fn token_to_bytes(&self, _model: &ScriptedModel, token: Token) -> Result<Vec<u8>, EngineError> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            BOS => Ok(Vec::new()),
            _ => Err(EngineError::DecodeFailure(format!("unknown token {}", token))),
        }
    }
}
