//! llama.cpp backend
//!
//! Implements [`InferenceBackend`] with `llama-cpp-2`.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use crate::inference::engine::{
    rand_seed, ContextParams, EngineError, InferenceBackend, ModelParams, ModelStats, Token,
};
use crate::inference::sampling::{plan_sampler_chain, SamplerStage};
use crate::types::config::SamplingConfig;

/// Candidates considered by mirostat v1
const MIROSTAT_M: i32 = 100;

/// Owns the process-wide llama.cpp backend
///
/// `llama_backend_init` runs when this is created and `llama_backend_free`
/// when it is dropped; only one may exist at a time.
pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

/// A llama.cpp context plus the batch used to feed it
pub struct LlamaSessionContext {
    // Declared before `_model` so the context is dropped first.
    ctx: LlamaContext<'static>,
    batch: LlamaBatch,
    /// Batch index holding the logits of the last decode, if requested
    logits_index: Option<i32>,
    _model: Arc<LlamaModel>,
}

impl InferenceBackend for LlamaCppBackend {
    type Model = LlamaModel;
    type Context = LlamaSessionContext;
    type Sampler = LlamaSampler;

    fn init() -> Result<Self, EngineError> {
        send_logs_to_tracing(LogOptions::default());
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(Self { backend })
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaModel, EngineError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::LoadFailure(e.to_string()))
    }

    fn describe_model(&self, model: &LlamaModel) -> ModelStats {
        ModelStats {
            vocab_size: model.n_vocab(),
            embedding_dim: model.n_embd(),
            context_length: model.n_ctx_train(),
            param_count: model.n_params() as u64,
            size_bytes: model.size() as u64,
        }
    }

    fn create_context(
        &self,
        model: &Arc<LlamaModel>,
        params: &ContextParams,
    ) -> Result<LlamaSessionContext, EngineError> {
        let n_ctx = NonZeroU32::new(params.n_ctx).ok_or_else(|| {
            EngineError::ContextCreationFailure("context size must be non-zero".to_string())
        })?;
        let threads = i32::try_from(params.n_threads).unwrap_or(i32::MAX);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let model = Arc::clone(model);
        let ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreationFailure(e.to_string()))?;

        // SAFETY: the context borrows the model behind `model`, whose heap
        // allocation is kept alive by the Arc stored next to it. The struct
        // declares `ctx` first, so the context is dropped before that Arc.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        Ok(LlamaSessionContext {
            ctx,
            batch: LlamaBatch::new(params.n_batch as usize, 1),
            logits_index: None,
            _model: model,
        })
    }

    fn tokenize(
        &self,
        model: &LlamaModel,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn decode(
        &self,
        ctx: &mut LlamaSessionContext,
        tokens: &[Token],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        ctx.logits_index = None;
        ctx.batch.clear();

        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            let pos = i32::try_from(start as usize + i)
                .map_err(|_| EngineError::ForwardPassFailure("position overflow".to_string()))?;
            ctx.batch
                .add(LlamaToken::new(*token), pos, &[0], want_logits && i == last)
                .map_err(|e| {
                    EngineError::ForwardPassFailure(format!("Failed to add token to batch: {}", e))
                })?;
        }

        ctx.ctx
            .decode(&mut ctx.batch)
            .map_err(|e| EngineError::ForwardPassFailure(format!("Failed to decode: {}", e)))?;

        if want_logits {
            ctx.logits_index = Some(ctx.batch.n_tokens() - 1);
        }
        Ok(())
    }

    fn create_sampler(
        &self,
        model: &LlamaModel,
        config: &SamplingConfig,
    ) -> Result<LlamaSampler, EngineError> {
        let seed = config.seed.unwrap_or_else(rand_seed);
        let chain = plan_sampler_chain(config, seed)
            .into_iter()
            .map(|stage| match stage {
                SamplerStage::Penalties {
                    last_n,
                    repeat,
                    frequency,
                    presence,
                } => LlamaSampler::penalties(last_n, repeat, frequency, presence),
                SamplerStage::Temperature(t) => LlamaSampler::temp(t),
                SamplerStage::Mirostat { seed, tau, eta } => {
                    LlamaSampler::mirostat(model.n_vocab(), seed, tau, eta, MIROSTAT_M)
                }
                SamplerStage::MirostatV2 { seed, tau, eta } => {
                    LlamaSampler::mirostat_v2(seed, tau, eta)
                }
                SamplerStage::Greedy => LlamaSampler::greedy(),
                SamplerStage::TopK(k) => LlamaSampler::top_k(k),
                SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
                SamplerStage::MinP(p) => LlamaSampler::min_p(p, 1),
                SamplerStage::Dist(seed) => LlamaSampler::dist(seed),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            "Sampler chain: top_k={} top_p={} temp={} mirostat={:?}",
            config.top_k,
            config.top_p,
            config.temperature,
            config.mirostat
        );
        Ok(LlamaSampler::chain_simple(chain))
    }

    fn sample(
        &self,
        sampler: &mut LlamaSampler,
        ctx: &mut LlamaSessionContext,
    ) -> Result<Token, EngineError> {
        let idx = ctx.logits_index.ok_or_else(|| {
            EngineError::ForwardPassFailure("no logits available to sample from".to_string())
        })?;
        // llama_sampler_sample also accepts the token into the chain's history.
        let token = sampler.sample(&ctx.ctx, idx);
        Ok(token.0)
    }

    fn is_end_of_generation(&self, model: &LlamaModel, token: Token) -> bool {
        model.is_eog_token(LlamaToken::new(token))
    }

    fn token_to_bytes(&self, model: &LlamaModel, token: Token) -> Result<Vec<u8>, EngineError> {
        model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| {
                EngineError::DecodeFailure(format!("Failed to convert token to bytes: {}", e))
            })
    }
}
