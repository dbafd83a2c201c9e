//! Sampler chain planning
//!
//! Turns a [`SamplingConfig`] into the ordered list of stages a backend
//! builds its sampler from. Keeping the plan separate from llama.cpp lets the
//! chain be checked without a model.

use crate::types::config::{MirostatMode, SamplingConfig};

/// One stage of a sampler chain, in application order
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    Penalties {
        last_n: i32,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    Temperature(f32),
    Mirostat {
        seed: u32,
        tau: f32,
        eta: f32,
    },
    MirostatV2 {
        seed: u32,
        tau: f32,
        eta: f32,
    },
    Greedy,
    TopK(i32),
    TopP(f32),
    MinP(f32),
    Dist(u32),
}

impl SamplerStage {
    /// True for the stage that picks the token
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Mirostat { .. } | Self::MirostatV2 { .. } | Self::Greedy | Self::Dist(_)
        )
    }
}

/// Plans the chain for `config`, drawing randomness from `seed`
///
/// Penalties come first when active. Mirostat replaces the truncation
/// stages; a greedy configuration collapses to a single argmax stage.
pub fn plan_sampler_chain(config: &SamplingConfig, seed: u32) -> Vec<SamplerStage> {
    let mut chain = Vec::new();

    if config.has_penalties() {
        chain.push(SamplerStage::Penalties {
            last_n: config.repeat_last_n,
            repeat: config.repeat_penalty,
            frequency: config.frequency_penalty,
            presence: config.presence_penalty,
        });
    }

    match config.mirostat {
        MirostatMode::V1 => {
            chain.push(SamplerStage::Temperature(config.temperature));
            chain.push(SamplerStage::Mirostat {
                seed,
                tau: config.mirostat_tau,
                eta: config.mirostat_eta,
            });
        }
        MirostatMode::V2 => {
            chain.push(SamplerStage::Temperature(config.temperature));
            chain.push(SamplerStage::MirostatV2 {
                seed,
                tau: config.mirostat_tau,
                eta: config.mirostat_eta,
            });
        }
        MirostatMode::Disabled if config.is_greedy() => chain.push(SamplerStage::Greedy),
        MirostatMode::Disabled => {
            if config.top_k > 0 {
                chain.push(SamplerStage::TopK(config.top_k));
            }
            chain.push(SamplerStage::TopP(config.top_p));
            chain.push(SamplerStage::MinP(config.min_p));
            chain.push(SamplerStage::Temperature(config.temperature));
            chain.push(SamplerStage::Dist(seed));
        }
    }

    chain
}
