//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp: model validation and
//! loading, contexts, sampling and the per-token generation loop.

pub mod engine;
pub mod llama;
pub mod model;
pub mod sampling;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub mod testing;
