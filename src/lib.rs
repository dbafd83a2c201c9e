//! llama-bridge
//!
//! Runs llama.cpp models on-device for a host application. The Rust API is
//! [`bridge::Runtime`] (or [`bridge::BridgeWorker`] from any thread); hosts
//! that cannot link Rust use the `llmb_*` C functions in [`bridge::ffi`].

pub mod bridge;
pub mod inference;
pub mod logging;
pub mod storage;
pub mod system;
pub mod types;
