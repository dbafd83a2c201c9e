//! Host-facing bridge
//!
//! [`runtime::Runtime`] owns the model, cursors and sessions behind
//! generation-checked handles. [`worker::BridgeWorker`] runs a runtime on its
//! own thread, and [`ffi`] exposes that worker through a C ABI.

pub mod error;
pub mod ffi;
pub mod handle;
pub mod runtime;
pub mod worker;

pub use error::BridgeError;
pub use runtime::{Runtime, SessionOptions};
pub use worker::BridgeWorker;
