//! Engine worker thread
//!
//! llama.cpp objects are not `Send`, so a single thread owns the
//! [`Runtime`] and everything in it. Callers talk to it through
//! [`BridgeWorker`], which sends a command and blocks on the reply. Handles
//! cross the channel as raw `u64` values.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bridge::error::BridgeError;
use crate::bridge::handle::Handle;
use crate::bridge::runtime::{CursorHandle, Runtime, SessionOptions};
use crate::inference::engine::InferenceBackend;
use crate::inference::streaming::{Completion, StepOutcome};
use crate::types::config::BridgeConfig;
use crate::types::model::ModelInfo;

type Reply<T> = mpsc::Sender<Result<T, BridgeError>>;

/// Callback receiving completion fragments on the worker thread
pub type TokenSink = Box<dyn FnMut(&str) + Send>;

enum Command {
    Configure {
        config: BridgeConfig,
        reply: Reply<()>,
    },
    Init {
        model_path: PathBuf,
        type_tag: String,
        reply: Reply<ModelInfo>,
    },
    ModelInfo {
        reply: Reply<Option<ModelInfo>>,
    },
    NewCursor {
        reply: Reply<u64>,
    },
    CursorPosition {
        cursor: u64,
        reply: Reply<u32>,
    },
    FreeCursor {
        cursor: u64,
        reply: Reply<()>,
    },
    CreateSession {
        prompt: String,
        cursor: u64,
        options: SessionOptions,
        reply: Reply<u64>,
    },
    Step {
        cursor: u64,
        sampler: u64,
        reply: Reply<StepOutcome>,
    },
    FreeSampler {
        sampler: u64,
        reply: Reply<()>,
    },
    Complete {
        prompt: String,
        options: SessionOptions,
        on_token: TokenSink,
        reply: Reply<Completion>,
    },
    Reset {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to the thread that owns the runtime
pub struct BridgeWorker {
    tx: Option<mpsc::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    call_timeout: Option<Duration>,
}

impl BridgeWorker {
    /// Spawns the worker thread with an empty runtime
    pub fn spawn<B: InferenceBackend + 'static>(mut config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate();
        let call_timeout = config.call_timeout_ms.map(Duration::from_millis);
        let (tx, rx) = mpsc::channel::<Command>();

        let thread = std::thread::Builder::new()
            .name("llama-bridge".to_string())
            .spawn(move || {
                let mut runtime = Runtime::<B>::new(config);
                tracing::debug!("Bridge worker started");
                for command in rx {
                    if !handle_command(&mut runtime, command) {
                        break;
                    }
                }
                runtime.shutdown();
                tracing::debug!("Bridge worker stopped");
            })
            .map_err(|e| BridgeError::Worker(format!("failed to spawn worker thread: {}", e)))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            call_timeout,
        })
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, BridgeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| BridgeError::Worker("worker is shut down".to_string()))?;
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(make(reply_tx))
            .map_err(|_| BridgeError::Worker("worker thread has exited".to_string()))?;

        match self.call_timeout {
            Some(limit) => match reply_rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("Bridge call timed out after {:?}", limit);
                    Err(BridgeError::Timeout(limit.as_millis() as u64))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Err(BridgeError::Worker("worker dropped the request".to_string()))
                }
            },
            None => reply_rx
                .recv()
                .map_err(|_| BridgeError::Worker("worker dropped the request".to_string()))?,
        }
    }

    /// Replaces the runtime configuration
    pub fn configure(&mut self, mut config: BridgeConfig) -> Result<(), BridgeError> {
        config.validate();
        let call_timeout = config.call_timeout_ms.map(Duration::from_millis);
        self.request(|reply| Command::Configure { config, reply })?;
        self.call_timeout = call_timeout;
        Ok(())
    }

    pub fn init(&self, model_path: impl Into<PathBuf>, type_tag: &str) -> Result<ModelInfo, BridgeError> {
        let model_path = model_path.into();
        let type_tag = type_tag.to_string();
        self.request(|reply| Command::Init {
            model_path,
            type_tag,
            reply,
        })
    }

    pub fn model_info(&self) -> Result<Option<ModelInfo>, BridgeError> {
        self.request(|reply| Command::ModelInfo { reply })
    }

    pub fn new_cursor(&self) -> Result<u64, BridgeError> {
        self.request(|reply| Command::NewCursor { reply })
    }

    pub fn cursor_position(&self, cursor: u64) -> Result<u32, BridgeError> {
        self.request(|reply| Command::CursorPosition { cursor, reply })
    }

    pub fn free_cursor(&self, cursor: u64) -> Result<(), BridgeError> {
        self.request(|reply| Command::FreeCursor { cursor, reply })
    }

    pub fn create_sampler_for_prompt(&self, prompt: &str, cursor: u64) -> Result<u64, BridgeError> {
        self.create_session(prompt, cursor, SessionOptions::default())
    }

    pub fn create_session(
        &self,
        prompt: &str,
        cursor: u64,
        options: SessionOptions,
    ) -> Result<u64, BridgeError> {
        let prompt = prompt.to_string();
        self.request(|reply| Command::CreateSession {
            prompt,
            cursor,
            options,
            reply,
        })
    }

    pub fn generate_next_token(&self, cursor: u64, sampler: u64) -> Result<StepOutcome, BridgeError> {
        self.request(|reply| Command::Step {
            cursor,
            sampler,
            reply,
        })
    }

    pub fn free_sampler(&self, sampler: u64) -> Result<(), BridgeError> {
        self.request(|reply| Command::FreeSampler { sampler, reply })
    }

    /// Runs a whole completion; `on_token` is called on the worker thread
    pub fn complete(
        &self,
        prompt: &str,
        options: SessionOptions,
        on_token: impl FnMut(&str) + Send + 'static,
    ) -> Result<Completion, BridgeError> {
        let prompt = prompt.to_string();
        let on_token: TokenSink = Box::new(on_token);
        self.request(|reply| Command::Complete {
            prompt,
            options,
            on_token,
            reply,
        })
    }

    /// Frees every session, cursor, the model and the backend, keeping the thread
    ///
    /// Handle generations survive, so handles issued before the reset stay
    /// invalid after the next `init`.
    pub fn reset(&self) -> Result<(), BridgeError> {
        self.request(|reply| Command::Reset { reply })
    }

    /// Shuts the runtime down and joins the thread
    ///
    /// Waits for the worker regardless of the call timeout.
    pub fn shutdown(&mut self) -> Result<(), BridgeError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = mpsc::channel();
        let result = match tx.send(Command::Shutdown { reply: reply_tx }) {
            Ok(()) => reply_rx
                .recv()
                .map_err(|_| BridgeError::Worker("worker dropped the request".to_string()))
                .and_then(|r| r),
            Err(_) => Err(BridgeError::Worker("worker thread has exited".to_string())),
        };
        drop(tx);
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Bridge worker thread panicked");
            }
        }
    }
}

impl Drop for BridgeWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.tx.take();
        self.join();
    }
}

/// Executes one command; returns `false` when the worker should stop
fn handle_command<B: InferenceBackend>(runtime: &mut Runtime<B>, command: Command) -> bool {
    match command {
        Command::Configure { config, reply } => {
            runtime.set_config(config);
            reply.send(Ok(())).ok();
        }
        Command::Init {
            model_path,
            type_tag,
            reply,
        } => {
            reply.send(runtime.init(&model_path, &type_tag)).ok();
        }
        Command::ModelInfo { reply } => {
            reply.send(Ok(runtime.model_info().cloned())).ok();
        }
        Command::NewCursor { reply } => {
            let cursor = runtime.new_cursor();
            if reply.send(Ok(cursor.to_raw())).is_err() {
                runtime.free_cursor(cursor).ok();
            }
        }
        Command::CursorPosition { cursor, reply } => {
            let result = cursor_handle(cursor).and_then(|c| runtime.cursor_position(c));
            reply.send(result).ok();
        }
        Command::FreeCursor { cursor, reply } => {
            let result = cursor_handle(cursor).and_then(|c| runtime.free_cursor(c));
            reply.send(result).ok();
        }
        Command::CreateSession {
            prompt,
            cursor,
            options,
            reply,
        } => {
            let created = cursor_handle(cursor)
                .and_then(|c| runtime.create_session(&prompt, c, &options));
            match created {
                Ok(sampler) => {
                    if reply.send(Ok(sampler.to_raw())).is_err() {
                        tracing::warn!("Caller gave up on session {:?}, releasing it", sampler);
                        runtime.free_sampler(sampler).ok();
                    }
                }
                Err(e) => {
                    reply.send(Err(e)).ok();
                }
            }
        }
        Command::Step {
            cursor,
            sampler,
            reply,
        } => {
            let sampler = Handle::from_raw(sampler);
            let result = cursor_handle(cursor).and_then(|c| {
                let s = sampler.ok_or_else(BridgeError::invalid_sampler)?;
                runtime.generate_next_token(c, s)
            });
            let stepped = result.is_ok();
            if reply.send(result).is_err() && stepped {
                // The caller never saw this fragment
                if let Some(s) = sampler {
                    tracing::warn!("Caller gave up on a step of {:?}, closing the session", s);
                    runtime.free_sampler(s).ok();
                }
            }
        }
        Command::FreeSampler { sampler, reply } => {
            let result = Handle::from_raw(sampler)
                .ok_or_else(BridgeError::invalid_sampler)
                .and_then(|s| runtime.free_sampler(s));
            reply.send(result).ok();
        }
        Command::Complete {
            prompt,
            options,
            mut on_token,
            reply,
        } => {
            reply
                .send(runtime.complete(&prompt, &options, |t| on_token(t)))
                .ok();
        }
        Command::Reset { reply } => {
            runtime.shutdown();
            reply.send(Ok(())).ok();
        }
        Command::Shutdown { reply } => {
            runtime.shutdown();
            reply.send(Ok(())).ok();
            return false;
        }
    }
    true
}

fn cursor_handle(raw: u64) -> Result<CursorHandle, BridgeError> {
    Handle::from_raw(raw).ok_or_else(BridgeError::invalid_cursor)
}
