//! C ABI
//!
//! One process-wide [`BridgeWorker`] backs these functions. Status codes are
//! `0` for success and the negative values of [`BridgeError::code`] for
//! failures; the message of the most recent failure is available from
//! [`llmb_last_error`]. Handle-returning functions return `0` on failure.
//!
//! Strings handed to the caller must be released with [`llmb_free_string`].

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::{Mutex, MutexGuard};

use crate::bridge::error::BridgeError;
use crate::bridge::runtime::SessionOptions;
use crate::bridge::worker::BridgeWorker;
use crate::inference::engine::{EngineError, InferenceBackend};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::streaming::StepOutcome;
use crate::storage::settings;
use crate::types::config::BridgeConfig;

static WORKER: Mutex<Option<BridgeWorker>> = Mutex::new(None);
static CONFIG: Mutex<Option<BridgeConfig>> = Mutex::new(None);
static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// `llmb_generate_next_token` produced a fragment
pub const LLMB_TOKEN: i32 = 0;
/// `llmb_generate_next_token` reached the end of the session
pub const LLMB_END: i32 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_last_error(err: &BridgeError) {
    *lock(&LAST_ERROR) = Some(err.to_string());
}

fn status(result: Result<(), BridgeError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!("Bridge call failed: {}", e);
            set_last_error(&e);
            e.code()
        }
    }
}

fn handle_or_zero(result: Result<u64, BridgeError>) -> u64 {
    result.unwrap_or_else(|e| {
        tracing::debug!("Bridge call failed: {}", e);
        set_last_error(&e);
        0
    })
}

/// Reads a NUL-terminated UTF-8 argument
///
/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
unsafe fn c_str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, BridgeError> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument(format!("{} is null", name)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| BridgeError::InvalidArgument(format!("{} is not valid UTF-8", name)))
}

fn with_worker<T>(f: impl FnOnce(&mut BridgeWorker) -> Result<T, BridgeError>) -> Result<T, BridgeError> {
    let mut guard = lock(&WORKER);
    match guard.as_mut() {
        Some(worker) => f(worker),
        None => Err(BridgeError::ModelNotLoaded),
    }
}

fn startup_config() -> BridgeConfig {
    lock(&CONFIG)
        .clone()
        .unwrap_or_else(settings::load_config)
}

fn init_with<B: InferenceBackend + 'static>(model_path: &str, type_tag: &str) -> Result<(), BridgeError> {
    let mut guard = lock(&WORKER);
    let worker = match guard.take() {
        Some(worker) => worker,
        None => BridgeWorker::spawn::<B>(startup_config())?,
    };
    let worker = guard.insert(worker);
    worker.init(model_path, type_tag).map(|_| ())
}

fn configure(json: &str) -> Result<(), BridgeError> {
    let mut config: BridgeConfig =
        serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
    config.validate();
    if let Some(worker) = lock(&WORKER).as_mut() {
        worker.configure(config.clone())?;
    }
    *lock(&CONFIG) = Some(config);
    Ok(())
}

fn save_current_config() -> Result<(), BridgeError> {
    settings::save_config(&startup_config()).map_err(|e| BridgeError::Config(e.to_string()))
}

/// Parses per-session options; null or an empty document means defaults
fn session_options(json: Option<&str>) -> Result<SessionOptions, BridgeError> {
    match json.map(str::trim) {
        None | Some("") => Ok(SessionOptions::default()),
        Some(json) => serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string())),
    }
}

fn next_token(cursor: u64, sampler: u64, out_text: *mut *mut c_char) -> Result<i32, BridgeError> {
    if out_text.is_null() {
        return Err(BridgeError::InvalidArgument("out_text is null".to_string()));
    }
    // SAFETY: checked non-null above; the caller guarantees it is writable.
    unsafe { *out_text = std::ptr::null_mut() };
    let (code, text) = with_worker(|w| match w.generate_next_token(cursor, sampler)? {
        StepOutcome::Token(fragment) => match CString::new(fragment) {
            Ok(text) => Ok((LLMB_TOKEN, text.into_raw())),
            Err(_) => {
                w.free_sampler(sampler).ok();
                Err(EngineError::DecodeFailure("token text contains a NUL byte".to_string()).into())
            }
        },
        StepOutcome::End(reason) => {
            tracing::debug!("Generation ended: {}", reason);
            Ok((LLMB_END, std::ptr::null_mut()))
        }
    })?;
    // SAFETY: as above.
    unsafe { *out_text = text };
    Ok(code)
}

fn shutdown() -> Result<(), BridgeError> {
    match lock(&WORKER).as_ref() {
        Some(worker) => worker.reset(),
        None => Ok(()),
    }
}

/// Loads the model at `model_path` and starts the runtime
///
/// `type_tag` names the model family (`"deepseek-r1-distill"`, `"chatml"`,
/// ...). Calling again after a failure retries from a clean state.
///
/// # Safety
/// Both arguments must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn llmb_init(model_path: *const c_char, type_tag: *const c_char) -> i32 {
    crate::logging::init_logging();
    status((|| {
        let model_path = c_str_arg(model_path, "model_path")?;
        let type_tag = c_str_arg(type_tag, "type_tag")?;
        init_with::<LlamaCppBackend>(model_path, type_tag)
    })())
}

/// Sets the runtime configuration from a JSON document
///
/// Missing fields take their defaults. Applies to sessions created later.
///
/// # Safety
/// `json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmb_configure(json: *const c_char) -> i32 {
    status(c_str_arg(json, "json").and_then(configure))
}

/// Returns a new cursor handle, or 0 on failure
#[no_mangle]
pub extern "C" fn llmb_new_cursor() -> u64 {
    handle_or_zero(with_worker(|w| w.new_cursor()))
}

/// Returns the cursor's position, or a negative status code
#[no_mangle]
pub extern "C" fn llmb_cursor_position(cursor: u64) -> i64 {
    match with_worker(|w| w.cursor_position(cursor)) {
        Ok(n_past) => i64::from(n_past),
        Err(e) => {
            set_last_error(&e);
            i64::from(e.code())
        }
    }
}

#[no_mangle]
pub extern "C" fn llmb_free_cursor(cursor: u64) -> i32 {
    status(with_worker(|w| w.free_cursor(cursor)))
}

/// Creates a context primed with `prompt` and returns its sampler handle,
/// or 0 on failure
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmb_create_sampler_for_prompt(prompt: *const c_char, cursor: u64) -> u64 {
    handle_or_zero(
        c_str_arg(prompt, "prompt")
            .and_then(|prompt| with_worker(|w| w.create_sampler_for_prompt(prompt, cursor))),
    )
}

/// Like [`llmb_create_sampler_for_prompt`], with per-session overrides
///
/// `options_json` is a JSON object with optional `sampling`, `limits`,
/// `system_prompt` and `chat_template` members; null or empty uses the
/// runtime configuration.
///
/// # Safety
/// `prompt` and `options_json` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn llmb_create_session(
    prompt: *const c_char,
    cursor: u64,
    options_json: *const c_char,
) -> u64 {
    handle_or_zero((|| {
        let prompt = c_str_arg(prompt, "prompt")?;
        let json = if options_json.is_null() {
            None
        } else {
            Some(c_str_arg(options_json, "options_json")?)
        };
        let options = session_options(json)?;
        with_worker(|w| w.create_session(prompt, cursor, options))
    })())
}

/// Runs one generation step
///
/// Returns [`LLMB_TOKEN`] with a newly allocated fragment in `*out_text`
/// (possibly empty), [`LLMB_END`] with `*out_text` set to null, or a
/// negative status code with `*out_text` set to null. A failed step closes
/// the session.
///
/// # Safety
/// `out_text` must be null or point to writable storage for one pointer.
#[no_mangle]
pub unsafe extern "C" fn llmb_generate_next_token(
    cursor: u64,
    sampler: u64,
    out_text: *mut *mut c_char,
) -> i32 {
    match next_token(cursor, sampler, out_text) {
        Ok(code) => code,
        Err(e) => {
            set_last_error(&e);
            e.code()
        }
    }
}

/// Frees a session's sampler and context
#[no_mangle]
pub extern "C" fn llmb_free_sampler(sampler: u64) -> i32 {
    status(with_worker(|w| w.free_sampler(sampler)))
}

/// Writes the current configuration to the config file
#[no_mangle]
pub extern "C" fn llmb_save_config() -> i32 {
    status(save_current_config())
}

/// Frees every session, cursor, the model and the backend
///
/// Handles issued before the call stay invalid; `llmb_init` may be called
/// again afterwards.
#[no_mangle]
pub extern "C" fn llmb_shutdown() -> i32 {
    status(shutdown())
}

/// Message of the most recent failure, or null
///
/// The caller releases it with [`llmb_free_string`].
#[no_mangle]
pub extern "C" fn llmb_last_error() -> *mut c_char {
    match lock(&LAST_ERROR).as_deref() {
        Some(message) => CString::new(message.replace('\0', " "))
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut()),
        None => std::ptr::null_mut(),
    }
}

/// Releases a string returned by this library
///
/// # Safety
/// `s` must be null or a pointer obtained from this library that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn llmb_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[no_mangle]
pub extern "C" fn llmb_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{write_model, Script, ScriptedBackend};

    // The C ABI state is process-wide.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn last_error() -> Option<String> {
        let ptr = llmb_last_error();
        if ptr.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        unsafe { llmb_free_string(ptr) };
        Some(message)
    }

    fn step(cursor: u64, sampler: u64) -> (i32, Option<String>) {
        let mut text: *mut c_char = std::ptr::null_mut();
        let code = unsafe { llmb_generate_next_token(cursor, sampler, &mut text) };
        if text.is_null() {
            return (code, None);
        }
        let fragment = unsafe { CStr::from_ptr(text) }.to_str().unwrap().to_string();
        unsafe { llmb_free_string(text) };
        (code, Some(fragment))
    }

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(llmb_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_free_null_string() {
        unsafe { llmb_free_string(std::ptr::null_mut()) };
    }

    #[test]
    fn test_calls_without_model() {
        let _serial = lock(&SERIAL);
        llmb_shutdown();
        let prompt = CString::new("hi").unwrap();
        let sampler = unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), llmb_new_cursor()) };
        assert_eq!(sampler, 0);
        assert_eq!(
            last_error().as_deref(),
            Some(BridgeError::ModelNotLoaded.to_string().as_str())
        );
    }

    #[test]
    fn test_null_arguments() {
        let _serial = lock(&SERIAL);
        let code = unsafe { llmb_init(std::ptr::null(), std::ptr::null()) };
        assert_eq!(code, BridgeError::InvalidArgument(String::new()).code());
        assert!(last_error().unwrap().contains("model_path"));

        let code = unsafe { llmb_generate_next_token(1, 1, std::ptr::null_mut()) };
        assert_eq!(code, BridgeError::InvalidArgument(String::new()).code());
    }

    #[test]
    fn test_bad_config_json() {
        let _serial = lock(&SERIAL);
        let json = CString::new("{\"n_ctx\": \"big\"}").unwrap();
        let code = unsafe { llmb_configure(json.as_ptr()) };
        assert_eq!(code, BridgeError::Config(String::new()).code());
    }

    #[test]
    fn test_session_through_c_abi() {
        let _serial = lock(&SERIAL);
        llmb_shutdown();
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), "model.gguf", &Script::reply("4"));
        init_with::<ScriptedBackend>(path.to_str().unwrap(), "deepseek-r1-distill").unwrap();

        let cursor = llmb_new_cursor();
        assert_ne!(cursor, 0);
        assert_eq!(llmb_cursor_position(cursor), 0);

        // Stepping before a sampler exists
        let (code, text) = step(cursor, 0);
        assert_eq!(code, BridgeError::invalid_sampler().code());
        assert!(text.is_none());

        let prompt = CString::new("What is 2+2?").unwrap();
        let sampler = unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), cursor) };
        assert_ne!(sampler, 0);
        let primed = llmb_cursor_position(cursor);
        assert!(primed > 0);

        assert_eq!(step(cursor, sampler), (LLMB_TOKEN, Some("4".to_string())));
        assert_eq!(llmb_cursor_position(cursor), primed + 1);
        assert_eq!(step(cursor, sampler), (LLMB_END, None));
        assert_eq!(step(cursor, sampler), (LLMB_END, None));

        assert_eq!(llmb_free_sampler(sampler), 0);
        assert_eq!(
            llmb_free_sampler(sampler),
            BridgeError::invalid_sampler().code()
        );
        assert_eq!(llmb_free_cursor(cursor), 0);

        let cursor = llmb_new_cursor();
        let sampler = unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), cursor) };
        assert_eq!(llmb_shutdown(), 0);
        assert_eq!(llmb_shutdown(), 0);
        assert_eq!(
            step(cursor, sampler).0,
            BridgeError::invalid_sampler().code()
        );
        assert_eq!(
            unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), llmb_new_cursor()) },
            0
        );

        // Starting again does not revive old handles
        init_with::<ScriptedBackend>(path.to_str().unwrap(), "deepseek-r1-distill").unwrap();
        assert_eq!(
            step(cursor, sampler).0,
            BridgeError::invalid_sampler().code()
        );
        assert_eq!(llmb_shutdown(), 0);
    }

    #[test]
    fn test_failed_step_clears_out_text() {
        let _serial = lock(&SERIAL);
        llmb_shutdown();
        let mut text = std::ptr::NonNull::<c_char>::dangling().as_ptr();
        let code = unsafe { llmb_generate_next_token(1, 1, &mut text) };
        assert!(code < 0);
        assert!(text.is_null());
    }

    #[test]
    fn test_nul_fragment_closes_session() {
        let _serial = lock(&SERIAL);
        llmb_shutdown();
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), "model.gguf", &Script::reply("a\0b"));
        init_with::<ScriptedBackend>(path.to_str().unwrap(), "raw").unwrap();

        let cursor = llmb_new_cursor();
        let prompt = CString::new("q").unwrap();
        let sampler = unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), cursor) };
        assert_eq!(step(cursor, sampler), (LLMB_TOKEN, Some("a".to_string())));

        let decode = BridgeError::from(EngineError::DecodeFailure(String::new())).code();
        assert_eq!(step(cursor, sampler), (decode, None));
        assert!(last_error().unwrap().contains("NUL"));
        assert_eq!(step(cursor, sampler).0, BridgeError::invalid_sampler().code());
        // The cursor is free for a new session
        let again = unsafe { llmb_create_sampler_for_prompt(prompt.as_ptr(), cursor) };
        assert_ne!(again, 0);
        assert_eq!(llmb_shutdown(), 0);
    }

    #[test]
    fn test_create_session_with_options() {
        let _serial = lock(&SERIAL);
        llmb_shutdown();
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path(), "model.gguf", &Script::reply("abcdef"));
        init_with::<ScriptedBackend>(path.to_str().unwrap(), "raw").unwrap();
        let prompt = CString::new("q").unwrap();

        let options = CString::new(r#"{"limits": {"max_new_tokens": 2}}"#).unwrap();
        let cursor = llmb_new_cursor();
        let sampler = unsafe { llmb_create_session(prompt.as_ptr(), cursor, options.as_ptr()) };
        assert_ne!(sampler, 0);
        assert_eq!(step(cursor, sampler), (LLMB_TOKEN, Some("a".to_string())));
        assert_eq!(step(cursor, sampler), (LLMB_TOKEN, Some("b".to_string())));
        assert_eq!(step(cursor, sampler), (LLMB_END, None));
        assert_eq!(llmb_free_sampler(sampler), 0);

        let defaults = unsafe { llmb_create_session(prompt.as_ptr(), cursor, std::ptr::null()) };
        assert_ne!(defaults, 0);
        assert_eq!(llmb_free_sampler(defaults), 0);

        let bad = CString::new(r#"{"limits": 3}"#).unwrap();
        let sampler = unsafe { llmb_create_session(prompt.as_ptr(), cursor, bad.as_ptr()) };
        assert_eq!(sampler, 0);
        assert!(last_error().unwrap().starts_with("Invalid configuration"));
        assert_eq!(llmb_shutdown(), 0);
    }

    #[test]
    fn test_save_config_writes_current_config() {
        let _serial = lock(&SERIAL);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        std::env::set_var(settings::CONFIG_ENV, &path);

        let json = CString::new(r#"{"n_ctx": 4096}"#).unwrap();
        assert_eq!(unsafe { llmb_configure(json.as_ptr()) }, 0);
        assert_eq!(llmb_save_config(), 0);
        let saved = settings::load_config_from(&path).unwrap();

        std::env::remove_var(settings::CONFIG_ENV);
        *lock(&CONFIG) = None;
        assert_eq!(saved.n_ctx, 4096);
    }
}
