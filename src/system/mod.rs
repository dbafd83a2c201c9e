//! System utilities
//!
//! Hardware probing used to size the engine's thread pools.

use std::thread;

/// Upper bound on the default thread count
pub const MAX_DEFAULT_THREADS: u32 = 4;

/// Default number of threads for generation and batch processing
///
/// `min(4, available cores)`, and at least 1 when the core count is unknown.
pub fn default_thread_count() -> u32 {
    let cores = thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    cores.clamp(1, MAX_DEFAULT_THREADS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thread_count_is_bounded() {
        let threads = default_thread_count();
        assert!(threads >= 1);
        assert!(threads <= MAX_DEFAULT_THREADS);
    }
}
