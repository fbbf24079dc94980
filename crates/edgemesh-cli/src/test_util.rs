//! Test-only helpers shared across this crate's unit test modules.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serializes tests that mutate process environment variables (`HOME`,
/// `XDG_CONFIG_HOME`, `EDGEMESH_*`), since those are global state shared
/// across the test binary's threads.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
