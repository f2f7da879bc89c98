//! Process-wide named locks used to serialize audit chain extension.
//!
//! A lock is keyed on a SHA-256 of `(database path, node_id)` and is only
//! ever acquired with `try_acquire`: a held key makes the caller fail fast
//! instead of waiting. The guard releases the key on drop, so a lock lives
//! exactly as long as the transaction that holds the guard.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

fn held_keys() -> &'static Mutex<HashSet<String>> {
    static HELD: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn lock_key(db_path: &Path, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(db_path.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(node_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
pub struct NamedLockGuard {
    key: String,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = held_keys().lock() {
            held.remove(&self.key);
        }
    }
}

/// Non-blocking acquire. `None` means another holder owns the key right now.
pub fn try_acquire(db_path: &Path, node_id: &str) -> Option<NamedLockGuard> {
    let key = lock_key(db_path, node_id);
    let mut held = held_keys().lock().ok()?;
    if held.insert(key.clone()) {
        Some(NamedLockGuard { key })
    } else {
        None
    }
}
