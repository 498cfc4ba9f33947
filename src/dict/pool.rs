use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use crate::codec::CompiledDict;
use crate::dict::meta::DictMeta;
use crate::error::{Error, Result};

/// Process-wide pool of compiled dictionary handles, keyed by the
/// dictionary's canonical path.
///
/// Routing tables retain handles while being built and release them
/// when the reclaimer frees the table; because a dictionary usually
/// survives from one table generation into the next, the pool keeps its
/// compiled handles alive across publications instead of recompiling.
///
/// A single mutex guards the map; pool traffic happens only on
/// publication and reclamation, never on the request hot path.
pub struct DictPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
}

struct PoolEntry {
    compiled: Option<Arc<CompiledDict>>,
    refs: i32,
    /// Set when compilation failed; later retains fail fast instead of
    /// re-reading a broken file on every rescan.
    poisoned: bool,
}

impl DictPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Retain compiled handles for a meta, compiling them from the dict
    /// file on first use.
    pub fn retain_for_meta(&self, meta: &DictMeta, level: i32) -> Result<Arc<CompiledDict>> {
        let key = meta.pool_key();
        let mut entries = self.entries.lock()?;
        if let Some(entry) = entries.get_mut(&key) {
            if entry.poisoned {
                return Err(Error::Codec(format!(
                    "dictionary {key} previously failed to compile"
                )));
            }
            entry.refs += 1;
            // A live entry always holds handles.
            return Ok(Arc::clone(entry.compiled.as_ref().expect("live pool entry")));
        }

        match fs::read(&meta.dict_path) {
            Ok(bytes) => {
                let compiled = Arc::new(CompiledDict::compile(&bytes, level));
                entries.insert(
                    key,
                    PoolEntry {
                        compiled: Some(Arc::clone(&compiled)),
                        refs: 1,
                        poisoned: false,
                    },
                );
                Ok(compiled)
            }
            Err(e) => {
                entries.insert(
                    key,
                    PoolEntry {
                        compiled: None,
                        refs: 0,
                        poisoned: true,
                    },
                );
                Err(Error::IO(format!("read {}: {e}", meta.dict_path.display())))
            }
        }
    }

    /// Release one retain. Returns the remaining count, or -1 when the
    /// meta was not in the pool. Handles are destroyed when the count
    /// reaches zero and the last table drops its `Arc`.
    pub fn release_for_meta(&self, meta: &DictMeta) -> i32 {
        let key = meta.pool_key();
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&key) else {
            return -1;
        };
        if entry.poisoned {
            return -1;
        }
        entry.refs -= 1;
        let left = entry.refs;
        if left <= 0 {
            entries.remove(&key);
        }
        left.max(0)
    }

    /// Current reference count for a meta; -1 when absent.
    pub fn refcount_for_meta(&self, meta: &DictMeta) -> i32 {
        let entries = self.entries.lock().unwrap();
        match entries.get(&meta.pool_key()) {
            Some(entry) if !entry.poisoned => entry.refs,
            _ => -1,
        }
    }

    /// Diagnostic dump: one `<key> refs=<n>` line per entry.
    pub fn dump(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut lines: Vec<String> = entries
            .iter()
            .map(|(key, entry)| {
                if entry.poisoned {
                    format!("{key} poisoned")
                } else {
                    format!("{key} refs={}", entry.refs)
                }
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DictPool {
    fn default() -> Self {
        Self::new()
    }
}
