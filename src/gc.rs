use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::dict::meta;
use crate::engine::{Core, RetiredTable};
use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::scheduler::{BackgroundTask, Context};

/// Reclaimer of retired routing tables and quarantined dictionary
/// files.
///
/// Publication pushes the previous table onto a lock-free stack; this
/// task drains it once a second and holds each table through the
/// cool-off period before releasing its dictionaries back to the pool.
/// The cool-off bounds the age of any in-flight reference; reference
/// counting on the table makes even an overstaying reader safe.
///
/// A second pass unlinks dictionary files whose ids are no longer in
/// the current table once they outlive the quarantine period.
pub(crate) struct GcTask {
    core: Arc<Core>,
    pending: Mutex<Vec<RetiredTable>>,
    errlog: RateLimiter,
}

impl GcTask {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            pending: Mutex::new(Vec::new()),
            errlog: RateLimiter::new(Duration::from_secs(10)),
        }
    }

    pub fn sweep(&self) -> Result<()> {
        let cool = self.core.config.gc_cool_period;
        let mut pending = self.pending.lock().unwrap();
        pending.extend(self.core.retired.drain());

        let mut kept = Vec::with_capacity(pending.len());
        for retired in pending.drain(..) {
            if retired.retired_at.elapsed() >= cool {
                tracing::debug!(
                    generation = retired.table.gen,
                    dicts = retired.table.metas.len(),
                    "Reclaiming retired routing table"
                );
                retired.table.release_dicts(&self.core.pool);
            } else {
                kept.push(retired);
            }
        }
        *pending = kept;
        drop(pending);

        self.sweep_quarantined_files()
    }

    /// Unlink dict and manifest files that are out of the routing table
    /// and older than the quarantine period.
    fn sweep_quarantined_files(&self) -> Result<()> {
        let Some(dir) = self.core.config.dict_dir.as_deref() else {
            return Ok(());
        };
        // Without a published table nothing is provably obsolete.
        let Some(table) = self.core.current_table() else {
            return Ok(());
        };
        let resident: HashSet<u16> = table.resident_ids().into_iter().collect();
        let quarantine = self.core.config.gc_quarantine_period;

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = meta::parse_dict_file_name(&path) else {
                continue;
            };
            if resident.contains(&id) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            if age < quarantine {
                continue;
            }

            let manifest = dir.join(meta::manifest_file_name(id));
            match fs::remove_file(&path).and_then(|()| fs::remove_file(&manifest)) {
                Ok(()) => {
                    tracing::info!(id = id, "Unlinked quarantined dictionary");
                }
                Err(e) => {
                    if self.errlog.allow() {
                        tracing::warn!(id = id, error = %e, "Failed to unlink quarantined dictionary");
                    }
                }
            }
        }
        Ok(())
    }
}

impl BackgroundTask for GcTask {
    fn name(&self) -> &'static str {
        "dict-gc"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        self.sweep()
    }
}

impl Drop for GcTask {
    fn drop(&mut self) {
        // Tables still cooling must return their pool retains.
        for retired in self.pending.lock().unwrap().drain(..) {
            retired.table.release_dicts(&self.core.pool);
        }
    }
}
