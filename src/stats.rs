use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Atomic counters for one namespace (or the global fallback block).
/// Updated with relaxed atomics from the hot path; blocks are created
/// once per namespace name and reused across routing-table rebuilds so
/// counters survive republication.
#[derive(Debug, Default)]
pub struct NsStats {
    pub writes_total: AtomicU64,
    pub reads_total: AtomicU64,
    pub bytes_raw_total: AtomicU64,
    pub bytes_cmp_total: AtomicU64,

    pub skipped_comp_min_size: AtomicU64,
    pub skipped_comp_max_size: AtomicU64,
    pub skipped_comp_incompressible: AtomicU64,

    pub compress_errs: AtomicU64,
    pub decompress_errs: AtomicU64,
    pub dict_miss_errs: AtomicU64,

    pub trainer_runs: AtomicU64,
    pub trainer_errs: AtomicU64,
    pub trainer_ms_last: AtomicU64,
    pub reservoir_bytes: AtomicU64,
    pub reservoir_items: AtomicU64,
    pub retrain_count: AtomicU64,
    pub last_retrain_ms: AtomicU64,
}

impl NsStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, delta: u64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Copy the counters into a plain snapshot.
    pub fn snapshot(&self, namespace: &str) -> StatsSnapshot {
        StatsSnapshot {
            namespace: namespace.to_string(),
            writes_total: Self::get(&self.writes_total),
            reads_total: Self::get(&self.reads_total),
            bytes_raw_total: Self::get(&self.bytes_raw_total),
            bytes_cmp_total: Self::get(&self.bytes_cmp_total),
            skipped_comp_min_size: Self::get(&self.skipped_comp_min_size),
            skipped_comp_max_size: Self::get(&self.skipped_comp_max_size),
            skipped_comp_incompressible: Self::get(&self.skipped_comp_incompressible),
            compress_errs: Self::get(&self.compress_errs),
            decompress_errs: Self::get(&self.decompress_errs),
            dict_miss_errs: Self::get(&self.dict_miss_errs),
            trainer_runs: Self::get(&self.trainer_runs),
            trainer_errs: Self::get(&self.trainer_errs),
            trainer_ms_last: Self::get(&self.trainer_ms_last),
            reservoir_bytes: Self::get(&self.reservoir_bytes),
            reservoir_items: Self::get(&self.reservoir_items),
            retrain_count: Self::get(&self.retrain_count),
            last_retrain_ms: Self::get(&self.last_retrain_ms),
            ..Default::default()
        }
    }
}

/// Point-in-time copy of one stats block, extended with routing and
/// efficiency fields for the "default" namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub namespace: String,

    pub writes_total: u64,
    pub reads_total: u64,
    pub bytes_raw_total: u64,
    pub bytes_cmp_total: u64,

    pub skipped_comp_min_size: u64,
    pub skipped_comp_max_size: u64,
    pub skipped_comp_incompressible: u64,

    pub compress_errs: u64,
    pub decompress_errs: u64,
    pub dict_miss_errs: u64,

    pub trainer_runs: u64,
    pub trainer_errs: u64,
    pub trainer_ms_last: u64,
    pub reservoir_bytes: u64,
    pub reservoir_items: u64,
    pub retrain_count: u64,
    pub last_retrain_ms: u64,

    // Routing metadata for the namespace, filled by the engine.
    pub dict_id: u16,
    pub dict_size: u64,
    pub total_dicts: usize,

    // Efficiency fields, filled only for the "default" namespace.
    pub ewma: f64,
    pub baseline: f64,
    pub train_mode: String,
}

impl StatsSnapshot {
    /// `STAT name value` lines, the plain-text control-surface form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut stat = |name: &str, value: String| {
            out.push_str("STAT ");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        };
        stat("namespace", self.namespace.clone());
        stat("writes_total", self.writes_total.to_string());
        stat("reads_total", self.reads_total.to_string());
        stat("bytes_raw_total", self.bytes_raw_total.to_string());
        stat("bytes_cmp_total", self.bytes_cmp_total.to_string());
        stat("skipped_comp_min_size", self.skipped_comp_min_size.to_string());
        stat("skipped_comp_max_size", self.skipped_comp_max_size.to_string());
        stat(
            "skipped_comp_incompressible",
            self.skipped_comp_incompressible.to_string(),
        );
        stat("compress_errs", self.compress_errs.to_string());
        stat("decompress_errs", self.decompress_errs.to_string());
        stat("dict_miss_errs", self.dict_miss_errs.to_string());
        stat("trainer_runs", self.trainer_runs.to_string());
        stat("trainer_errs", self.trainer_errs.to_string());
        stat("trainer_ms_last", self.trainer_ms_last.to_string());
        stat("reservoir_bytes", self.reservoir_bytes.to_string());
        stat("reservoir_items", self.reservoir_items.to_string());
        stat("retrain_count", self.retrain_count.to_string());
        stat("last_retrain_ms", self.last_retrain_ms.to_string());
        stat("dict_id", self.dict_id.to_string());
        stat("dict_size", self.dict_size.to_string());
        stat("total_dicts", self.total_dicts.to_string());
        if !self.train_mode.is_empty() {
            stat("ewma", format!("{:.6}", self.ewma));
            stat("baseline", format!("{:.6}", self.baseline));
            stat("train_mode", self.train_mode.clone());
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Process-wide stats registry: a global fallback block plus one block
/// per namespace name, handed out as `Arc` so routing tables can embed
/// them and the hot path reaches counters without a lookup.
pub struct StatsRegistry {
    global: Arc<NsStats>,
    spaces: Mutex<HashMap<String, Arc<NsStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            global: Arc::new(NsStats::default()),
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// The global fallback block, used when no namespace matches.
    pub fn global(&self) -> Arc<NsStats> {
        Arc::clone(&self.global)
    }

    /// Get or create the block for a namespace. Blocks persist for the
    /// process lifetime so counters are stable across republication.
    pub fn for_namespace(&self, name: &str) -> Arc<NsStats> {
        let mut spaces = self.spaces.lock().unwrap();
        Arc::clone(
            spaces
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(NsStats::default())),
        )
    }

    /// Block for a namespace if it already exists.
    pub fn lookup(&self, name: &str) -> Option<Arc<NsStats>> {
        self.spaces.lock().unwrap().get(name).map(Arc::clone)
    }

    /// Aggregate every namespace block plus the global fallback into
    /// one overall snapshot. Cold path only.
    pub fn aggregate(&self) -> StatsSnapshot {
        let mut total = self.global.snapshot("global");
        let spaces = self.spaces.lock().unwrap();
        for stats in spaces.values() {
            let s = stats.snapshot("");
            total.writes_total += s.writes_total;
            total.reads_total += s.reads_total;
            total.bytes_raw_total += s.bytes_raw_total;
            total.bytes_cmp_total += s.bytes_cmp_total;
            total.skipped_comp_min_size += s.skipped_comp_min_size;
            total.skipped_comp_max_size += s.skipped_comp_max_size;
            total.skipped_comp_incompressible += s.skipped_comp_incompressible;
            total.compress_errs += s.compress_errs;
            total.decompress_errs += s.decompress_errs;
            total.dict_miss_errs += s.dict_miss_errs;
            total.trainer_runs += s.trainer_runs;
            total.trainer_errs += s.trainer_errs;
            total.reservoir_bytes += s.reservoir_bytes;
            total.reservoir_items += s.reservoir_items;
            total.retrain_count += s.retrain_count;
            total.trainer_ms_last = total.trainer_ms_last.max(s.trainer_ms_last);
            total.last_retrain_ms = total.last_retrain_ms.max(s.last_retrain_ms);
        }
        total
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
