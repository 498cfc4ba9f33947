use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;

use crate::codec;
use crate::config::Config;
use crate::dict::meta::DEFAULT_NS;
use crate::dict::{DictPool, RoutingTable};
use crate::efficiency::EfficiencyTracker;
use crate::error::{Error, Result};
use crate::gc::GcTask;
use crate::incompressible::is_likely_incompressible;
use crate::reservoir::Reservoir;
use crate::sampler::{Sampler, SamplerStatus};
use crate::scheduler::{BackgroundTask, Context, Scheduler};
use crate::stack::Stack;
use crate::stats::{NsStats, StatsRegistry, StatsSnapshot};
use crate::trainer::TrainerTask;

/// Why a value bypassed compression. Not errors; the host stores the
/// value uncompressed and the reason is counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Compression is disabled in the configuration.
    Disabled,
    /// The value is smaller than `min_comp_size`.
    BelowMin,
    /// The value is larger than `max_comp_size`.
    AboveMax,
    /// Compression did not shrink the value.
    Incompressible,
}

/// Result of `maybe_compress`. On `Compressed` the caller's buffer
/// holds the frame and `dict_id` must be stored alongside the value
/// (0 = dict-less).
#[derive(Debug, PartialEq, Eq)]
pub enum CompressOutcome {
    Compressed { len: usize, dict_id: u16 },
    Skipped(SkipReason),
}

/// Result of `maybe_decompress`. `PassThrough` means the item was not
/// compressed (or is chunked) and must be served as stored.
#[derive(Debug, PartialEq, Eq)]
pub enum DecompressOutcome {
    PassThrough,
    Data(Vec<u8>),
}

/// Boundary view of a stored item, as the host cache engine hands it to
/// the read path: value bytes, the stored dictionary id, and the two
/// item flags the engine keeps for us.
#[derive(Clone, Copy, Debug)]
pub struct StoredItem<'a> {
    pub key: &'a [u8],
    pub data: &'a [u8],
    pub dict_id: u16,
    pub compressed: bool,
    pub chunked: bool,
}

/// A routing table awaiting reclamation.
pub(crate) struct RetiredTable {
    pub table: Arc<RoutingTable>,
    pub retired_at: Instant,
}

/// Shared state of the compression core. Background tasks hold an
/// `Arc<Core>`; the `Engine` owns the scheduler on top of it.
pub(crate) struct Core {
    pub config: Config,
    /// The published routing table; release store, acquire load.
    table: ArcSwapOption<RoutingTable>,
    generation: AtomicU64,
    pub reservoir: Reservoir,
    pub tracker: EfficiencyTracker,
    pub pool: DictPool,
    pub stats: StatsRegistry,
    /// Sticky trainer activation flag; set by the trainer when it wants
    /// samples, cleared after a successful publish.
    pub train_active: AtomicBool,
    /// Tables retired by publication, awaiting the reclaimer.
    pub retired: Stack<RetiredTable>,
    pub sampler: Sampler,

    // Cached stats blocks so the hot path never touches the registry
    // mutex.
    global_stats: Arc<NsStats>,
    default_stats: Arc<NsStats>,
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Core {
    fn new(config: Config) -> Self {
        let stats = StatsRegistry::new();
        let global_stats = stats.global();
        let default_stats = stats.for_namespace(DEFAULT_NS);
        let reservoir = Reservoir::new(config.training_threshold());
        let tracker = EfficiencyTracker::new(&config, now_epoch() as u64);
        let sampler = Sampler::new(
            config.spool_dir.clone(),
            config.sample_p,
            config.sample_window_duration,
            config.spool_max_bytes,
        );
        Self {
            config,
            table: ArcSwapOption::from(None),
            generation: AtomicU64::new(0),
            reservoir,
            tracker,
            pool: DictPool::new(),
            stats,
            train_active: AtomicBool::new(false),
            retired: Stack::new(),
            sampler,
            global_stats,
            default_stats,
        }
    }

    pub fn current_table(&self) -> Option<Arc<RoutingTable>> {
        self.table.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Install a new routing table. The publisher is unique (trainer or
    /// startup), so a plain swap is enough; the old table goes to the
    /// reclaimer.
    pub fn publish(&self, mut table: RoutingTable) {
        table.gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let old = self.table.swap(Some(Arc::new(table)));
        if let Some(old) = old {
            self.retired.push(RetiredTable {
                table: old,
                retired_at: Instant::now(),
            });
        }
    }

    /// Build a routing table from the dictionary directory.
    fn scan_table(&self) -> Result<RoutingTable> {
        let dir = self
            .config
            .dict_dir
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("no dict_dir configured".into()))?;
        RoutingTable::scan_dict_dir(
            dir,
            self.config.dict_retain_max,
            self.config.gc_quarantine_period.as_secs() as i64,
            self.config.zstd_level,
            &self.pool,
            &self.stats,
            now_epoch(),
        )
    }

    /// Rescan the dictionary directory and publish the result.
    pub fn reload_dictionaries(&self) -> Result<()> {
        let table = self.scan_table()?;
        self.publish(table);
        Ok(())
    }

    pub fn has_default_dict(&self) -> bool {
        self.table
            .load()
            .as_deref()
            .is_some_and(RoutingTable::has_default_dict)
    }

    pub fn default_stats(&self) -> &Arc<NsStats> {
        &self.default_stats
    }

    /// Compress a value if configuration and routing say so. `dst` is
    /// the caller's reusable scratch buffer; on `Compressed` it holds
    /// the frame.
    pub fn maybe_compress(
        &self,
        key: &[u8],
        src: &[u8],
        dst: &mut Vec<u8>,
    ) -> Result<CompressOutcome> {
        if !self.config.enable_comp {
            return Ok(CompressOutcome::Skipped(SkipReason::Disabled));
        }
        if src.is_empty() {
            return Err(Error::InvalidInput("empty value".into()));
        }

        let guard = self.table.load();
        let entry = guard.as_deref().and_then(|t| t.pick_namespace(key));
        let stats = entry.map_or(&self.global_stats, |e| &e.stats);

        NsStats::inc(&stats.writes_total);
        NsStats::add(&stats.bytes_raw_total, src.len() as u64);

        if src.len() < self.config.min_comp_size {
            NsStats::inc(&stats.skipped_comp_min_size);
            return Ok(CompressOutcome::Skipped(SkipReason::BelowMin));
        }
        if src.len() > self.config.max_comp_size {
            NsStats::inc(&stats.skipped_comp_max_size);
            return Ok(CompressOutcome::Skipped(SkipReason::AboveMax));
        }

        let meta = if self.config.enable_dict {
            entry.map(|e| e.active())
        } else {
            None
        };
        let dict = meta.and_then(|m| m.compiled.as_deref());

        let len = match codec::compress_into(dst, src, dict, self.config.zstd_level) {
            Ok(len) => len,
            Err(e) => {
                NsStats::inc(&stats.compress_errs);
                return Err(e);
            }
        };

        // Efficiency is tracked for the default namespace only: that is
        // the dictionary the trainer rebuilds.
        if entry.is_some_and(|e| e.is_default()) {
            self.tracker.on_observation(src.len(), len);
        }

        if len >= src.len() {
            NsStats::inc(&stats.skipped_comp_incompressible);
            return Ok(CompressOutcome::Skipped(SkipReason::Incompressible));
        }
        NsStats::add(&stats.bytes_cmp_total, len as u64);

        Ok(CompressOutcome::Compressed {
            len,
            dict_id: meta.map_or(0, |m| m.id),
        })
    }

    /// Decompress a stored item, passing through anything the write
    /// path did not compress.
    pub fn maybe_decompress(&self, item: &StoredItem) -> Result<DecompressOutcome> {
        let guard = self.table.load();
        let entry = guard.as_deref().and_then(|t| t.pick_namespace(item.key));
        let stats = entry.map_or(&self.global_stats, |e| &e.stats);
        NsStats::inc(&stats.reads_total);

        if !item.compressed || item.chunked {
            return Ok(DecompressOutcome::PassThrough);
        }

        let dict = if item.dict_id != 0 {
            let Some(meta) = guard
                .as_deref()
                .and_then(|t| t.lookup_by_id(item.dict_id))
            else {
                NsStats::inc(&stats.dict_miss_errs);
                return Err(Error::UnknownDict(item.dict_id));
            };
            meta.compiled.as_deref()
        } else {
            None
        };

        let expect = match codec::frame_content_size(item.data) {
            Ok(Some(n)) => n as usize,
            // No content size in the frame; allocate pessimistically.
            Ok(None) => item.data.len().saturating_mul(4),
            Err(e) => {
                NsStats::inc(&stats.decompress_errs);
                return Err(e);
            }
        };

        match codec::decompress(item.data, dict, expect) {
            Ok(out) => Ok(DecompressOutcome::Data(out)),
            Err(e) => {
                NsStats::inc(&stats.decompress_errs);
                Err(e)
            }
        }
    }

    /// Feed one write into the training reservoir and the spooler.
    pub fn sample(&self, key: &[u8], value: &[u8]) {
        self.sample_for_training(value);
        if self.config.enable_sampling {
            self.sampler.maybe_record(key, value);
        }
    }

    fn sample_for_training(&self, value: &[u8]) {
        if value.len() > self.config.max_comp_size || value.len() < self.config.min_comp_size {
            return;
        }
        if !self.train_active.load(Ordering::Acquire) {
            return;
        }

        // Bootstrap: with no default dictionary yet, take every sample
        // so the first corpus fills quickly.
        let p = if self.has_default_dict() {
            self.config.sample_p
        } else {
            1.0
        };
        if p <= 0.0 {
            return;
        }
        if p < 1.0 {
            let threshold = (u32::MAX as f64 * p) as u32;
            if rand::random::<u32>() > threshold {
                return;
            }
        }

        if is_likely_incompressible(value) {
            return;
        }
        if self.reservoir.push(value) {
            NsStats::add(&self.default_stats.reservoir_bytes, value.len() as u64);
            NsStats::inc(&self.default_stats.reservoir_items);
        }
    }

    /// Release everything still held: queued retired tables, then the
    /// current table. Runs at shutdown after the background threads
    /// have stopped.
    fn release_tables(&self) {
        for retired in self.retired.drain() {
            retired.table.release_dicts(&self.pool);
        }
        if let Some(current) = self.table.swap(None) {
            current.release_dicts(&self.pool);
        }
    }
}

/// Periodic log line with the core's vital signs.
struct MetricsTask {
    core: Arc<Core>,
}

impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        let snapshot = self.core.stats.aggregate();
        tracing::info!(
            generation = self.core.generation(),
            writes = snapshot.writes_total,
            reads = snapshot.reads_total,
            bytes_raw = snapshot.bytes_raw_total,
            bytes_cmp = snapshot.bytes_cmp_total,
            ewma = self.core.tracker.ewma(),
            reservoir_bytes = self.core.reservoir.bytes_pending(),
            pool_entries = self.core.pool.len(),
            "Compression metrics"
        );
        Ok(())
    }
}

/// The process-wide compression core: hot-path entry points, the
/// dictionary lifecycle machinery, and its background threads.
///
/// One instance per process. `open` loads dictionaries and prepares the
/// core; `start` spawns the trainer, reclaimer, metrics and sampler
/// threads; `shutdown` stops them and releases pooled handles.
pub struct Engine {
    core: Arc<Core>,
    scheduler: Scheduler,
}

impl Engine {
    /// Build the core from a configuration and load any dictionaries
    /// already on disk. An invalid configuration is logged and demoted
    /// to pass-through mode (the host loader surfaces the exit code via
    /// `Config::sanity_check`).
    pub fn open(mut config: Config) -> Engine {
        if let Err(e) = config.sanity_check() {
            tracing::error!(error = %e, "Configuration rejected; compression disabled");
        }
        let core = Arc::new(Core::new(config));

        if core.config.enable_comp && core.config.enable_dict && core.config.dict_dir.is_some() {
            // An empty directory publishes nothing: the first trained
            // dictionary then becomes generation 1.
            match core.scan_table() {
                Ok(table) if !table.metas.is_empty() => {
                    tracing::info!(
                        dicts = table.metas.len(),
                        namespaces = table.spaces.len(),
                        "Loaded dictionaries"
                    );
                    core.publish(table);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Dictionary load failed; starting without dictionaries");
                }
            }
        }

        Engine {
            core,
            scheduler: Scheduler::new(),
        }
    }

    /// Spawn the background threads. Idempotent per engine: call once.
    pub fn start(&self) {
        let cfg = &self.core.config;
        if !cfg.enable_comp {
            return;
        }
        if cfg.enable_dict {
            if cfg.enable_training && cfg.dict_dir.is_some() {
                self.scheduler
                    .register(Arc::new(TrainerTask::new(Arc::clone(&self.core))));
            }
            self.scheduler
                .register(Arc::new(GcTask::new(Arc::clone(&self.core))));
        }
        self.scheduler.register(Arc::new(MetricsTask {
            core: Arc::clone(&self.core),
        }));
        if cfg.enable_sampling && cfg.spool_dir.is_some() {
            if let Err(e) = self.core.sampler.start() {
                tracing::warn!(error = %e, "Sampler failed to start");
            }
        }
    }

    /// Stop background threads and release pooled dictionaries.
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown()?;
        self.core.sampler.stop();
        self.core.sampler.drain_queue();
        self.core.release_tables();
        Ok(())
    }

    // ---- hot path ----------------------------------------------------

    pub fn maybe_compress(
        &self,
        key: &[u8],
        src: &[u8],
        dst: &mut Vec<u8>,
    ) -> Result<CompressOutcome> {
        self.core.maybe_compress(key, src, dst)
    }

    pub fn maybe_decompress(&self, item: &StoredItem) -> Result<DecompressOutcome> {
        self.core.maybe_decompress(item)
    }

    pub fn sample(&self, key: &[u8], value: &[u8]) {
        self.core.sample(key, value)
    }

    // ---- control surface ---------------------------------------------

    /// Namespaces of the current routing table.
    pub fn list_namespaces(&self) -> Vec<String> {
        self.core
            .current_table()
            .map(|t| t.namespace_names())
            .unwrap_or_default()
    }

    pub fn config_text(&self) -> String {
        self.core.config.to_text()
    }

    pub fn config_json(&self) -> serde_json::Value {
        self.core.config.to_json()
    }

    /// Stats snapshot: `None` aggregates everything, `Some(ns)` reports
    /// one namespace, with routing and efficiency detail where known.
    pub fn stats_snapshot(&self, namespace: Option<&str>) -> Result<StatsSnapshot> {
        let Some(ns) = namespace else {
            return Ok(self.core.stats.aggregate());
        };
        let stats = self
            .core
            .stats
            .lookup(ns)
            .ok_or_else(|| Error::InvalidInput(format!("unknown namespace '{ns}'")))?;
        let mut snapshot = stats.snapshot(ns);

        if let Some(table) = self.core.current_table() {
            if let Some(entry) = table.spaces.iter().find(|e| e.prefix == ns) {
                let active = entry.active();
                snapshot.dict_id = active.id;
                snapshot.dict_size = active.dict_size;
                snapshot.total_dicts = entry.dicts.len();
            }
        }
        if ns == DEFAULT_NS {
            snapshot.ewma = self.core.tracker.ewma();
            snapshot.baseline = self.core.tracker.baseline();
            snapshot.train_mode = self.core.config.train_mode.name().to_string();
            snapshot.last_retrain_ms = self.core.tracker.last_train_seconds() * 1000;
        }
        Ok(snapshot)
    }

    pub fn sampler_start(&self) -> Result<bool> {
        self.core.sampler.start()
    }

    pub fn sampler_stop(&self) -> bool {
        self.core.sampler.stop()
    }

    pub fn sampler_status(&self) -> SamplerStatus {
        self.core.sampler.status()
    }

    /// Diagnostic dump of the dictionary pool.
    pub fn pool_dump(&self) -> String {
        self.core.pool.dump()
    }

    /// Generation of the current routing table (0 = none yet).
    pub fn generation(&self) -> u64 {
        self.core.generation()
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::meta::save_dictionary;
    use crate::tmpfs::TempDir;

    fn base_config(dir: &TempDir) -> Config {
        let mut config = Config::new(dir.path());
        config.min_comp_size = 16;
        config.max_comp_size = 100_000;
        config.dict_size = 64 * 1024;
        config.enable_sampling = false;
        config
    }

    fn json_value(i: usize) -> Vec<u8> {
        format!(
            "{{\"id\":\"item-{i:07}\",\"kind\":\"profile\",\"flags\":[\"a\",\"b\",\"c\"],\
             \"score\":{},\"home\":\"region-{}\",\"note\":\"abcdefghijklmnopqrstuvwxyz\",\
             \"pad\":\"................................................\"}}",
            i % 1000,
            i % 7
        )
        .into_bytes()
    }

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_trip_through_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(base_config(&dir));

        let value = json_value(1);
        let mut scratch = Vec::new();
        let outcome = engine.maybe_compress(b"k1", &value, &mut scratch).unwrap();
        let CompressOutcome::Compressed { len, dict_id } = outcome else {
            panic!("expected compression, got {outcome:?}");
        };
        assert_eq!(dict_id, 0, "no dictionaries on disk yet");
        assert_eq!(len, scratch.len());

        let item = StoredItem {
            key: b"k1",
            data: &scratch,
            dict_id,
            compressed: true,
            chunked: false,
        };
        match engine.maybe_decompress(&item).unwrap() {
            DecompressOutcome::Data(out) => assert_eq!(out, value),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_skip_reasons_and_counters() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.min_comp_size = 32;
        config.max_comp_size = 1024;
        let engine = Engine::open(config);
        let mut scratch = Vec::new();

        assert_eq!(
            engine.maybe_compress(b"k", b"tiny", &mut scratch).unwrap(),
            CompressOutcome::Skipped(SkipReason::BelowMin)
        );
        let big = vec![0u8; 2048];
        assert_eq!(
            engine.maybe_compress(b"k", &big, &mut scratch).unwrap(),
            CompressOutcome::Skipped(SkipReason::AboveMax)
        );

        // High-entropy payload fails the ratio check.
        let mut state = 1u64;
        let noise: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as u8
            })
            .collect();
        assert_eq!(
            engine.maybe_compress(b"k", &noise, &mut scratch).unwrap(),
            CompressOutcome::Skipped(SkipReason::Incompressible)
        );

        let stats = engine.stats_snapshot(None).unwrap();
        assert_eq!(stats.writes_total, 3);
        assert_eq!(stats.skipped_comp_min_size, 1);
        assert_eq!(stats.skipped_comp_max_size, 1);
        assert_eq!(stats.skipped_comp_incompressible, 1);
    }

    #[test]
    fn test_disabled_engine_passes_through() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.enable_comp = false;
        let engine = Engine::open(config);
        let mut scratch = Vec::new();
        assert_eq!(
            engine.maybe_compress(b"k", &json_value(0), &mut scratch).unwrap(),
            CompressOutcome::Skipped(SkipReason::Disabled)
        );
    }

    #[test]
    fn test_invalid_config_starts_pass_through() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.zstd_level = 77;
        let engine = Engine::open(config);
        let mut scratch = Vec::new();
        assert_eq!(
            engine.maybe_compress(b"k", &json_value(0), &mut scratch).unwrap(),
            CompressOutcome::Skipped(SkipReason::Disabled)
        );
    }

    #[test]
    fn test_uncompressed_item_passes_through() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(base_config(&dir));
        let item = StoredItem {
            key: b"k",
            data: b"plain bytes",
            dict_id: 0,
            compressed: false,
            chunked: false,
        };
        assert_eq!(
            engine.maybe_decompress(&item).unwrap(),
            DecompressOutcome::PassThrough
        );
    }

    #[test]
    fn test_unknown_dict_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(base_config(&dir));
        let item = StoredItem {
            key: b"k",
            data: b"whatever",
            dict_id: 42,
            compressed: true,
            chunked: false,
        };
        assert_eq!(
            engine.maybe_decompress(&item),
            Err(Error::UnknownDict(42))
        );
        let stats = engine.stats_snapshot(None).unwrap();
        assert_eq!(stats.dict_miss_errs, 1);
    }

    #[test]
    fn test_dictionary_routing_on_write_path() {
        let dir = TempDir::new().unwrap();
        save_dictionary(dir.path(), &json_value(1), &prefixes(&["user:"]), 3, 10, 0).unwrap();
        save_dictionary(dir.path(), &json_value(2), &[], 3, 11, 0).unwrap();

        let engine = Engine::open(base_config(&dir));
        assert_eq!(engine.generation(), 1);
        assert_eq!(engine.list_namespaces(), vec!["default", "user:"]);

        let mut scratch = Vec::new();
        let value = json_value(3);
        let CompressOutcome::Compressed { dict_id, .. } = engine
            .maybe_compress(b"user:42", &value, &mut scratch)
            .unwrap()
        else {
            panic!("expected compression");
        };
        assert_eq!(dict_id, 1, "user: routes to the prefix dictionary");

        let CompressOutcome::Compressed { dict_id, .. } = engine
            .maybe_compress(b"other", &value, &mut scratch)
            .unwrap()
        else {
            panic!("expected compression");
        };
        assert_eq!(dict_id, 2, "unmatched keys fall to default");

        // Round trip through the prefix dictionary.
        let _ = engine
            .maybe_compress(b"user:42", &value, &mut scratch)
            .unwrap();
        let item = StoredItem {
            key: b"user:42",
            data: &scratch,
            dict_id: 1,
            compressed: true,
            chunked: false,
        };
        match engine.maybe_decompress(&item).unwrap() {
            DecompressOutcome::Data(out) => assert_eq!(out, value),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_publication_is_monotonic_and_stable() {
        let dir = TempDir::new().unwrap();
        save_dictionary(dir.path(), &json_value(0), &[], 3, 10, 0).unwrap();
        let engine = Engine::open(base_config(&dir));
        let core = engine.core();

        let mut seen = Vec::new();
        for _ in 0..5 {
            core.reload_dictionaries().unwrap();
            seen.push(core.current_table().unwrap().gen);
        }
        // Republishing the same directory keeps routing identical and
        // generations strictly increasing.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        let table = core.current_table().unwrap();
        assert_eq!(table.metas.len(), 1);
        assert!(table.has_default_dict());
    }

    #[test]
    fn test_concurrent_readers_under_publish() {
        let dir = TempDir::new().unwrap();
        save_dictionary(dir.path(), &json_value(0), &[], 3, 10, 0).unwrap();
        let engine = Arc::new(Engine::open(base_config(&dir)));

        // Pre-compress one value with dictionary id 1.
        let value = json_value(5);
        let mut scratch = Vec::new();
        let CompressOutcome::Compressed { dict_id, .. } =
            engine.maybe_compress(b"k", &value, &mut scratch).unwrap()
        else {
            panic!("expected compression");
        };
        assert_eq!(dict_id, 1);
        let frame = Arc::new(scratch.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let frame = Arc::clone(&frame);
            let value = value.clone();
            let stop = Arc::clone(&stop);
            readers.push(std::thread::spawn(move || {
                let mut last_gen = 0;
                while !stop.load(Ordering::Relaxed) {
                    let item = StoredItem {
                        key: b"k",
                        data: &frame,
                        dict_id: 1,
                        compressed: true,
                        chunked: false,
                    };
                    match engine.maybe_decompress(&item).unwrap() {
                        DecompressOutcome::Data(out) => assert_eq!(out, value),
                        other => panic!("unexpected {other:?}"),
                    }
                    let gen = engine.generation();
                    assert!(gen >= last_gen, "generation went backwards");
                    last_gen = gen;
                }
            }));
        }

        // Publisher: keep republishing (id 1 stays present) and add a
        // second dictionary partway through.
        for round in 0..20 {
            if round == 10 {
                save_dictionary(dir.path(), &json_value(9), &[], 3, 20, 0).unwrap();
            }
            engine.core().reload_dictionaries().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_stats_snapshot_unknown_namespace() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(base_config(&dir));
        assert!(engine.stats_snapshot(Some("nope:")).is_err());
    }

    #[test]
    fn test_default_namespace_snapshot_has_efficiency() {
        let dir = TempDir::new().unwrap();
        save_dictionary(dir.path(), &json_value(0), &[], 3, 10, 0).unwrap();
        let engine = Engine::open(base_config(&dir));

        let mut scratch = Vec::new();
        for i in 0..50 {
            engine
                .maybe_compress(b"some-key", &json_value(i), &mut scratch)
                .unwrap();
        }
        let snapshot = engine.stats_snapshot(Some(DEFAULT_NS)).unwrap();
        assert_eq!(snapshot.dict_id, 1);
        assert_eq!(snapshot.total_dicts, 1);
        assert!(snapshot.ewma > 0.0, "observations must feed the tracker");
        assert_eq!(snapshot.train_mode, "fast");
        assert_eq!(snapshot.writes_total, 50);
    }
}
