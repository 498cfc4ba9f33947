use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, CompiledDict};
use crate::config::TrainMode;
use crate::engine::{now_epoch, Core};
use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::scheduler::{BackgroundTask, Context};
use crate::stats::NsStats;

/// The codec occasionally emits near-empty dictionaries from weak
/// corpora; anything under 1 KiB is rejected.
const MIN_DICT_SIZE: usize = 1024;

/// Holdout samples scored when searching training parameters.
const OPTIMIZE_HOLDOUT_MAX: usize = 128;

/// Online dictionary trainer.
///
/// One iteration per second. Activation is sticky: it turns on when the
/// routing table has no default dictionary (bootstrap) or when the
/// efficiency tracker reports drift, and turns off only after a
/// dictionary has been built, persisted, and published. While active,
/// worker threads feed the reservoir; once enough bytes are pending the
/// batch is drained and trained.
pub(crate) struct TrainerTask {
    core: Arc<Core>,
    errlog: RateLimiter,
}

impl TrainerTask {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            errlog: RateLimiter::new(Duration::from_secs(10)),
        }
    }

    fn run_once(&self) -> Result<()> {
        let core = &self.core;
        let now = now_epoch();

        if !core.has_default_dict() || core.tracker.should_retrain(now as u64) {
            core.train_active.store(true, Ordering::Release);
        }
        if !core.train_active.load(Ordering::Acquire) {
            return Ok(());
        }

        if core.reservoir.bytes_pending() < core.config.training_threshold() {
            return Ok(());
        }

        let stats = Arc::clone(core.default_stats());
        NsStats::inc(&stats.trainer_runs);

        let batch = core.reservoir.drain();
        if batch.is_empty() {
            NsStats::inc(&stats.trainer_errs);
            if self.errlog.allow() {
                tracing::warn!("Trainer activated with an empty reservoir");
            }
            return Ok(());
        }

        // Flatten the batch; drop it outright if the total overflows.
        let mut total = 0usize;
        let mut overflow = false;
        for sample in &batch {
            match total.checked_add(sample.len()) {
                Some(t) => total = t,
                None => {
                    overflow = true;
                    break;
                }
            }
        }
        if overflow || total == 0 {
            NsStats::inc(&stats.trainer_errs);
            core.reservoir.consume(usize::MAX);
            NsStats::set(&stats.reservoir_bytes, 0);
            NsStats::set(&stats.reservoir_items, 0);
            return Ok(());
        }

        let sizes: Vec<usize> = batch.iter().map(|s| s.len()).collect();
        let mut flat = Vec::with_capacity(total);
        for sample in &batch {
            flat.extend_from_slice(sample);
        }
        drop(batch);

        let mut success = false;
        match self.train(&flat, &sizes) {
            Ok(dict) if dict.len() >= MIN_DICT_SIZE => {
                match self.persist_and_publish(&dict, now) {
                    Ok(()) => {
                        tracing::info!(
                            dict_bytes = dict.len(),
                            samples = sizes.len(),
                            corpus_bytes = total,
                            "Built and published dictionary"
                        );
                        success = true;
                    }
                    Err(e) => {
                        NsStats::inc(&stats.trainer_errs);
                        if self.errlog.allow() {
                            tracing::warn!(error = %e, "Dictionary persist failed; will retry");
                        }
                    }
                }
            }
            Ok(dict) => {
                NsStats::inc(&stats.trainer_errs);
                if self.errlog.allow() {
                    tracing::warn!(
                        dict_bytes = dict.len(),
                        "Trained dictionary too small, dropped"
                    );
                }
            }
            Err(e) => {
                NsStats::inc(&stats.trainer_errs);
                if self.errlog.allow() {
                    tracing::warn!(
                        error = %e,
                        samples = sizes.len(),
                        corpus_bytes = total,
                        "Dictionary training failed"
                    );
                }
            }
        }

        // Return the consumed bytes exactly once, success or not.
        core.reservoir.consume(total);
        NsStats::set(&stats.reservoir_bytes, 0);
        NsStats::set(&stats.reservoir_items, 0);
        NsStats::set(&stats.trainer_ms_last, now as u64 * 1000);

        if success {
            core.train_active.store(false, Ordering::Release);
            core.tracker.mark_retrained(now as u64);
            NsStats::inc(&stats.retrain_count);
            NsStats::set(&stats.last_retrain_ms, now as u64 * 1000);
        }
        Ok(())
    }

    fn persist_and_publish(&self, dict: &[u8], now: i64) -> Result<()> {
        let dir = self
            .core
            .config
            .dict_dir
            .as_deref()
            .ok_or_else(|| crate::Error::InvalidInput("no dict_dir configured".into()))?;
        crate::dict::meta::save_dictionary(
            dir,
            dict,
            &[],
            self.core.config.zstd_level,
            now,
            self.core.config.gc_quarantine_period.as_secs() as i64,
        )?;
        self.core.reload_dictionaries()
    }

    fn train(&self, flat: &[u8], sizes: &[usize]) -> Result<Vec<u8>> {
        let max_size = self.core.config.dict_size;
        match self.core.config.train_mode {
            TrainMode::Fast => codec::train_from_continuous(flat, sizes, max_size),
            TrainMode::Optimize => {
                train_optimize(flat, sizes, max_size, self.core.config.zstd_level)
            }
        }
    }
}

impl BackgroundTask for TrainerTask {
    fn name(&self) -> &'static str {
        "dict-trainer"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        self.run_once()
    }
}

/// Parameter search: train candidates at several target sizes and keep
/// the one that compresses a held-out slice of the corpus best.
fn train_optimize(flat: &[u8], sizes: &[usize], max_size: usize, level: i32) -> Result<Vec<u8>> {
    let mut candidates = vec![max_size];
    for shrunk in [max_size / 2, max_size / 4] {
        if shrunk >= MIN_DICT_SIZE {
            candidates.push(shrunk);
        }
    }

    // The last samples of the corpus serve as the scoring holdout.
    let holdout_count = (sizes.len() / 10).clamp(1, OPTIMIZE_HOLDOUT_MAX);
    let holdout_bytes: usize = sizes[sizes.len() - holdout_count..].iter().sum();
    let mut holdout = Vec::with_capacity(holdout_count);
    let mut offset = flat.len() - holdout_bytes;
    for len in &sizes[sizes.len() - holdout_count..] {
        holdout.push(&flat[offset..offset + len]);
        offset += len;
    }

    let mut best: Option<(usize, Vec<u8>)> = None;
    let mut last_err = None;
    for candidate in candidates {
        let dict = match codec::train_from_continuous(flat, sizes, candidate) {
            Ok(dict) if dict.len() >= MIN_DICT_SIZE => dict,
            Ok(_) => continue,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let compiled = CompiledDict::compile(&dict, level);
        let mut scratch = Vec::new();
        let mut score = 0usize;
        for sample in &holdout {
            score += codec::compress_into(&mut scratch, sample, Some(&compiled), level)?;
        }
        if best.as_ref().map_or(true, |(s, _)| score < *s) {
            best = Some((score, dict));
        }
    }

    match best {
        Some((_, dict)) => Ok(dict),
        None => Err(last_err
            .unwrap_or_else(|| crate::Error::Codec("no usable dictionary candidate".into()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{CompressOutcome, Engine};
    use crate::tmpfs::TempDir;
    use std::time::Instant;

    fn sample_value(i: usize) -> Vec<u8> {
        format!(
            "{{\"event\":\"page_view\",\"user\":\"u-{i:08}\",\"path\":\"/catalog/items/{}\",\
             \"agent\":\"Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36\",\
             \"country\":\"de\",\"ab_bucket\":{},\"referrer\":\"https://search.example.com/\"}}",
            i % 500,
            i % 16
        )
        .into_bytes()
    }

    fn corpus(count: usize) -> (Vec<u8>, Vec<usize>) {
        let samples: Vec<Vec<u8>> = (0..count).map(sample_value).collect();
        let sizes = samples.iter().map(Vec::len).collect();
        (samples.concat(), sizes)
    }

    #[test]
    fn test_optimize_search_produces_usable_dict() {
        let (flat, sizes) = corpus(3000);
        let dict = train_optimize(&flat, &sizes, 32 * 1024, 3).unwrap();
        assert!(dict.len() >= MIN_DICT_SIZE);
        assert!(dict.len() <= 32 * 1024);

        let compiled = CompiledDict::compile(&dict, 3);
        let value = sample_value(777_777);
        let mut dst = Vec::new();
        let len = codec::compress_into(&mut dst, &value, Some(&compiled), 3).unwrap();
        assert!(len < value.len());
    }

    /// Bootstrap end to end: an empty dictionary directory, a stream of
    /// structured values, and the trainer must produce and publish the
    /// first dictionary on its own.
    #[test]
    fn test_bootstrap_builds_first_dictionary() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.min_comp_size = 32;
        config.max_comp_size = 100_000;
        config.dict_size = 64 * 1024;
        config.min_training_size = 1 << 20;
        config.ewma_alpha = 0.2;
        config.retrain_drop = 0.1;
        config.enable_sampling = false;
        let engine = Engine::open(config);
        assert_eq!(engine.generation(), 0);
        engine.start();

        // Feed until the trainer activates (first tick), fills the
        // reservoir past 1 MiB, trains, and publishes.
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut i = 0usize;
        while engine.generation() == 0 {
            assert!(Instant::now() < deadline, "trainer never published");
            for _ in 0..500 {
                let key = format!("page:{i}");
                engine.sample(key.as_bytes(), &sample_value(i));
                i += 1;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(engine.generation(), 1);
        assert_eq!(engine.list_namespaces(), vec!["default"]);

        // New writes now route to dictionary id 1 and compress well.
        let value = sample_value(1_000_001);
        let mut scratch = Vec::new();
        let CompressOutcome::Compressed { len, dict_id } = engine
            .maybe_compress(b"no-prefix-key", &value, &mut scratch)
            .unwrap()
        else {
            panic!("expected compression after bootstrap");
        };
        assert_eq!(dict_id, 1);
        assert!(
            (len as f64) < 0.7 * value.len() as f64,
            "dictionary ratio too weak: {len}/{}",
            value.len()
        );

        // Success deactivates training until the tracker re-triggers.
        assert!(!engine.core().train_active.load(Ordering::Acquire));
        let stats = engine.stats_snapshot(Some("default")).unwrap();
        assert!(stats.trainer_runs >= 1);
        assert_eq!(stats.retrain_count, 1);
        assert_eq!(stats.reservoir_bytes, 0);
        assert_eq!(stats.reservoir_items, 0);

        engine.shutdown().unwrap();
    }

    /// A failed batch keeps the trainer active and charges an error.
    #[test]
    fn test_weak_corpus_is_dropped_and_retried() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.min_comp_size = 1;
        config.max_comp_size = 100_000;
        config.dict_size = 64 * 1024;
        config.min_training_size = 64;
        config.enable_sampling = false;
        let engine = Engine::open(config);
        let core = Arc::clone(engine.core());

        // Two tiny samples cannot train a dictionary.
        core.train_active.store(true, Ordering::Release);
        core.reservoir.push(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        core.reservoir.push(b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

        let trainer = TrainerTask::new(Arc::clone(&core));
        trainer.run_once().unwrap();

        assert_eq!(engine.generation(), 0, "nothing published");
        assert!(core.train_active.load(Ordering::Acquire), "stays active");
        assert_eq!(core.reservoir.bytes_pending(), 0, "budget returned");
        let stats = engine.stats_snapshot(Some("default")).unwrap();
        assert_eq!(stats.trainer_runs, 1);
        assert_eq!(stats.trainer_errs, 1);
    }

    /// Below the threshold the trainer waits even though it is active.
    #[test]
    fn test_threshold_gate_holds_training() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.min_comp_size = 1;
        config.max_comp_size = 100_000;
        config.min_training_size = 1 << 20;
        config.enable_sampling = false;
        let engine = Engine::open(config);
        let core = Arc::clone(engine.core());

        let trainer = TrainerTask::new(Arc::clone(&core));
        trainer.run_once().unwrap();
        assert!(
            core.train_active.load(Ordering::Acquire),
            "bootstrap activates sampling"
        );

        core.reservoir.push(&vec![b'x'; 1024]);
        trainer.run_once().unwrap();
        assert_eq!(
            core.reservoir.bytes_pending(),
            1024,
            "batch must not be drained below the threshold"
        );
        let stats = engine.stats_snapshot(Some("default")).unwrap();
        assert_eq!(stats.trainer_runs, 0);
    }
}
