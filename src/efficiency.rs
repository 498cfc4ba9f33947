use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::Config;

/// Lock-free tracker of compression efficiency.
///
/// Maintains an EWMA of the per-value compression ratio
/// (compressed/original, lower is better) and decides when the online
/// trainer should rebuild the default dictionary. One instance is shared
/// by all worker threads; the two ratio cells are independent atomics,
/// so a reader may observe a momentarily inconsistent pair. That is fine
/// for a heuristic gate.
///
/// The baseline is non-increasing: it is captured at each retrain and
/// only ever improves.
pub struct EfficiencyTracker {
    ewma_bits: AtomicU64,
    baseline_bits: AtomicU64,
    initialized: AtomicBool,
    last_train_ts: AtomicU64,
    bytes_since_train: AtomicU64,

    enabled: bool,
    retraining_interval_s: u64,
    min_training_size: u64,
    alpha: f64,
    retrain_drop: f64,
}

impl EfficiencyTracker {
    pub fn new(config: &Config, now_s: u64) -> Self {
        Self {
            ewma_bits: AtomicU64::new(0f64.to_bits()),
            baseline_bits: AtomicU64::new(0f64.to_bits()),
            initialized: AtomicBool::new(false),
            last_train_ts: AtomicU64::new(now_s),
            bytes_since_train: AtomicU64::new(0),
            enabled: config.enable_training,
            retraining_interval_s: config.retraining_interval.as_secs(),
            min_training_size: config.min_training_size as u64,
            alpha: config.ewma_alpha,
            retrain_drop: config.retrain_drop,
        }
    }

    /// Record one compression result. Hot path; CAS-retry only, no
    /// locks. An observation with `original == 0` is ignored.
    pub fn on_observation(&self, original: usize, compressed: usize) {
        if original == 0 {
            return;
        }
        let ratio = compressed as f64 / original as f64;

        if !self.initialized.load(Ordering::Acquire)
            && self
                .initialized
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.ewma_bits.store(ratio.to_bits(), Ordering::Release);
        } else {
            let mut current = self.ewma_bits.load(Ordering::Acquire);
            loop {
                let next = (1.0 - self.alpha) * f64::from_bits(current) + self.alpha * ratio;
                match self.ewma_bits.compare_exchange_weak(
                    current,
                    next.to_bits(),
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }

        self.bytes_since_train
            .fetch_add(original as u64, Ordering::Relaxed);
    }

    /// True when the trainer should rebuild: training enabled, EWMA
    /// initialized, the retrain interval has elapsed, enough bytes have
    /// been observed, and the ratio has worsened past the baseline by
    /// the configured margin. A zero baseline (never retrained) leaves
    /// only the byte/time gates in force.
    pub fn should_retrain(&self, now_s: u64) -> bool {
        if !self.enabled || !self.initialized.load(Ordering::Acquire) {
            return false;
        }
        let last = self.last_train_ts.load(Ordering::Acquire);
        if now_s.saturating_sub(last) < self.retraining_interval_s {
            return false;
        }
        if self.bytes_since_train.load(Ordering::Acquire) < self.min_training_size {
            return false;
        }
        let baseline = f64::from_bits(self.baseline_bits.load(Ordering::Acquire));
        if baseline == 0.0 {
            return true;
        }
        let ewma = f64::from_bits(self.ewma_bits.load(Ordering::Acquire));
        ewma >= baseline * (1.0 + self.retrain_drop)
    }

    /// Record a completed retrain: capture the baseline (keeping it
    /// non-increasing), stamp the time, reset the byte counter. Called
    /// only by the trainer thread.
    pub fn mark_retrained(&self, now_s: u64) {
        let ewma = f64::from_bits(self.ewma_bits.load(Ordering::Acquire));
        let baseline = f64::from_bits(self.baseline_bits.load(Ordering::Acquire));
        let next = if baseline == 0.0 {
            ewma
        } else {
            baseline.min(ewma)
        };
        self.baseline_bits.store(next.to_bits(), Ordering::Release);
        self.last_train_ts.store(now_s, Ordering::Release);
        self.bytes_since_train.store(0, Ordering::Release);
    }

    pub fn ewma(&self) -> f64 {
        f64::from_bits(self.ewma_bits.load(Ordering::Acquire))
    }

    pub fn baseline(&self) -> f64 {
        f64::from_bits(self.baseline_bits.load(Ordering::Acquire))
    }

    pub fn last_train_seconds(&self) -> u64 {
        self.last_train_ts.load(Ordering::Acquire)
    }

    pub fn bytes_since_train(&self) -> u64 {
        self.bytes_since_train.load(Ordering::Acquire)
    }
}
