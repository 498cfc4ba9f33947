use std::path::PathBuf;
use std::time::Duration;

use crate::errinput;
use crate::error::{Error, Result};

/// Absolute limits for the Zstandard integration.
const ZSTD_LEVEL_MIN: i32 = 1;
const ZSTD_LEVEL_MAX: i32 = 22;
const ZSTD_DICT_MAX: usize = 1024 * 1024;
const ZSTD_VALUE_MAX: usize = 200 * 1024;

/// Dictionary training mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainMode {
    /// Single pass with the codec's default cover parameters.
    Fast,
    /// Parameter search across candidate dictionary sizes, scored on a
    /// held-out slice of the training batch.
    Optimize,
}

impl TrainMode {
    pub fn name(&self) -> &'static str {
        match self {
            TrainMode::Fast => "fast",
            TrainMode::Optimize => "optimize",
        }
    }
}

/// Configuration for the compression core. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch for the compression hot path (default: true)
    pub enable_comp: bool,

    /// Use shared dictionaries for compression (default: true)
    pub enable_dict: bool,

    /// Directory holding dictionary and manifest files
    pub dict_dir: Option<PathBuf>,

    /// Target dictionary size in bytes (default: 256KB)
    pub dict_size: usize,

    /// Zstandard compression level, 1..=22 (default: 3)
    pub zstd_level: i32,

    /// Smallest value size eligible for compression (default: 32)
    pub min_comp_size: usize,

    /// Largest value size eligible for compression (default: 100KB)
    pub max_comp_size: usize,

    /// Enable the online trainer (default: true)
    pub enable_training: bool,

    /// Minimum time between retrains (default: 2h)
    pub retraining_interval: Duration,

    /// Bytes observed since the last train before a retrain may fire;
    /// 0 means "dict_size * 100" (default: 0)
    pub min_training_size: usize,

    /// EWMA smoothing factor for the compression ratio, 0..1 (default: 0.05)
    pub ewma_alpha: f64,

    /// Relative ratio worsening that triggers a retrain (default: 0.1)
    pub retrain_drop: f64,

    /// Training mode (default: fast)
    pub train_mode: TrainMode,

    /// Resident dictionaries retained per namespace (default: 10)
    pub dict_retain_max: usize,

    /// How long a retired routing table stays in memory (default: 1h)
    pub gc_cool_period: Duration,

    /// How long a retired dictionary file stays on disk and its id stays
    /// off-limits (default: 7d)
    pub gc_quarantine_period: Duration,

    /// Enable the raw sample spooler (default: true)
    pub enable_sampling: bool,

    /// Bernoulli probability for spooling a sample, 0..1 (default: 0.02)
    pub sample_p: f64,

    /// Spooling window; zero means unbounded (default: 0)
    pub sample_window_duration: Duration,

    /// Directory for spool files
    pub spool_dir: Option<PathBuf>,

    /// Spool file size cap in bytes (default: 64MB)
    pub spool_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_comp: true,
            enable_dict: true,
            dict_dir: None,
            dict_size: 256 * 1024,
            zstd_level: 3,
            min_comp_size: 32,
            max_comp_size: 100 * 1024,
            enable_training: true,
            retraining_interval: Duration::from_secs(2 * 60 * 60),
            min_training_size: 0,
            ewma_alpha: 0.05,
            retrain_drop: 0.1,
            train_mode: TrainMode::Fast,
            dict_retain_max: 10,
            gc_cool_period: Duration::from_secs(3600),
            gc_quarantine_period: Duration::from_secs(3600 * 24 * 7),
            enable_sampling: true,
            sample_p: 0.02,
            sample_window_duration: Duration::ZERO,
            spool_dir: None,
            spool_max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new config with the given dictionary directory
    pub fn new(dict_dir: impl Into<PathBuf>) -> Self {
        Self {
            dict_dir: Some(dict_dir.into()),
            ..Default::default()
        }
    }

    /// Set the target dictionary size
    pub fn dict_size(mut self, size: usize) -> Self {
        self.dict_size = size;
        self
    }

    /// Set the compression level
    pub fn zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    /// Set the eligible value size range
    pub fn comp_size_range(mut self, min: usize, max: usize) -> Self {
        self.min_comp_size = min;
        self.max_comp_size = max;
        self
    }

    /// Set the training byte threshold
    pub fn min_training_size(mut self, bytes: usize) -> Self {
        self.min_training_size = bytes;
        self
    }

    /// Set the spool directory
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Effective training threshold: configured minimum, or the 100x
    /// rule when unset.
    pub fn training_threshold(&self) -> usize {
        if self.min_training_size != 0 {
            self.min_training_size
        } else {
            self.dict_size.saturating_mul(100)
        }
    }

    /// Apply one `key = value` pair from the host's configuration
    /// loader. Unknown keys are rejected so typos surface at startup.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "enable_comp" => self.enable_comp = parse_bool(value)?,
            "enable_dict" => self.enable_dict = parse_bool(value)?,
            "dict_dir" => self.dict_dir = Some(PathBuf::from(value)),
            "dict_size" => self.dict_size = parse_bytes(value)?,
            "zstd_level" => self.zstd_level = value.trim().parse()?,
            "min_comp_size" => self.min_comp_size = parse_bytes(value)?,
            "max_comp_size" => self.max_comp_size = parse_bytes(value)?,
            "enable_training" => self.enable_training = parse_bool(value)?,
            "retraining_interval" => self.retraining_interval = parse_duration(value)?,
            "min_training_size" => self.min_training_size = parse_bytes(value)?,
            "ewma_alpha" => self.ewma_alpha = value.trim().parse()?,
            "retrain_drop" => self.retrain_drop = value.trim().parse()?,
            "train_mode" => {
                self.train_mode = match value.trim() {
                    "fast" => TrainMode::Fast,
                    "optimize" => TrainMode::Optimize,
                    other => return errinput!("unknown train_mode '{other}'"),
                }
            }
            "dict_retain_max" => self.dict_retain_max = value.trim().parse()?,
            "gc_cool_period" => self.gc_cool_period = parse_duration(value)?,
            "gc_quarantine_period" => self.gc_quarantine_period = parse_duration(value)?,
            "enable_sampling" => self.enable_sampling = parse_bool(value)?,
            "sample_p" => self.sample_p = value.trim().parse()?,
            "sample_window_duration" => self.sample_window_duration = parse_duration(value)?,
            "spool_dir" => self.spool_dir = Some(PathBuf::from(value)),
            "spool_max_bytes" => self.spool_max_bytes = parse_bytes(value)?,
            other => return errinput!("unknown config key '{other}'"),
        }
        Ok(())
    }

    /// Validate and normalize the configuration. On a hard error the
    /// compression and dictionary switches are cleared so the core can
    /// still start in pass-through mode, and the error is returned for
    /// the loader's exit code.
    pub fn sanity_check(&mut self) -> Result<()> {
        if let Err(e) = self.check() {
            self.enable_comp = false;
            self.enable_dict = false;
            return Err(e);
        }
        Ok(())
    }

    fn check(&mut self) -> Result<()> {
        if self.zstd_level == 0 {
            self.zstd_level = 3;
        }
        if self.zstd_level < ZSTD_LEVEL_MIN || self.zstd_level > ZSTD_LEVEL_MAX {
            return Err(Error::ConfigInvalid(format!(
                "zstd_level {} out of range [{ZSTD_LEVEL_MIN}..{ZSTD_LEVEL_MAX}]",
                self.zstd_level
            )));
        }
        if self.dict_size == 0 {
            self.dict_size = 112 * 1024;
        }
        if self.dict_size > ZSTD_DICT_MAX {
            self.dict_size = ZSTD_DICT_MAX;
        }
        if self.max_comp_size > ZSTD_VALUE_MAX {
            self.max_comp_size = ZSTD_VALUE_MAX;
        }
        if self.min_comp_size > self.max_comp_size {
            return Err(Error::ConfigInvalid(format!(
                "min_comp_size {} exceeds max_comp_size {}",
                self.min_comp_size, self.max_comp_size
            )));
        }
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err(Error::ConfigInvalid(format!(
                "ewma_alpha {} out of range [0..1]",
                self.ewma_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.retrain_drop) {
            return Err(Error::ConfigInvalid(format!(
                "retrain_drop {} out of range [0..1]",
                self.retrain_drop
            )));
        }
        if !(0.0..=1.0).contains(&self.sample_p) {
            return Err(Error::ConfigInvalid(format!(
                "sample_p {} out of range [0..1]",
                self.sample_p
            )));
        }
        if self.dict_retain_max == 0 {
            return Err(Error::ConfigInvalid(
                "dict_retain_max must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Render the configuration as `key = value` lines for the plain
    /// control-surface dump.
    pub fn to_text(&self) -> String {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        format!(
            "enable_comp = {}\n\
             enable_dict = {}\n\
             dict_dir = {}\n\
             dict_size = {}\n\
             zstd_level = {}\n\
             min_comp_size = {}\n\
             max_comp_size = {}\n\
             enable_training = {}\n\
             retraining_interval = {}\n\
             min_training_size = {}\n\
             ewma_alpha = {}\n\
             retrain_drop = {}\n\
             train_mode = {}\n\
             dict_retain_max = {}\n\
             gc_cool_period = {}\n\
             gc_quarantine_period = {}\n\
             enable_sampling = {}\n\
             sample_p = {}\n\
             sample_window_duration = {}\n\
             spool_dir = {}\n\
             spool_max_bytes = {}\n",
            self.enable_comp,
            self.enable_dict,
            path(&self.dict_dir),
            self.dict_size,
            self.zstd_level,
            self.min_comp_size,
            self.max_comp_size,
            self.enable_training,
            self.retraining_interval.as_secs(),
            self.min_training_size,
            self.ewma_alpha,
            self.retrain_drop,
            self.train_mode.name(),
            self.dict_retain_max,
            self.gc_cool_period.as_secs(),
            self.gc_quarantine_period.as_secs(),
            self.enable_sampling,
            self.sample_p,
            self.sample_window_duration.as_secs(),
            path(&self.spool_dir),
            self.spool_max_bytes,
        )
    }

    /// Render the configuration as JSON for the control surface.
    pub fn to_json(&self) -> serde_json::Value {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        serde_json::json!({
            "enable_comp": self.enable_comp,
            "enable_dict": self.enable_dict,
            "dict_dir": path(&self.dict_dir),
            "dict_size": self.dict_size,
            "zstd_level": self.zstd_level,
            "min_comp_size": self.min_comp_size,
            "max_comp_size": self.max_comp_size,
            "enable_training": self.enable_training,
            "retraining_interval": self.retraining_interval.as_secs(),
            "min_training_size": self.min_training_size,
            "ewma_alpha": self.ewma_alpha,
            "retrain_drop": self.retrain_drop,
            "train_mode": self.train_mode.name(),
            "dict_retain_max": self.dict_retain_max,
            "gc_cool_period": self.gc_cool_period.as_secs(),
            "gc_quarantine_period": self.gc_quarantine_period.as_secs(),
            "enable_sampling": self.enable_sampling,
            "sample_p": self.sample_p,
            "sample_window_duration": self.sample_window_duration.as_secs(),
            "spool_dir": path(&self.spool_dir),
            "spool_max_bytes": self.spool_max_bytes,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => errinput!("expected boolean, got '{other}'"),
    }
}

/// Parse a byte size with an optional K/M/G suffix (SI-1024; KB/KiB and
/// friends are accepted, case-insensitive).
pub fn parse_bytes(value: &str) -> Result<usize> {
    let value = value.trim();
    if value.is_empty() {
        return errinput!("empty size value");
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (num, suffix) = value.split_at(split);
    let num: f64 = num.trim().parse()?;
    let mul: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => return errinput!("unknown size suffix '{other}'"),
    };
    let total = num * mul as f64;
    if total < 0.0 || total > usize::MAX as f64 {
        return errinput!("size '{value}' out of range");
    }
    Ok(total as usize)
}

/// Parse a duration: a plain number is seconds; s/m/h suffixes are
/// accepted.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return errinput!("empty duration value");
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (num, suffix) = value.split_at(split);
    let num: f64 = num.trim().parse()?;
    let mul: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return errinput!("unknown duration suffix '{other}'"),
    };
    if num < 0.0 {
        return errinput!("negative duration '{value}'");
    }
    Ok(Duration::from_secs_f64(num * mul as f64))
}
