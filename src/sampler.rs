use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Local;

use crate::error::{Error, Result};
use crate::stack::Stack;

/// Poll period of the consumer thread.
const POLL: Duration = Duration::from_millis(10);
/// User-space write buffer in front of the spool file.
const WRITE_BUF: usize = 1 << 20;

/// One spooled record: deep copies of key and value.
struct SpoolRecord {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl SpoolRecord {
    /// On-disk footprint: 8-byte header plus both payloads.
    fn cost(&self) -> usize {
        8 + self.key.len() + self.value.len()
    }
}

/// Status snapshot for the control surface.
#[derive(Debug, Clone)]
pub struct SamplerStatus {
    pub configured: bool,
    pub running: bool,
    pub bytes_written: usize,
    pub bytes_collected: usize,
    pub path: Option<PathBuf>,
}

struct Inner {
    spool_dir: Option<PathBuf>,
    sample_p: f64,
    window: Duration,
    max_bytes: usize,

    running: AtomicBool,
    bytes_written: AtomicUsize,
    /// Bytes accepted into the queue (queued + written), gating intake.
    bytes_collected: AtomicUsize,
    path: Mutex<Option<PathBuf>>,
    queue: Stack<SpoolRecord>,
}

/// Spooler of Bernoulli-sampled key/value records for offline corpus
/// analysis.
///
/// Producers push deep copies through a lock-free stack; one consumer
/// thread drains it every ~10 ms and appends records to
/// `<spool_dir>/mcz_samples_YYYYMMDD_HHMMSS.bin`:
///
/// ```text
/// offset 0       key_len  : u32 LE
/// offset 4       val_len  : u32 LE
/// offset 8       key bytes
/// offset 8+klen  val bytes
/// ```
///
/// The thread stops on its own when the byte cap or the sampling window
/// is reached, or on an I/O error.
pub struct Sampler {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn new(
        spool_dir: Option<PathBuf>,
        sample_p: f64,
        window: Duration,
        max_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                spool_dir,
                sample_p,
                window,
                max_bytes: if max_bytes == 0 { 64 << 20 } else { max_bytes },
                running: AtomicBool::new(false),
                bytes_written: AtomicUsize::new(0),
                bytes_collected: AtomicUsize::new(0),
                path: Mutex::new(None),
                queue: Stack::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    fn configured(&self) -> bool {
        self.inner.spool_dir.is_some()
    }

    /// Start the consumer thread. Ok(true) when started, Ok(false) when
    /// already running.
    pub fn start(&self) -> Result<bool> {
        if !self.configured() {
            return Err(Error::InvalidInput("sampler has no spool_dir".into()));
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        // A previous self-stopped run may have left a finished worker.
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.take() {
            handle.join().ok();
        }

        self.inner.bytes_written.store(0, Ordering::Release);
        self.inner.bytes_collected.store(0, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("sampler".to_string())
            .spawn(move || consumer_main(&inner))
            .map_err(|e| Error::IO(e.to_string()))?;
        *worker = Some(handle);
        Ok(true)
    }

    /// Stop collection and join the consumer. Returns false when it was
    /// not running (it may have stopped itself at the cap).
    pub fn stop(&self) -> bool {
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.join().ok();
        }
        was_running
    }

    /// Offer one key/value pair. Subject to the running flag, the
    /// Bernoulli coin, and the byte cap; accepted records are deep
    /// copied and queued for the consumer.
    pub fn maybe_record(&self, key: &[u8], value: &[u8]) {
        if !self.inner.running.load(Ordering::Acquire) {
            return;
        }
        let p = self.inner.sample_p;
        if p <= 0.0 {
            return;
        }
        if p < 1.0 {
            let threshold = (u32::MAX as f64 * p) as u32;
            if rand::random::<u32>() > threshold {
                return;
            }
        }
        if self.inner.bytes_collected.load(Ordering::Acquire) >= self.inner.max_bytes {
            return;
        }

        let record = SpoolRecord {
            key: key.to_vec().into_boxed_slice(),
            value: value.to_vec().into_boxed_slice(),
        };
        let cost = record.cost();
        self.inner.queue.push(record);
        self.inner.bytes_collected.fetch_add(cost, Ordering::AcqRel);
    }

    pub fn status(&self) -> SamplerStatus {
        SamplerStatus {
            configured: self.configured(),
            running: self.inner.running.load(Ordering::Acquire),
            bytes_written: self.inner.bytes_written.load(Ordering::Acquire),
            bytes_collected: self.inner.bytes_collected.load(Ordering::Acquire),
            path: self.inner.path.lock().unwrap().clone(),
        }
    }

    /// Drop queued records without writing them. Used at shutdown and
    /// by tests.
    pub fn drain_queue(&self) {
        drop(self.inner.queue.drain());
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consumer_main(inner: &Inner) {
    let start = Instant::now();
    let dir = inner.spool_dir.as_deref().expect("sampler started unconfigured");

    if let Err(e) = fs::create_dir_all(dir) {
        tracing::error!(dir = %dir.display(), error = %e, "Sampler cannot create spool dir");
        finish(inner);
        return;
    }
    let path = dir.join(format!(
        "mcz_samples_{}.bin",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = match OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Sampler cannot open spool file");
            finish(inner);
            return;
        }
    };
    *inner.path.lock().unwrap() = Some(path.clone());
    let mut writer = BufWriter::with_capacity(WRITE_BUF, file);

    let window = inner.window;
    while inner.running.load(Ordering::Acquire) {
        if !window.is_zero() && start.elapsed() >= window {
            break;
        }

        // LIFO drain; reverse to restore arrival order.
        let mut batch: Vec<SpoolRecord> = inner.queue.drain().collect();
        if batch.is_empty() {
            std::thread::sleep(POLL);
            continue;
        }
        batch.reverse();

        for record in batch {
            if record.key.len() > u32::MAX as usize || record.value.len() > u32::MAX as usize {
                continue;
            }
            if let Err(e) = write_record(&mut writer, &record) {
                tracing::error!(path = %path.display(), error = %e, "Sampler write failed");
                finish_with(inner, &mut writer);
                return;
            }
            let total = inner
                .bytes_written
                .fetch_add(record.cost(), Ordering::AcqRel)
                + record.cost();
            if total >= inner.max_bytes {
                finish_with(inner, &mut writer);
                return;
            }
        }
    }

    finish_with(inner, &mut writer);
}

fn write_record(writer: &mut impl Write, record: &SpoolRecord) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(record.key.len() as u32)?;
    writer.write_u32::<LittleEndian>(record.value.len() as u32)?;
    writer.write_all(&record.key)?;
    writer.write_all(&record.value)
}

fn finish_with(inner: &Inner, writer: &mut BufWriter<fs::File>) {
    let _ = writer.flush();
    finish(inner);
}

fn finish(inner: &Inner) {
    inner.bytes_collected.store(0, Ordering::Release);
    inner.running.store(false, Ordering::Release);
}
