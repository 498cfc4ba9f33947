use std::sync::atomic::{AtomicUsize, Ordering};

use crate::stack::Stack;

/// In-memory accumulator of raw training samples.
///
/// Producers (worker threads) push copies of eligible values; the
/// trainer drains the whole reservoir in one exchange. A byte budget
/// provides back-pressure: once `bytes_pending` reaches the limit,
/// pushes are refused until the trainer consumes the batch.
///
/// `bytes_pending` is decremented only by what the trainer actually
/// took, saturating at zero so concurrent pushes during a drain can
/// never underflow it.
pub struct Reservoir {
    samples: Stack<Box<[u8]>>,
    bytes_pending: AtomicUsize,
    limit: usize,
}

impl Reservoir {
    pub fn new(limit: usize) -> Self {
        Self {
            samples: Stack::new(),
            bytes_pending: AtomicUsize::new(0),
            limit,
        }
    }

    /// Copy a sample into the reservoir. Returns false when the byte
    /// budget is exhausted and the sample was dropped.
    pub fn push(&self, data: &[u8]) -> bool {
        if self.bytes_pending.load(Ordering::Relaxed) >= self.limit {
            return false;
        }
        let len = data.len();
        self.samples.push(data.to_vec().into_boxed_slice());
        self.bytes_pending.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Take every pending sample. Order is newest-first, which is fine:
    /// training does not depend on arrival order. Does not touch the
    /// byte counter; the caller reports what it consumed.
    pub fn drain(&self) -> Vec<Box<[u8]>> {
        self.samples.drain().collect()
    }

    /// Return consumed bytes to the budget, saturating at zero.
    pub fn consume(&self, bytes: usize) {
        self.bytes_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(bytes))
            })
            .ok();
    }

    pub fn bytes_pending(&self) -> usize {
        self.bytes_pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_and_drain() {
        let reservoir = Reservoir::new(1024);
        assert!(reservoir.push(b"aaaa"));
        assert!(reservoir.push(b"bbbb"));
        assert_eq!(reservoir.bytes_pending(), 8);

        let batch = reservoir.drain();
        assert_eq!(batch.len(), 2);
        assert_eq!(&*batch[0], b"bbbb");
        assert_eq!(&*batch[1], b"aaaa");

        // Budget is returned explicitly, not by drain.
        assert_eq!(reservoir.bytes_pending(), 8);
        reservoir.consume(8);
        assert_eq!(reservoir.bytes_pending(), 0);
    }

    #[test]
    fn test_back_pressure() {
        let reservoir = Reservoir::new(10);
        assert!(reservoir.push(&[0u8; 10]));
        assert!(!reservoir.push(b"x"), "push over the limit must refuse");
        reservoir.consume(10);
        assert!(reservoir.push(b"x"));
    }

    #[test]
    fn test_consume_saturates() {
        let reservoir = Reservoir::new(100);
        reservoir.push(&[0u8; 20]);
        reservoir.consume(50);
        assert_eq!(reservoir.bytes_pending(), 0);
    }

    #[test]
    fn test_concurrent_push_with_draining_consumer() {
        let reservoir = Arc::new(Reservoir::new(usize::MAX));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reservoir = Arc::clone(&reservoir);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    reservoir.push(&[7u8; 16]);
                }
            }));
        }

        let consumer = {
            let reservoir = Arc::clone(&reservoir);
            std::thread::spawn(move || {
                let mut taken = 0usize;
                while taken < 4 * 2000 {
                    let batch = reservoir.drain();
                    let bytes: usize = batch.iter().map(|s| s.len()).sum();
                    taken += batch.len();
                    reservoir.consume(bytes);
                }
                taken
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), 8000);
        assert_eq!(reservoir.bytes_pending(), 0);
        assert!(reservoir.is_empty());
    }
}
