//! Logical timestamps for snapshot and commit ordering.
//!
//! Every snapshot start time and every commit time is drawn from a single
//! [`TimestampOracle`], which makes "committed after my snapshot" a plain
//! integer comparison.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Logical point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a new timestamp with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the timestamp.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the minimum possible timestamp.
    pub fn min() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

/// Oracle handing out strictly increasing timestamps.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct TimestampOracle {
    last_timestamp: Arc<AtomicU64>,
}

impl TimestampOracle {
    /// Creates an oracle whose first generated timestamp is 1.
    pub fn new() -> Self {
        Self::with_start(0)
    }

    /// Creates an oracle that continues after `start`.
    pub fn with_start(start: u64) -> Self {
        Self {
            last_timestamp: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Generates a timestamp strictly greater than every one generated before.
    pub fn generate(&self) -> Timestamp {
        let ts = self.last_timestamp.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp::new(ts)
    }

    /// Gets the most recently issued timestamp without advancing.
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.last_timestamp.load(Ordering::SeqCst))
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = Timestamp::new(100);
        let ts2 = Timestamp::new(200);

        assert!(ts1 < ts2);
        assert_eq!(ts2, Timestamp::new(200));
        assert!(Timestamp::min() < ts1);
        assert_eq!(format!("{}", ts1), "ts100");
    }

    #[test]
    fn test_oracle_monotonic() {
        let oracle = TimestampOracle::new();

        assert_eq!(oracle.current(), Timestamp::min());
        let ts1 = oracle.generate();
        let ts2 = oracle.generate();

        assert_eq!(ts1.value(), 1);
        assert_eq!(ts2.value(), 2);
        assert_eq!(oracle.current(), ts2);
    }

    #[test]
    fn test_oracle_concurrent() {
        let oracle = TimestampOracle::new();
        let num_threads = 8;
        let per_thread = 200;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let oracle = oracle.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..per_thread).map(|_| oracle.generate()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), num_threads * per_thread);
        assert_eq!(oracle.current().value(), (num_threads * per_thread) as u64);
    }
}
