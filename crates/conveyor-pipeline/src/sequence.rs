//! Monotonic counter shared between writers.

use std::sync::Mutex;

/// Strictly increasing counter. The first [`next`](Sequence::next) returns 1.
#[derive(Debug, Default)]
pub struct Sequence {
    value: Mutex<u64>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment, then return the new value.
    pub fn next(&self) -> u64 {
        // A poisoned lock still holds a valid integer.
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *value += 1;
        *value
    }

    /// Latest value handed out, or 0 if `next` was never called.
    pub fn current(&self) -> u64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn starts_at_one() {
        let seq = Sequence::new();
        assert_eq!(seq.current(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.current(), 2);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn concurrent_next_yields_each_value_once() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 250;

        let seq = Arc::new(Sequence::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..PER_THREAD).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "value {value} returned twice");
            }
        }

        let n = THREADS * PER_THREAD;
        assert_eq!(seen, (1..=n).collect::<BTreeSet<_>>());
        assert_eq!(seq.current(), n);
    }
}
