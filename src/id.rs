//! Identifier generation for process chains and output paths.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of unique identifiers, monotonic per generator instance.
///
/// One generator is shared by a compiler for both process-chain ids and
/// output file names; tests substitute a deterministic implementation.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// UUIDv7-based generator. Ids embed a millisecond timestamp, so they sort by
/// creation time across restarts.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeOrderedIdGenerator;

impl IdGenerator for TimeOrderedIdGenerator {
    fn next_id(&self) -> String {
        Uuid::now_v7().simple().to_string()
    }
}

/// Counter-backed generator producing `0000`, `0001`, … for reproducible
/// process-chain ids and output paths in tests.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        format!("{:04}", self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_generator_counts_up() {
        let generator = SequentialIdGenerator::new();
        assert_eq!(generator.next_id(), "0000");
        assert_eq!(generator.next_id(), "0001");
    }

    #[test]
    fn time_ordered_generator_is_unique_and_sortable() {
        let generator = TimeOrderedIdGenerator;
        let first = generator.next_id();
        let second = generator.next_id();
        assert_ne!(first, second);
        assert!(first < second, "v7 ids should sort by creation order");
    }
}
