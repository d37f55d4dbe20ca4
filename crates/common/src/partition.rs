use std::hash::{Hash, Hasher};

use crate::CorrelationId;

/// Maps a correlation id to a partition index in `0..partitions`.
///
/// Both the outbox relay shards and the inbox worker pool use this function,
/// so a given saga always lands on the same lane on both sides and causally
/// related events are never reordered by concurrency.
pub fn partition_for(correlation_id: CorrelationId, partitions: usize) -> usize {
    assert!(partitions > 0, "partition count must be non-zero");
    let mut hasher = std::hash::DefaultHasher::new();
    correlation_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}
