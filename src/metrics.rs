//! Cache activity counters.

/// Counters describing cache activity since construction, plus a snapshot of
/// current occupancy. Obtained from
/// [`ContentCache::metrics`](crate::cache::ContentCache::metrics); cheap to
/// copy around.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
  /// Retrievals served by joining an existing entry.
  pub hits: u64,
  /// Retrievals that created a new entry.
  pub misses: u64,
  /// Low-level fetches started on behalf of entries.
  pub fetches_started: u64,
  /// Events delivered to handle callbacks, replays included.
  pub events_delivered: u64,
  /// Entries removed by sweeps or shutdown.
  pub entries_evicted: u64,
  /// Estimated bytes released by evictions.
  pub bytes_evicted: u64,
  /// Entries currently resident. Snapshot, not a running count.
  pub entries: usize,
  /// Estimated bytes currently resident. Snapshot.
  pub size_estimate: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_metrics_start_at_zero() {
    let metrics = CacheMetrics::default();
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.misses, 0);
    assert_eq!(metrics.entries, 0);
  }
}
