//! Cache eviction.
//!
//! The sweeper runs from [`ContentCache::poll`] on the configured interval,
//! or on demand through [`ContentCache::sweep_now`], and reclaims entries
//! nothing holds a handle to. Three passes, in order:
//!
//! 1. Husks: idle entries that can never be joined again (errored,
//!    uncacheable, invalidated, exclusive to a consumer now gone, or handed
//!    off as downloads) go unconditionally.
//! 2. Age: idle entries unused for longer than `max_idle_age` go, whatever
//!    the cache's size.
//! 3. Size: while estimated occupancy exceeds `target_size + hysteresis`,
//!    idle entries are evicted oldest-first (by last access, then creation
//!    order) until occupancy is back at `target_size` or only pinned
//!    entries remain.
//!
//! Entries with attached handles are never touched, and an entry whose
//! event dispatch is still on the stack is kept, with a warning, for a
//! later sweep. Evicting an entry whose fetch is still running aborts that
//! fetch.

use std::time::Instant;

use tracing::{debug, warn};

use crate::cache::entry::EntryIdx;
use crate::cache::ContentCache;
use crate::content::ContentStatus;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
  /// Entries resident when the sweep began.
  pub examined: usize,
  /// Entries torn down.
  pub evicted: usize,
  /// Estimated bytes those entries accounted for.
  pub bytes_freed: u64,
  /// Idle entries kept because they were released within the reuse grace
  /// window.
  pub spared_by_grace: usize,
}

impl ContentCache {
  /// Runs a sweep immediately, regardless of the sweep interval. No-op on
  /// a finalised cache.
  pub fn sweep_now(&mut self) -> SweepOutcome {
    if self.finalised {
      return SweepOutcome::default();
    }
    let outcome = self.run_sweep(Instant::now());
    self.last_sweep = Instant::now();
    outcome
  }

  pub(crate) fn run_sweep(&mut self, now: Instant) -> SweepOutcome {
    let mut outcome = SweepOutcome {
      examined: self.entries.len(),
      ..SweepOutcome::default()
    };

    // Pass 1: husks. Lookups skip these, so once idle they are pure waste.
    let husks: Vec<EntryIdx> = self
      .entries
      .iter()
      .filter(|(_, entry)| {
        entry.is_idle()
          && (entry.status() == ContentStatus::Error
            || entry.uncacheable
            || entry.invalidated
            || entry.no_share
            || entry.handed_off)
      })
      .map(|(idx, _)| idx)
      .collect();
    for idx in husks {
      self.evict(idx, &mut outcome, "unreachable");
    }

    // Pass 2: age.
    if let Some(max_idle) = self.config.max_idle_age {
      let old: Vec<EntryIdx> = self
        .entries
        .iter()
        .filter(|(_, entry)| {
          entry.is_idle() && now.duration_since(entry.last_access) >= max_idle
        })
        .map(|(idx, _)| idx)
        .collect();
      for idx in old {
        self.evict(idx, &mut outcome, "idle too long");
      }
    }

    // Pass 3: size. Pinned entries count towards occupancy but are never
    // evicted, so the cache can legitimately stay above the limit.
    let limit = self.config.target_size.saturating_add(self.config.hysteresis);
    let mut total = self.entries.total_size_estimate();
    if total > limit {
      let mut candidates: Vec<(Instant, u64, EntryIdx)> = self
        .entries
        .iter()
        .filter(|(_, entry)| entry.is_idle())
        .map(|(idx, entry)| (entry.last_access, entry.created_seq, idx))
        .collect();
      candidates.sort_by_key(|&(last_access, seq, _)| (last_access, seq));
      for (last_access, _, idx) in candidates {
        if total <= self.config.target_size {
          break;
        }
        if now.duration_since(last_access) < self.config.reuse_grace {
          outcome.spared_by_grace += 1;
          continue;
        }
        let freed = self.evict(idx, &mut outcome, "size pressure");
        total = total.saturating_sub(freed);
      }
      if total > limit {
        debug!(
          resident = total,
          limit,
          "cache still above limit, remainder is pinned, busy, or in grace"
        );
      }
    }

    if outcome.evicted > 0 {
      debug!(
        evicted = outcome.evicted,
        bytes = outcome.bytes_freed,
        remaining = self.entries.len(),
        "sweep complete"
      );
    }
    outcome
  }

  /// Tears one entry down and returns the bytes freed, or zero when the
  /// entry had to be spared.
  fn evict(&mut self, idx: EntryIdx, outcome: &mut SweepOutcome, reason: &str) -> u64 {
    let Some(entry) = self.entries.get(idx) else {
      return 0;
    };
    if entry.dispatching > 0 {
      // A dispatch on the stack is still walking this entry's user list;
      // a later sweep reclaims it.
      warn!(url = %entry.key.url(), "entry busy during sweep, deferring eviction");
      return 0;
    }
    let size = entry.size_estimate() as u64;
    debug!(reason = %reason, size, "evicting entry");
    self.teardown_entry(idx);
    outcome.evicted += 1;
    outcome.bytes_freed += size;
    size
  }
}
