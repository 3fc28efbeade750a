//! Cache entries and the key-indexed table that owns them.
//!
//! Entries live in a generational arena: external handles hold arena
//! indices, and the generation check turns any use of a stale index into a
//! clean miss instead of touching a recycled slot. A key-to-indices map on
//! the side answers join lookups; uncacheable entries (POST results) are
//! kept out of that map so nothing can ever join them.

use std::time::Instant;

use generational_arena::{Arena, Index};
use rustc_hash::FxHashMap;
use url::Url;

use crate::cache::EventCallback;
use crate::content::{Content, ContentStatus};
use crate::error::ContentErrorKind;
use crate::fetch::FetchId;
use crate::key::{CacheKey, RetrieveFlags};

pub(crate) type EntryIdx = Index;
pub(crate) type HandleIdx = Index;

/// Fixed bookkeeping cost charged per entry on top of its content.
pub(crate) const ENTRY_OVERHEAD: usize = 256;

/// Registration record behind one public handle.
pub(crate) struct HandleRecord {
  /// Entry this handle is attached to.
  pub entry: EntryIdx,
  /// Current event callback. Swapped wholesale by `replace_callback`.
  pub callback: EventCallback,
  /// Set once `abort` has been called, making later aborts no-ops.
  pub abort_requested: bool,
}

/// Headers held back while type sniffing waits for body bytes.
#[derive(Debug, Clone)]
pub(crate) struct PendingHeaders {
  pub mime: Option<String>,
  pub charset: Option<String>,
}

/// One cached retrieval: key, fetch state, content and its users.
pub(crate) struct CacheEntry {
  pub key: CacheKey,
  pub flags: RetrieveFlags,
  /// URL the bytes actually come from; diverges from the key after
  /// redirects.
  pub current_url: Url,
  /// Referrer from the originating retrieval, kept for refetches when
  /// sharers of exclusive content are split onto their own entries.
  pub referrer: Option<Url>,
  pub content: Option<Content>,
  /// Terminal failure. Also covers failures before a content object
  /// existed, and is replayed to late joiners of a failed entry.
  pub failed: Option<ContentErrorKind>,
  /// In-flight low-level fetch, while one is owned by this entry.
  pub fetch: Option<FetchId>,
  /// Headers awaiting the first data chunk for sniffing.
  pub pending: Option<PendingHeaders>,
  /// Expected body length, from headers.
  pub length_hint: Option<u64>,
  /// Attached handles in registration order. Dispatch snapshots this.
  pub users: Vec<HandleIdx>,
  /// POST results are never indexed and never joined.
  pub uncacheable: bool,
  /// Superseded; lookups skip it, existing users are unaffected.
  pub invalidated: bool,
  /// Resolved to a kind that cannot serve more than one user.
  pub no_share: bool,
  /// Fetch ownership moved to the download machinery.
  pub handed_off: bool,
  /// Depth of event dispatches currently walking this entry's user list.
  pub dispatching: u32,
  /// Tie-breaker for eviction ordering between entries idle equally long.
  pub created_seq: u64,
  /// Last time a handle was attached or released. Eviction orders idle
  /// entries by this, oldest first.
  pub last_access: Instant,
}

impl CacheEntry {
  fn new(
    key: CacheKey,
    flags: RetrieveFlags,
    uncacheable: bool,
    created_seq: u64,
    now: Instant,
  ) -> Self {
    let current_url = key.url().clone();
    Self {
      key,
      flags,
      current_url,
      referrer: None,
      content: None,
      failed: None,
      fetch: None,
      pending: None,
      length_hint: None,
      users: Vec::new(),
      uncacheable,
      invalidated: false,
      no_share: false,
      handed_off: false,
      dispatching: 0,
      created_seq,
      last_access: now,
    }
  }

  /// Effective status: a recorded failure dominates, otherwise the content
  /// status, otherwise `Loading` (fetch under way, type not yet known).
  pub fn status(&self) -> ContentStatus {
    if self.failed.is_some() {
      ContentStatus::Error
    } else {
      match &self.content {
        Some(content) => content.status(),
        None => ContentStatus::Loading,
      }
    }
  }

  /// Whether a new retrieval may attach to this entry.
  pub fn joinable(&self) -> bool {
    !self.uncacheable
      && !self.invalidated
      && !self.no_share
      && !self.handed_off
      && self.status() != ContentStatus::Error
  }

  pub fn is_idle(&self) -> bool {
    self.users.is_empty()
  }

  pub fn touch(&mut self, now: Instant) {
    self.last_access = now;
  }

  /// Estimated resident bytes for size accounting.
  pub fn size_estimate(&self) -> usize {
    let content = self
      .content
      .as_ref()
      .map(Content::size_estimate)
      .unwrap_or(0);
    content + ENTRY_OVERHEAD
  }
}

/// Arena of entries plus the key index used for join lookups.
pub(crate) struct EntryTable {
  arena: Arena<CacheEntry>,
  by_key: FxHashMap<CacheKey, Vec<EntryIdx>>,
  next_seq: u64,
}

impl EntryTable {
  pub fn new() -> Self {
    Self {
      arena: Arena::new(),
      by_key: FxHashMap::default(),
      next_seq: 0,
    }
  }

  /// Creates an entry, indexing it for joins unless it is uncacheable.
  pub fn create(
    &mut self,
    key: CacheKey,
    flags: RetrieveFlags,
    uncacheable: bool,
    now: Instant,
  ) -> EntryIdx {
    let seq = self.next_seq;
    self.next_seq += 1;
    let entry = CacheEntry::new(key.clone(), flags, uncacheable, seq, now);
    let idx = self.arena.insert(entry);
    if !uncacheable {
      self.by_key.entry(key).or_default().push(idx);
    }
    idx
  }

  /// Finds an entry a retrieval with this key may join.
  pub fn lookup(&self, key: &CacheKey) -> Option<EntryIdx> {
    self
      .by_key
      .get(key)?
      .iter()
      .copied()
      .find(|&idx| self.arena.get(idx).is_some_and(CacheEntry::joinable))
  }

  /// Marks every indexed entry for `key` as superseded. Attached handles
  /// keep working; only future lookups are affected.
  pub fn invalidate_key(&mut self, key: &CacheKey) {
    let Some(indices) = self.by_key.get(key) else {
      return;
    };
    for &idx in indices {
      if let Some(entry) = self.arena.get_mut(idx) {
        entry.invalidated = true;
      }
    }
  }

  /// Removes an entry and its index references.
  pub fn remove(&mut self, idx: EntryIdx) -> Option<CacheEntry> {
    let entry = self.arena.remove(idx)?;
    if let Some(indices) = self.by_key.get_mut(&entry.key) {
      indices.retain(|&i| i != idx);
      if indices.is_empty() {
        self.by_key.remove(&entry.key);
      }
    }
    Some(entry)
  }

  pub fn get(&self, idx: EntryIdx) -> Option<&CacheEntry> {
    self.arena.get(idx)
  }

  pub fn get_mut(&mut self, idx: EntryIdx) -> Option<&mut CacheEntry> {
    self.arena.get_mut(idx)
  }

  pub fn iter(&self) -> impl Iterator<Item = (EntryIdx, &CacheEntry)> {
    self.arena.iter()
  }

  /// Indices of all resident entries, for passes that mutate while walking.
  pub fn indices(&self) -> Vec<EntryIdx> {
    self.arena.iter().map(|(idx, _)| idx).collect()
  }

  pub fn len(&self) -> usize {
    self.arena.len()
  }

  /// Combined size estimate of everything resident, pinned or not.
  pub fn total_size_estimate(&self) -> u64 {
    self
      .arena
      .iter()
      .map(|(_, entry)| entry.size_estimate() as u64)
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key::{AcceptedTypes, ChildContext};

  fn key(url: &str) -> CacheKey {
    CacheKey::new(url, AcceptedTypes::any(), ChildContext::default()).unwrap()
  }

  #[test]
  fn test_lookup_finds_joinable_entry() {
    let mut table = EntryTable::new();
    let k = key("http://example.com/a");
    let idx = table.create(k.clone(), RetrieveFlags::empty(), false, Instant::now());
    assert_eq!(table.lookup(&k), Some(idx));
  }

  #[test]
  fn test_uncacheable_entries_are_not_indexed() {
    let mut table = EntryTable::new();
    let k = key("http://example.com/post");
    table.create(k.clone(), RetrieveFlags::empty(), true, Instant::now());
    assert_eq!(table.lookup(&k), None);
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn test_invalidated_entries_are_skipped() {
    let mut table = EntryTable::new();
    let k = key("http://example.com/a");
    let first = table.create(k.clone(), RetrieveFlags::empty(), false, Instant::now());
    table.invalidate_key(&k);
    assert_eq!(table.lookup(&k), None);
    // A replacement entry becomes the join target.
    let second = table.create(k.clone(), RetrieveFlags::empty(), false, Instant::now());
    assert_eq!(table.lookup(&k), Some(second));
    assert_ne!(first, second);
  }

  #[test]
  fn test_no_share_and_failed_entries_are_skipped() {
    let mut table = EntryTable::new();
    let k = key("http://example.com/a");
    let idx = table.create(k.clone(), RetrieveFlags::empty(), false, Instant::now());
    table.get_mut(idx).unwrap().no_share = true;
    assert_eq!(table.lookup(&k), None);
    table.get_mut(idx).unwrap().no_share = false;
    table.get_mut(idx).unwrap().failed = Some(ContentErrorKind::NotFound);
    assert_eq!(table.lookup(&k), None);
  }

  #[test]
  fn test_remove_unindexes() {
    let mut table = EntryTable::new();
    let k = key("http://example.com/a");
    let idx = table.create(k.clone(), RetrieveFlags::empty(), false, Instant::now());
    let removed = table.remove(idx).unwrap();
    assert_eq!(removed.key, k);
    assert_eq!(table.lookup(&k), None);
    assert_eq!(table.len(), 0);
    assert!(table.remove(idx).is_none());
  }

  #[test]
  fn test_creation_sequence_is_monotonic() {
    let mut table = EntryTable::new();
    let now = Instant::now();
    let a = table.create(key("http://example.com/a"), RetrieveFlags::empty(), false, now);
    let b = table.create(key("http://example.com/b"), RetrieveFlags::empty(), false, now);
    let seq_a = table.get(a).unwrap().created_seq;
    let seq_b = table.get(b).unwrap().created_seq;
    assert!(seq_b > seq_a);
  }

  #[test]
  fn test_size_estimate_includes_overhead() {
    let mut table = EntryTable::new();
    let idx = table.create(
      key("http://example.com/a"),
      RetrieveFlags::empty(),
      false,
      Instant::now(),
    );
    assert_eq!(
      table.get(idx).unwrap().size_estimate(),
      ENTRY_OVERHEAD
    );
    assert_eq!(table.total_size_estimate(), ENTRY_OVERHEAD as u64);
  }
}
