//! The high-level content cache.
//!
//! [`ContentCache`] sits between retrieval users (document parsers, layout,
//! UI) and the low-level fetch machinery. Users ask for a URL and get back a
//! [`CacheHandle`]; everything after that arrives as [`CacheEvent`]s on the
//! callback registered with the handle. Identical retrievals share one
//! underlying entry and one fetch, so a page pulling the same stylesheet
//! from forty places costs one network transfer.
//!
//! The cache is single-threaded and cooperative. Nothing progresses and no
//! callback ever runs except under [`ContentCache::poll`], which drives the
//! fetch backend, applies the resulting events to entries, dispatches cache
//! events to handles, and periodically sweeps unused entries.
//!
//! # Example
//!
//! ```
//! use hlcache::fetch::memory::{MemoryBackend, MemoryResource};
//! use hlcache::{callback, ContentCache, Retrieval};
//!
//! let mut backend = MemoryBackend::new();
//! backend.register(
//!   "http://example.com/",
//!   MemoryResource::new("text/html", "<title>Home</title>".as_bytes()),
//! );
//! let mut cache = ContentCache::new(backend);
//! let handle = cache
//!   .retrieve(
//!     Retrieval::new("http://example.com/"),
//!     callback(|_cache, _handle, event| println!("event: {:?}", event)),
//!   )
//!   .unwrap();
//! for _ in 0..8 {
//!   cache.poll();
//! }
//! assert_eq!(cache.title(handle).unwrap(), Some("Home"));
//! ```

use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use generational_arena::Arena;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::entry::{EntryIdx, EntryTable, HandleIdx, HandleRecord, PendingHeaders};
use crate::content::{self, Content, ContentKind, ContentStatus};
use crate::error::{ContentErrorKind, Error, Result};
use crate::event::{CacheEvent, DownloadHandoff, RedrawRect};
use crate::fetch::{
  FetchBackend, FetchEvent, FetchId, FetchQuery, FetchRequest, PostData, QueryResponse,
};
use crate::key::{AcceptedTypes, CacheKey, ChildContext, RetrieveFlags};
use crate::metrics::CacheMetrics;

pub(crate) mod entry;
mod sweep;

pub use sweep::SweepOutcome;

// ============================================================================
// Callback types and handles
// ============================================================================

/// Callback invoked for every event delivered to a handle.
///
/// The callback receives the cache itself, so it may retrieve, release,
/// clone or even finalise from inside event handling; dispatch re-checks
/// handle liveness around every invocation.
pub type EventCallback = Rc<dyn Fn(&mut ContentCache, CacheHandle, &CacheEvent)>;

/// Handler consulted when a fetch suspends on an embedder decision
/// (authentication, certificate trust). Without one, all queries are
/// denied.
pub type QueryHandler = Rc<dyn Fn(&FetchQuery) -> QueryResponse>;

/// Sink receiving raw fetch events for fetches that were handed off as
/// downloads.
pub type DownloadHandler = Rc<dyn Fn(FetchId, &FetchEvent)>;

/// Wraps a closure as an [`EventCallback`].
pub fn callback(
  f: impl Fn(&mut ContentCache, CacheHandle, &CacheEvent) + 'static,
) -> EventCallback {
  Rc::new(f)
}

/// A user's registration against a cache entry.
///
/// Handles are small copyable tokens backed by a generational slot, so a
/// retained copy of a released handle stays safe: every operation on it
/// returns `StaleHandle` instead of touching whatever reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle {
  idx: HandleIdx,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a [`ContentCache`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use hlcache::CacheConfig;
///
/// let config = CacheConfig::default()
///   .with_target_size(2 * 1024 * 1024)
///   .with_sweep_interval(Duration::from_millis(250));
/// ```
#[derive(Clone)]
pub struct CacheConfig {
  /// Size the sweeper shrinks the cache back to once the hysteresis band
  /// is exceeded.
  pub target_size: u64,
  /// Slack above `target_size` before a sweep starts evicting for size.
  /// Keeps entries from thrashing right at the boundary.
  pub hysteresis: u64,
  /// Minimum time between opportunistic sweeps run from `poll`.
  pub sweep_interval: Duration,
  /// Unused entries idle longer than this are evicted regardless of size
  /// pressure. `None` disables age-based eviction.
  pub max_idle_age: Option<Duration>,
  /// Entries released more recently than this are exempt from size
  /// eviction, protecting just-released entries likely to be re-requested.
  pub reuse_grace: Duration,
  /// Answers fetch queries. `None` denies everything.
  pub query_handler: Option<QueryHandler>,
  /// Receives raw fetch events for handed-off downloads. `None` disables
  /// download conversion; unacceptable content fails instead.
  pub download_handler: Option<DownloadHandler>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      target_size: 8 * 1024 * 1024,
      hysteresis: 1024 * 1024,
      sweep_interval: Duration::from_secs(1),
      max_idle_age: Some(Duration::from_secs(60)),
      reuse_grace: Duration::ZERO,
      query_handler: None,
      download_handler: None,
    }
  }
}

impl CacheConfig {
  pub fn with_target_size(mut self, bytes: u64) -> Self {
    self.target_size = bytes;
    self
  }

  pub fn with_hysteresis(mut self, bytes: u64) -> Self {
    self.hysteresis = bytes;
    self
  }

  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval = interval;
    self
  }

  pub fn with_max_idle_age(mut self, age: Option<Duration>) -> Self {
    self.max_idle_age = age;
    self
  }

  pub fn with_reuse_grace(mut self, grace: Duration) -> Self {
    self.reuse_grace = grace;
    self
  }

  pub fn with_query_handler(
    mut self,
    handler: impl Fn(&FetchQuery) -> QueryResponse + 'static,
  ) -> Self {
    self.query_handler = Some(Rc::new(handler));
    self
  }

  pub fn with_download_handler(
    mut self,
    handler: impl Fn(FetchId, &FetchEvent) + 'static,
  ) -> Self {
    self.download_handler = Some(Rc::new(handler));
    self
  }
}

impl fmt::Debug for CacheConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheConfig")
      .field("target_size", &self.target_size)
      .field("hysteresis", &self.hysteresis)
      .field("sweep_interval", &self.sweep_interval)
      .field("max_idle_age", &self.max_idle_age)
      .field("reuse_grace", &self.reuse_grace)
      .field("query_handler", &self.query_handler.is_some())
      .field("download_handler", &self.download_handler.is_some())
      .finish()
  }
}

// ============================================================================
// Retrieval requests
// ============================================================================

/// Everything describing one retrieval except its callback.
///
/// # Example
///
/// ```
/// use hlcache::{AcceptedTypes, Retrieval, RetrieveFlags};
///
/// let request = Retrieval::new("http://example.com/logo.png")
///   .with_accept(AcceptedTypes::IMAGE)
///   .with_flags(RetrieveFlags::MAY_DOWNLOAD)
///   .with_referrer("http://example.com/");
/// ```
#[derive(Debug, Clone)]
pub struct Retrieval {
  url: String,
  flags: RetrieveFlags,
  accept: AcceptedTypes,
  context: ChildContext,
  referrer: Option<String>,
  post: Option<PostData>,
}

impl Retrieval {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      flags: RetrieveFlags::empty(),
      accept: AcceptedTypes::any(),
      context: ChildContext::default(),
      referrer: None,
      post: None,
    }
  }

  pub fn with_flags(mut self, flags: RetrieveFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn with_accept(mut self, accept: AcceptedTypes) -> Self {
    self.accept = accept;
    self
  }

  pub fn with_context(mut self, context: ChildContext) -> Self {
    self.context = context;
    self
  }

  pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
    self.referrer = Some(referrer.into());
    self
  }

  /// Makes this a POST. POST results are never shared and never joined.
  pub fn with_post(mut self, post: PostData) -> Self {
    self.post = Some(post);
    self
  }
}

// ============================================================================
// The cache
// ============================================================================

/// High-level content cache over a [`FetchBackend`].
///
/// Owns every cache entry, every handle registration and the backend
/// itself. All methods take `&mut self`; the cache is designed for a
/// single-threaded event loop that calls [`poll`](Self::poll) regularly.
pub struct ContentCache {
  config: CacheConfig,
  backend: Box<dyn FetchBackend>,
  entries: EntryTable,
  handles: Arena<HandleRecord>,
  fetch_to_entry: FxHashMap<FetchId, EntryIdx>,
  downloads: FxHashSet<FetchId>,
  last_sweep: Instant,
  polling: bool,
  finalised: bool,
  counters: CacheMetrics,
}

impl ContentCache {
  /// Creates a cache with default configuration.
  pub fn new(backend: impl FetchBackend + 'static) -> Self {
    Self::with_config(backend, CacheConfig::default())
  }

  pub fn with_config(backend: impl FetchBackend + 'static, config: CacheConfig) -> Self {
    Self {
      config,
      backend: Box::new(backend),
      entries: EntryTable::new(),
      handles: Arena::new(),
      fetch_to_entry: FxHashMap::default(),
      downloads: FxHashSet::default(),
      last_sweep: Instant::now(),
      polling: false,
      finalised: false,
      counters: CacheMetrics::default(),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  // ==========================================================================
  // Retrieval
  // ==========================================================================

  /// Starts (or joins) a retrieval and registers `callback` for its events.
  ///
  /// An existing entry with an equal key is joined without any fetch; a
  /// handle joining late has the transitions it missed replayed before this
  /// call returns. A miss starts one low-level fetch. Errors out with
  /// `BadParameter` for unusable URLs and `NoFetchHandler` for unknown
  /// schemes, in both cases without creating an entry or handle.
  pub fn retrieve(&mut self, request: Retrieval, callback: EventCallback) -> Result<CacheHandle> {
    self.ensure_live()?;
    let key = CacheKey::new(&request.url, request.accept, request.context.clone())?;
    let referrer = match &request.referrer {
      Some(raw) => Some(crate::key::normalize_url(raw)?),
      None => None,
    };
    let now = Instant::now();
    let uncacheable = request.post.is_some();
    let force = request.flags.contains(RetrieveFlags::FORCE_FETCH);

    if !uncacheable && !force {
      if let Some(idx) = self.entries.lookup(&key) {
        trace!(url = %key.url(), "cache hit");
        self.counters.hits += 1;
        let handle = self.attach(idx, callback, now);
        self.catch_up(handle);
        return Ok(handle);
      }
    }
    if force {
      // A forced refetch supersedes whatever is cached under this key.
      self.entries.invalidate_key(&key);
    }
    self.counters.misses += 1;

    // Start the fetch before creating any state, so scheme and parameter
    // failures leave the cache untouched.
    let mut fetch_request = FetchRequest::new(key.url().clone());
    if let Some(referrer) = referrer.clone() {
      fetch_request = fetch_request.with_referrer(referrer);
    }
    if let Some(post) = request.post.clone() {
      fetch_request = fetch_request.with_post(post);
    }
    let fetch = self.backend.start(fetch_request)?;
    self.counters.fetches_started += 1;
    debug!(url = %key.url(), fetch = fetch.raw(), "fetch started");

    let idx = self.entries.create(key, request.flags, uncacheable, now);
    if let Some(entry) = self.entries.get_mut(idx) {
      entry.fetch = Some(fetch);
      entry.referrer = referrer;
    }
    self.fetch_to_entry.insert(fetch, idx);
    Ok(self.attach(idx, callback, now))
  }

  /// Deregisters a handle. The entry stays resident for later joins; with
  /// no handles left it becomes an eviction candidate for the sweeper,
  /// which also aborts its fetch if one is still running. A second release
  /// of the same handle returns `StaleHandle` and changes nothing.
  pub fn release(&mut self, handle: CacheHandle) -> Result<()> {
    let record = self.handles.remove(handle.idx).ok_or(Error::StaleHandle)?;
    let now = Instant::now();
    if let Some(entry) = self.entries.get_mut(record.entry) {
      entry.users.retain(|&hid| hid != handle.idx);
      entry.touch(now);
      if entry.is_idle() {
        trace!(url = %entry.key.url(), "entry idle");
      }
    }
    Ok(())
  }

  /// Requests cancellation of the owning entry's fetch. Only effective
  /// while the entry is still `Loading`: every attached handle then
  /// receives a single `Aborted` error event. From `Ready` onward this is
  /// a no-op, as is a repeated abort through the same handle.
  pub fn abort(&mut self, handle: CacheHandle) -> Result<()> {
    let record = self.handles.get_mut(handle.idx).ok_or(Error::StaleHandle)?;
    if record.abort_requested {
      return Ok(());
    }
    record.abort_requested = true;
    let idx = record.entry;
    if self.entries.get(idx).map(|e| e.status()) == Some(ContentStatus::Loading) {
      self.fail_entry(idx, ContentErrorKind::Aborted);
    }
    Ok(())
  }

  /// Registers a second handle against the entry behind `handle`, sharing
  /// its callback, and replays the entry's progress so far to the new
  /// handle. Fails without side effects when the content cannot serve two
  /// consumers or cannot replay its state.
  pub fn clone_handle(&mut self, handle: CacheHandle) -> Result<CacheHandle> {
    self.ensure_live()?;
    let record = self.handles.get(handle.idx).ok_or(Error::StaleHandle)?;
    let idx = record.entry;
    let cb = Rc::clone(&record.callback);
    let entry = self.entries.get(idx).ok_or(Error::StaleHandle)?;
    if entry.no_share {
      return Err(Error::CloneFailed(
        "content is exclusive to its first consumer".to_string(),
      ));
    }
    if let Some(content) = &entry.content {
      if !content.kind().replayable() {
        return Err(Error::CloneFailed(format!(
          "{} content cannot replay its state",
          content.kind()
        )));
      }
    }
    let clone = self.attach(idx, cb, Instant::now());
    self.catch_up(clone);
    Ok(clone)
  }

  /// Atomically swaps the callback for a handle. Events dispatched after
  /// this call go to the new callback; there is no window in which events
  /// are dropped.
  pub fn replace_callback(&mut self, handle: CacheHandle, callback: EventCallback) -> Result<()> {
    let record = self.handles.get_mut(handle.idx).ok_or(Error::StaleHandle)?;
    record.callback = callback;
    Ok(())
  }

  /// Marks the entry behind `handle` as superseded: future retrievals of
  /// its key fetch fresh. Handles already attached, this one included,
  /// keep working against the current content.
  pub fn invalidate(&mut self, handle: CacheHandle) -> Result<()> {
    let record = self.handles.get(handle.idx).ok_or(Error::StaleHandle)?;
    let idx = record.entry;
    if let Some(entry) = self.entries.get_mut(idx) {
      entry.invalidated = true;
      debug!(url = %entry.key.url(), "entry invalidated");
    }
    Ok(())
  }

  // ==========================================================================
  // Driving
  // ==========================================================================

  /// Makes progress: drives the backend, applies fetch events to entries,
  /// dispatches cache events to handles, and runs a sweep when one is due.
  /// All callbacks run under this call. Reentrant calls (a callback
  /// calling `poll`) are no-ops, as is polling a finalised cache.
  pub fn poll(&mut self) {
    if self.finalised || self.polling {
      return;
    }
    self.polling = true;
    let mut events: Vec<(FetchId, FetchEvent)> = Vec::new();
    self.backend.poll(&mut |id, event| events.push((id, event)));
    for (id, event) in events {
      if self.finalised {
        break;
      }
      self.route_fetch_event(id, event);
    }
    if !self.finalised && self.last_sweep.elapsed() >= self.config.sweep_interval {
      self.run_sweep(Instant::now());
      self.last_sweep = Instant::now();
    }
    self.polling = false;
  }

  /// Shuts the cache down: aborts every in-flight fetch (handed-off
  /// downloads included), tears down all entries and deregisters all
  /// handles. Idempotent. After this, operations that would create new
  /// state return `Finalised`.
  pub fn finalise(&mut self) {
    if self.finalised {
      return;
    }
    self.finalised = true;
    debug!(entries = self.entries.len(), "cache finalising");
    for idx in self.entries.indices() {
      let busy = self.entries.get(idx).map(|e| e.dispatching > 0).unwrap_or(false);
      if busy {
        // Mid-dispatch entries are reaped when their dispatch unwinds.
        warn!("entry busy during finalise, deferring teardown");
        continue;
      }
      self.teardown_entry(idx);
    }
    self.handles.clear();
    let downloads: Vec<FetchId> = self.downloads.drain().collect();
    for id in downloads {
      self.backend.abort(id);
    }
    self.fetch_to_entry.clear();
  }

  // ==========================================================================
  // Accessors
  // ==========================================================================

  /// Current status of the entry behind a handle.
  pub fn status(&self, handle: CacheHandle) -> Result<ContentStatus> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .map(|entry| entry.status())
        .unwrap_or(ContentStatus::Error),
    )
  }

  /// Resolved content kind, once headers or sniffing have determined it.
  pub fn content_kind(&self, handle: CacheHandle) -> Result<Option<ContentKind>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .map(Content::kind),
    )
  }

  /// Resolved MIME type.
  pub fn mime_type(&self, handle: CacheHandle) -> Result<Option<&str>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .map(Content::mime),
    )
  }

  /// Character set, from the MIME parameter, the transport, or the child
  /// context fallback.
  pub fn charset(&self, handle: CacheHandle) -> Result<Option<&str>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .and_then(Content::charset),
    )
  }

  /// Document title, for HTML content that declared one.
  pub fn title(&self, handle: CacheHandle) -> Result<Option<&str>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .and_then(Content::title),
    )
  }

  /// Intrinsic dimensions, for finished raster images.
  pub fn dimensions(&self, handle: CacheHandle) -> Result<Option<(u32, u32)>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .and_then(Content::dimensions),
    )
  }

  /// Raw source bytes received so far. `None` before the type is known.
  pub fn source(&self, handle: CacheHandle) -> Result<Option<&[u8]>> {
    let idx = self.entry_of(handle)?;
    Ok(
      self
        .entries
        .get(idx)
        .and_then(|entry| entry.content.as_ref())
        .map(Content::source),
    )
  }

  /// The URL the entry's bytes come from, tracking redirects.
  pub fn url(&self, handle: CacheHandle) -> Result<&Url> {
    let idx = self.entry_of(handle)?;
    self
      .entries
      .get(idx)
      .map(|entry| &entry.current_url)
      .ok_or(Error::StaleHandle)
  }

  /// Estimated resident bytes for the entry behind `handle`, counted the
  /// way the sweeper counts them.
  pub fn size_estimate(&self, handle: CacheHandle) -> Result<usize> {
    let idx = self.entry_of(handle)?;
    self
      .entries
      .get(idx)
      .map(|entry| entry.size_estimate())
      .ok_or(Error::StaleHandle)
  }

  /// Number of entries currently resident.
  pub fn entry_count(&self) -> usize {
    self.entries.len()
  }

  /// Activity counters plus an occupancy snapshot.
  pub fn metrics(&self) -> CacheMetrics {
    let mut metrics = self.counters;
    metrics.entries = self.entries.len();
    metrics.size_estimate = self.entries.total_size_estimate();
    metrics
  }

  pub fn is_finalised(&self) -> bool {
    self.finalised
  }

  // ==========================================================================
  // Handle plumbing
  // ==========================================================================

  fn ensure_live(&self) -> Result<()> {
    if self.finalised {
      Err(Error::Finalised)
    } else {
      Ok(())
    }
  }

  fn entry_of(&self, handle: CacheHandle) -> Result<EntryIdx> {
    self
      .handles
      .get(handle.idx)
      .map(|record| record.entry)
      .ok_or(Error::StaleHandle)
  }

  fn attach(&mut self, idx: EntryIdx, callback: EventCallback, now: Instant) -> CacheHandle {
    let hid = self.handles.insert(HandleRecord {
      entry: idx,
      callback,
      abort_requested: false,
    });
    if let Some(entry) = self.entries.get_mut(idx) {
      entry.users.push(hid);
      entry.touch(now);
    }
    CacheHandle { idx: hid }
  }

  /// Replays the transitions a late joiner missed, to that handle only.
  /// The replayed sequence matches what an original consumer saw:
  /// `Loading`, then `Ready`, then `Done`, or the terminal error.
  fn catch_up(&mut self, handle: CacheHandle) {
    let Some(record) = self.handles.get(handle.idx) else {
      return;
    };
    let Some(entry) = self.entries.get(record.entry) else {
      return;
    };
    let mut replay: Vec<CacheEvent> = Vec::new();
    if entry.content.is_some() {
      replay.push(CacheEvent::Loading);
    }
    match entry.status() {
      ContentStatus::Loading => {}
      ContentStatus::Ready => replay.push(CacheEvent::Ready),
      ContentStatus::Done => {
        replay.push(CacheEvent::Ready);
        replay.push(CacheEvent::Done);
      }
      ContentStatus::Error => {
        if let Some(kind) = &entry.failed {
          replay.push(CacheEvent::error(kind.clone()));
        }
      }
    }
    for event in replay {
      if self.handles.get(handle.idx).is_none() {
        // The callback released the handle mid-replay.
        break;
      }
      self.deliver(handle, &event);
    }
  }

  /// Delivers one event to one handle, if it is still registered.
  fn deliver(&mut self, handle: CacheHandle, event: &CacheEvent) {
    let Some(record) = self.handles.get(handle.idx) else {
      return;
    };
    let cb = Rc::clone(&record.callback);
    self.counters.events_delivered += 1;
    cb(self, handle, event);
  }

  /// Dispatches one event to every handle attached to an entry.
  ///
  /// The user list is snapshotted first, then each handle is re-checked
  /// for liveness immediately before its callback runs, so callbacks may
  /// freely release, clone, retrieve or replace callbacks mid-dispatch.
  /// The callback looked up at invocation time is the current one, which
  /// is what makes `replace_callback` gap-free.
  fn dispatch(&mut self, idx: EntryIdx, event: &CacheEvent) {
    let users = match self.entries.get_mut(idx) {
      Some(entry) => {
        entry.dispatching += 1;
        entry.users.clone()
      }
      None => return,
    };
    for hid in users {
      if self.finalised {
        break;
      }
      let still_attached = self
        .handles
        .get(hid)
        .map(|record| record.entry == idx)
        .unwrap_or(false);
      if !still_attached {
        continue;
      }
      self.deliver(CacheHandle { idx: hid }, event);
    }
    if let Some(entry) = self.entries.get_mut(idx) {
      entry.dispatching = entry.dispatching.saturating_sub(1);
    }
    if self.finalised {
      self.reap_after_finalise(idx);
    }
  }

  fn reap_after_finalise(&mut self, idx: EntryIdx) {
    let reapable = self
      .entries
      .get(idx)
      .map(|entry| entry.dispatching == 0)
      .unwrap_or(false);
    if reapable {
      self.teardown_entry(idx);
    }
  }

  // ==========================================================================
  // Fetch event application
  // ==========================================================================

  fn route_fetch_event(&mut self, id: FetchId, event: FetchEvent) {
    if self.downloads.contains(&id) {
      let terminal = matches!(event, FetchEvent::Finished | FetchEvent::Failed { .. });
      if let Some(handler) = self.config.download_handler.clone() {
        handler(id, &event);
      }
      if terminal {
        self.downloads.remove(&id);
      }
      return;
    }
    let Some(&idx) = self.fetch_to_entry.get(&id) else {
      trace!(fetch = id.raw(), "event for unknown fetch dropped");
      return;
    };
    self.apply_fetch_event(idx, id, event);
  }

  fn apply_fetch_event(&mut self, idx: EntryIdx, id: FetchId, event: FetchEvent) {
    match event {
      FetchEvent::Headers {
        mime,
        charset,
        length,
      } => {
        let (terminal, sniff) = match self.entries.get_mut(idx) {
          Some(entry) => {
            entry.length_hint = length;
            (
              entry.status().is_terminal(),
              entry.flags.contains(RetrieveFlags::SNIFF_TYPE),
            )
          }
          None => return,
        };
        if terminal {
          return;
        }
        if needs_body_sniff(mime.as_deref(), sniff) {
          if let Some(entry) = self.entries.get_mut(idx) {
            entry.pending = Some(PendingHeaders { mime, charset });
          }
        } else {
          self.resolve_type(idx, mime, charset, &[]);
        }
      }
      FetchEvent::Data(chunk) => {
        let needs_resolve = {
          let Some(entry) = self.entries.get(idx) else {
            return;
          };
          if entry.status().is_terminal() {
            return;
          }
          entry.content.is_none()
        };
        if needs_resolve {
          let pending = self.entries.get_mut(idx).and_then(|e| e.pending.take());
          let (mime, charset) = match pending {
            Some(p) => (p.mime, p.charset),
            None => (None, None),
          };
          self.resolve_type(idx, mime, charset, &chunk);
        } else {
          self.append_body(idx, &chunk);
        }
      }
      FetchEvent::Redirect { to } => {
        let from = match self.entries.get_mut(idx) {
          Some(entry) if !entry.status().is_terminal() => {
            let from = entry.current_url.clone();
            entry.current_url = to.clone();
            from
          }
          _ => return,
        };
        debug!(from = %from, to = %to, "fetch redirected");
        self.dispatch(idx, &CacheEvent::Redirect { from, to });
      }
      FetchEvent::Query(query) => {
        let response = match &self.config.query_handler {
          Some(handler) => handler(&query),
          None => {
            debug!("fetch query with no handler installed, denying");
            QueryResponse::Deny
          }
        };
        self.backend.answer_query(id, response);
      }
      FetchEvent::Finished => {
        let needs_resolve = self
          .entries
          .get(idx)
          .map(|e| !e.status().is_terminal() && e.content.is_none())
          .unwrap_or(false);
        if needs_resolve {
          // Empty or tiny bodies can finish before sniffing had a chunk.
          let pending = self.entries.get_mut(idx).and_then(|e| e.pending.take());
          let (mime, charset) = match pending {
            Some(p) => (p.mime, p.charset),
            None => (None, None),
          };
          self.resolve_type(idx, mime, charset, &[]);
        }
        if self.downloads.contains(&id) {
          // Resolution just handed this fetch to the download side; the
          // terminal event belongs to it as well.
          self.route_fetch_event(id, FetchEvent::Finished);
          return;
        }
        self.fetch_to_entry.remove(&id);
        if let Some(entry) = self.entries.get_mut(idx) {
          if entry.fetch == Some(id) {
            entry.fetch = None;
          }
        }
        let finish = {
          let Some(entry) = self.entries.get_mut(idx) else {
            return;
          };
          if entry.status().is_terminal() {
            return;
          }
          match entry.content.as_mut() {
            Some(content) => content.finish(),
            None => return,
          }
        };
        match finish {
          Err(kind) => self.fail_entry(idx, kind),
          Ok(()) => {
            self.advance_entry(idx, ContentStatus::Ready);
            self.advance_entry(idx, ContentStatus::Done);
          }
        }
      }
      FetchEvent::Failed { failure } => {
        self.fetch_to_entry.remove(&id);
        if let Some(entry) = self.entries.get_mut(idx) {
          if entry.fetch == Some(id) {
            entry.fetch = None;
          }
        }
        self.fail_entry(idx, failure.into());
      }
    }
  }

  /// Fixes the entry's content type from declared headers and/or leading
  /// body bytes, then runs the accept check, exclusive-kind splitting, and
  /// content creation. `first_data` is the chunk that triggered sniffing
  /// (empty when resolution comes straight from headers).
  fn resolve_type(
    &mut self,
    idx: EntryIdx,
    declared: Option<String>,
    transport_charset: Option<String>,
    first_data: &[u8],
  ) {
    let (sniff, accept, may_download, context_charset) = {
      let Some(entry) = self.entries.get(idx) else {
        return;
      };
      (
        entry.flags.contains(RetrieveFlags::SNIFF_TYPE),
        entry.key.accept(),
        entry.flags.contains(RetrieveFlags::MAY_DOWNLOAD),
        entry.key.context().charset.clone(),
      )
    };
    let mime = content::resolve_mime(declared.as_deref(), first_data, sniff);
    let kind = ContentKind::from_mime(&mime);
    trace!(mime = %mime, kind = %kind, "content type resolved");

    if !accept.contains(kind.accept_bit()) {
      if may_download && self.config.download_handler.is_some() {
        self.convert_to_download(idx, mime, first_data);
      } else {
        self.fail_entry(idx, ContentErrorKind::NotAcceptable(mime));
      }
      return;
    }

    if !kind.shareable() {
      self.split_exclusive(idx);
    }

    let charset = declared
      .as_deref()
      .and_then(content::mime_charset)
      .or(transport_charset)
      .or(context_charset);
    {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      entry.no_share = !kind.shareable();
      entry.content = Some(Content::new(
        kind,
        entry.current_url.clone(),
        mime,
        charset,
      ));
    }
    self.dispatch(idx, &CacheEvent::Loading);
    if !first_data.is_empty() {
      self.append_body(idx, first_data);
    }
  }

  /// Appends body bytes to the entry's content and emits the matching
  /// progress event: `Status` while loading, `Ready` when a progressive
  /// kind first becomes usable, `Redraw` for updates after that.
  fn append_body(&mut self, idx: EntryIdx, chunk: &[u8]) {
    let (status, progressive, received, hint) = {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      let Some(content) = entry.content.as_mut() else {
        return;
      };
      content.append_data(chunk);
      (
        content.status(),
        content.kind().ready_on_partial(),
        content.source().len(),
        entry.length_hint,
      )
    };
    if status.is_terminal() {
      return;
    }
    if progressive && status == ContentStatus::Loading {
      self.advance_entry(idx, ContentStatus::Ready);
    } else if status == ContentStatus::Loading {
      let text = progress_text(received, hint);
      self.dispatch(idx, &CacheEvent::Status { text });
    } else {
      self.dispatch(
        idx,
        &CacheEvent::Redraw {
          rect: RedrawRect::everything(),
        },
      );
    }
  }

  /// Advances the entry's content along the status machine and dispatches
  /// the matching event. Illegal advances are ignored, which is what keeps
  /// `Loading -> Ready -> Done` emission idempotent for progressive
  /// content that turned `Ready` early.
  fn advance_entry(&mut self, idx: EntryIdx, to: ContentStatus) {
    {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      let Some(content) = entry.content.as_mut() else {
        return;
      };
      if !content.status().can_advance_to(to) {
        return;
      }
      content.advance(to);
    }
    let event = match to {
      ContentStatus::Ready => CacheEvent::Ready,
      ContentStatus::Done => CacheEvent::Done,
      _ => return,
    };
    self.dispatch(idx, &event);
  }

  /// Fails an entry: records the cause, aborts any in-flight fetch, and
  /// dispatches a single `Error` event to every attached handle. Entries
  /// already in a terminal state drop the failure silently, which is what
  /// keeps fetch stragglers and double aborts from producing duplicate
  /// error events.
  fn fail_entry(&mut self, idx: EntryIdx, kind: ContentErrorKind) {
    let fetch = {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      if entry.status().is_terminal() {
        return;
      }
      if let Some(content) = entry.content.as_mut() {
        content.advance(ContentStatus::Error);
      }
      entry.failed = Some(kind.clone());
      entry.pending = None;
      warn!(url = %entry.key.url(), error = %kind, "retrieval failed");
      entry.fetch.take()
    };
    if let Some(fetch) = fetch {
      self.fetch_to_entry.remove(&fetch);
      self.backend.abort(fetch);
    }
    self.dispatch(idx, &CacheEvent::error(kind));
  }

  /// Converts an unacceptable retrieval into a download: the fetch is
  /// handed to the download handler, the first handle gets a `Download`
  /// event and is deregistered, and any other sharers fail with
  /// `NotAcceptable` since a fetch can only be handed over once.
  fn convert_to_download(&mut self, idx: EntryIdx, mime: String, leading: &[u8]) {
    let (fetch, url, first_user) = {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      let Some(fetch) = entry.fetch.take() else {
        return;
      };
      entry.handed_off = true;
      entry.pending = None;
      (fetch, entry.current_url.clone(), entry.users.first().copied())
    };
    self.fetch_to_entry.remove(&fetch);
    self.downloads.insert(fetch);
    debug!(url = %url, fetch = fetch.raw(), mime = %mime, "retrieval converted to download");

    let handoff = DownloadHandoff {
      fetch,
      url,
      mime: mime.clone(),
    };
    if let Some(first) = first_user {
      let handle = CacheHandle { idx: first };
      self.deliver(handle, &CacheEvent::Download { handoff });
      let _ = self.release(handle);
    }
    let has_users = self
      .entries
      .get(idx)
      .map(|entry| !entry.users.is_empty())
      .unwrap_or(false);
    if has_users {
      self.fail_entry(idx, ContentErrorKind::NotAcceptable(mime));
    } else if let Some(entry) = self.entries.get_mut(idx) {
      // No one left to tell; mark the husk reapable.
      entry.failed = Some(ContentErrorKind::NotAcceptable(mime));
    }
    if !leading.is_empty() {
      if let Some(handler) = self.config.download_handler.clone() {
        handler(fetch, &FetchEvent::Data(leading.to_vec()));
      }
    }
  }

  /// Resolving to an exclusive kind with several sharers attached: the
  /// first-registered handle keeps this entry; every later sharer is
  /// migrated onto a fresh entry with its own fetch, replaying the
  /// retrieval it originally asked for.
  fn split_exclusive(&mut self, idx: EntryIdx) {
    let (key, flags, referrer, extras) = {
      let Some(entry) = self.entries.get_mut(idx) else {
        return;
      };
      if entry.users.len() <= 1 {
        return;
      }
      let extras = entry.users.split_off(1);
      (entry.key.clone(), entry.flags, entry.referrer.clone(), extras)
    };
    debug!(url = %key.url(), migrated = extras.len(), "exclusive content, splitting sharers");
    let now = Instant::now();
    for hid in extras {
      let new_idx = self.entries.create(key.clone(), flags, false, now);
      if let Some(record) = self.handles.get_mut(hid) {
        record.entry = new_idx;
      }
      if let Some(entry) = self.entries.get_mut(new_idx) {
        entry.users.push(hid);
        // The kind is already known to be exclusive.
        entry.no_share = true;
        entry.referrer = referrer.clone();
      }
      let mut request = FetchRequest::new(key.url().clone());
      if let Some(referrer) = referrer.clone() {
        request = request.with_referrer(referrer);
      }
      match self.backend.start(request) {
        Ok(fetch) => {
          self.counters.fetches_started += 1;
          self.fetch_to_entry.insert(fetch, new_idx);
          if let Some(entry) = self.entries.get_mut(new_idx) {
            entry.fetch = Some(fetch);
          }
        }
        Err(e) => {
          warn!(url = %key.url(), error = %e, "migration fetch failed to start");
          self.fail_entry(new_idx, ContentErrorKind::Network(e.to_string()));
        }
      }
    }
  }

  /// Removes an entry outright, aborting its fetch if one is in flight.
  pub(crate) fn teardown_entry(&mut self, idx: EntryIdx) {
    let Some(entry) = self.entries.remove(idx) else {
      return;
    };
    if let Some(fetch) = entry.fetch {
      self.fetch_to_entry.remove(&fetch);
      self.backend.abort(fetch);
    }
    self.counters.entries_evicted += 1;
    self.counters.bytes_evicted += entry.size_estimate() as u64;
    trace!(url = %entry.key.url(), "entry removed");
  }

  #[cfg(test)]
  pub(crate) fn backdate_entries(&mut self, by: Duration) {
    for idx in self.entries.indices() {
      if let Some(entry) = self.entries.get_mut(idx) {
        if let Some(back) = entry.last_access.checked_sub(by) {
          entry.last_access = back;
        }
      }
    }
  }
}

impl fmt::Debug for ContentCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContentCache")
      .field("entries", &self.entries.len())
      .field("handles", &self.handles.len())
      .field("in_flight", &self.fetch_to_entry.len())
      .field("finalised", &self.finalised)
      .finish()
  }
}

/// Whether type resolution must wait for body bytes.
fn needs_body_sniff(declared: Option<&str>, sniff_requested: bool) -> bool {
  if sniff_requested {
    return true;
  }
  match declared {
    None => true,
    Some(mime) => {
      let essence = content::mime_essence(mime);
      essence.is_empty() || essence == "application/octet-stream"
    }
  }
}

fn progress_text(received: usize, hint: Option<u64>) -> String {
  match hint {
    Some(total) if total > 0 => format!("received {} of {} bytes", received, total),
    _ => format!("received {} bytes", received),
  }
}
