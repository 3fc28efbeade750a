//! Scheme-based composition of fetch backends.
//!
//! A [`SchemeRouter`] owns several backends and forwards each fetch to the
//! first one claiming the URL's scheme. Inner backends mint ids
//! independently, so the router issues its own ids and keeps the mapping;
//! two backends both using id 0 can never be confused by the cache.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::fetch::{FetchBackend, FetchEvent, FetchId, FetchRequest, QueryResponse};

/// Routes fetches to per-scheme backends behind one [`FetchBackend`] face.
///
/// # Example
///
/// ```
/// use hlcache::fetch::data_url::DataUrlBackend;
/// use hlcache::fetch::memory::MemoryBackend;
/// use hlcache::fetch::router::SchemeRouter;
///
/// let router = SchemeRouter::new()
///   .with_backend(MemoryBackend::new())
///   .with_backend(DataUrlBackend::new());
/// ```
#[derive(Default)]
pub struct SchemeRouter {
  backends: Vec<Box<dyn FetchBackend>>,
  next_id: u64,
  forward: FxHashMap<u64, (usize, FetchId)>,
  reverse: FxHashMap<(usize, u64), u64>,
}

impl SchemeRouter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a backend. Backends are consulted in registration order, so an
  /// earlier backend shadows a later one for schemes both claim.
  pub fn with_backend(mut self, backend: impl FetchBackend + 'static) -> Self {
    self.backends.push(Box::new(backend));
    self
  }

  fn backend_for(&self, scheme: &str) -> Option<usize> {
    self
      .backends
      .iter()
      .position(|backend| backend.supports_scheme(scheme))
  }
}

impl fmt::Debug for SchemeRouter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchemeRouter")
      .field("backends", &self.backends.len())
      .field("in_flight", &self.forward.len())
      .finish()
  }
}

impl FetchBackend for SchemeRouter {
  fn supports_scheme(&self, scheme: &str) -> bool {
    self.backend_for(scheme).is_some()
  }

  fn start(&mut self, request: FetchRequest) -> Result<FetchId> {
    let scheme = request.url.scheme().to_ascii_lowercase();
    let index = self
      .backend_for(&scheme)
      .ok_or(Error::NoFetchHandler(scheme))?;
    let inner = self.backends[index].start(request)?;
    let raw = self.next_id;
    self.next_id += 1;
    self.forward.insert(raw, (index, inner));
    self.reverse.insert((index, inner.raw()), raw);
    Ok(FetchId::new(raw))
  }

  fn abort(&mut self, id: FetchId) {
    if let Some((index, inner)) = self.forward.remove(&id.raw()) {
      self.reverse.remove(&(index, inner.raw()));
      self.backends[index].abort(inner);
    }
  }

  fn answer_query(&mut self, id: FetchId, response: QueryResponse) {
    if let Some(&(index, inner)) = self.forward.get(&id.raw()) {
      self.backends[index].answer_query(inner, response);
    }
  }

  fn poll(&mut self, sink: &mut dyn FnMut(FetchId, FetchEvent)) {
    let mut finished: Vec<u64> = Vec::new();
    let reverse = &self.reverse;
    for (index, backend) in self.backends.iter_mut().enumerate() {
      backend.poll(&mut |inner, event| {
        let Some(&raw) = reverse.get(&(index, inner.raw())) else {
          return;
        };
        if matches!(event, FetchEvent::Finished | FetchEvent::Failed { .. }) {
          finished.push(raw);
        }
        sink(FetchId::new(raw), event);
      });
    }
    for raw in finished {
      if let Some((index, inner)) = self.forward.remove(&raw) {
        self.reverse.remove(&(index, inner.raw()));
      }
    }
  }
}
