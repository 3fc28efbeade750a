//! Deterministic in-memory fetch backend.
//!
//! Serves pre-registered resources, delivering their bytes through the same
//! event contract a network backend would use. Each in-flight fetch advances
//! by exactly one event per `poll` call, which makes interleavings
//! reproducible; scripts on a resource (redirects, authentication
//! challenges, mid-body failures, chunked delivery) exercise the cache paths
//! a real transport would hit.
//!
//! Used for tests and for rendering from offline snapshots.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::{
  FetchBackend, FetchEvent, FetchFailure, FetchId, FetchQuery, FetchRequest, QueryResponse,
};

/// Redirect chains longer than this fail the fetch.
const MAX_REDIRECT_HOPS: u8 = 5;

/// A resource served by [`MemoryBackend`], plus the script of how to serve
/// it.
#[derive(Debug, Clone)]
pub struct MemoryResource {
  mime: Option<String>,
  charset: Option<String>,
  bytes: Vec<u8>,
  chunk_size: usize,
  redirect_to: Option<String>,
  auth_realm: Option<String>,
  failure: Option<FetchFailure>,
  failure_after: Option<usize>,
}

impl MemoryResource {
  /// A resource with a declared content type.
  pub fn new(mime: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      mime: Some(mime.into()),
      charset: None,
      bytes: bytes.into(),
      chunk_size: 0,
      redirect_to: None,
      auth_realm: None,
      failure: None,
      failure_after: None,
    }
  }

  /// A resource with no declared content type, forcing the cache to sniff.
  pub fn untyped(bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      mime: None,
      charset: None,
      bytes: bytes.into(),
      chunk_size: 0,
      redirect_to: None,
      auth_realm: None,
      failure: None,
      failure_after: None,
    }
  }

  /// Delivers the body in chunks of at most `size` bytes, one chunk per
  /// poll. Zero (the default) delivers the whole body in one event.
  pub fn with_chunk_size(mut self, size: usize) -> Self {
    self.chunk_size = size;
    self
  }

  /// Declares a transport-level charset alongside the content type.
  pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
    self.charset = Some(charset.into());
    self
  }

  /// Redirects to another registered URL before serving anything.
  pub fn with_redirect_to(mut self, target: impl Into<String>) -> Self {
    self.redirect_to = Some(target.into());
    self
  }

  /// Demands authentication before serving; the fetch suspends on an
  /// `Authentication` query until answered.
  pub fn with_auth_realm(mut self, realm: impl Into<String>) -> Self {
    self.auth_realm = Some(realm.into());
    self
  }

  /// Fails the fetch with `failure` instead of serving the body.
  pub fn with_failure(mut self, failure: FetchFailure) -> Self {
    self.failure = Some(failure);
    self
  }

  /// Serves roughly `bytes` of body, then fails. Combine with
  /// `with_failure` to pick the failure; the default is a network error.
  pub fn with_failure_after(mut self, bytes: usize) -> Self {
    self.failure_after = Some(bytes);
    self
  }

  fn late_failure(&self) -> FetchFailure {
    self
      .failure
      .clone()
      .unwrap_or_else(|| FetchFailure::Network("connection reset by peer".to_string()))
  }
}

/// What serving a fetch does next.
#[derive(Debug, Clone)]
enum Stage {
  Challenge,
  AwaitAnswer,
  Redirect,
  Headers,
  Body { offset: usize },
  Finish,
  Fail(FetchFailure),
}

#[derive(Debug)]
struct ActiveFetch {
  id: FetchId,
  url: Url,
  resource: MemoryResource,
  stage: Stage,
  hops: u8,
}

enum Step {
  Emit(FetchEvent, bool),
  Idle,
}

impl ActiveFetch {
  fn initial_stage(resource: &MemoryResource) -> Stage {
    if let (Some(failure), None) = (&resource.failure, resource.failure_after) {
      Stage::Fail(failure.clone())
    } else if resource.auth_realm.is_some() {
      Stage::Challenge
    } else if resource.redirect_to.is_some() {
      Stage::Redirect
    } else {
      Stage::Headers
    }
  }

  fn stage_after_auth(resource: &MemoryResource) -> Stage {
    if resource.redirect_to.is_some() {
      Stage::Redirect
    } else {
      Stage::Headers
    }
  }

  fn step(&mut self, resources: &FxHashMap<String, MemoryResource>) -> Step {
    match self.stage.clone() {
      Stage::Challenge => {
        let realm = self.resource.auth_realm.clone().unwrap_or_default();
        self.stage = Stage::AwaitAnswer;
        Step::Emit(
          FetchEvent::Query(FetchQuery::Authentication { realm }),
          false,
        )
      }
      Stage::AwaitAnswer => Step::Idle,
      Stage::Redirect => {
        let target = self.resource.redirect_to.clone().unwrap_or_default();
        self.hops += 1;
        if self.hops > MAX_REDIRECT_HOPS {
          self.stage = Stage::Fail(FetchFailure::Network("too many redirects".to_string()));
          return self.step(resources);
        }
        let to = match Url::parse(&target) {
          Ok(to) => to,
          Err(e) => {
            self.stage = Stage::Fail(FetchFailure::Malformed(format!(
              "redirect to invalid URL {:?}: {}",
              target, e
            )));
            return self.step(resources);
          }
        };
        match resources.get(to.as_str()) {
          Some(next) => {
            self.resource = next.clone();
            self.url = to.clone();
            // Re-run the challenge/redirect script of the target.
            self.stage = if self.resource.auth_realm.is_some() {
              Stage::Challenge
            } else if self.resource.redirect_to.is_some() {
              Stage::Redirect
            } else {
              Stage::Headers
            };
          }
          None => {
            self.stage = Stage::Fail(FetchFailure::NotFound);
          }
        }
        Step::Emit(FetchEvent::Redirect { to }, false)
      }
      Stage::Headers => {
        self.stage = Stage::Body { offset: 0 };
        Step::Emit(
          FetchEvent::Headers {
            mime: self.resource.mime.clone(),
            charset: self.resource.charset.clone(),
            length: Some(self.resource.bytes.len() as u64),
          },
          false,
        )
      }
      Stage::Body { offset } => {
        if let Some(limit) = self.resource.failure_after {
          if offset >= limit {
            return Step::Emit(
              FetchEvent::Failed {
                failure: self.resource.late_failure(),
              },
              true,
            );
          }
        }
        let total = self.resource.bytes.len();
        if offset >= total {
          return Step::Emit(FetchEvent::Finished, true);
        }
        let step = if self.resource.chunk_size == 0 {
          total - offset
        } else {
          self.resource.chunk_size.min(total - offset)
        };
        let mut end = offset + step;
        if let Some(limit) = self.resource.failure_after {
          end = end.min(limit.max(offset + 1)).min(total);
        }
        let chunk = self.resource.bytes[offset..end].to_vec();
        self.stage = if end == total && self.resource.failure_after.is_none() {
          Stage::Finish
        } else {
          Stage::Body { offset: end }
        };
        Step::Emit(FetchEvent::Data(chunk), false)
      }
      Stage::Finish => Step::Emit(FetchEvent::Finished, true),
      Stage::Fail(failure) => Step::Emit(FetchEvent::Failed { failure }, true),
    }
  }
}

/// Fetch backend serving registered in-memory resources.
///
/// # Example
///
/// ```
/// use hlcache::fetch::memory::{MemoryBackend, MemoryResource};
///
/// let mut backend = MemoryBackend::new();
/// backend.register(
///   "http://example.com/style.css",
///   MemoryResource::new("text/css", "body { }".as_bytes()),
/// );
/// ```
#[derive(Debug)]
pub struct MemoryBackend {
  resources: FxHashMap<String, MemoryResource>,
  active: Vec<ActiveFetch>,
  schemes: Vec<String>,
  next_id: u64,
  log: Vec<FetchRequest>,
  aborted: Vec<FetchId>,
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self {
      resources: FxHashMap::default(),
      active: Vec::new(),
      schemes: vec!["http".to_string(), "https".to_string()],
      next_id: 0,
      log: Vec::new(),
      aborted: Vec::new(),
    }
  }

  /// Adds a scheme this backend claims beyond http/https.
  pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
    self.schemes.push(scheme.into().to_ascii_lowercase());
    self
  }

  /// Registers a resource. The URL is normalized the same way retrieval
  /// URLs are, so registrations and lookups line up.
  pub fn register(&mut self, url: &str, resource: MemoryResource) {
    let key = match crate::key::normalize_url(url) {
      Ok(parsed) => parsed.to_string(),
      Err(_) => url.to_string(),
    };
    self.resources.insert(key, resource);
  }

  /// Every request this backend has been asked to start, in order.
  pub fn request_log(&self) -> &[FetchRequest] {
    &self.log
  }

  /// How many fetches have been started for `url`.
  pub fn starts_for(&self, url: &str) -> usize {
    self
      .log
      .iter()
      .filter(|request| request.url.as_str() == url)
      .count()
  }

  /// Number of fetches currently in flight.
  pub fn active_count(&self) -> usize {
    self.active.len()
  }

  /// Fetches cancelled while still in flight.
  pub fn aborts(&self) -> &[FetchId] {
    &self.aborted
  }
}

impl FetchBackend for MemoryBackend {
  fn supports_scheme(&self, scheme: &str) -> bool {
    self.schemes.iter().any(|s| s == scheme)
  }

  fn start(&mut self, request: FetchRequest) -> Result<FetchId> {
    let scheme = request.url.scheme().to_ascii_lowercase();
    if !self.supports_scheme(&scheme) {
      return Err(Error::NoFetchHandler(scheme));
    }
    let id = FetchId::new(self.next_id);
    self.next_id += 1;
    let url = request.url.clone();
    self.log.push(request);
    let (resource, stage) = match self.resources.get(url.as_str()) {
      Some(resource) => (resource.clone(), ActiveFetch::initial_stage(resource)),
      None => (
        MemoryResource::untyped(Vec::new()),
        Stage::Fail(FetchFailure::NotFound),
      ),
    };
    self.active.push(ActiveFetch {
      id,
      url,
      resource,
      stage,
      hops: 0,
    });
    Ok(id)
  }

  fn abort(&mut self, id: FetchId) {
    let before = self.active.len();
    self.active.retain(|fetch| fetch.id != id);
    if self.active.len() != before {
      self.aborted.push(id);
    }
  }

  fn answer_query(&mut self, id: FetchId, response: QueryResponse) {
    let Some(fetch) = self.active.iter_mut().find(|fetch| fetch.id == id) else {
      return;
    };
    if !matches!(fetch.stage, Stage::AwaitAnswer) {
      return;
    }
    fetch.stage = match response {
      QueryResponse::Credentials { .. } | QueryResponse::Proceed => {
        ActiveFetch::stage_after_auth(&fetch.resource)
      }
      QueryResponse::Deny => Stage::Fail(FetchFailure::Denied),
    };
  }

  fn poll(&mut self, sink: &mut dyn FnMut(FetchId, FetchEvent)) {
    let mut index = 0;
    while index < self.active.len() {
      match self.active[index].step(&self.resources) {
        Step::Emit(event, done) => {
          let id = self.active[index].id;
          if done {
            self.active.remove(index);
          } else {
            index += 1;
          }
          sink(id, event);
        }
        Step::Idle => {
          index += 1;
        }
      }
    }
  }
}

// ============================================================================
// Shared backend
// ============================================================================

/// Cheaply clonable view over one [`MemoryBackend`].
///
/// A cache takes ownership of its backend, which would otherwise leave a
/// test with no way to script new resources or inspect the request log
/// afterwards. Hand the cache a `SharedBackend` and keep a clone.
///
/// Single-threaded, like everything else here.
#[derive(Debug, Clone, Default)]
pub struct SharedBackend {
  inner: Rc<RefCell<MemoryBackend>>,
}

impl SharedBackend {
  pub fn new(backend: MemoryBackend) -> Self {
    Self {
      inner: Rc::new(RefCell::new(backend)),
    }
  }

  pub fn register(&self, url: &str, resource: MemoryResource) {
    self.inner.borrow_mut().register(url, resource);
  }

  pub fn starts_for(&self, url: &str) -> usize {
    self.inner.borrow().starts_for(url)
  }

  pub fn request_count(&self) -> usize {
    self.inner.borrow().request_log().len()
  }

  pub fn active_count(&self) -> usize {
    self.inner.borrow().active_count()
  }

  pub fn abort_count(&self) -> usize {
    self.inner.borrow().aborts().len()
  }
}

impl FetchBackend for SharedBackend {
  fn supports_scheme(&self, scheme: &str) -> bool {
    self.inner.borrow().supports_scheme(scheme)
  }

  fn start(&mut self, request: FetchRequest) -> Result<FetchId> {
    self.inner.borrow_mut().start(request)
  }

  fn abort(&mut self, id: FetchId) {
    self.inner.borrow_mut().abort(id);
  }

  fn answer_query(&mut self, id: FetchId, response: QueryResponse) {
    self.inner.borrow_mut().answer_query(id, response);
  }

  fn poll(&mut self, sink: &mut dyn FnMut(FetchId, FetchEvent)) {
    self.inner.borrow_mut().poll(sink);
  }
}
