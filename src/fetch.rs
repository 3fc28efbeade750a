//! Low-level fetch abstraction.
//!
//! This module provides a trait-based abstraction over the machinery that
//! actually moves bytes: the cache never talks to a network stack directly.
//! Implementing [`FetchBackend`] allows:
//!
//! - In-memory backends for tests and offline rendering
//! - Inline decoding of `data:` URLs
//! - Routing between per-scheme backends
//! - Custom transports behind the same event contract
//!
//! A backend is driven cooperatively: `start` registers work, and each call
//! to `poll` makes some progress and reports it through the event sink. The
//! contract every backend honors for a single fetch is: at most one
//! `Headers` event, before any `Data`; then exactly one of `Finished` or
//! `Failed`, after which the fetch id is dead and must produce nothing more.

use url::Url;

use crate::error::Result;

pub mod data_url;
pub mod memory;
pub mod router;

/// Identifier of one in-flight low-level fetch.
///
/// Minted by the backend on `start`; dead once `Finished` or `Failed` has
/// been emitted or `abort` has been called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(u64);

impl FetchId {
  pub const fn new(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> u64 {
    self.0
  }
}

/// Body of a POST request.
///
/// Retrievals carrying one of these are never joined to an existing entry
/// and never indexed for later joins, since replaying a POST response to a
/// second consumer would be wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostData {
  /// `application/x-www-form-urlencoded` payload.
  UrlEncoded(String),
  /// Arbitrary payload with an explicit content type.
  Raw {
    content_type: String,
    bytes: Vec<u8>,
  },
}

/// Everything a backend needs to issue one fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  /// Normalized URL to fetch.
  pub url: Url,
  /// Referring document, when there is one.
  pub referrer: Option<Url>,
  /// POST body; `None` means GET.
  pub post: Option<PostData>,
}

impl FetchRequest {
  pub fn new(url: Url) -> Self {
    Self {
      url,
      referrer: None,
      post: None,
    }
  }

  pub fn with_referrer(mut self, referrer: Url) -> Self {
    self.referrer = Some(referrer);
    self
  }

  pub fn with_post(mut self, post: PostData) -> Self {
    self.post = Some(post);
    self
  }
}

/// A question the transport cannot answer by itself.
///
/// Queries suspend the fetch until [`FetchBackend::answer_query`] is called
/// for its id. The cache routes them to the query handler configured by the
/// embedder and denies them when none is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchQuery {
  /// The origin demands authentication for the given realm.
  Authentication { realm: String },
  /// The transport distrusts the server certificate.
  UntrustedTls { reason: String },
}

/// An embedder's answer to a [`FetchQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
  /// Retry with credentials.
  Credentials { username: String, password: String },
  /// Proceed despite the concern (for TLS queries).
  Proceed,
  /// Give up; the fetch fails with a denied error.
  Deny,
}

/// Why a fetch failed, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
  /// The resource does not exist.
  NotFound,
  /// Transport-level failure.
  Network(String),
  /// The URL itself could not be understood by the backend.
  Malformed(String),
  /// A suspending query was answered with `Deny`.
  Denied,
}

/// Progress report for one fetch, delivered through the poll sink.
#[derive(Debug, Clone)]
pub enum FetchEvent {
  /// Response metadata. Sent at most once, before any `Data`.
  Headers {
    /// Declared content type, parameters included, when the transport
    /// knows one.
    mime: Option<String>,
    /// Charset declared outside the MIME parameters, when the transport
    /// carries it separately.
    charset: Option<String>,
    /// Expected body length, when declared.
    length: Option<u64>,
  },
  /// A chunk of body bytes.
  Data(Vec<u8>),
  /// The fetch was redirected and continues at `to`.
  Redirect { to: Url },
  /// The fetch is suspended on an embedder decision.
  Query(FetchQuery),
  /// The body is complete. Terminal.
  Finished,
  /// The fetch failed. Terminal.
  Failed { failure: FetchFailure },
}

/// Trait for the low-level fetch machinery underneath the cache.
///
/// # Event ordering
///
/// For each fetch id: zero or more `Redirect`/`Query` events, at most one
/// `Headers`, zero or more `Data` (all after `Headers`), then exactly one
/// terminal `Finished` or `Failed`. After a terminal event, or after
/// `abort`, the id is dead and the backend must emit nothing further for
/// it.
///
/// # Threading
///
/// The cache is single-threaded and cooperative; backends are driven only
/// from `poll` on the caller's thread and need no internal synchronization.
pub trait FetchBackend {
  /// Whether this backend can fetch URLs of the given scheme. Schemes are
  /// compared lowercased.
  fn supports_scheme(&self, scheme: &str) -> bool;

  /// Begins a fetch and returns its id.
  ///
  /// Returns `NoFetchHandler` when the scheme is unsupported and
  /// `BadParameter` when the request is unusable. Failures *after* this
  /// point are reported asynchronously as `Failed` events.
  fn start(&mut self, request: FetchRequest) -> Result<FetchId>;

  /// Cancels an in-flight fetch. Unknown or already-finished ids are
  /// ignored; no events follow an abort.
  fn abort(&mut self, id: FetchId);

  /// Resumes a fetch suspended on a `Query` event.
  fn answer_query(&mut self, id: FetchId, response: QueryResponse);

  /// Makes progress on all in-flight fetches, reporting each step to
  /// `sink`. Implementations should do a bounded amount of work per call;
  /// the cache polls repeatedly.
  fn poll(&mut self, sink: &mut dyn FnMut(FetchId, FetchEvent));
}
