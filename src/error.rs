//! Error types for the high-level cache.
//!
//! Two layers of errors exist, mirroring how failures propagate out of the
//! cache:
//!
//! - [`Error`] is returned synchronously from cache operations that fail
//!   before an event callback could be involved (bad URLs, unknown schemes,
//!   operations on a handle that is no longer registered).
//! - [`ContentErrorKind`] describes failures that happen *after* a handle has
//!   been returned (fetch failures, aborts, unusable content). These are never
//!   returned as a function result; they arrive through the event callback as
//!   a [`CacheEvent::Error`](crate::event::CacheEvent::Error) carrying the
//!   kind and a message rendered once by the dispatcher.

use thiserror::Error;

use crate::content::ContentKind;
use crate::fetch::FetchFailure;

/// Result type alias for cache operations.
///
/// # Examples
///
/// ```
/// use hlcache::Result;
///
/// fn lookup_something() -> Result<()> {
///   Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously from cache operations.
///
/// Failures of an in-flight retrieval are not represented here; those are
/// delivered asynchronously as `Error` events on the registered callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// A malformed URL or otherwise unusable argument. No handle or cache
  /// entry is created when this is returned.
  #[error("bad parameter: {0}")]
  BadParameter(String),

  /// No fetch backend recognizes the URL scheme. Callers are expected to
  /// fall back to an external action (for instance launching a helper
  /// application) rather than treating this as a cache failure.
  #[error("no fetch handler for {0:?} URLs")]
  NoFetchHandler(String),

  /// A handle clone was rejected because the underlying content cannot be
  /// shared or cannot replay its state to a second consumer.
  #[error("clone failed: {0}")]
  CloneFailed(String),

  /// The handle is not (or is no longer) registered with the cache.
  /// Returned for operations on an already-released handle, which keeps a
  /// double release from corrupting the registration list.
  #[error("handle is not registered")]
  StaleHandle,

  /// The cache has been shut down with `finalise` and accepts no further
  /// operations.
  #[error("cache has been finalised")]
  Finalised,
}

/// Structured cause attached to an `Error` event.
///
/// The event dispatcher renders the human-readable message from this kind
/// exactly once per event, so callbacks never need to translate codes
/// themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentErrorKind {
  /// The fetch was cancelled on request of a handle owner.
  #[error("fetch was aborted")]
  Aborted,

  /// The backend reports that the resource does not exist.
  #[error("resource not found")]
  NotFound,

  /// A backend recognized the URL's scheme but could not make sense of the
  /// URL itself, for example a `data:` URL with no payload separator.
  #[error("unusable URL: {0}")]
  BadUrl(String),

  /// The backend failed to retrieve the resource.
  #[error("network failure: {0}")]
  Network(String),

  /// An embedder query (authentication, certificate trust) was denied,
  /// either by the configured query handler or because none is installed.
  #[error("authentication was refused")]
  QueryDenied,

  /// The resolved content type is not in the accepted set for this
  /// retrieval and could not be converted to a download.
  #[error("content type {0:?} is not acceptable in this context")]
  NotAcceptable(String),

  /// The resource arrived but could not be understood by its type-specific
  /// conversion step (for example an image with an unreadable header).
  #[error("{0} content is malformed")]
  Malformed(ContentKind),
}

impl From<FetchFailure> for ContentErrorKind {
  fn from(failure: FetchFailure) -> Self {
    match failure {
      FetchFailure::NotFound => ContentErrorKind::NotFound,
      FetchFailure::Network(message) => ContentErrorKind::Network(message),
      FetchFailure::Malformed(message) => ContentErrorKind::BadUrl(message),
      FetchFailure::Denied => ContentErrorKind::QueryDenied,
    }
  }
}
