//! Events delivered to handle callbacks.
//!
//! Every state change a handle owner can observe arrives as a [`CacheEvent`]
//! through the callback registered at retrieval time. Events for one entry
//! are ordered; nothing is ever delivered after a terminal `Done` or `Error`
//! event, and a handle that joins late has the transitions it missed
//! replayed to it so every consumer sees the same sequence.

use url::Url;

use crate::error::ContentErrorKind;
use crate::fetch::FetchId;

/// A damage rectangle attached to a redraw notification.
///
/// A zero-sized rect means the whole content should be repainted; partial
/// rects are produced by progressive kinds that know which region changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedrawRect {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

impl RedrawRect {
  /// The conventional "repaint everything" rect.
  pub fn everything() -> Self {
    Self::default()
  }
}

/// Ownership transfer of an in-flight fetch to the download machinery.
///
/// After a `Download` event the cache no longer routes events for this
/// fetch; the download handler configured on the cache receives the raw
/// fetch events instead.
#[derive(Debug, Clone)]
pub struct DownloadHandoff {
  /// The low-level fetch now owned by the download side.
  pub fetch: FetchId,
  /// Final URL of the resource being downloaded.
  pub url: Url,
  /// Declared MIME type, as far as headers revealed it.
  pub mime: String,
}

/// Notification delivered to a handle callback.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// A content object exists and has begun loading.
  Loading,
  /// Human-readable progress text changed.
  Status { text: String },
  /// Part of the content needs repainting. Only emitted for content that
  /// is already usable.
  Redraw { rect: RedrawRect },
  /// The content became usable.
  Ready,
  /// Fetch and conversion finished completely.
  Done,
  /// The retrieval failed. `message` is rendered from `kind` exactly once,
  /// at dispatch time, so all recipients see identical text.
  Error {
    kind: ContentErrorKind,
    message: String,
  },
  /// The fetch was redirected. Informational; the entry keeps its original
  /// key and the content records the final URL.
  Redirect { from: Url, to: Url },
  /// The retrieval was converted into a download and this handle will
  /// receive no further events.
  Download { handoff: DownloadHandoff },
}

impl CacheEvent {
  /// Builds an `Error` event, rendering the message from the kind.
  pub(crate) fn error(kind: ContentErrorKind) -> Self {
    let message = kind.to_string();
    CacheEvent::Error { kind, message }
  }

  /// Whether this event ends the stream for its recipients.
  pub fn is_terminal(&self) -> bool {
    matches!(self, CacheEvent::Done | CacheEvent::Error { .. })
  }
}
