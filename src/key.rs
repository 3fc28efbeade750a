//! Retrieval keys and the URL normalization they rely on.
//!
//! Two retrievals share a cache entry only when their keys are equal, so the
//! key carries everything that changes what a fetch would produce or how the
//! resulting content behaves: the normalized URL, the set of content types
//! the requester accepts, and the parsing context (quirks mode, fallback
//! charset) that feeds type-specific conversion.

use bitflags::bitflags;
use url::Url;

use crate::error::{Error, Result};

bitflags! {
  /// Content types a retrieval is willing to receive.
  ///
  /// The resolved type of the fetched resource is checked against this set
  /// once headers (or sniffing) have determined it. A resource outside the
  /// set is either converted to a download or failed with `NotAcceptable`.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct AcceptedTypes: u8 {
    /// HTML documents.
    const HTML = 1 << 0;
    /// Raster and vector images.
    const IMAGE = 1 << 1;
    /// CSS stylesheets.
    const STYLESHEET = 1 << 2;
    /// JavaScript sources.
    const SCRIPT = 1 << 3;
    /// Plugin-rendered content. Never shareable between users.
    const PLUGIN = 1 << 4;
    /// Anything the other categories do not cover.
    const OTHER = 1 << 5;
  }
}

impl AcceptedTypes {
  /// Every type the cache knows about.
  pub fn any() -> Self {
    Self::all()
  }
}

impl Default for AcceptedTypes {
  fn default() -> Self {
    Self::all()
  }
}

bitflags! {
  /// Per-retrieval behavior switches.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct RetrieveFlags: u8 {
    /// Bypass any existing entry and force a fresh fetch. Existing entries
    /// for the same key are invalidated so later retrievals see the
    /// refreshed resource rather than the stale one.
    const FORCE_FETCH = 1 << 0;
    /// Resolve the content type from leading body bytes instead of
    /// trusting the header-declared type.
    const SNIFF_TYPE = 1 << 1;
    /// Permit conversion to a download when the resolved type is not
    /// acceptable, instead of failing the retrieval.
    const MAY_DOWNLOAD = 1 << 2;
  }
}

/// Parsing context inherited from the requesting document.
///
/// Carried in the key because content fetched for a quirks-mode document or
/// with a different fallback charset may parse differently, so such
/// retrievals must not share an entry with standards-mode ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChildContext {
  /// Quirks mode of the requesting document.
  pub quirks: bool,
  /// Fallback charset to use when the resource does not declare one.
  pub charset: Option<String>,
}

impl ChildContext {
  /// Context for a quirks-mode document.
  pub fn quirks() -> Self {
    Self {
      quirks: true,
      charset: None,
    }
  }

  /// Sets the fallback charset.
  pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
    self.charset = Some(charset.into());
    self
  }
}

/// Identity of a cache entry.
///
/// Keys are compared for exact equality when deciding whether a retrieval
/// may join an existing entry. URL normalization happens at construction so
/// trivially different spellings of the same URL produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  url: Url,
  accept: AcceptedTypes,
  context: ChildContext,
}

impl CacheKey {
  /// Builds a key from a raw URL string, normalizing it along the way.
  ///
  /// Returns `BadParameter` when the URL does not parse; no entry or handle
  /// is ever created from an unparseable URL.
  pub fn new(raw_url: &str, accept: AcceptedTypes, context: ChildContext) -> Result<Self> {
    let url = normalize_url(raw_url)?;
    Ok(Self {
      url,
      accept,
      context,
    })
  }

  /// The normalized URL this key identifies.
  pub fn url(&self) -> &Url {
    &self.url
  }

  /// The accepted-type set of the retrieval that built this key.
  pub fn accept(&self) -> AcceptedTypes {
    self.accept
  }

  /// The inherited parsing context.
  pub fn context(&self) -> &ChildContext {
    &self.context
  }
}

/// Parses and normalizes a URL for use as (part of) a cache key.
///
/// Normalization lowercases the scheme and host, drops default ports, fills
/// in an empty path, and strips the fragment, since the fragment never
/// reaches the network and must not split otherwise-identical entries.
pub fn normalize_url(raw: &str) -> Result<Url> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return Err(Error::BadParameter("empty URL".to_string()));
  }
  let mut url = Url::parse(trimmed)
    .map_err(|e| Error::BadParameter(format!("invalid URL {:?}: {}", trimmed, e)))?;
  url.set_fragment(None);
  Ok(url)
}
