//! Content objects: typed, stateful wrappers around fetched bytes.
//!
//! A [`Content`] is created once the type of an in-flight resource is known,
//! accumulates body bytes as the fetch streams them in, and runs a
//! type-specific finishing step when the fetch completes. Its
//! [`ContentStatus`] drives which events the cache dispatches to handle
//! owners; the transition rules live here so the cache proper only ever asks
//! "may I advance?".

use std::fmt;
use std::io::Cursor;

use image::ImageDecoder;
use image::ImageFormat;
use url::Url;

use crate::error::ContentErrorKind;
use crate::key::AcceptedTypes;

/// Upper bound on how far into an HTML document the title scan looks.
const TITLE_SCAN_LIMIT: usize = 128 * 1024;

/// Estimated bytes per pixel for a decoded raster image.
const DECODED_PIXEL_COST: usize = 4;

// ============================================================================
// Content kinds
// ============================================================================

/// Resolved type of a cached resource.
///
/// The kind is fixed at type-resolution time (headers or sniffing) and
/// determines sharing, replay and readiness behavior for the rest of the
/// entry's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
  /// An HTML document.
  Html,
  /// A raster or vector image.
  Image,
  /// A CSS stylesheet.
  Stylesheet,
  /// A JavaScript source.
  Script,
  /// Content rendered by an external plugin. Plugin instances hold
  /// per-consumer state, so this kind is never shared between users.
  Plugin,
  /// Anything else.
  Other,
}

impl ContentKind {
  /// Maps a MIME type onto a kind. Parameters (`;charset=...`) are ignored.
  pub fn from_mime(mime: &str) -> Self {
    match mime_essence(mime).as_str() {
      "text/html" | "application/xhtml+xml" => ContentKind::Html,
      "text/css" => ContentKind::Stylesheet,
      "text/javascript" | "application/javascript" | "application/x-javascript"
      | "application/ecmascript" => ContentKind::Script,
      "application/x-shockwave-flash" => ContentKind::Plugin,
      essence if essence.starts_with("image/") => ContentKind::Image,
      essence if essence.starts_with("application/x-plugin") => ContentKind::Plugin,
      _ => ContentKind::Other,
    }
  }

  /// Whether one entry of this kind may serve several users at once.
  pub fn shareable(self) -> bool {
    !matches!(self, ContentKind::Plugin)
  }

  /// Whether a second user can join after the fact and have the state
  /// transitions replayed to it. Required for handle cloning.
  pub fn replayable(self) -> bool {
    !matches!(self, ContentKind::Plugin)
  }

  /// Whether the content becomes usable before the fetch finishes.
  /// HTML documents render progressively; everything else needs its full
  /// body before conversion can start.
  pub fn ready_on_partial(self) -> bool {
    matches!(self, ContentKind::Html)
  }

  /// The accepted-types bit this kind occupies.
  pub fn accept_bit(self) -> AcceptedTypes {
    match self {
      ContentKind::Html => AcceptedTypes::HTML,
      ContentKind::Image => AcceptedTypes::IMAGE,
      ContentKind::Stylesheet => AcceptedTypes::STYLESHEET,
      ContentKind::Script => AcceptedTypes::SCRIPT,
      ContentKind::Plugin => AcceptedTypes::PLUGIN,
      ContentKind::Other => AcceptedTypes::OTHER,
    }
  }
}

impl fmt::Display for ContentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ContentKind::Html => "html",
      ContentKind::Image => "image",
      ContentKind::Stylesheet => "stylesheet",
      ContentKind::Script => "script",
      ContentKind::Plugin => "plugin",
      ContentKind::Other => "other",
    };
    f.write_str(name)
  }
}

/// Resolves the effective MIME type of a resource from its declared type
/// and, when sniffing is requested or no type was declared, its leading
/// body bytes. Returns the resolved MIME string.
pub fn resolve_mime(declared: Option<&str>, data: &[u8], sniff: bool) -> String {
  if !sniff {
    if let Some(declared) = declared {
      let essence = mime_essence(declared);
      if !essence.is_empty() && essence != "application/octet-stream" {
        return essence;
      }
    }
  }
  if let Some(sniffed) = sniff_mime(data) {
    return sniffed.to_string();
  }
  match declared {
    Some(declared) if !mime_essence(declared).is_empty() => mime_essence(declared),
    _ => "application/octet-stream".to_string(),
  }
}

/// The `type/subtype` part of a MIME string, trimmed and lowercased.
pub fn mime_essence(mime: &str) -> String {
  mime
    .split(';')
    .next()
    .unwrap_or("")
    .trim()
    .to_ascii_lowercase()
}

/// Extracts the `charset` parameter from a MIME string, if present.
pub fn mime_charset(mime: &str) -> Option<String> {
  for param in mime.split(';').skip(1) {
    let mut parts = param.splitn(2, '=');
    let name = parts.next()?.trim().to_ascii_lowercase();
    if name == "charset" {
      let value = parts.next()?.trim().trim_matches('"');
      if !value.is_empty() {
        return Some(value.to_ascii_uppercase());
      }
    }
  }
  None
}

/// Sniffs a MIME type from magic bytes. Covers the signatures the cache
/// actually distinguishes on; unrecognized data returns `None`.
fn sniff_mime(data: &[u8]) -> Option<&'static str> {
  if data.starts_with(b"\x89PNG\r\n\x1a\n") {
    return Some("image/png");
  }
  if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
    return Some("image/gif");
  }
  if data.starts_with(b"\xFF\xD8\xFF") {
    return Some("image/jpeg");
  }
  if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
    return Some("image/webp");
  }
  if data.starts_with(b"%PDF-") {
    return Some("application/pdf");
  }
  let text_start = skip_sniff_prefix(data);
  let lowered: Vec<u8> = text_start
    .iter()
    .take(64)
    .map(|b| b.to_ascii_lowercase())
    .collect();
  if lowered.starts_with(b"<!doctype html")
    || lowered.starts_with(b"<html")
    || lowered.starts_with(b"<head")
    || lowered.starts_with(b"<body")
  {
    return Some("text/html");
  }
  let xml_window = &text_start[..text_start.len().min(1024)];
  if lowered.starts_with(b"<svg")
    || (lowered.starts_with(b"<?xml") && contains_ci(xml_window, b"<svg"))
  {
    return Some("image/svg+xml");
  }
  None
}

/// Skips a UTF-8 BOM and leading ASCII whitespace before tag sniffing.
fn skip_sniff_prefix(data: &[u8]) -> &[u8] {
  let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
  let start = data
    .iter()
    .position(|b| !b.is_ascii_whitespace())
    .unwrap_or(data.len());
  &data[start..]
}

fn contains_ci(haystack: &[u8], needle: &[u8]) -> bool {
  find_ci(haystack, needle, 0).is_some()
}

fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
  if needle.is_empty() || haystack.len() < needle.len() {
    return None;
  }
  (from..=haystack.len() - needle.len()).find(|&i| {
    haystack[i..i + needle.len()]
      .iter()
      .zip(needle)
      .all(|(a, b)| a.eq_ignore_ascii_case(b))
  })
}

// ============================================================================
// Status machine
// ============================================================================

/// Lifecycle state of a content object.
///
/// Transitions only ever move forward: `Loading` to `Ready` to `Done`, with
/// `Error` reachable from either of the first two. `Done` and `Error` are
/// terminal; no events are dispatched for an entry once it reaches one of
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentStatus {
  /// The fetch is still streaming and the content is not yet usable.
  Loading,
  /// The content is usable; for progressive kinds the fetch may still be
  /// running.
  Ready,
  /// Fetch and conversion are fully complete.
  Done,
  /// The retrieval failed. Terminal.
  Error,
}

impl ContentStatus {
  /// Whether no further transitions (and therefore no further events) are
  /// possible from this state.
  pub fn is_terminal(self) -> bool {
    matches!(self, ContentStatus::Done | ContentStatus::Error)
  }

  /// Whether the machine may move from `self` to `next`.
  pub fn can_advance_to(self, next: ContentStatus) -> bool {
    match (self, next) {
      (ContentStatus::Loading, ContentStatus::Ready) => true,
      (ContentStatus::Ready, ContentStatus::Done) => true,
      (ContentStatus::Loading | ContentStatus::Ready, ContentStatus::Error) => true,
      _ => false,
    }
  }
}

// ============================================================================
// Content object
// ============================================================================

/// Typed content attached to a cache entry.
///
/// Owned exclusively by its entry; handle owners reach it through accessor
/// methods on the cache rather than holding references into it.
#[derive(Debug, Clone)]
pub struct Content {
  kind: ContentKind,
  status: ContentStatus,
  url: Url,
  mime: String,
  charset: Option<String>,
  source: Vec<u8>,
  title: Option<String>,
  title_scan_done: bool,
  dimensions: Option<(u32, u32)>,
}

impl Content {
  /// Creates a content object in the `Loading` state.
  ///
  /// `url` is the final URL the bytes come from (post-redirect), `mime` the
  /// resolved type and `charset` the effective charset after falling back
  /// to the requesting document's.
  pub fn new(kind: ContentKind, url: Url, mime: String, charset: Option<String>) -> Self {
    Self {
      kind,
      status: ContentStatus::Loading,
      url,
      mime,
      charset,
      source: Vec::new(),
      title: None,
      title_scan_done: false,
      dimensions: None,
    }
  }

  /// Appends a chunk of body bytes, updating derived state (the HTML title
  /// scan) as data arrives.
  pub fn append_data(&mut self, chunk: &[u8]) {
    self.source.extend_from_slice(chunk);
    if self.kind == ContentKind::Html {
      self.scan_title();
    }
  }

  /// Runs the type-specific finishing step once all bytes have arrived.
  ///
  /// For images this probes the header for intrinsic dimensions and reports
  /// `Malformed` when no known decoder can read them. Other kinds accept
  /// whatever arrived; their consumers parse lazily.
  pub fn finish(&mut self) -> Result<(), ContentErrorKind> {
    match self.kind {
      ContentKind::Image => {
        if mime_essence(&self.mime) == "image/svg+xml" {
          return Ok(());
        }
        match probe_dimensions(&self.source, Some(&self.mime)) {
          Some(dims) => {
            self.dimensions = Some(dims);
            Ok(())
          }
          None => Err(ContentErrorKind::Malformed(ContentKind::Image)),
        }
      }
      _ => Ok(()),
    }
  }

  /// Advances the status machine. Panics in debug builds on an illegal
  /// transition, which the cache's dispatch logic is responsible for never
  /// attempting.
  pub fn advance(&mut self, next: ContentStatus) {
    debug_assert!(
      self.status.can_advance_to(next),
      "illegal status transition {:?} -> {:?}",
      self.status,
      next
    );
    self.status = next;
  }

  pub fn kind(&self) -> ContentKind {
    self.kind
  }

  pub fn status(&self) -> ContentStatus {
    self.status
  }

  /// The final URL of the bytes, after any redirects.
  pub fn url(&self) -> &Url {
    &self.url
  }

  /// The resolved MIME type (essence only, no parameters).
  pub fn mime(&self) -> &str {
    &self.mime
  }

  /// The effective charset, when one is known.
  pub fn charset(&self) -> Option<&str> {
    self.charset.as_deref()
  }

  /// The raw bytes received so far.
  pub fn source(&self) -> &[u8] {
    &self.source
  }

  /// Document title, for HTML content that declared one.
  pub fn title(&self) -> Option<&str> {
    self.title.as_deref()
  }

  /// Intrinsic dimensions, for raster images after `finish`.
  pub fn dimensions(&self) -> Option<(u32, u32)> {
    self.dimensions
  }

  /// Estimated memory footprint: raw bytes plus, for images, the expected
  /// decoded size. Feeds the cache's size accounting.
  pub fn size_estimate(&self) -> usize {
    let decoded = match self.dimensions {
      Some((w, h)) => (w as usize).saturating_mul(h as usize) * DECODED_PIXEL_COST,
      None => 0,
    };
    self.source.len() + decoded
  }

  /// Incremental `<title>` extraction over the buffered prefix. Stops for
  /// good once a title is found or the scan window is exhausted.
  fn scan_title(&mut self) {
    if self.title_scan_done {
      return;
    }
    let window = &self.source[..self.source.len().min(TITLE_SCAN_LIMIT)];
    if let Some(title) = extract_title(window) {
      self.title = Some(title);
      self.title_scan_done = true;
    } else if self.source.len() >= TITLE_SCAN_LIMIT {
      self.title_scan_done = true;
    }
  }
}

/// Pulls the text of the first `<title>` element out of an HTML prefix.
/// Whitespace is collapsed; an empty or unterminated title yields `None`.
fn extract_title(html: &[u8]) -> Option<String> {
  let open = find_ci(html, b"<title", 0)?;
  let text_start = html[open..].iter().position(|&b| b == b'>')? + open + 1;
  let close = find_ci(html, b"</title", text_start)?;
  let raw = &html[text_start..close];
  let text = String::from_utf8_lossy(raw);
  let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
  if collapsed.is_empty() {
    None
  } else {
    Some(collapsed)
  }
}

/// Reads intrinsic dimensions from an image header without decoding pixel
/// data. Tries the declared format first, then the sniffed one.
fn probe_dimensions(bytes: &[u8], content_type: Option<&str>) -> Option<(u32, u32)> {
  let from_content_type =
    content_type.and_then(|mime| ImageFormat::from_mime_type(mime_essence(mime)));
  let sniffed = image::guess_format(bytes).ok();
  from_content_type
    .and_then(|format| dimensions_for_format(bytes, format))
    .or_else(|| sniffed.and_then(|format| dimensions_for_format(bytes, format)))
}

fn dimensions_for_format(bytes: &[u8], format: ImageFormat) -> Option<(u32, u32)> {
  match format {
    ImageFormat::Png => image::codecs::png::PngDecoder::new(Cursor::new(bytes))
      .ok()
      .map(|d| d.dimensions()),
    ImageFormat::Jpeg => image::codecs::jpeg::JpegDecoder::new(Cursor::new(bytes))
      .ok()
      .map(|d| d.dimensions()),
    ImageFormat::Gif => image::codecs::gif::GifDecoder::new(Cursor::new(bytes))
      .ok()
      .map(|d| d.dimensions()),
    ImageFormat::WebP => image::codecs::webp::WebPDecoder::new(Cursor::new(bytes))
      .ok()
      .map(|d| d.dimensions()),
    _ => None,
  }
}
