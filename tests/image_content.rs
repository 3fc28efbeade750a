//! Type-specific conversion: image probing, HTML titles, charset
//! resolution and sniffing through the full cache path.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use hlcache::fetch::memory::{MemoryResource, SharedBackend};
use hlcache::{
  callback, CacheConfig, CacheEvent, ChildContext, ContentCache, ContentErrorKind, ContentKind,
  ContentStatus, EventCallback, Retrieval, RetrieveFlags,
};

// A valid 1x1 transparent PNG.
const TINY_PNG: &[u8] = &[
  0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
  0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
  0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00, 0x01, 0x00, 0x00,
  0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
  0x42, 0x60, 0x82,
];

fn test_config() -> CacheConfig {
  // Sweeps only on demand, so idle entries stay resident for the test.
  CacheConfig::default().with_sweep_interval(Duration::from_secs(3600))
}

fn pump(cache: &mut ContentCache) {
  for _ in 0..64 {
    cache.poll();
  }
}

fn tag(event: &CacheEvent) -> &'static str {
  match event {
    CacheEvent::Loading => "loading",
    CacheEvent::Status { .. } => "status",
    CacheEvent::Redraw { .. } => "redraw",
    CacheEvent::Ready => "ready",
    CacheEvent::Done => "done",
    CacheEvent::Error { .. } => "error",
    CacheEvent::Redirect { .. } => "redirect",
    CacheEvent::Download { .. } => "download",
  }
}

/// Records whole events so tests can inspect error kinds, not just tags.
fn recorder() -> (EventCallback, Rc<RefCell<Vec<CacheEvent>>>) {
  let log = Rc::new(RefCell::new(Vec::new()));
  let sink = Rc::clone(&log);
  (
    callback(move |_, _, event| sink.borrow_mut().push(event.clone())),
    log,
  )
}

fn tags(log: &[CacheEvent]) -> Vec<&'static str> {
  log.iter().map(tag).collect()
}

#[test]
fn png_dimensions_are_probed_at_completion() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/dot.png",
    MemoryResource::new("image/png", TINY_PNG),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let handle = cache
    .retrieve(
      Retrieval::new("http://example.com/dot.png"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Done);
  assert_eq!(cache.content_kind(handle).unwrap(), Some(ContentKind::Image));
  assert_eq!(cache.mime_type(handle).unwrap(), Some("image/png"));
  assert_eq!(cache.dimensions(handle).unwrap(), Some((1, 1)));
  assert!(
    cache.size_estimate(handle).unwrap() >= TINY_PNG.len(),
    "the estimate must cover at least the source bytes"
  );
}

#[test]
fn corrupt_image_fails_as_malformed() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/broken.png",
    MemoryResource::new("image/png", "not actually a png".as_bytes()),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let (cb, log) = recorder();
  let handle = cache
    .retrieve(Retrieval::new("http://example.com/broken.png"), cb)
    .unwrap();
  pump(&mut cache);

  let log = log.borrow();
  assert_eq!(
    tags(&log),
    vec!["loading", "status", "error"],
    "the failure must surface at the conversion step, not before"
  );
  assert!(matches!(
    log.last(),
    Some(CacheEvent::Error {
      kind: ContentErrorKind::Malformed(ContentKind::Image),
      ..
    })
  ));
  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Error);
}

#[test]
fn svg_completes_without_a_bitmap_probe() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/icon.svg",
    MemoryResource::new(
      "image/svg+xml",
      "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"10\" height=\"10\"/>".as_bytes(),
    ),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let handle = cache
    .retrieve(
      Retrieval::new("http://example.com/icon.svg"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Done);
  assert_eq!(cache.content_kind(handle).unwrap(), Some(ContentKind::Image));
  assert_eq!(
    cache.dimensions(handle).unwrap(),
    None,
    "vector images have no intrinsic pixel dimensions"
  );
}

#[test]
fn html_title_is_extracted_while_streaming() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/page",
    MemoryResource::new(
      "text/html",
      "<html><head><title>  Front \n Page </title></head><body></body></html>".as_bytes(),
    ),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let handle = cache
    .retrieve(
      Retrieval::new("http://example.com/page"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.title(handle).unwrap(), Some("Front Page"));
}

#[test]
fn charset_prefers_mime_param_then_transport_then_context() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/param",
    MemoryResource::new("text/html; charset=utf-8", "<p>a</p>".as_bytes())
      .with_charset("ISO-8859-1"),
  );
  shared.register(
    "http://example.com/transport",
    MemoryResource::new("text/html", "<p>b</p>".as_bytes()).with_charset("ISO-8859-1"),
  );
  shared.register(
    "http://example.com/fallback",
    MemoryResource::new("text/html", "<p>c</p>".as_bytes()),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let context = ChildContext::default().with_charset("KOI8-R");
  let param = cache
    .retrieve(
      Retrieval::new("http://example.com/param").with_context(context.clone()),
      callback(|_, _, _| {}),
    )
    .unwrap();
  let transport = cache
    .retrieve(
      Retrieval::new("http://example.com/transport").with_context(context.clone()),
      callback(|_, _, _| {}),
    )
    .unwrap();
  let fallback = cache
    .retrieve(
      Retrieval::new("http://example.com/fallback").with_context(context),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.charset(param).unwrap(), Some("UTF-8"));
  assert_eq!(cache.charset(transport).unwrap(), Some("ISO-8859-1"));
  assert_eq!(cache.charset(fallback).unwrap(), Some("KOI8-R"));
}

#[test]
fn untyped_bytes_are_sniffed_from_magic() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/mystery",
    MemoryResource::untyped(TINY_PNG),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let (cb, log) = recorder();
  let handle = cache
    .retrieve(Retrieval::new("http://example.com/mystery"), cb)
    .unwrap();
  pump(&mut cache);

  // Type resolution waited for body bytes, but the event sequence is the
  // same as for a declared type.
  assert_eq!(tags(&log.borrow()), vec!["loading", "status", "ready", "done"]);
  assert_eq!(cache.mime_type(handle).unwrap(), Some("image/png"));
  assert_eq!(cache.dimensions(handle).unwrap(), Some((1, 1)));
}

#[test]
fn sniff_flag_overrides_the_declared_type() {
  let shared = SharedBackend::default();
  shared.register(
    "http://example.com/lying",
    MemoryResource::new("text/plain", TINY_PNG),
  );
  let mut cache = ContentCache::with_config(shared, test_config());

  let sniffed = cache
    .retrieve(
      Retrieval::new("http://example.com/lying").with_flags(RetrieveFlags::SNIFF_TYPE),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);
  assert_eq!(cache.content_kind(sniffed).unwrap(), Some(ContentKind::Image));
  assert_eq!(cache.mime_type(sniffed).unwrap(), Some("image/png"));

  // Without the flag the declared type is believed.
  let trusting = cache
    .retrieve(
      Retrieval::new("http://example.com/lying").with_flags(RetrieveFlags::FORCE_FETCH),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);
  assert_eq!(cache.content_kind(trusting).unwrap(), Some(ContentKind::Other));
  assert_eq!(cache.mime_type(trusting).unwrap(), Some("text/plain"));
}
