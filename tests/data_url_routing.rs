//! Data URLs and scheme routing in front of multiple backends.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use hlcache::fetch::data_url::DataUrlBackend;
use hlcache::fetch::memory::{MemoryBackend, MemoryResource};
use hlcache::fetch::router::SchemeRouter;
use hlcache::{
  callback, CacheConfig, CacheEvent, ContentCache, ContentErrorKind, ContentKind, ContentStatus,
  Error, EventCallback, Retrieval,
};

fn test_config() -> CacheConfig {
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

fn recorder() -> (EventCallback, Rc<RefCell<Vec<&'static str>>>) {
  let log = Rc::new(RefCell::new(Vec::new()));
  let sink = Rc::clone(&log);
  (
    callback(move |_, _, event| sink.borrow_mut().push(tag(event))),
    log,
  )
}

fn routed_cache() -> ContentCache {
  let mut backend = MemoryBackend::new();
  backend.register(
    "http://example.com/page",
    MemoryResource::new("text/html", "<p>net</p>".as_bytes()),
  );
  let router = SchemeRouter::new()
    .with_backend(DataUrlBackend::new())
    .with_backend(backend);
  ContentCache::with_config(router, test_config())
}

#[test]
fn data_url_loads_like_any_other_content() {
  let mut cache = routed_cache();
  let (cb, log) = recorder();
  let handle = cache
    .retrieve(Retrieval::new("data:text/html,<p>inline</p>"), cb)
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Done);
  assert_eq!(cache.content_kind(handle).unwrap(), Some(ContentKind::Html));
  assert_eq!(cache.source(handle).unwrap().unwrap(), b"<p>inline</p>");
  assert_eq!(*log.borrow(), vec!["loading", "ready", "done"]);
}

#[test]
fn percent_encoded_payloads_are_decoded() {
  let mut cache = routed_cache();
  let handle = cache
    .retrieve(
      Retrieval::new("data:text/plain,hello%20world"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.source(handle).unwrap().unwrap(), b"hello world");
  assert_eq!(cache.mime_type(handle).unwrap(), Some("text/plain"));
}

#[test]
fn base64_payloads_are_decoded() {
  let mut cache = routed_cache();
  let handle = cache
    .retrieve(
      Retrieval::new("data:text/plain;base64,aGVsbG8="),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Done);
  assert_eq!(cache.source(handle).unwrap().unwrap(), b"hello");
}

#[test]
fn omitted_media_type_defaults_to_ascii_text() {
  let mut cache = routed_cache();
  let handle = cache
    .retrieve(Retrieval::new("data:,hi"), callback(|_, _, _| {}))
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.mime_type(handle).unwrap(), Some("text/plain"));
  assert_eq!(cache.charset(handle).unwrap(), Some("US-ASCII"));
  assert_eq!(cache.source(handle).unwrap().unwrap(), b"hi");
}

#[test]
fn malformed_data_url_fails_through_the_event_stream() {
  let mut cache = routed_cache();
  let seen = Rc::new(RefCell::new(None));
  let sink = Rc::clone(&seen);
  let handle = cache
    .retrieve(
      // No comma separating the media type from the payload.
      Retrieval::new("data:text/plain%3bnopayload"),
      callback(move |_, _, event| {
        if let CacheEvent::Error { kind, .. } = event {
          *sink.borrow_mut() = Some(kind.clone());
        }
      }),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(handle).unwrap(), ContentStatus::Error);
  assert!(matches!(
    seen.borrow().as_ref(),
    Some(ContentErrorKind::BadUrl(reason)) if reason.contains("comma")
  ));
}

#[test]
fn unknown_schemes_are_rejected_synchronously() {
  let mut cache = routed_cache();
  let result = cache.retrieve(
    Retrieval::new("ftp://example.com/file"),
    callback(|_, _, _| {}),
  );
  assert!(matches!(result, Err(Error::NoFetchHandler(s)) if s == "ftp"));
  assert_eq!(cache.entry_count(), 0);
}

#[test]
fn both_backends_serve_concurrently_without_id_collisions() {
  let mut cache = routed_cache();
  let net = cache
    .retrieve(
      Retrieval::new("http://example.com/page"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  let inline = cache
    .retrieve(
      Retrieval::new("data:text/plain,inline"),
      callback(|_, _, _| {}),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(cache.status(net).unwrap(), ContentStatus::Done);
  assert_eq!(cache.status(inline).unwrap(), ContentStatus::Done);
  assert_eq!(cache.source(net).unwrap().unwrap(), b"<p>net</p>");
  assert_eq!(cache.source(inline).unwrap().unwrap(), b"inline");
}
