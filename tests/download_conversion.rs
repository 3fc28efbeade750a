//! Converting unacceptable retrievals into downloads.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use hlcache::fetch::memory::{MemoryBackend, MemoryResource, SharedBackend};
use hlcache::{
  callback, AcceptedTypes, CacheConfig, CacheEvent, ContentCache, ContentErrorKind, Error,
  EventCallback, FetchEvent, Retrieval, RetrieveFlags,
};

const PAGE: &str = "http://example.com/report";
const BODY: &[u8] = b"<html><body>quarterly report</body></html>";

fn pump(cache: &mut ContentCache) {
  for _ in 0..64 {
    cache.poll();
  }
}

/// Collects the raw fetch events the download side receives.
type DownloadLog = Rc<RefCell<Vec<(u64, String)>>>;

fn download_config() -> (CacheConfig, DownloadLog) {
  let log: DownloadLog = Rc::new(RefCell::new(Vec::new()));
  let sink = Rc::clone(&log);
  let config = CacheConfig::default()
    .with_sweep_interval(Duration::from_secs(3600))
    .with_download_handler(move |id, event| {
      let tag = match event {
        FetchEvent::Headers { .. } => "headers".to_string(),
        FetchEvent::Data(bytes) => format!("data:{}", bytes.len()),
        FetchEvent::Redirect { .. } => "redirect".to_string(),
        FetchEvent::Query(_) => "query".to_string(),
        FetchEvent::Finished => "finished".to_string(),
        FetchEvent::Failed { .. } => "failed".to_string(),
      };
      sink.borrow_mut().push((id.raw(), tag));
    });
  (config, log)
}

fn image_only_download() -> Retrieval {
  Retrieval::new(PAGE)
    .with_accept(AcceptedTypes::IMAGE)
    .with_flags(RetrieveFlags::MAY_DOWNLOAD)
}

#[test]
fn unacceptable_content_becomes_a_download() {
  let mut backend = MemoryBackend::new();
  backend.register(PAGE, MemoryResource::new("text/html", BODY));
  let (config, downloads) = download_config();
  let mut cache = ContentCache::with_config(backend, config);

  let seen = Rc::new(RefCell::new(None));
  let sink = Rc::clone(&seen);
  let handle = cache
    .retrieve(
      image_only_download(),
      callback(move |_, _, event| {
        if let CacheEvent::Download { handoff } = event {
          *sink.borrow_mut() = Some(handoff.clone());
        }
      }),
    )
    .unwrap();
  pump(&mut cache);

  let handoff = seen.borrow().clone().expect("a download event must arrive");
  assert_eq!(handoff.mime, "text/html");
  assert_eq!(handoff.url.as_str(), PAGE);

  // The handle was deregistered as part of the hand-off.
  assert_eq!(cache.status(handle), Err(Error::StaleHandle));

  // The download side received the rest of the fetch under the handed-off id.
  let log = downloads.borrow();
  assert_eq!(log.len(), 2);
  assert_eq!(log[0], (handoff.fetch.raw(), format!("data:{}", BODY.len())));
  assert_eq!(log[1], (handoff.fetch.raw(), "finished".to_string()));
}

#[test]
fn download_husk_is_swept_away() {
  let mut backend = MemoryBackend::new();
  backend.register(PAGE, MemoryResource::new("text/html", BODY));
  let (config, _downloads) = download_config();
  let mut cache = ContentCache::with_config(backend, config);
  cache.retrieve(image_only_download(), callback(|_, _, _| {})).unwrap();
  pump(&mut cache);

  assert_eq!(cache.entry_count(), 1, "the husk lingers until a sweep");
  let outcome = cache.sweep_now();
  assert_eq!(outcome.evicted, 1);
  assert_eq!(cache.entry_count(), 0);
}

#[test]
fn only_the_first_sharer_gets_the_download() {
  let mut backend = MemoryBackend::new();
  backend.register(PAGE, MemoryResource::new("text/html", BODY));
  let (config, _downloads) = download_config();
  let mut cache = ContentCache::with_config(backend, config);

  let first_saw = Rc::new(RefCell::new(Vec::new()));
  let sink_a = Rc::clone(&first_saw);
  cache
    .retrieve(
      image_only_download(),
      callback(move |_, _, event| {
        sink_a.borrow_mut().push(matches!(event, CacheEvent::Download { .. }));
      }),
    )
    .unwrap();

  let second_error = Rc::new(RefCell::new(None));
  let sink_b = Rc::clone(&second_error);
  cache
    .retrieve(
      image_only_download(),
      callback(move |_, _, event| {
        if let CacheEvent::Error { kind, .. } = event {
          *sink_b.borrow_mut() = Some(kind.clone());
        }
      }),
    )
    .unwrap();
  pump(&mut cache);

  assert_eq!(*first_saw.borrow(), vec![true], "one download event, nothing else");
  assert!(
    matches!(
      second_error.borrow().as_ref(),
      Some(ContentErrorKind::NotAcceptable(mime)) if mime == "text/html"
    ),
    "the fetch can only be handed over once, so the second sharer fails"
  );
}

#[test]
fn sniffed_leading_bytes_are_forwarded_to_the_download() {
  let mut backend = MemoryBackend::new();
  // No declared type: resolution waits for body bytes and sniffs html.
  backend.register(PAGE, MemoryResource::untyped(BODY));
  let (config, downloads) = download_config();
  let mut cache = ContentCache::with_config(backend, config);
  cache.retrieve(image_only_download(), callback(|_, _, _| {})).unwrap();
  pump(&mut cache);

  let log = downloads.borrow();
  assert_eq!(
    log.first().map(|(_, tag)| tag.as_str()),
    Some(format!("data:{}", BODY.len()).as_str()),
    "the chunk consumed for sniffing belongs to the download"
  );
  assert_eq!(log.last().map(|(_, tag)| tag.as_str()), Some("finished"));
}

#[test]
fn without_the_flag_unacceptable_content_fails() {
  let mut backend = MemoryBackend::new();
  backend.register(PAGE, MemoryResource::new("text/html", BODY));
  let (config, downloads) = download_config();
  let mut cache = ContentCache::with_config(backend, config);

  let seen = Rc::new(RefCell::new(None));
  let sink = Rc::clone(&seen);
  cache
    .retrieve(
      Retrieval::new(PAGE).with_accept(AcceptedTypes::IMAGE),
      callback(move |_, _, event| {
        if let CacheEvent::Error { kind, .. } = event {
          *sink.borrow_mut() = Some(kind.clone());
        }
      }),
    )
    .unwrap();
  pump(&mut cache);

  assert!(matches!(
    seen.borrow().as_ref(),
    Some(ContentErrorKind::NotAcceptable(_))
  ));
  assert!(downloads.borrow().is_empty(), "no hand-off without the flag");
}

#[test]
fn without_a_handler_the_flag_is_inert() {
  let mut backend = MemoryBackend::new();
  backend.register(PAGE, MemoryResource::new("text/html", BODY));
  let mut cache = ContentCache::with_config(
    backend,
    CacheConfig::default().with_sweep_interval(Duration::from_secs(3600)),
  );

  let seen = Rc::new(RefCell::new(None));
  let sink = Rc::clone(&seen);
  cache
    .retrieve(
      image_only_download(),
      callback(move |_, _, event| {
        if let CacheEvent::Error { kind, .. } = event {
          *sink.borrow_mut() = Some(kind.clone());
        }
      }),
    )
    .unwrap();
  pump(&mut cache);

  assert!(
    matches!(seen.borrow().as_ref(), Some(ContentErrorKind::NotAcceptable(_))),
    "downloads need somewhere to go; without a handler the retrieval fails"
  );
}

#[test]
fn downloads_in_flight_are_aborted_at_finalise() {
  let shared = SharedBackend::default();
  shared.register(
    PAGE,
    MemoryResource::new("text/html", vec![b'x'; 64]).with_chunk_size(1),
  );
  let (config, downloads) = download_config();
  let mut cache = ContentCache::with_config(shared.clone(), config);
  cache.retrieve(image_only_download(), callback(|_, _, _| {})).unwrap();
  // Headers arrive and the hand-off happens; the body is still streaming.
  cache.poll();
  cache.poll();
  assert!(shared.active_count() > 0);

  cache.finalise();
  assert_eq!(shared.active_count(), 0, "finalise must abort handed-off fetches");
  assert_eq!(shared.abort_count(), 1);
  // Whatever trickled through before finalise, nothing arrives after.
  let count = downloads.borrow().len();
  pump(&mut cache);
  assert_eq!(downloads.borrow().len(), count);
}
