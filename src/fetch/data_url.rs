//! Inline `data:` URL backend.
//!
//! Decodes RFC 2397 data URLs and serves them through the fetch event
//! contract. The payload is decoded eagerly at `start`; delivery happens on
//! the next `poll`, where a well-formed URL completes in a single call
//! (headers, one data chunk, finished). Malformed URLs are reported as an
//! asynchronous fetch failure rather than a start error, so callers see the
//! same error path a failing network fetch would take.

use base64::Engine;
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::{FetchBackend, FetchEvent, FetchFailure, FetchId, FetchRequest, QueryResponse};

/// MIME type assumed when a data URL declares none.
const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

#[derive(Debug)]
struct PendingData {
  id: FetchId,
  decoded: std::result::Result<DecodedData, FetchFailure>,
}

#[derive(Debug)]
struct DecodedData {
  mime: String,
  bytes: Vec<u8>,
}

/// Fetch backend for `data:` URLs.
#[derive(Debug, Default)]
pub struct DataUrlBackend {
  pending: Vec<PendingData>,
  next_id: u64,
}

impl DataUrlBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

impl FetchBackend for DataUrlBackend {
  fn supports_scheme(&self, scheme: &str) -> bool {
    scheme == "data"
  }

  fn start(&mut self, request: FetchRequest) -> Result<FetchId> {
    if request.url.scheme() != "data" {
      return Err(Error::NoFetchHandler(request.url.scheme().to_string()));
    }
    let id = FetchId::new(self.next_id);
    self.next_id += 1;
    self.pending.push(PendingData {
      id,
      decoded: decode_data_url(&request.url),
    });
    Ok(id)
  }

  fn abort(&mut self, id: FetchId) {
    self.pending.retain(|pending| pending.id != id);
  }

  fn answer_query(&mut self, _id: FetchId, _response: QueryResponse) {
    // data: URLs never raise queries.
  }

  fn poll(&mut self, sink: &mut dyn FnMut(FetchId, FetchEvent)) {
    for pending in self.pending.drain(..) {
      match pending.decoded {
        Ok(data) => {
          sink(
            pending.id,
            FetchEvent::Headers {
              mime: Some(data.mime),
              charset: None,
              length: Some(data.bytes.len() as u64),
            },
          );
          if !data.bytes.is_empty() {
            sink(pending.id, FetchEvent::Data(data.bytes));
          }
          sink(pending.id, FetchEvent::Finished);
        }
        Err(failure) => {
          sink(pending.id, FetchEvent::Failed { failure });
        }
      }
    }
  }
}

/// Decodes a `data:` URL into its media type and payload bytes.
fn decode_data_url(url: &Url) -> std::result::Result<DecodedData, FetchFailure> {
  let rest = &url.as_str()["data:".len()..];
  let comma_pos = rest
    .find(',')
    .ok_or_else(|| FetchFailure::Malformed("missing comma in data URL".to_string()))?;

  let header = &rest[..comma_pos];
  let data = &rest[comma_pos + 1..];

  // Header grammar: [mediatype][;base64]
  let is_base64 = header
    .split(';')
    .any(|segment| segment.eq_ignore_ascii_case("base64"));
  let media_type = {
    let segments: Vec<&str> = header
      .split(';')
      .filter(|segment| !segment.eq_ignore_ascii_case("base64"))
      .collect();
    let leading = segments.first().copied().unwrap_or("");
    if leading.contains('/') {
      segments.join(";")
    } else {
      DEFAULT_MEDIA_TYPE.to_string()
    }
  };

  let bytes = if is_base64 {
    // Padding and other base64 characters may themselves arrive
    // percent-encoded, so unescape before decoding.
    let unescaped = percent_decode(data.trim())?;
    base64::engine::general_purpose::STANDARD
      .decode(unescaped)
      .map_err(|e| FetchFailure::Malformed(format!("invalid base64: {}", e)))?
  } else {
    percent_decode(data)?
  };

  Ok(DecodedData {
    mime: media_type,
    bytes,
  })
}

/// Percent-decode a string to bytes. Unlike form decoding, `+` stays a
/// literal plus inside data URLs.
fn percent_decode(input: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
  let mut out = Vec::with_capacity(input.len());
  let bytes = input.as_bytes();
  let mut i = 0;

  while i < bytes.len() {
    if bytes[i] == b'%' {
      if i + 2 >= bytes.len() {
        return Err(FetchFailure::Malformed(
          "incomplete percent-escape".to_string(),
        ));
      }
      let hi = (bytes[i + 1] as char).to_digit(16);
      let lo = (bytes[i + 2] as char).to_digit(16);
      match (hi, lo) {
        (Some(hi), Some(lo)) => {
          out.push(((hi << 4) | lo) as u8);
          i += 3;
        }
        _ => {
          return Err(FetchFailure::Malformed(
            "invalid percent-escape".to_string(),
          ))
        }
      }
    } else {
      out.push(bytes[i]);
      i += 1;
    }
  }

  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn run(url: &str) -> Vec<FetchEvent> {
    let mut backend = DataUrlBackend::new();
    backend
      .start(FetchRequest::new(Url::parse(url).unwrap()))
      .unwrap();
    let mut events = Vec::new();
    backend.poll(&mut |_, event| events.push(event));
    events
  }

  #[test]
  fn test_base64_payload() {
    // "hello" in base64.
    let events = run("data:image/png;base64,aGVsbG8=");
    assert!(matches!(&events[0], FetchEvent::Headers { mime: Some(m), .. } if m == "image/png"));
    assert!(matches!(&events[1], FetchEvent::Data(d) if d == b"hello"));
    assert!(matches!(events[2], FetchEvent::Finished));
  }

  #[test]
  fn test_percent_encoded_payload() {
    let events = run("data:text/plain,hello%20world");
    assert!(matches!(&events[1], FetchEvent::Data(d) if d == b"hello world"));
  }

  #[test]
  fn test_plus_stays_literal() {
    let events = run("data:text/plain,a+b");
    assert!(matches!(&events[1], FetchEvent::Data(d) if d == b"a+b"));
  }

  #[test]
  fn test_missing_mediatype_defaults() {
    let events = run("data:,hello");
    assert!(matches!(
      &events[0],
      FetchEvent::Headers { mime: Some(m), .. } if m == DEFAULT_MEDIA_TYPE
    ));
  }

  #[test]
  fn test_mediatype_with_charset_is_preserved() {
    let events = run("data:text/html;charset=utf-8,<p>hi</p>");
    assert!(matches!(
      &events[0],
      FetchEvent::Headers { mime: Some(m), .. } if m == "text/html;charset=utf-8"
    ));
  }

  #[test]
  fn test_missing_comma_fails_asynchronously() {
    let events = run("data:text/plainnocomma");
    assert_eq!(events.len(), 1);
    assert!(matches!(
      &events[0],
      FetchEvent::Failed {
        failure: FetchFailure::Malformed(_)
      }
    ));
  }

  #[test]
  fn test_percent_encoded_base64_padding() {
    let events = run("data:text/plain;base64,aGVsbG8%3D");
    assert!(matches!(&events[1], FetchEvent::Data(d) if d == b"hello"));
  }

  #[test]
  fn test_invalid_base64_fails() {
    let events = run("data:text/plain;base64,!!!");
    assert!(matches!(
      &events[0],
      FetchEvent::Failed {
        failure: FetchFailure::Malformed(_)
      }
    ));
  }

  #[test]
  fn test_empty_payload_skips_data_event() {
    let events = run("data:text/plain,");
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], FetchEvent::Headers { .. }));
    assert!(matches!(events[1], FetchEvent::Finished));
  }

  #[test]
  fn test_non_data_scheme_rejected() {
    let mut backend = DataUrlBackend::new();
    let result = backend.start(FetchRequest::new(
      Url::parse("http://example.com/").unwrap(),
    ));
    assert!(matches!(result, Err(Error::NoFetchHandler(_))));
  }
}
