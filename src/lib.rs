pub mod cache;
pub mod content;
pub mod error;
pub mod event;
pub mod fetch;
pub mod key;
pub mod metrics;

pub use cache::{
  callback, CacheConfig, CacheHandle, ContentCache, DownloadHandler, EventCallback, QueryHandler,
  Retrieval, SweepOutcome,
};
pub use content::{ContentKind, ContentStatus};
pub use error::{ContentErrorKind, Error, Result};
pub use event::{CacheEvent, DownloadHandoff, RedrawRect};
pub use fetch::{
  FetchBackend, FetchEvent, FetchFailure, FetchId, FetchQuery, FetchRequest, PostData,
  QueryResponse,
};
pub use key::{AcceptedTypes, CacheKey, ChildContext, RetrieveFlags};
pub use metrics::CacheMetrics;
