//! Value types carried beside cached bytes
//!
//! Fetch payloads are a sum type over buffered bytes and readable streams.
//! A payload owns its stream: dropping the payload closes the underlying
//! file or connection. Buffering a stream into bytes is an explicit,
//! one-way operation used only when replication needs the full body.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CacheOpResult;

/// Small attributes carried beside the artifact bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// MIME type of the artifact, when known
    pub content_type: Option<String>,
    /// Exact byte length, when known ahead of the body
    pub content_length: Option<u64>,
}

impl EntryMetadata {
    /// Metadata with only a content type.
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            content_length: None,
        }
    }
}

/// Boxed readable body stream
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

/// Artifact body: fully buffered or streaming
pub enum FetchBody {
    /// Body buffered in memory
    Bytes(Bytes),
    /// Body streamed from the tier; owned by the payload
    Stream(BodyStream),
}

impl fmt::Debug for FetchBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Result of a successful tier fetch: a body plus its metadata
#[derive(Debug)]
pub struct FetchPayload {
    /// The artifact body
    pub body: FetchBody,
    /// Attributes carried beside the body
    pub metadata: EntryMetadata,
}

impl FetchPayload {
    /// Payload over buffered bytes.
    pub fn from_bytes(bytes: Bytes, metadata: EntryMetadata) -> Self {
        Self {
            body: FetchBody::Bytes(bytes),
            metadata,
        }
    }

    /// Payload over a stream the tier handed off.
    pub fn from_stream(stream: BodyStream, metadata: EntryMetadata) -> Self {
        Self {
            body: FetchBody::Stream(stream),
            metadata,
        }
    }

    /// Buffered bytes, if the body is not stream-shaped.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            FetchBody::Bytes(b) => Some(b),
            FetchBody::Stream(_) => None,
        }
    }

    /// Consume the payload, buffering a stream body if necessary.
    pub async fn into_bytes(self) -> CacheOpResult<(Bytes, EntryMetadata)> {
        match self.body {
            FetchBody::Bytes(b) => Ok((b, self.metadata)),
            FetchBody::Stream(mut stream) => {
                let capacity = self
                    .metadata
                    .content_length
                    .map(|len| len as usize)
                    .unwrap_or(64 * 1024);
                let mut buf = Vec::with_capacity(capacity);
                stream.read_to_end(&mut buf).await?;
                Ok((Bytes::from(buf), self.metadata))
            }
        }
    }
}

/// Where the cascade found (or produced) the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeStatus {
    /// A total miss: the factory produced the artifact
    Created,
    /// Served from a memory-zone tier
    MemoryHit,
    /// Served from a disk-zone tier
    DiskHit,
    /// Served from a cloud-zone tier
    CloudHit,
    /// A coalesced waiter timed out before the factory finished
    Timeout,
    /// The factory failed or returned nothing
    Error,
}

impl CascadeStatus {
    /// Whether the artifact came out of a cache tier rather than the factory.
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::MemoryHit | Self::DiskHit | Self::CloudHit)
    }
}

/// Outcome returned by the cascade for one request
#[derive(Debug)]
pub struct CascadeOutcome {
    /// Where the artifact came from
    pub status: CascadeStatus,
    /// Name of the tier that served a hit, when applicable
    pub provider: Option<String>,
    /// Content type, when known
    pub content_type: Option<String>,
    /// Wall-clock time spent inside the cascade
    pub latency: Option<Duration>,
    /// The artifact body; absent for `Timeout` and `Error`
    pub body: Option<FetchBody>,
    /// Failure detail for `Error`
    pub error_detail: Option<String>,
}

impl CascadeOutcome {
    pub(crate) fn failed(status: CascadeStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            provider: None,
            content_type: None,
            latency: None,
            body: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// Event kinds emitted by the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// A tier served the request
    Hit,
    /// Every tier missed
    Miss,
    /// A store was issued to a tier (inline or queued)
    Store,
    /// The factory failed or returned nothing
    Error,
}

/// One observability event from the cascade
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// What happened
    pub kind: CacheEventKind,
    /// Tier involved, when one was
    pub provider: Option<String>,
    /// Canonical string key of the request
    pub key: String,
    /// Wall-clock latency, when measured
    pub latency: Option<Duration>,
    /// Body size in bytes, when known
    pub size_bytes: Option<u64>,
}

/// Callback receiving cascade events
pub type EventSink = Arc<dyn Fn(CacheEvent) + Send + Sync>;
