//! Content fetching: the capability interface the playlist engine polls
//! through, plus the concrete HTTP and local (`file:`/`data:`) fetchers.

pub mod agent;
pub mod http;
pub mod local;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{PlaylistError, PlaylistResult};

pub use http::HttpFetcher;
pub use local::FileFetcher;

pub type ByteStream = Pin<Box<dyn Stream<Item = PlaylistResult<Bytes>> + Send>>;

/// Inclusive byte window of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

/// Options for a single [`ContentFetcher::perform`] call.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Request only this byte window (HTTP `Range`).
    pub byterange: Option<ByteRange>,
    /// Metadata-only request, no body stream.
    pub probe: bool,
    /// Overall deadline for the request.
    pub timeout: Option<Duration>,
    /// Server-side retry budget on soft failures.
    pub retries: u8,
    /// Connection-affinity key: requests sharing a key are serialized
    /// through a single-connection agent.
    pub blocking: Option<String>,
    /// Bypass intermediate caches (`Cache-Control: no-store`).
    pub fresh: bool,
    /// Cancellation token; aborts the request and the body stream.
    pub signal: Option<CancellationToken>,
    /// Download progress observer.
    pub tracker: Option<Arc<dyn DownloadTracker>>,
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("byterange", &self.byterange)
            .field("probe", &self.probe)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("blocking", &self.blocking)
            .field("fresh", &self.fresh)
            .field("tracker", &self.tracker.is_some())
            .finish()
    }
}

/// Response metadata common to all fetcher implementations.
#[derive(Debug, Clone)]
pub struct FetchMeta {
    /// Final resolved URL, after redirects.
    pub url: Url,
    /// Lowercased MIME type, parameters stripped.
    pub mime: String,
    /// Byte size, -1 when unknown.
    pub size: i64,
    pub modified: Option<SystemTime>,
    pub etag: Option<String>,
}

/// Context handed to [`DownloadTracker::start`].
#[derive(Debug, Clone)]
pub struct TrackerInfo {
    pub byterange: Option<ByteRange>,
    pub blocking: bool,
}

/// Download-progress observer.
///
/// A failing `start` disables tracking for that request only; `advance` with
/// zero bytes signals that the response headers arrived.
pub trait DownloadTracker: Send + Sync {
    fn start(&self, url: &Url, info: &TrackerInfo) -> PlaylistResult<u64>;
    fn advance(&self, token: u64, bytes: u64);
    fn finish(&self, token: u64, err: Option<&PlaylistError>);
}

#[derive(Debug, Clone)]
enum CompletionState {
    Pending,
    Done,
    Failed(PlaylistError),
}

/// Byte stream wrapper that feeds the tracker and resolves the `completed`
/// future on end-of-stream or error. Holds the blocking-agent gate (if any)
/// for the lifetime of the body.
struct ProgressStream {
    inner: ByteStream,
    tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
    done: watch::Sender<CompletionState>,
    _gate: Option<OwnedMutexGuard<()>>,
    finished: bool,
}

impl Stream for ProgressStream {
    type Item = PlaylistResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some((tracker, token)) = &this.tracker {
                    tracker.advance(*token, chunk.len() as u64);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                if !this.finished {
                    this.finished = true;
                    if let Some((tracker, token)) = &this.tracker {
                        tracker.finish(*token, Some(&err));
                    }
                    let _ = this.done.send(CompletionState::Failed(err.clone()));
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    if let Some((tracker, token)) = &this.tracker {
                        tracker.finish(*token, None);
                    }
                    let _ = this.done.send(CompletionState::Done);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        // A dropped body is a cancel, not an error.
        if !self.finished {
            if let Some((tracker, token)) = &self.tracker {
                tracker.finish(*token, None);
            }
            let _ = self.done.send(CompletionState::Done);
        }
    }
}

/// Result of a successful fetch: metadata plus an optional body stream.
pub struct FetchResult {
    pub meta: FetchMeta,
    stream: Option<ProgressStream>,
    completion: watch::Receiver<CompletionState>,
}

impl FetchResult {
    /// Assemble a result around a raw byte stream.
    pub fn new(
        meta: FetchMeta,
        stream: Option<ByteStream>,
        tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
        gate: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        let initial = if stream.is_some() {
            CompletionState::Pending
        } else {
            // No body to deliver: the request is already complete.
            if let Some((tracker, token)) = &tracker {
                tracker.finish(*token, None);
            }
            CompletionState::Done
        };
        let (done_tx, done_rx) = watch::channel(initial);
        let stream = stream.map(|inner| ProgressStream {
            inner,
            tracker,
            done: done_tx,
            _gate: gate,
            finished: false,
        });
        Self {
            meta,
            stream,
            completion: done_rx,
        }
    }

    /// A future resolving once the body stream has been fully delivered or
    /// failed. Detached from `self`, so it can be held while the stream is
    /// consumed.
    pub fn completed(&self) -> impl Future<Output = PlaylistResult<()>> + Send + use<> {
        let mut rx = self.completion.clone();
        async move {
            loop {
                match rx.borrow_and_update().clone() {
                    CompletionState::Done => return Ok(()),
                    CompletionState::Failed(err) => return Err(err),
                    CompletionState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    // Stream dropped while pending: treated as a clean cancel.
                    return Ok(());
                }
            }
        }
    }

    /// Take the body stream, if one was requested.
    pub fn into_stream(mut self) -> Option<impl Stream<Item = PlaylistResult<Bytes>> + Send> {
        self.stream.take()
    }

    /// Drain the body and return it as UTF-8 text.
    pub async fn consume_utf8(mut self) -> PlaylistResult<String> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(String::new());
        };
        let mut buf: Vec<u8> = Vec::with_capacity(self.meta.size.max(0) as usize);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        String::from_utf8(buf)
            .map_err(|e| PlaylistError::parse(format!("playlist is not valid UTF-8: {e}")))
    }

    /// Drop the body stream without raising an error.
    pub fn cancel(mut self, _reason: Option<PlaylistError>) {
        drop(self.stream.take());
    }
}

impl fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResult")
            .field("meta", &self.meta)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// Capability interface over content retrieval for one URL scheme family.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn perform(&self, url: &Url, options: FetchOptions) -> PlaylistResult<FetchResult>;
}

/// Scheme-dispatching fetcher covering `http(s)`, `file` and `data` URLs.
pub struct DefaultFetcher {
    http: HttpFetcher,
    local: FileFetcher,
}

impl DefaultFetcher {
    pub fn new() -> PlaylistResult<Self> {
        Self::with_config(crate::config::HttpConfig::default())
    }

    pub fn with_config(config: crate::config::HttpConfig) -> PlaylistResult<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            local: FileFetcher::new(),
        })
    }

    pub fn supports(url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https" | "file" | "data")
    }
}

#[async_trait]
impl ContentFetcher for DefaultFetcher {
    async fn perform(&self, url: &Url, options: FetchOptions) -> PlaylistResult<FetchResult> {
        match url.scheme() {
            "http" | "https" => self.http.perform(url, options).await,
            "file" | "data" => self.local.perform(url, options).await,
            other => Err(PlaylistError::usage(format!(
                "unsupported URL scheme `{other}`"
            ))),
        }
    }
}

/// Start the tracker for a request, tolerating a failing hook.
pub(crate) fn start_tracker(
    tracker: Option<&Arc<dyn DownloadTracker>>,
    url: &Url,
    options: &FetchOptions,
) -> Option<(Arc<dyn DownloadTracker>, u64)> {
    let tracker = tracker?;
    let info = TrackerInfo {
        byterange: options.byterange,
        blocking: options.blocking.is_some(),
    };
    match tracker.start(url, &info) {
        Ok(token) => Some((Arc::clone(tracker), token)),
        Err(err) => {
            tracing::debug!(url = %url, error = %err, "download tracker rejected request; disabled");
            None
        }
    }
}
