//! Pull-based snapshot stream over a [`PlaylistFetcher`].
//!
//! The reader holds no buffer: a refresh is only started when the consumer
//! asks for the next snapshot, so the engine can never run ahead of
//! consumption. The stream closes after the first snapshot of a non-live
//! playlist or the first fatal error.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use url::Url;

use crate::config::{ReaderOptions, UpdateOptions};
use crate::error::{PlaylistError, PlaylistResult};
use crate::fetch::{ContentFetcher, DefaultFetcher};
use crate::fetcher::{PlaylistFetcher, PlaylistSnapshot};

enum ReaderState {
    Initial,
    Live,
    Closed,
}

pub struct PlaylistReader {
    fetcher: Arc<PlaylistFetcher>,
    max_stall_time: Option<Duration>,
    state: ReaderState,
}

impl PlaylistReader {
    /// Build a reader for a URL with the default content fetcher.
    pub fn new(url: Url, options: ReaderOptions) -> PlaylistResult<Self> {
        if !DefaultFetcher::supports(&url) {
            return Err(PlaylistError::usage(format!(
                "unsupported URL scheme `{}`",
                url.scheme()
            )));
        }
        let content: Arc<dyn ContentFetcher> = Arc::new(DefaultFetcher::new()?);
        let fetcher = Arc::new(PlaylistFetcher::new(url, content, options.fetcher));
        Ok(Self::with_fetcher(fetcher, options.max_stall_time))
    }

    /// Wrap an existing fetcher.
    pub fn with_fetcher(fetcher: Arc<PlaylistFetcher>, max_stall_time: Option<Duration>) -> Self {
        Self {
            fetcher,
            max_stall_time,
            state: ReaderState::Initial,
        }
    }

    pub fn fetcher(&self) -> &Arc<PlaylistFetcher> {
        &self.fetcher
    }

    /// Pull the next snapshot. `None` marks end-of-stream; an `Err` item is
    /// always the last one.
    pub async fn next(&mut self) -> Option<PlaylistResult<PlaylistSnapshot>> {
        let result = match self.state {
            ReaderState::Closed => return None,
            ReaderState::Initial => self.fetcher.index().await,
            ReaderState::Live => {
                self.fetcher
                    .update(UpdateOptions {
                        timeout: self.max_stall_time,
                    })
                    .await
            }
        };

        match result {
            Ok(snapshot) => {
                self.state = if self.fetcher.can_update() {
                    ReaderState::Live
                } else {
                    ReaderState::Closed
                };
                Some(Ok(snapshot))
            }
            Err(err) => {
                self.state = ReaderState::Closed;
                Some(Err(err))
            }
        }
    }

    /// Cancel the stream and the underlying fetcher.
    pub fn cancel(&mut self, reason: Option<PlaylistError>) {
        self.state = ReaderState::Closed;
        self.fetcher.cancel(reason);
    }

    /// Adapt the reader into a `futures::Stream` of snapshots.
    pub fn into_stream(mut self) -> impl Stream<Item = PlaylistResult<PlaylistSnapshot>> {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}

impl Drop for PlaylistReader {
    fn drop(&mut self) {
        self.fetcher.cancel(None);
    }
}
