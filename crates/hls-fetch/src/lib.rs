//! HLS playlist polling engine.
//!
//! Given a manifest URL this crate fetches the playlist, decides whether it
//! is a master or media playlist, and, for live/event media playlists, keeps
//! refreshing it at the cadence HLS requires, including RFC 8216bis
//! low-latency blocking reloads. Every successful refresh becomes an
//! immutable [`PlaylistSnapshot`]; the [`PlaylistReader`] exposes those as a
//! lazy, zero-buffered pull stream.
//!
//! ```no_run
//! use hls_fetch::{create_reader, ReaderOptions};
//!
//! # async fn run() -> Result<(), hls_fetch::PlaylistError> {
//! let url = "https://example.com/live/index.m3u8".parse().unwrap();
//! let mut reader = create_reader(url, ReaderOptions::default())?;
//! while let Some(snapshot) = reader.next().await {
//!     let snapshot = snapshot?;
//!     println!("head msn: {:?}", snapshot.last_msn(true));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod fetcher;
pub mod manifest;
pub mod parsed;
pub mod reader;
pub mod watcher;

pub use config::{FetcherOptions, HttpConfig, ProblemCallback, ReaderOptions, UpdateOptions};
pub use error::{PlaylistError, PlaylistResult};
pub use fetch::{
    ByteRange, ContentFetcher, DefaultFetcher, DownloadTracker, FetchMeta, FetchOptions,
    FetchResult, FileFetcher, HttpFetcher, TrackerInfo,
};
pub use fetcher::{PlaylistFetcher, PlaylistIndex, PlaylistSnapshot, SnapshotMeta};
pub use manifest::{
    MediaManifest, ParsedManifest, Part, PlaylistKind, PlaylistType, Segment, ServerControl,
};
pub use parsed::{ParsedPlaylist, PlaylistHead, PreloadHint, PreloadHints};
pub use reader::PlaylistReader;
pub use watcher::{Change, ChangeWatcher};

use url::Url;

/// Convenience constructor: a reader over the default content fetcher.
pub fn create_reader(url: Url, options: ReaderOptions) -> PlaylistResult<PlaylistReader> {
    PlaylistReader::new(url, options)
}
