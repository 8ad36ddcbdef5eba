//! Change notification for `file:` playlists.
//!
//! Watches the playlist's parent directory rather than the file itself so an
//! atomic rename-replace (the common way encoders publish playlists) is
//! observed. Events that pile up between calls collapse into the latest one.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{PlaylistError, PlaylistResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Renamed,
    Timeout,
}

pub struct ChangeWatcher {
    rx: mpsc::Receiver<PlaylistResult<Change>>,
    watcher: Option<RecommendedWatcher>,
    closed: bool,
    failure: Option<PlaylistError>,
}

impl ChangeWatcher {
    /// Open a watcher for a `file:` URL. Non-file URLs get `None`.
    pub fn create(url: &Url) -> PlaylistResult<Option<Self>> {
        if url.scheme() != "file" {
            return Ok(None);
        }
        let path = url
            .to_file_path()
            .map_err(|_| PlaylistError::usage(format!("invalid file: URL `{url}`")))?;
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| PlaylistError::usage(format!("file: URL has no file name: `{url}`")))?
            .to_os_string();
        let parent = path.parent().unwrap_or(Path::new("/")).to_path_buf();

        let (tx, rx) = mpsc::channel(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let item = match res {
                    Ok(event) => match classify(&event, &file_name) {
                        Some(change) => Ok(change),
                        None => return,
                    },
                    Err(e) => Err(PlaylistError::Transport {
                        reason: format!("file watch error: {e}"),
                        source: None,
                        syscall: true,
                        blocking: false,
                    }),
                };
                // A full channel only means unconsumed wake-ups are queued;
                // dropping the extra event loses nothing.
                let _ = tx.try_send(item);
            },
            Config::default(),
        )
        .map_err(|e| PlaylistError::transport(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| {
                PlaylistError::transport(format!("failed to watch {}: {e}", parent.display()))
            })?;

        tracing::debug!(dir = %parent.display(), "watching playlist directory");
        Ok(Some(Self {
            rx,
            watcher: Some(watcher),
            closed: false,
            failure: None,
        }))
    }

    /// Wait for the next change, returning `Timeout` if nothing happens
    /// within `timeout`. Events accumulated since the previous call are
    /// collapsed to the most recent one.
    pub async fn next(&mut self, timeout: Option<Duration>) -> PlaylistResult<Change> {
        if self.closed {
            return Err(closed_error());
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let mut backlog = None;
        while let Ok(item) = self.rx.try_recv() {
            backlog = Some(item);
        }
        if let Some(item) = backlog {
            return self.resolve(item);
        }

        let first = match timeout {
            Some(timeout) => {
                tokio::select! {
                    item = self.rx.recv() => item,
                    _ = tokio::time::sleep(timeout) => return Ok(Change::Timeout),
                }
            }
            None => self.rx.recv().await,
        };

        let Some(mut latest) = first else {
            self.closed = true;
            return Err(closed_error());
        };
        // Collapse the rest of the burst.
        while let Ok(item) = self.rx.try_recv() {
            latest = item;
        }
        self.resolve(latest)
    }

    fn resolve(&mut self, item: PlaylistResult<Change>) -> PlaylistResult<Change> {
        match item {
            Ok(change) => Ok(change),
            Err(err) => {
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Stop watching. Subsequent `next()` calls fail.
    pub fn close(&mut self) {
        self.watcher = None;
        self.closed = true;
    }
}

fn closed_error() -> PlaylistError {
    PlaylistError::usage("change watcher closed")
}

fn classify(event: &Event, file_name: &OsString) -> Option<Change> {
    let relevant = event.paths.is_empty()
        || event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()));
    if !relevant {
        return None;
    }
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => Some(Change::Renamed),
        EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any => Some(Change::Changed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_url(path: &Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[test]
    fn non_file_urls_are_not_watched() {
        let url = Url::parse("https://example.com/index.m3u8").unwrap();
        assert!(ChangeWatcher::create(&url).unwrap().is_none());
    }

    #[tokio::test]
    async fn times_out_when_nothing_changes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.m3u8");
        std::fs::write(&target, "#EXTM3U\n").unwrap();

        let mut watcher = ChangeWatcher::create(&file_url(&target)).unwrap().unwrap();
        let change = watcher.next(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(change, Change::Timeout);
    }

    #[tokio::test]
    async fn sees_atomic_rename_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.m3u8");
        std::fs::write(&target, "#EXTM3U\n").unwrap();

        let mut watcher = ChangeWatcher::create(&file_url(&target)).unwrap().unwrap();

        let staged = dir.path().join("next.m3u8");
        std::fs::write(&staged, "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:1\n").unwrap();
        std::fs::rename(&staged, &target).unwrap();

        let change = watcher.next(Some(Duration::from_secs(5))).await.unwrap();
        assert!(matches!(change, Change::Renamed | Change::Changed));
    }

    #[tokio::test]
    async fn close_poisons_subsequent_calls() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.m3u8");
        std::fs::write(&target, "#EXTM3U\n").unwrap();

        let mut watcher = ChangeWatcher::create(&file_url(&target)).unwrap().unwrap();
        watcher.close();
        assert!(watcher.next(Some(Duration::from_millis(10))).await.is_err());
    }

    #[tokio::test]
    async fn events_between_calls_collapse_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.m3u8");
        std::fs::write(&target, "#EXTM3U\n").unwrap();

        let mut watcher = ChangeWatcher::create(&file_url(&target)).unwrap().unwrap();

        for sequence in 1..=3 {
            std::fs::write(&target, format!("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:{sequence}\n"))
                .unwrap();
        }
        // Give the backend a moment to deliver.
        tokio::time::sleep(Duration::from_millis(200)).await;

        watcher.next(Some(Duration::from_secs(5))).await.unwrap();
        // The burst is gone: the next call times out instead of replaying it.
        let change = watcher.next(Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(change, Change::Timeout);
    }
}
