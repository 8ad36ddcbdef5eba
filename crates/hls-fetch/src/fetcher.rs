//! The playlist fetcher state machine.
//!
//! One fetcher owns one playlist URL. `index()` performs the initial fetch
//! and classification; for live media playlists, `update()` runs the refresh
//! loop until the head moves: it schedules polls from the target/part
//! duration, switches to blocking reloads when the server allows them,
//! enforces head monotonicity, recovers from transient failures, and wakes
//! early on file-change notifications for `file:` sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{FetcherOptions, UpdateOptions};
use crate::error::{PlaylistError, PlaylistResult};
use crate::fetch::{ContentFetcher, FetchMeta, FetchOptions};
use crate::manifest::{self, MediaManifest, ParseOptions, ParsedManifest, PlaylistKind};
use crate::parsed::{ParsedPlaylist, PlaylistHead};
use crate::watcher::ChangeWatcher;

/// MIME types a playlist response may carry. URLs ending in `.m3u8`/`.m3u`
/// are accepted regardless.
const VALID_MIME_TYPES: [&str; 3] = [
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
];

/// Floor between retry iterations of the update loop.
const RETRY_FLOOR: Duration = Duration::from_millis(100);

/// The parsed manifest held by a snapshot.
#[derive(Debug, Clone)]
pub enum PlaylistIndex {
    Master(Arc<m3u8_rs::MasterPlaylist>),
    Media(Arc<MediaManifest>),
}

impl PlaylistIndex {
    pub fn kind(&self) -> PlaylistKind {
        match self {
            Self::Master(_) => PlaylistKind::Master,
            Self::Media(_) => PlaylistKind::Media,
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            Self::Master(_) => false,
            Self::Media(manifest) => manifest.is_live(),
        }
    }

    pub fn as_media(&self) -> Option<&Arc<MediaManifest>> {
        match self {
            Self::Media(manifest) => Some(manifest),
            Self::Master(_) => None,
        }
    }

    pub fn as_master(&self) -> Option<&Arc<m3u8_rs::MasterPlaylist>> {
        match self {
            Self::Master(playlist) => Some(playlist),
            Self::Media(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    /// Resolved base URL with any `_HLS_*` blocking parameters stripped.
    pub url: Url,
    /// Wall-clock instant the refresh completed.
    pub updated: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
}

/// One immutable delivery unit per successful refresh.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    pub index: PlaylistIndex,
    /// Derived view, present for media playlists. Shares the manifest with
    /// `index` (after any low-latency strip).
    pub playlist: Option<ParsedPlaylist>,
    pub meta: SnapshotMeta,
}

impl PlaylistSnapshot {
    pub fn last_msn(&self, include_partial: bool) -> Option<i64> {
        self.index
            .as_media()
            .map(|manifest| manifest.last_msn(include_partial))
    }
}

struct FetcherState {
    /// Memoized outcome of the first `index()` call.
    index_result: Option<PlaylistResult<PlaylistSnapshot>>,
    kind: Option<PlaylistKind>,
    playlist: Option<ParsedPlaylist>,
    snapshot: Option<PlaylistSnapshot>,
    updated_at: Option<Instant>,
    /// Consecutive backward head jumps rejected so far.
    rejected: u32,
}

struct InstallOutcome {
    snapshot: PlaylistSnapshot,
    changed: bool,
}

pub struct PlaylistFetcher {
    url: Url,
    fetcher: Arc<dyn ContentFetcher>,
    options: FetcherOptions,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<PlaylistError>>,
    state: Mutex<FetcherState>,
    index_gate: tokio::sync::Mutex<()>,
    update_busy: AtomicBool,
    watcher: tokio::sync::Mutex<Option<ChangeWatcher>>,
}

impl PlaylistFetcher {
    pub fn new(url: Url, fetcher: Arc<dyn ContentFetcher>, options: FetcherOptions) -> Self {
        Self {
            url,
            fetcher,
            options,
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            state: Mutex::new(FetcherState {
                index_result: None,
                kind: None,
                playlist: None,
                snapshot: None,
                updated_at: None,
                rejected: 0,
            }),
            index_gate: tokio::sync::Mutex::new(()),
            update_busy: AtomicBool::new(false),
            watcher: tokio::sync::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch and classify the playlist. Idempotent: the first call performs
    /// the fetch, later calls return the same settled outcome.
    pub async fn index(&self) -> PlaylistResult<PlaylistSnapshot> {
        let _gate = self.index_gate.lock().await;
        if let Some(result) = self.state.lock().expect("state poisoned").index_result.clone() {
            return result;
        }

        let result = self.run_guarded(self.fetch_initial()).await;
        self.state.lock().expect("state poisoned").index_result = Some(result.clone());
        if !self.can_update() {
            self.release_watcher().await;
        }
        result
    }

    /// Refresh the playlist until its head moves. Fails synchronously when
    /// the initial index is missing, another update is running, or the
    /// playlist can no longer be updated.
    pub async fn update(&self, options: UpdateOptions) -> PlaylistResult<PlaylistSnapshot> {
        {
            let state = self.state.lock().expect("state poisoned");
            if !matches!(state.index_result, Some(Ok(_))) {
                return Err(PlaylistError::usage(
                    "An initial index() must have been successfully fetched",
                ));
            }
        }
        if self.update_busy.swap(true, Ordering::SeqCst) {
            return Err(PlaylistError::usage("An update is already being fetched"));
        }
        let _busy = BusyGuard(&self.update_busy);

        if !self.can_update() {
            return Err(if self.cancel.is_cancelled() {
                self.cancel_error()
            } else {
                PlaylistError::usage("Playlist cannot be updated")
            });
        }
        if self.url.scheme() == "data" {
            return Err(PlaylistError::usage("data: uri cannot be updated"));
        }

        let result = match options.timeout {
            Some(stall) => {
                tokio::select! {
                    biased;
                    result = self.perform_update() => result,
                    _ = tokio::time::sleep(stall) => {
                        self.cancel(Some(PlaylistError::timeout("Index update stalled")));
                        Err(self.cancel_error())
                    }
                }
            }
            None => self.perform_update().await,
        };

        if !self.can_update() {
            self.release_watcher().await;
        }
        result
    }

    /// True while the fetcher is not cancelled and the last known playlist
    /// is live.
    pub fn can_update(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .state
                .lock()
                .expect("state poisoned")
                .playlist
                .as_ref()
                .is_some_and(|p| p.is_live())
    }

    /// Cancel all pending and future work. Idempotent: the first reason
    /// sticks.
    pub fn cancel(&self, reason: Option<PlaylistError>) {
        if self.cancel.is_cancelled() {
            return;
        }
        *self.cancel_reason.lock().expect("cancel reason poisoned") = reason;
        self.cancel.cancel();
    }

    /// Last known playlist view, if any.
    pub fn playlist(&self) -> Option<ParsedPlaylist> {
        self.state.lock().expect("state poisoned").playlist.clone()
    }

    /// Distance between the last refresh and the playlist's end program
    /// date, when both are known.
    pub fn current_playout_delay(&self) -> Option<TimeDelta> {
        let state = self.state.lock().expect("state poisoned");
        let snapshot = state.snapshot.as_ref()?;
        let end = state.playlist.as_ref()?.end_date()?;
        Some(snapshot.meta.updated - end)
    }

    fn cancel_error(&self) -> PlaylistError {
        self.cancel_reason
            .lock()
            .expect("cancel reason poisoned")
            .clone()
            .unwrap_or_else(PlaylistError::aborted)
    }

    async fn run_guarded<F>(&self, work: F) -> PlaylistResult<PlaylistSnapshot>
    where
        F: Future<Output = PlaylistResult<PlaylistSnapshot>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancel_error()),
            result = work => match result {
                Err(_) if self.cancel.is_cancelled() => Err(self.cancel_error()),
                other => other,
            }
        }
    }

    async fn fetch_initial(&self) -> PlaylistResult<PlaylistSnapshot> {
        let mut url = self.url.clone();
        let mut blocking = None;
        if let Some(head) = self.options.head {
            apply_head_query(&mut url, &head);
            blocking = Some(self.url.to_string());
        }

        if self.url.scheme() == "file" {
            *self.watcher.lock().await = ChangeWatcher::create(&self.url)?;
        }

        let outcome = self.fetch_index(&url, blocking, false).await?;
        Ok(outcome.snapshot)
    }

    /// One full fetch-validate-parse-install pass.
    async fn fetch_index(
        &self,
        url: &Url,
        blocking: Option<String>,
        fresh: bool,
    ) -> PlaylistResult<InstallOutcome> {
        let is_blocking = blocking.is_some();
        let options = FetchOptions {
            timeout: Some(self.options.fetch_timeout),
            retries: self.options.fetch_retries,
            blocking,
            fresh,
            signal: Some(self.cancel.clone()),
            tracker: self.options.tracker.clone(),
            ..Default::default()
        };

        let tag = |err: PlaylistError| if is_blocking { err.tag_blocking() } else { err };

        let result = self.fetcher.perform(url, options).await.map_err(tag)?;
        if let Err(err) = validate_mime(&result.meta) {
            result.cancel(None);
            return Err(err);
        }

        let meta = result.meta.clone();
        let text = result.consume_utf8().await.map_err(tag)?;
        let parsed = manifest::parse(
            &text,
            ParseOptions {
                extensions: Some(&self.options.extensions),
            },
        )?;
        self.install(parsed, meta)
    }

    /// Store a freshly parsed manifest, enforcing kind stability and head
    /// monotonicity.
    fn install(&self, parsed: ParsedManifest, meta: FetchMeta) -> PlaylistResult<InstallOutcome> {
        let mut state = self.state.lock().expect("state poisoned");

        if let Some(kind) = state.kind
            && kind != parsed.kind()
        {
            return Err(PlaylistError::parse(
                "playlist kind changed between refreshes",
            ));
        }

        let mut stored_url = meta.url.clone();
        strip_head_query(&mut stored_url);
        let snapshot_meta = SnapshotMeta {
            url: stored_url,
            updated: Utc::now(),
            modified: meta.modified.map(DateTime::<Utc>::from),
        };

        match parsed {
            ParsedManifest::Master(master) => {
                let snapshot = PlaylistSnapshot {
                    index: PlaylistIndex::Master(Arc::new(master)),
                    playlist: None,
                    meta: snapshot_meta,
                };
                state.kind = Some(PlaylistKind::Master);
                state.snapshot = Some(snapshot.clone());
                state.updated_at = Some(Instant::now());
                Ok(InstallOutcome {
                    snapshot,
                    changed: true,
                })
            }
            ParsedManifest::Media(media) => {
                let prev_last_msn = state.playlist.as_ref().map(|prev| prev.last_msn(true));
                if let Some(prev_last_msn) = prev_last_msn
                    && media.last_msn(true) < prev_last_msn
                    && state.rejected < self.options.max_rewinds
                {
                    state.rejected += 1;
                    tracing::warn!(
                        url = %self.url,
                        new = media.last_msn(true),
                        prev = prev_last_msn,
                        rejected = state.rejected,
                        "rejected playlist update from the past"
                    );
                    return Err(PlaylistError::RejectedFromPast);
                }
                state.rejected = 0;

                let playlist = ParsedPlaylist::new(media, !self.options.low_latency);
                let changed = state
                    .playlist
                    .as_ref()
                    .is_none_or(|prev| !playlist.is_same_head(prev));
                let snapshot = PlaylistSnapshot {
                    index: PlaylistIndex::Media(Arc::clone(playlist.manifest())),
                    playlist: Some(playlist.clone()),
                    meta: snapshot_meta,
                };
                state.kind = Some(PlaylistKind::Media);
                state.playlist = Some(playlist);
                state.snapshot = Some(snapshot.clone());
                state.updated_at = Some(Instant::now());
                Ok(InstallOutcome { snapshot, changed })
            }
        }
    }

    /// The refresh loop. Retries until the head moves or a non-recoverable
    /// error escapes.
    async fn perform_update(&self) -> PlaylistResult<PlaylistSnapshot> {
        let mut was_updated = true;
        let mut was_error = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancel_error());
            }

            let (playlist, updated_at) = {
                let state = self.state.lock().expect("state poisoned");
                match (&state.playlist, state.updated_at) {
                    (Some(playlist), updated_at) => (playlist.clone(), updated_at),
                    (None, _) => {
                        return Err(PlaylistError::usage("Playlist cannot be updated"));
                    }
                }
            };

            let mut delay = self.update_interval(&playlist, was_updated && !was_error);
            if !was_error && let Some(at) = updated_at {
                delay = delay.saturating_sub(at.elapsed());
            }

            let mut url = self.url.clone();
            let mut blocking = None;
            if playlist.can_block_reload() && was_updated && !was_error {
                delay = Duration::ZERO;
                blocking = Some(self.url.to_string());
                apply_head_query(&mut url, &playlist.next_head());
            }

            if delay > Duration::ZERO {
                self.wait_for(delay).await?;
            }

            match self.fetch_index(&url, blocking.clone(), blocking.is_none()).await {
                Ok(outcome) => {
                    was_error = false;
                    if !self.can_update() || outcome.changed {
                        return Ok(outcome.snapshot);
                    }
                    // Same head. A blocking reload was asked to hold until
                    // the head advanced, so an unchanged answer means the
                    // server is not honoring its own contract.
                    if blocking.is_some() {
                        return Err(PlaylistError::StreamInconsistency);
                    }
                    tracing::debug!(url = %self.url, "playlist head unchanged; retrying");
                    was_updated = false;
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Err(self.cancel_error());
                    }
                    if !err.is_recoverable_update() {
                        return Err(err);
                    }
                    tracing::debug!(url = %self.url, error = %err, "recoverable update error");
                    self.report_problem(&err)?;
                    was_error = true;
                }
            }

            self.sleep_cancellable(RETRY_FLOOR).await?;
        }
    }

    /// Poll cadence: part target when present (and not I-frames-only), else
    /// target duration; halved when the previous poll was unchanged or the
    /// playlist has no segments.
    fn update_interval(&self, playlist: &ParsedPlaylist, updated: bool) -> Duration {
        let part_target = playlist.part_target().unwrap_or(0.0);
        let manifest = playlist.manifest();
        let mut secs = if part_target > 0.0 && !manifest.i_frames_only {
            part_target
        } else {
            manifest.target_duration
        };
        if !updated || manifest.segments.is_empty() {
            secs /= 2.0;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Wait out the poll delay, waking early on a file change.
    async fn wait_for(&self, delay: Duration) -> PlaylistResult<()> {
        let mut slot = self.watcher.lock().await;
        let waited = match slot.as_mut() {
            Some(watcher) => Some(
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(self.cancel_error()),
                    outcome = watcher.next(Some(delay)) => outcome,
                },
            ),
            None => None,
        };

        match waited {
            Some(Ok(change)) => {
                tracing::trace!(?change, "woke from change watcher");
                Ok(())
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "change watcher failed; falling back to timers");
                *slot = None;
                drop(slot);
                self.sleep_cancellable(delay).await
            }
            None => {
                drop(slot);
                self.sleep_cancellable(delay).await
            }
        }
    }

    async fn sleep_cancellable(&self, delay: Duration) -> PlaylistResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancel_error()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn report_problem(&self, err: &PlaylistError) -> PlaylistResult<()> {
        match &self.options.on_problem {
            Some(callback) => callback(err),
            None => Ok(()),
        }
    }

    async fn release_watcher(&self) {
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.close();
        }
    }
}

impl Drop for PlaylistFetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Append `_HLS_msn`/`_HLS_part` blocking-reload parameters.
fn apply_head_query(url: &mut Url, head: &PlaylistHead) {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("_HLS_msn", &head.msn.to_string());
    if let Some(part) = head.part {
        pairs.append_pair("_HLS_part", &part.to_string());
    }
}

/// Remove `_HLS_*` parameters from a resolved URL so relative resolution
/// against the stored base stays stable across blocking reloads.
fn strip_head_query(url: &mut Url) {
    if url.query().is_none_or(|q| !q.contains("_HLS_")) {
        return;
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("_HLS_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if retained.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(retained);
    }
}

fn validate_mime(meta: &FetchMeta) -> PlaylistResult<()> {
    if VALID_MIME_TYPES.contains(&meta.mime.as_str()) {
        return Ok(());
    }
    let path = meta.url.path();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Ok(());
    }
    Err(PlaylistError::InvalidMime {
        mime: meta.mime.clone(),
        url: meta.url.to_string(),
    })
}
