//! Read-only view over a parsed media playlist with the derived properties
//! the update loop needs: head identity, next-head computation, program
//! dates and preload hints. Construction can strip LL-HLS features so that
//! consumers configured without low latency never observe them.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::fetch::ByteRange;
use crate::manifest::MediaManifest;

/// A `(msn, part?)` position in the live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistHead {
    pub msn: u64,
    pub part: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadHint {
    pub uri: String,
    pub byterange: Option<ByteRange>,
}

/// Projection of the playlist's `EXT-X-PRELOAD-HINT` tags: at most one hint
/// per kind, later tags overwriting earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadHints {
    pub part: Option<PreloadHint>,
    pub map: Option<PreloadHint>,
}

#[derive(Debug, Clone)]
pub struct ParsedPlaylist {
    manifest: Arc<MediaManifest>,
}

impl ParsedPlaylist {
    pub fn new(manifest: MediaManifest, no_low_latency: bool) -> Self {
        let manifest = if no_low_latency {
            strip_low_latency(manifest)
        } else {
            manifest
        };
        Self {
            manifest: Arc::new(manifest),
        }
    }

    pub fn manifest(&self) -> &Arc<MediaManifest> {
        &self.manifest
    }

    pub fn part_target(&self) -> Option<f64> {
        self.manifest.part_inf.map(|p| p.part_target)
    }

    pub fn can_block_reload(&self) -> bool {
        self.manifest
            .server_control
            .as_ref()
            .is_some_and(|c| c.can_block_reload)
    }

    pub fn last_msn(&self, include_partial: bool) -> i64 {
        self.manifest.last_msn(include_partial)
    }

    pub fn is_live(&self) -> bool {
        self.manifest.is_live()
    }

    /// Whether partial-segment arithmetic applies to this playlist.
    fn uses_parts(&self) -> bool {
        self.part_target().unwrap_or(0.0) > 0.0 && !self.manifest.i_frames_only
    }

    fn tail_part_count(&self) -> usize {
        self.manifest
            .segments
            .last()
            .map_or(0, |segment| segment.parts.len())
    }

    /// Head equality between two playlist states.
    pub fn is_same_head(&self, other: &ParsedPlaylist) -> bool {
        let include_partial = self.uses_parts() || other.uses_parts();
        if self.last_msn(include_partial) != other.last_msn(include_partial) {
            return false;
        }
        !include_partial || self.tail_part_count() == other.tail_part_count()
    }

    /// The head a blocking reload should request next.
    pub fn next_head(&self) -> PlaylistHead {
        if self.uses_parts() {
            let Some(last) = self.manifest.segments.last() else {
                return PlaylistHead {
                    msn: self.manifest.media_sequence,
                    part: None,
                };
            };
            if last.uri.is_some() {
                PlaylistHead {
                    msn: (self.last_msn(true) + 1).max(0) as u64,
                    part: Some(0),
                }
            } else {
                PlaylistHead {
                    msn: self.last_msn(true).max(0) as u64,
                    part: Some(last.parts.len() as u64),
                }
            }
        } else {
            PlaylistHead {
                msn: (self.last_msn(false) + 1).max(0) as u64,
                part: None,
            }
        }
    }

    /// Program date of the segment at `media_sequence`.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.manifest.segments.first()?.program_date_time
    }

    /// Program date of the live edge, inferred by walking backwards from the
    /// nearest dated segment.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        let mut acc = 0f64;
        for segment in self.manifest.segments.iter().rev() {
            let duration = segment.effective_duration().unwrap_or(0.0);
            if let Some(date) = segment.program_date_time {
                return Some(date + secs_f64(duration + acc));
            }
            acc += duration;
        }
        None
    }

    pub fn preload_hints(&self) -> PreloadHints {
        let mut hints = PreloadHints::default();
        for tag in &self.manifest.preload_hints {
            let Some(uri) = &tag.uri else { continue };
            let hint = PreloadHint {
                uri: uri.clone(),
                byterange: tag.byterange_start.map(|offset| ByteRange {
                    offset,
                    length: tag.byterange_length,
                }),
            };
            match tag.kind.to_ascii_uppercase().as_str() {
                "PART" => hints.part = Some(hint),
                "MAP" => hints.map = Some(hint),
                _ => {}
            }
        }
        hints
    }
}

fn secs_f64(secs: f64) -> TimeDelta {
    TimeDelta::milliseconds((secs * 1000.0).round() as i64)
}

fn strip_low_latency(mut manifest: MediaManifest) -> MediaManifest {
    manifest.part_inf = None;
    manifest.preload_hints.clear();
    manifest.rendition_reports.clear();
    if let Some(control) = &mut manifest.server_control {
        control.part_hold_back = None;
    }
    if manifest
        .segments
        .last()
        .is_some_and(|segment| segment.uri.is_none())
    {
        manifest.segments.pop();
    }
    for segment in &mut manifest.segments {
        segment.parts.clear();
    }
    manifest
}
