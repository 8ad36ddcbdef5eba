//! Parsed playlist model.
//!
//! The base structure comes from `m3u8-rs`. Low-latency tags (RFC 8216bis)
//! are not modeled by that crate, so a line-level overlay scan collects
//! `EXT-X-PART-INF`, `EXT-X-SERVER-CONTROL`, `EXT-X-PART`,
//! `EXT-X-PRELOAD-HINT`, `EXT-X-RENDITION-REPORT` and the trailing
//! partial-only segment, and associates parts with their parent segments by
//! URI-line position.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{PlaylistError, PlaylistResult};
use crate::fetch::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Event,
    Vod,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PartInf {
    pub part_target: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ServerControl {
    pub can_block_reload: bool,
    pub hold_back: Option<f64>,
    pub part_hold_back: Option<f64>,
    pub can_skip_until: Option<f64>,
}

/// LL-HLS partial segment.
#[derive(Debug, Clone)]
pub struct Part {
    pub uri: String,
    pub duration: f64,
    pub independent: bool,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default)]
pub struct Segment {
    /// None for the trailing partial-only segment of an LL playlist.
    pub uri: Option<String>,
    pub duration: Option<f64>,
    pub title: Option<String>,
    pub program_date_time: Option<DateTime<Utc>>,
    pub parts: Vec<Part>,
    pub custom_tags: Vec<CustomTag>,
}

impl Segment {
    /// Segment duration, falling back to the sum of its part durations.
    pub fn effective_duration(&self) -> Option<f64> {
        self.duration.or_else(|| {
            if self.parts.is_empty() {
                None
            } else {
                Some(self.parts.iter().map(|p| p.duration).sum())
            }
        })
    }
}

/// A preserved custom tag (see `FetcherOptions::extensions`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTag {
    pub name: String,
    pub value: Option<String>,
}

/// Raw `EXT-X-PRELOAD-HINT` entry, in playlist order.
#[derive(Debug, Clone)]
pub struct PreloadHintTag {
    pub kind: String,
    pub uri: Option<String>,
    pub byterange_start: Option<u64>,
    pub byterange_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RenditionReport {
    pub uri: Option<String>,
    pub last_msn: Option<u64>,
    pub last_part: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MediaManifest {
    pub media_sequence: u64,
    pub target_duration: f64,
    pub segments: Vec<Segment>,
    pub part_inf: Option<PartInf>,
    pub server_control: Option<ServerControl>,
    pub preload_hints: Vec<PreloadHintTag>,
    pub rendition_reports: Vec<RenditionReport>,
    pub i_frames_only: bool,
    pub playlist_type: Option<PlaylistType>,
    pub end_list: bool,
    pub custom_tags: Vec<CustomTag>,
}

impl MediaManifest {
    /// Media sequence number of the last full segment, or of the trailing
    /// partial segment when `include_partial` is set. An empty playlist
    /// yields `media_sequence - 1`.
    pub fn last_msn(&self, include_partial: bool) -> i64 {
        let mut counted = self.segments.len();
        if !include_partial && counted > 0 && self.segments[counted - 1].uri.is_none() {
            counted -= 1;
        }
        self.media_sequence as i64 + counted as i64 - 1
    }

    /// A playlist is live unless it has ended or declares itself VOD.
    pub fn is_live(&self) -> bool {
        !self.end_list && self.playlist_type != Some(PlaylistType::Vod)
    }
}

#[derive(Debug, Clone)]
pub enum ParsedManifest {
    Master(m3u8_rs::MasterPlaylist),
    Media(MediaManifest),
}

impl ParsedManifest {
    pub fn kind(&self) -> PlaylistKind {
        match self {
            Self::Master(_) => PlaylistKind::Master,
            Self::Media(_) => PlaylistKind::Media,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions<'a> {
    /// Custom tags to preserve: tag name (without `#`) -> segment-local flag.
    pub extensions: Option<&'a HashMap<String, bool>>,
}

/// Parse a playlist document.
pub fn parse(text: &str, options: ParseOptions<'_>) -> PlaylistResult<ParsedManifest> {
    match m3u8_rs::parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(playlist)) => Ok(ParsedManifest::Master(playlist)),
        Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
            Ok(ParsedManifest::Media(build_media(playlist, text, options)))
        }
        Err(e) => Err(PlaylistError::parse(e.to_string())),
    }
}

fn build_media(
    playlist: m3u8_rs::MediaPlaylist,
    text: &str,
    options: ParseOptions<'_>,
) -> MediaManifest {
    let mut segments: Vec<Segment> = playlist
        .segments
        .iter()
        .map(|s| Segment {
            uri: Some(s.uri.clone()),
            duration: Some(s.duration as f64),
            title: s.title.clone(),
            program_date_time: s.program_date_time.map(|d| d.with_timezone(&Utc)),
            parts: Vec::new(),
            custom_tags: Vec::new(),
        })
        .collect();

    let mut manifest = MediaManifest {
        media_sequence: playlist.media_sequence,
        target_duration: playlist.target_duration as f64,
        segments: Vec::new(),
        part_inf: None,
        server_control: None,
        preload_hints: Vec::new(),
        rendition_reports: Vec::new(),
        i_frames_only: false,
        playlist_type: None,
        end_list: playlist.end_list,
        custom_tags: Vec::new(),
    };

    // Overlay scan. Parts and segment-local custom tags accumulate until the
    // next URI line claims them; anything left at EOF forms the trailing
    // partial-only segment.
    let mut seg_idx = 0usize;
    let mut pending_parts: Vec<Part> = Vec::new();
    let mut pending_custom: Vec<CustomTag> = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            if let Some(attrs) = rest.strip_prefix("EXT-X-PART-INF:") {
                let attrs = split_attributes(attrs);
                if let Some(target) = attr_f64(&attrs, "PART-TARGET") {
                    manifest.part_inf = Some(PartInf {
                        part_target: target,
                    });
                }
            } else if let Some(attrs) = rest.strip_prefix("EXT-X-SERVER-CONTROL:") {
                let attrs = split_attributes(attrs);
                manifest.server_control = Some(ServerControl {
                    can_block_reload: attr_str(&attrs, "CAN-BLOCK-RELOAD") == Some("YES"),
                    hold_back: attr_f64(&attrs, "HOLD-BACK"),
                    part_hold_back: attr_f64(&attrs, "PART-HOLD-BACK"),
                    can_skip_until: attr_f64(&attrs, "CAN-SKIP-UNTIL"),
                });
            } else if let Some(attrs) = rest.strip_prefix("EXT-X-PRELOAD-HINT:") {
                let attrs = split_attributes(attrs);
                manifest.preload_hints.push(PreloadHintTag {
                    kind: attr_str(&attrs, "TYPE").unwrap_or_default().to_string(),
                    uri: attr_str(&attrs, "URI").map(str::to_string),
                    byterange_start: attr_u64(&attrs, "BYTERANGE-START"),
                    byterange_length: attr_u64(&attrs, "BYTERANGE-LENGTH"),
                });
            } else if let Some(attrs) = rest.strip_prefix("EXT-X-RENDITION-REPORT:") {
                let attrs = split_attributes(attrs);
                manifest.rendition_reports.push(RenditionReport {
                    uri: attr_str(&attrs, "URI").map(str::to_string),
                    last_msn: attr_u64(&attrs, "LAST-MSN"),
                    last_part: attr_u64(&attrs, "LAST-PART"),
                });
            } else if let Some(attrs) = rest.strip_prefix("EXT-X-PART:") {
                let attrs = split_attributes(attrs);
                if let Some(uri) = attr_str(&attrs, "URI") {
                    pending_parts.push(Part {
                        uri: uri.to_string(),
                        duration: attr_f64(&attrs, "DURATION").unwrap_or_default(),
                        independent: attr_str(&attrs, "INDEPENDENT") == Some("YES"),
                        byte_range: parse_part_byterange(attr_str(&attrs, "BYTERANGE")),
                    });
                }
            } else if let Some(value) = rest.strip_prefix("EXT-X-PLAYLIST-TYPE:") {
                manifest.playlist_type = match value.trim() {
                    "VOD" => Some(PlaylistType::Vod),
                    "EVENT" => Some(PlaylistType::Event),
                    _ => None,
                };
            } else if rest == "EXT-X-I-FRAMES-ONLY" {
                manifest.i_frames_only = true;
            } else if let Some(extensions) = options.extensions {
                let (name, value) = match rest.split_once(':') {
                    Some((name, value)) => (name, Some(value.to_string())),
                    None => (rest, None),
                };
                if let Some(&segment_local) = extensions.get(name) {
                    let tag = CustomTag {
                        name: name.to_string(),
                        value,
                    };
                    if segment_local {
                        pending_custom.push(tag);
                    } else {
                        manifest.custom_tags.push(tag);
                    }
                }
            }
        } else {
            // URI line closes the current segment's tag run.
            if let Some(segment) = segments.get_mut(seg_idx) {
                segment.parts = std::mem::take(&mut pending_parts);
                segment.custom_tags = std::mem::take(&mut pending_custom);
            }
            seg_idx += 1;
            pending_parts.clear();
            pending_custom.clear();
        }
    }

    // Parts published after the last full segment form a partial-only tail.
    if !pending_parts.is_empty() {
        segments.push(Segment {
            uri: None,
            duration: None,
            title: None,
            program_date_time: None,
            parts: pending_parts,
            custom_tags: pending_custom,
        });
    }

    manifest.segments = segments;
    manifest
}

/// Split an attribute list on commas, keeping quoted values intact.
fn split_attributes(rest: &str) -> Vec<(String, String)> {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let mut value = value.trim();
            if let Some(stripped) = value.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                value = stripped;
            }
            Some((key.trim().to_ascii_uppercase(), value.to_string()))
        })
        .collect()
}

fn attr_str<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn attr_f64(attrs: &[(String, String)], key: &str) -> Option<f64> {
    attr_str(attrs, key).and_then(|v| v.parse().ok())
}

fn attr_u64(attrs: &[(String, String)], key: &str) -> Option<u64> {
    attr_str(attrs, key).and_then(|v| v.parse().ok())
}

/// `BYTERANGE="<length>[@<offset>]"` as used by `EXT-X-PART`.
fn parse_part_byterange(value: Option<&str>) -> Option<ByteRange> {
    let value = value?;
    let (length, offset) = value.split_once('@').unwrap_or((value, ""));
    let length = length.trim().parse::<u64>().ok()?;
    let offset = offset.trim().parse::<u64>().unwrap_or(0);
    Some(ByteRange {
        offset,
        length: Some(length),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_media(text: &str) -> MediaManifest {
        match parse(text, ParseOptions::default()).unwrap() {
            ParsedManifest::Media(m) => m,
            ParsedManifest::Master(_) => panic!("expected media playlist"),
        }
    }

    #[test]
    fn parses_plain_live_playlist() {
        let manifest = parse_media(
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:2\n\
             #EXT-X-MEDIA-SEQUENCE:10\n\
             #EXTINF:2.0,\n\
             seg10.ts\n\
             #EXTINF:2.0,\n\
             seg11.ts\n",
        );
        assert_eq!(manifest.media_sequence, 10);
        assert_eq!(manifest.target_duration, 2.0);
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(manifest.last_msn(true), 11);
        assert_eq!(manifest.last_msn(false), 11);
        assert!(manifest.is_live());
        assert!(!manifest.end_list);
    }

    #[test]
    fn vod_and_endlist_are_not_live() {
        let ended = parse_media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
        );
        assert!(!ended.is_live());

        let vod = parse_media(
            "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg0.ts\n",
        );
        assert_eq!(vod.playlist_type, Some(PlaylistType::Vod));
        assert!(!vod.is_live());

        let event = parse_media(
            "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg0.ts\n",
        );
        assert_eq!(event.playlist_type, Some(PlaylistType::Event));
        assert!(event.is_live());
    }

    #[test]
    fn parses_low_latency_tags() {
        let manifest = parse_media(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:4\n\
             #EXT-X-PART-INF:PART-TARGET=1.004\n\
             #EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=3.012\n\
             #EXT-X-MEDIA-SEQUENCE:20\n\
             #EXT-X-PART:DURATION=1.0,URI=\"seg20.part0.mp4\"\n\
             #EXT-X-PART:DURATION=1.0,URI=\"seg20.part1.mp4\",INDEPENDENT=YES\n\
             #EXTINF:4.0,\n\
             seg20.mp4\n\
             #EXT-X-PART:DURATION=1.0,URI=\"seg21.part0.mp4\"\n\
             #EXT-X-PART:DURATION=1.0,URI=\"seg21.part1.mp4\",BYTERANGE=\"500@1000\"\n\
             #EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"seg21.part2.mp4\",BYTERANGE-START=1500\n",
        );

        assert_eq!(manifest.part_inf.unwrap().part_target, 1.004);
        let control = manifest.server_control.as_ref().unwrap();
        assert!(control.can_block_reload);
        assert_eq!(control.part_hold_back, Some(3.012));

        // One full segment plus a trailing partial-only segment.
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(manifest.segments[0].uri.as_deref(), Some("seg20.mp4"));
        assert_eq!(manifest.segments[0].parts.len(), 2);
        assert!(manifest.segments[0].parts[1].independent);

        let tail = &manifest.segments[1];
        assert!(tail.uri.is_none());
        assert_eq!(tail.parts.len(), 2);
        assert_eq!(
            tail.parts[1].byte_range,
            Some(ByteRange {
                offset: 1000,
                length: Some(500)
            })
        );
        assert_eq!(tail.effective_duration(), Some(2.0));

        assert_eq!(manifest.preload_hints.len(), 1);
        assert_eq!(manifest.preload_hints[0].kind, "PART");
        assert_eq!(manifest.preload_hints[0].byterange_start, Some(1500));

        assert_eq!(manifest.last_msn(true), 21);
        assert_eq!(manifest.last_msn(false), 20);
    }

    #[test]
    fn preserves_configured_custom_tags() {
        let mut extensions = HashMap::new();
        extensions.insert("EXT-X-SESSION-MARK".to_string(), false);
        extensions.insert("EXT-X-CUE-OUT".to_string(), true);

        let parsed = parse(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:2\n\
             #EXT-X-SESSION-MARK:id=77\n\
             #EXT-X-CUE-OUT:DURATION=30\n\
             #EXTINF:2.0,\n\
             seg0.ts\n",
            ParseOptions {
                extensions: Some(&extensions),
            },
        )
        .unwrap();

        let ParsedManifest::Media(manifest) = parsed else {
            panic!("expected media playlist");
        };
        assert_eq!(
            manifest.custom_tags,
            vec![CustomTag {
                name: "EXT-X-SESSION-MARK".to_string(),
                value: Some("id=77".to_string()),
            }]
        );
        assert_eq!(
            manifest.segments[0].custom_tags,
            vec![CustomTag {
                name: "EXT-X-CUE-OUT".to_string(),
                value: Some("DURATION=30".to_string()),
            }]
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse("not a playlist", ParseOptions::default()).unwrap_err();
        assert!(matches!(err, PlaylistError::Parse { .. }));
        assert!(err.is_recoverable_update());
    }

    #[test]
    fn empty_playlist_last_msn_precedes_media_sequence() {
        let manifest = parse_media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:5\n",
        );
        assert!(manifest.segments.is_empty());
        assert_eq!(manifest.last_msn(true), 4);
    }

    #[test]
    fn quoted_attribute_values_keep_commas() {
        let attrs = split_attributes("URI=\"a,b,c.mp4\",DURATION=1.5");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attr_str(&attrs, "URI"), Some("a,b,c.mp4"));
        assert_eq!(attr_f64(&attrs, "DURATION"), Some(1.5));
    }
}
