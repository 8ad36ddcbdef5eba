//! Local content fetcher: `file:` paths and inline `data:` URLs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{PlaylistError, PlaylistResult};
use crate::fetch::{
    start_tracker, ByteRange, ByteStream, ContentFetcher, DownloadTracker, FetchMeta,
    FetchOptions, FetchResult,
};

pub struct FileFetcher;

impl FileFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn perform_file(
        &self,
        url: &Url,
        options: &FetchOptions,
        tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
    ) -> PlaylistResult<FetchResult> {
        let path = url
            .to_file_path()
            .map_err(|_| PlaylistError::usage(format!("invalid file: URL `{url}`")))?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PlaylistError::io(&e))?;
        let modified = metadata.modified().ok();
        let mime = mime_for_path(&path);

        if options.probe {
            let meta = FetchMeta {
                url: url.clone(),
                mime,
                size: metadata.len() as i64,
                modified,
                etag: None,
            };
            return Ok(FetchResult::new(meta, None, tracker, None));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PlaylistError::io(&e))?;
        let bytes = apply_byterange(bytes, options.byterange);

        if let Some((tracker, token)) = &tracker {
            tracker.advance(*token, 0);
        }

        let meta = FetchMeta {
            url: url.clone(),
            mime,
            size: bytes.len() as i64,
            modified,
            etag: None,
        };
        Ok(FetchResult::new(
            meta,
            Some(single_chunk(bytes)),
            tracker,
            None,
        ))
    }

    fn perform_data(
        &self,
        url: &Url,
        options: &FetchOptions,
        tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
    ) -> PlaylistResult<FetchResult> {
        let body = url.path();
        let (header, payload) = body
            .split_once(',')
            .ok_or_else(|| PlaylistError::usage(format!("invalid data: URL `{url}`")))?;

        let (mime, base64) = match header.strip_suffix(";base64") {
            Some(mime) => (mime, true),
            None => (header, false),
        };
        let mime = if mime.is_empty() {
            "text/plain".to_string()
        } else {
            mime.split(';').next().unwrap_or(mime).to_ascii_lowercase()
        };

        let bytes = if base64 {
            base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| PlaylistError::usage(format!("invalid data: URL payload: {e}")))?
        } else {
            percent_decode_str(payload).collect()
        };
        let bytes = apply_byterange(bytes, options.byterange);

        if let Some((tracker, token)) = &tracker {
            tracker.advance(*token, 0);
        }

        let meta = FetchMeta {
            url: url.clone(),
            mime,
            size: bytes.len() as i64,
            modified: None,
            etag: None,
        };
        let stream = (!options.probe).then(|| single_chunk(bytes));
        Ok(FetchResult::new(meta, stream, tracker, None))
    }
}

impl Default for FileFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentFetcher for FileFetcher {
    async fn perform(&self, url: &Url, options: FetchOptions) -> PlaylistResult<FetchResult> {
        let tracker = start_tracker(options.tracker.as_ref(), url, &options);
        let signal = options.signal.clone().unwrap_or_default();

        let work = async {
            match url.scheme() {
                "file" => self.perform_file(url, &options, tracker.clone()).await,
                "data" => self.perform_data(url, &options, tracker.clone()),
                other => Err(PlaylistError::usage(format!(
                    "unsupported URL scheme `{other}`"
                ))),
            }
        };

        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                let err = PlaylistError::aborted();
                if let Some((tracker, token)) = &tracker {
                    tracker.finish(*token, Some(&err));
                }
                Err(err)
            }
            result = work => {
                if let (Err(err), Some((tracker, token))) = (&result, &tracker) {
                    tracker.finish(*token, Some(err));
                }
                result
            }
        }
    }
}

fn mime_for_path(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("m3u8") || ext.eq_ignore_ascii_case("m3u") => {
            "application/vnd.apple.mpegurl".to_string()
        }
        _ => "application/octet-stream".to_string(),
    }
}

fn apply_byterange(bytes: Vec<u8>, range: Option<ByteRange>) -> Vec<u8> {
    let Some(range) = range else {
        return bytes;
    };
    let start = (range.offset as usize).min(bytes.len());
    let end = match range.length {
        Some(len) => start.saturating_add(len as usize).min(bytes.len()),
        None => bytes.len(),
    };
    bytes[start..end].to_vec()
}

fn single_chunk(bytes: Vec<u8>) -> ByteStream {
    futures::stream::once(async move { Ok(Bytes::from(bytes)) }).boxed()
}
