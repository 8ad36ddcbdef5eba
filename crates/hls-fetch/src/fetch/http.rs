//! HTTP(S) content fetcher over `reqwest`.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use reqwest::{Client, Response};
use tokio::sync::OwnedMutexGuard;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{is_soft_status, PlaylistError, PlaylistResult};
use crate::fetch::{
    agent, start_tracker, ByteStream, ContentFetcher, DownloadTracker, FetchMeta, FetchOptions,
    FetchResult,
};

pub struct HttpFetcher {
    client: Client,
    config: HttpConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> PlaylistResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()
            .map_err(|e| PlaylistError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn perform_inner(
        &self,
        url: &Url,
        options: &FetchOptions,
        tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
    ) -> PlaylistResult<FetchResult> {
        let agent = match &options.blocking {
            Some(key) => Some(
                agent::acquire(key, url.scheme(), &self.config)
                    .map_err(|e| self.fail(e, options, &tracker))?,
            ),
            None => None,
        };

        // The gate is taken before the first attempt and handed to the body
        // stream on success, so a blocking server sees one request at a time.
        let gate = match &agent {
            Some(agent) => Some(agent.lock().await),
            None => None,
        };
        let client = agent
            .as_ref()
            .map(|a| a.client().clone())
            .unwrap_or_else(|| self.client.clone());

        let mut attempt: u32 = 0;
        let budget = u32::from(options.retries);
        loop {
            match self.send_once(&client, url, options).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if let Some((tracker, token)) = &tracker {
                            tracker.advance(*token, 0);
                        }
                        return Ok(build_result(response, options, tracker, gate));
                    }

                    let err = PlaylistError::http_status(status, url.as_str());
                    if !is_soft_status(status) || attempt >= budget {
                        return Err(self.fail(err, options, &tracker));
                    }
                    tracing::warn!(url = %url, %status, attempt, "playlist fetch failed; retrying");
                }
                Err(err) => {
                    let retryable = matches!(
                        err,
                        PlaylistError::Transport { syscall: true, .. } | PlaylistError::Timeout { .. }
                    );
                    if !retryable || attempt >= budget {
                        return Err(self.fail(err, options, &tracker));
                    }
                    tracing::warn!(url = %url, error = %err, attempt, "transport error; retrying");
                }
            }

            let delay = self.config.retry_backoff.delay_for_attempt(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        client: &Client,
        url: &Url,
        options: &FetchOptions,
    ) -> PlaylistResult<Response> {
        let mut request = if options.probe {
            client.head(url.clone())
        } else {
            client.get(url.clone())
        };

        if let Some(range) = &options.byterange {
            request = request.header(header::RANGE, range_value(range));
        }
        if options.fresh {
            request = request.header(header::CACHE_CONTROL, "no-store");
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        request
            .send()
            .await
            .map_err(|e| PlaylistError::from_reqwest(e, url))
    }

    fn fail(
        &self,
        err: PlaylistError,
        options: &FetchOptions,
        tracker: &Option<(Arc<dyn DownloadTracker>, u64)>,
    ) -> PlaylistError {
        let err = if options.blocking.is_some() {
            err.tag_blocking()
        } else {
            err
        };
        if let Some((tracker, token)) = tracker {
            tracker.finish(*token, Some(&err));
        }
        err
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn perform(&self, url: &Url, options: FetchOptions) -> PlaylistResult<FetchResult> {
        let tracker = start_tracker(options.tracker.as_ref(), url, &options);
        let signal = options.signal.clone().unwrap_or_default();

        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                let err = PlaylistError::aborted();
                if let Some((tracker, token)) = &tracker {
                    tracker.finish(*token, Some(&err));
                }
                Err(err)
            }
            result = self.perform_inner(url, &options, tracker.clone()) => result,
        }
    }
}

/// Inclusive `Range` header value per RFC 9110.
fn range_value(range: &crate::fetch::ByteRange) -> String {
    match range.length {
        Some(len) if len > 0 => format!("bytes={}-{}", range.offset, range.offset + len - 1),
        _ => format!("bytes={}-", range.offset),
    }
}

fn build_result(
    response: Response,
    options: &FetchOptions,
    tracker: Option<(Arc<dyn DownloadTracker>, u64)>,
    gate: Option<OwnedMutexGuard<()>>,
) -> FetchResult {
    let final_url = response.url().clone();
    let mime = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();
    let size = response.content_length().map_or(-1, |len| len as i64);
    let modified = response
        .headers()
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| SystemTime::from(dt.with_timezone(&chrono::Utc)));
    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let meta = FetchMeta {
        url: final_url.clone(),
        mime,
        size,
        modified,
        etag,
    };

    if options.probe {
        return FetchResult::new(meta, None, tracker, None);
    }

    let stream: ByteStream = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| PlaylistError::from_reqwest(e, &final_url)))
        .boxed();

    FetchResult::new(meta, Some(stream), tracker, gate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_values() {
        let with_len = crate::fetch::ByteRange {
            offset: 100,
            length: Some(50),
        };
        let open_ended = crate::fetch::ByteRange {
            offset: 100,
            length: None,
        };
        assert_eq!(range_value(&with_len), "bytes=100-149");
        assert_eq!(range_value(&open_ended), "bytes=100-");
    }
}
