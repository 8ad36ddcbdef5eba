use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PlaylistError, PlaylistResult};
use crate::fetch::DownloadTracker;
use crate::parsed::PlaylistHead;

/// Callback invoked for every non-fatal problem swallowed by the update loop.
///
/// Returning an `Err` is fatal: it escapes the running `update()` call.
pub type ProblemCallback = Arc<dyn Fn(&PlaylistError) -> PlaylistResult<()> + Send + Sync>;

/// Options for a [`PlaylistFetcher`](crate::fetcher::PlaylistFetcher).
#[derive(Clone)]
pub struct FetcherOptions {
    /// When false, LL-HLS features (parts, preload hints, rendition reports,
    /// part hold-back) are stripped from every exposed snapshot.
    pub low_latency: bool,

    /// Initial request hint: issues the first fetch as a blocking reload for
    /// this head (`_HLS_msn`/`_HLS_part`).
    pub head: Option<PlaylistHead>,

    /// Custom playlist tags to preserve, keyed by tag name (without the
    /// leading `#`). `true` marks the tag as segment-local.
    pub extensions: HashMap<String, bool>,

    /// Non-fatal problem callback.
    pub on_problem: Option<ProblemCallback>,

    /// Progress observer handed to every content fetch.
    pub tracker: Option<Arc<dyn DownloadTracker>>,

    /// Consecutive backward jumps of the playlist head to reject before a
    /// server rewind is accepted as genuine.
    pub max_rewinds: u32,

    /// Per-request fetch timeout.
    pub fetch_timeout: Duration,

    /// Server-side retry budget for each playlist fetch.
    pub fetch_retries: u8,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            low_latency: true,
            head: None,
            extensions: HashMap::new(),
            on_problem: None,
            tracker: None,
            max_rewinds: 2,
            fetch_timeout: Duration::from_secs(30),
            fetch_retries: 1,
        }
    }
}

impl fmt::Debug for FetcherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherOptions")
            .field("low_latency", &self.low_latency)
            .field("head", &self.head)
            .field("extensions", &self.extensions)
            .field("on_problem", &self.on_problem.is_some())
            .field("tracker", &self.tracker.is_some())
            .field("max_rewinds", &self.max_rewinds)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("fetch_retries", &self.fetch_retries)
            .finish()
    }
}

/// Options for one `update()` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Arms a stall timer: if no head change arrives within this duration the
    /// fetcher is cancelled with "Index update stalled".
    pub timeout: Option<Duration>,
}

/// Options for a [`PlaylistReader`](crate::reader::PlaylistReader).
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub fetcher: FetcherOptions,

    /// Propagated to every `update()` call as its stall timeout.
    pub max_stall_time: Option<Duration>,
}

/// HTTP client configuration, applied to both the shared client and the
/// per-key blocking agents.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Maximum idle connections to keep per host on the shared client.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing.
    pub pool_idle_timeout: Duration,

    /// Backoff applied between server-side retries.
    pub retry_backoff: RetryBackoff,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("hls-fetch/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 4,
            pool_idle_timeout: Duration::from_secs(30),
            retry_backoff: RetryBackoff::default(),
        }
    }
}

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Base delay. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2) to spread retries.
    pub jitter: bool,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryBackoff {
    /// Compute the delay for a given attempt number (0-indexed).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        use rand::Rng;
        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_max_cap() {
        let backoff = RetryBackoff {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert!(backoff.delay_for_attempt(10) <= Duration::from_secs(5));
    }

    #[test]
    fn backoff_without_jitter_is_deterministic() {
        let backoff = RetryBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn backoff_with_jitter_stays_bounded() {
        let backoff = RetryBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..32 {
            assert!(backoff.delay_for_attempt(8) <= Duration::from_secs(1));
        }
    }
}
