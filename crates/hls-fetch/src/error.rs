use std::sync::Arc;

use reqwest::StatusCode;

pub type PlaylistResult<T> = Result<T, PlaylistError>;

/// Errors produced by the playlist engine.
///
/// Variants are cheap to clone: transport causes are kept behind `Arc` so a
/// stored cancel reason can be handed out to every pending caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaylistError {
    #[error("fetch aborted: {reason}")]
    Aborted { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("playlist parse error: {reason}")]
    Parse { reason: String },

    #[error("invalid MIME type `{mime}` for {url}")]
    InvalidMime { mime: String, url: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        blocking: bool,
    },

    #[error("transport error: {reason}")]
    Transport {
        reason: String,
        source: Option<Arc<reqwest::Error>>,
        /// Failure originated below HTTP (connect, reset, DNS, local I/O).
        syscall: bool,
        blocking: bool,
    },

    #[error("rejected update from the past")]
    RejectedFromPast,

    #[error("blocking playlist reload returned a stale head")]
    StreamInconsistency,

    #[error("{reason}")]
    Usage { reason: String },
}

impl PlaylistError {
    pub fn aborted() -> Self {
        Self::Aborted {
            reason: "cancelled".to_string(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            blocking: false,
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            source: None,
            syscall: false,
            blocking: false,
        }
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
            source: None,
            syscall: true,
            blocking: false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, url: &url::Url) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                reason: format!("request to {url} timed out"),
            };
        }
        if let Some(status) = err.status() {
            return Self::http_status(status, url.as_str());
        }
        let syscall = err.is_connect() || err.is_request() || err.is_body() || err.is_decode();
        Self::Transport {
            reason: err.to_string(),
            source: Some(Arc::new(err)),
            syscall,
            blocking: false,
        }
    }

    /// Whether a failed blocking request produced this error.
    pub fn is_blocking(&self) -> bool {
        match self {
            Self::HttpStatus { blocking, .. } | Self::Transport { blocking, .. } => *blocking,
            _ => false,
        }
    }

    /// Tag an error as coming from a blocking request.
    ///
    /// Only errors whose status/cause would already be retryable carry the
    /// tag; hard failures stay hard even on a blocking socket.
    pub(crate) fn tag_blocking(self) -> Self {
        match self {
            Self::HttpStatus { status, url, .. } if is_soft_status(status) => Self::HttpStatus {
                status,
                url,
                blocking: true,
            },
            Self::Transport {
                reason,
                source,
                syscall: true,
                ..
            } => Self::Transport {
                reason,
                source,
                syscall: true,
                blocking: true,
            },
            other => other,
        }
    }

    /// Classify an error produced inside the update loop.
    ///
    /// Recoverable errors are reported through `on_problem` and retried;
    /// everything else escapes `update()`.
    pub fn is_recoverable_update(&self) -> bool {
        match self {
            Self::HttpStatus {
                blocking: true, ..
            }
            | Self::Transport {
                blocking: true, ..
            } => true,
            Self::HttpStatus { status, .. } => is_soft_status(*status),
            Self::Transport { syscall, .. } => *syscall,
            Self::Parse { .. } => true,
            Self::RejectedFromPast => true,
            Self::Aborted { .. }
            | Self::Timeout { .. }
            | Self::InvalidMime { .. }
            | Self::StreamInconsistency
            | Self::Usage { .. } => false,
        }
    }
}

/// Statuses that must never be retried, regardless of retry budget.
pub(crate) fn is_hard_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 400 | 401 | 410 | 501)
}

/// Statuses worth retrying: server errors plus a handful of transient
/// client-side codes (not found during a live rollover, request timeout,
/// too early, rate limited).
pub(crate) fn is_soft_status(status: StatusCode) -> bool {
    if is_hard_status(status) {
        return false;
    }
    status.is_server_error() || matches!(status.as_u16(), 404 | 408 | 425 | 429)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_statuses_are_recoverable() {
        for code in [404u16, 408, 425, 429, 500, 502, 503] {
            let err =
                PlaylistError::http_status(StatusCode::from_u16(code).unwrap(), "http://x/p.m3u8");
            assert!(err.is_recoverable_update(), "HTTP {code} should recover");
        }
    }

    #[test]
    fn hard_statuses_are_fatal() {
        for code in [301u16, 400, 401, 403, 410, 501] {
            let err =
                PlaylistError::http_status(StatusCode::from_u16(code).unwrap(), "http://x/p.m3u8");
            assert!(!err.is_recoverable_update(), "HTTP {code} should be fatal");
        }
    }

    #[test]
    fn blocking_tag_only_sticks_to_soft_failures() {
        let soft = PlaylistError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://x")
            .tag_blocking();
        assert!(soft.is_blocking());

        let hard = PlaylistError::http_status(StatusCode::GONE, "http://x").tag_blocking();
        assert!(!hard.is_blocking());
        assert!(!hard.is_recoverable_update());
    }

    #[test]
    fn status_message_carries_canonical_reason() {
        let err =
            PlaylistError::http_status(StatusCode::INTERNAL_SERVER_ERROR, "http://x/p.m3u8");
        assert!(err.to_string().contains("Internal Server Error"));
    }

    #[test]
    fn rejected_update_routes_through_recovery() {
        assert!(PlaylistError::RejectedFromPast.is_recoverable_update());
    }
}
