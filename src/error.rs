// =============================================================================
// Feed Errors — the failure taxonomy shared by providers, aggregation and
// streaming sessions
// =============================================================================
//
// Every variant carries a human-readable message only. Transport details,
// upstream bodies and credentials stay in the logs and never cross the
// subscriber boundary. `kind()` gives subscribers a stable machine tag.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::types::Interval;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    /// Local admission control refused the call. Back off until the next cycle.
    #[error("rate limit exceeded for {key}, please try again later")]
    RateLimited { key: String },

    /// The upstream refused the request (its own rate limit, or credentials).
    #[error("upstream rejected the request: {0}")]
    UpstreamRejected(String),

    /// Transport failure, timeout, or an unusable upstream response.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The advisory collaborator produced nothing usable.
    #[error("market signal unavailable: {0}")]
    AnnotationUnavailable(String),

    /// Missing or malformed subscription parameters.
    #[error("{0}")]
    InvalidSubscription(String),

    /// Every interval of one aggregation cycle failed.
    #[error("all intervals failed: {}", summarize(.0))]
    AllIntervalsFailed(Vec<(Interval, FeedError)>),
}

fn summarize(causes: &[(Interval, FeedError)]) -> String {
    causes
        .iter()
        .map(|(interval, err)| format!("{interval}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FeedError {
    /// Stable tag used in `{error, kind}` messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::AnnotationUnavailable(_) => "annotation_unavailable",
            Self::InvalidSubscription(_) => "invalid_subscription",
            Self::AllIntervalsFailed(_) => "all_intervals_failed",
        }
    }

    /// Only a bad subscription ends the connection; everything else is
    /// reported and retried on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidSubscription(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamRejected(_) | Self::AllIntervalsFailed(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable(_) | Self::AnnotationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidSubscription(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for FeedError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_failed_message_lists_every_cause() {
        let err = FeedError::AllIntervalsFailed(vec![
            (Interval::Day, FeedError::UpstreamUnavailable("timed out".into())),
            (Interval::Week, FeedError::RateLimited { key: "EURUSD@week".into() }),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("day: upstream unavailable: timed out"));
        assert!(msg.contains("week: rate limit exceeded for EURUSD@week"));
        assert_eq!(err.kind(), "all_intervals_failed");
    }

    #[test]
    fn only_invalid_subscription_is_fatal() {
        assert!(FeedError::InvalidSubscription("Symbol not provided.".into()).is_fatal());
        assert!(!FeedError::UpstreamRejected("429".into()).is_fatal());
        assert!(!FeedError::RateLimited { key: "X".into() }.is_fatal());
    }

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            FeedError::RateLimited { key: "X".into() }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            FeedError::InvalidSubscription("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
