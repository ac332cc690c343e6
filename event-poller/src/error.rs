use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Enumeration of errors raised while pulling pages from the events endpoint.
///
/// Any of these aborts the whole fetch: pages collected before the failure are dropped.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} could not be completed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with status {status}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("response from {url} is not a JSON array of events")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {url} contains an invalid event: {reason}")]
    InvalidEvent { url: String, reason: String },
    #[error("{url} is not a valid url")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("stopped following pagination after {0} pages")]
    TooManyPages(usize),
}

impl FetchError {
    pub(crate) fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout {
                url: url.to_owned(),
                source: error,
            }
        } else {
            FetchError::Request {
                url: url.to_owned(),
                source: error,
            }
        }
    }

    /// A short hint for whoever operates the connector.
    pub fn user_message(&self) -> &'static str {
        match self {
            FetchError::Status { status, .. } => match status.as_u16() {
                400 => "Events endpoint rejected the request -- check the configured url and query",
                401 => "Authentication failed, check your credentials",
                403 => "Access denied -- check your credentials",
                404 => "Events endpoint not found -- check the configured url",
                429 => "Rate limit exceeded -- the next scheduled run will resume from the last watermark",
                s if s >= 500 => "Remote server error",
                _ => "Unknown error -- try the run again",
            },
            FetchError::Timeout { .. } => "Request timed out -- consider raising REQUEST_TIMEOUT",
            FetchError::Request { .. } => "Could not reach the events endpoint",
            FetchError::Decode { .. } | FetchError::InvalidEvent { .. } => {
                "The events endpoint returned data that is not a list of events"
            }
            FetchError::InvalidUrl { .. } => "The events endpoint returned an invalid next link",
            FetchError::TooManyPages(_) => {
                "Pagination did not terminate -- raise MAX_PAGES or check the endpoint"
            }
        }
    }
}

/// Errors related to loading and persisting the watermark.
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("persisted watermark could not be parsed: {0}")]
    Malformed(String),
    #[error("cursor store at {path} could not be accessed")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while resolving configuration, before any request is made.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not a valid run mode")]
    InvalidRunMode(String),
    #[error("{0} is not a valid sink")]
    InvalidSink(String),
    #[error("SINK_PATH must be set when using the file sink")]
    MissingSinkPath,
    #[error("HEADERS must be a JSON object with string values")]
    InvalidHeaders(#[source] serde_json::Error),
    #[error("{0} is not a valid header")]
    InvalidHeader(String),
    #[error("{0} is not a valid timestamp")]
    InvalidTimestamp(String),
    #[error("a look-back window of {0} days reaches before the earliest supported date")]
    InvalidLookback(u32),
    #[error("{0} is not a valid url")]
    InvalidUrl(String),
    #[error("failed to construct http client")]
    Client(#[source] reqwest::Error),
}

/// Top level error of a single invocation. Whatever the variant, the watermark is left as the
/// last successful run stored it.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("fetch failed")]
    FetchFailed(#[from] FetchError),
    #[error("cursor store failed")]
    Cursor(#[from] CursorError),
    #[error("sink failed to accept a chunk: {0:#}")]
    Sink(anyhow::Error),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_user_messages() {
        let err = |code: u16| FetchError::Status {
            url: "http://localhost/logs".to_owned(),
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };

        assert!(err(401).user_message().contains("Authentication failed"));
        assert!(err(403).user_message().contains("Access denied"));
        assert!(err(429).user_message().contains("Rate limit"));
        assert_eq!(err(502).user_message(), "Remote server error");
        assert!(err(418).user_message().contains("Unknown error"));
    }

    #[test]
    fn test_run_error_keeps_fetch_cause() {
        let err = RunError::from(FetchError::TooManyPages(3));
        let source = std::error::Error::source(&err).expect("fetch failure has a source");
        assert_eq!(source.to_string(), "stopped following pagination after 3 pages");
    }
}
