use http::Method;
use thiserror::Error;

use crate::response::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Transport,
    Http,
    Timeout,
    Rejection,
    Aggregate,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Transport => "transport",
            Self::Http => "http",
            Self::Timeout => "timeout",
            Self::Rejection => "rejection",
            Self::Aggregate => "aggregate",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error is `Clone` so a single rejection reason can be delivered to every
/// handler registered on a promise chain.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid http method: {method}")]
    InvalidMethod { method: String },
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("url rejected by policy: {url}")]
    UrlRejected { url: String },
    #[error("invalid header name: {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}: {message}")]
    InvalidHeaderValue { name: String, message: String },
    #[error("failed to serialize request body: {message}")]
    Serialize { message: String },
    #[error("failed to decode response json: {message}; body={body}")]
    Deserialize { message: String, body: String },
    #[error("transport error for {method} {url}: {message}")]
    Transport {
        method: Method,
        url: String,
        message: String,
    },
    #[error("http status error {status} for {method} {url}")]
    HttpStatus {
        status: u16,
        method: Method,
        url: String,
        response: Box<Response>,
    },
    #[error("wait timed out after {timeout_ms}ms")]
    WaitTimeout { timeout_ms: u128 },
    #[error("promise rejected: {message}")]
    Rejection { message: String },
    #[error("all promises rejected ({})", .reasons.len())]
    Aggregate { reasons: Vec<Error> },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMethod { .. }
            | Self::InvalidUrl { .. }
            | Self::UrlRejected { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::Serialize { .. }
            | Self::Deserialize { .. } => ErrorKind::InvalidInput,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::HttpStatus { .. } => ErrorKind::Http,
            Self::WaitTimeout { .. } => ErrorKind::Timeout,
            Self::Rejection { .. } => ErrorKind::Rejection,
            Self::Aggregate { .. } => ErrorKind::Aggregate,
        }
    }

    /// Builds the status error a middleware raises when it opts into
    /// status-based failures. The dispatch engine itself never produces this
    /// for ordinary responses.
    pub fn from_response(response: &Response) -> Self {
        Self::HttpStatus {
            status: response.status().as_u16(),
            method: response.method().clone(),
            url: response.url().to_owned(),
            response: Box::new(response.clone()),
        }
    }

    pub fn rejection(message: impl Into<String>) -> Self {
        Self::Rejection {
            message: message.into(),
        }
    }
}
