use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Result type for xhrpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for xhrpool
///
/// These are the failures returned directly to a caller. Failures of an
/// individual request are never returned this way; they are delivered to the
/// `error` callback of its [`ResponsePromise`](crate::response::ResponsePromise)
/// as a [`RequestError`].
#[derive(Error, Debug)]
pub enum Error {
    /// No transport became available while waiting on a full pool
    #[error("No connections became available after waiting {} seconds ({attempts} attempts)", .waited.as_secs_f64())]
    PoolExhausted { attempts: u32, waited: Duration },

    /// The transport was destroyed and can no longer send
    #[error("Transport has been destroyed")]
    TransportDestroyed,

    /// The reqwest backend was asked to send outside of a tokio runtime
    #[error("No async runtime available to drive the request")]
    NoRuntime,

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid request configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new pool exhaustion error
    pub fn pool_exhausted(attempts: u32, period: Duration) -> Self {
        Error::PoolExhausted {
            attempts,
            waited: period * attempts,
        }
    }

    /// Create a new invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Check if this is a pool exhaustion error
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}

/// Kind of a per-request error
///
/// The HTTP families form a strict hierarchy: the specific 4xx kinds are a
/// [`ErrorKind::Client`], the specific 5xx kinds are a [`ErrorKind::Server`].
/// Everything else is a root kind of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 3xx and any other non-success status below 400
    Redirect,
    /// Unhandled 4xx
    Client,
    /// 401 or 419
    NotAuthorized,
    /// 404
    NotFound,
    /// 409
    ResourceStateConflict,
    /// 415
    UnsupportedMediaType,
    /// 429 or 420
    RequestLimitExceeded,
    /// 422, carries validation messages
    ClientValidation,
    /// Unhandled 5xx
    Server,
    /// 503
    ServiceUnavailable,
    /// 504
    GatewayTimeout,
    /// A success body that failed strict JSON parsing
    ResponseParse,
    /// A plain message raised through `handle_error`
    Generic,
}

impl ErrorKind {
    /// The direct parent of this kind, `None` for root kinds
    pub fn parent(self) -> Option<ErrorKind> {
        use ErrorKind::*;

        match self {
            NotAuthorized | NotFound | ResourceStateConflict | UnsupportedMediaType
            | RequestLimitExceeded | ClientValidation => Some(Client),
            ServiceUnavailable | GatewayTimeout => Some(Server),
            Redirect | Client | Server | ResponseParse | Generic => None,
        }
    }

    /// Whether this kind is `other` or descends from it
    pub fn is_a(self, other: ErrorKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// The root of this kind's family
    pub fn root(self) -> ErrorKind {
        let mut kind = self;
        while let Some(parent) = kind.parent() {
            kind = parent;
        }
        kind
    }

    /// Name of the kind as it appears in messages and CLI output
    pub fn name(self) -> &'static str {
        use ErrorKind::*;

        match self {
            Redirect => "RedirectError",
            Client => "ClientError",
            NotAuthorized => "NotAuthorizedError",
            NotFound => "NotFoundError",
            ResourceStateConflict => "ResourceStateConflictError",
            UnsupportedMediaType => "UnsupportedMediaTypeError",
            RequestLimitExceeded => "RequestLimitExceededError",
            ClientValidation => "ClientValidationError",
            Server => "ServerError",
            ServiceUnavailable => "ServiceUnavailableError",
            GatewayTimeout => "GatewayTimeoutError",
            ResponseParse => "ResponseParseError",
            Generic => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error object handed to the `error` callback of a request
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct RequestError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    validation_messages: Option<Value>,
}

impl RequestError {
    /// Create a new request error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            validation_messages: None,
        }
    }

    /// Create a `ClientValidation` error carrying the parsed response body
    pub fn validation(message: impl Into<String>, messages: Option<Value>) -> Self {
        Self {
            validation_messages: messages,
            ..Self::new(ErrorKind::ClientValidation, message)
        }
    }

    /// Attach the HTTP status that produced this error
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the HTTP status, if the error came from one
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Validation messages parsed from a 422 body, `None` if unparseable
    pub fn validation_messages(&self) -> Option<&Value> {
        self.validation_messages.as_ref()
    }

    /// Whether this error is of `kind` or one of its descendants
    pub fn is_a(&self, kind: ErrorKind) -> bool {
        self.kind.is_a(kind)
    }

    /// Check if this is a redirect error
    pub fn is_redirect(&self) -> bool {
        self.is_a(ErrorKind::Redirect)
    }

    /// Check if this is a client error (any 4xx kind)
    pub fn is_client_error(&self) -> bool {
        self.is_a(ErrorKind::Client)
    }

    /// Check if this is a server error (any 5xx kind)
    pub fn is_server_error(&self) -> bool {
        self.is_a(ErrorKind::Server)
    }
}

impl From<String> for RequestError {
    fn from(message: String) -> Self {
        RequestError::new(ErrorKind::Generic, message)
    }
}

impl From<&str> for RequestError {
    fn from(message: &str) -> Self {
        RequestError::new(ErrorKind::Generic, message)
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        RequestError::new(ErrorKind::ResponseParse, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_family() {
        for kind in [
            ErrorKind::NotAuthorized,
            ErrorKind::NotFound,
            ErrorKind::ResourceStateConflict,
            ErrorKind::UnsupportedMediaType,
            ErrorKind::RequestLimitExceeded,
            ErrorKind::ClientValidation,
        ] {
            assert!(kind.is_a(ErrorKind::Client), "{kind} should be a ClientError");
            assert!(!kind.is_a(ErrorKind::Server));
            assert_eq!(kind.root(), ErrorKind::Client);
        }
    }

    #[test]
    fn test_server_family() {
        assert!(ErrorKind::ServiceUnavailable.is_a(ErrorKind::Server));
        assert!(ErrorKind::GatewayTimeout.is_a(ErrorKind::Server));
        assert!(!ErrorKind::GatewayTimeout.is_a(ErrorKind::Client));
    }

    #[test]
    fn test_roots_are_independent() {
        let roots = [
            ErrorKind::Redirect,
            ErrorKind::Client,
            ErrorKind::Server,
            ErrorKind::ResponseParse,
            ErrorKind::Generic,
        ];
        for a in roots {
            assert_eq!(a.parent(), None);
            for b in roots {
                assert_eq!(a.is_a(b), a == b);
            }
        }
        assert!(!ErrorKind::Client.is_a(ErrorKind::NotFound));
    }

    #[test]
    fn test_request_error_from_string() {
        let error = RequestError::from("boom");
        assert_eq!(error.kind(), ErrorKind::Generic);
        assert_eq!(error.message(), "boom");
        assert_eq!(error.status(), None);
        assert_eq!(error.to_string(), "Error: boom");
    }

    #[test]
    fn test_validation_error() {
        let messages = serde_json::json!({"name": ["is required"]});
        let error = RequestError::validation("invalid", Some(messages.clone())).with_status(422);
        assert!(error.is_client_error());
        assert_eq!(error.validation_messages(), Some(&messages));
        assert_eq!(error.status(), Some(422));
    }

    #[test]
    fn test_pool_exhausted_message() {
        let error = Error::pool_exhausted(20, Duration::from_millis(250));
        assert!(error.is_pool_exhausted());
        assert_eq!(
            error.to_string(),
            "No connections became available after waiting 5 seconds (20 attempts)"
        );
    }
}
