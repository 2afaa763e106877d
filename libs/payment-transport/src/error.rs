use std::time::Duration;
use thiserror::Error;

/// Which phase of a call a timeout expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the TCP connection (and proxy tunnel, if any)
    Connect,
    /// Waiting for the response head or reading the response body
    Read,
}

/// Transport-level failure classification.
///
/// See [`TransportError::is_retryable`] for which kinds an outer retry
/// policy may re-attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpFailureKind {
    /// Connection could not be established (DNS, refused, unreachable, proxy tunnel)
    #[error("connection failed: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Connect or read timeout exceeded
    #[error("{phase:?} timeout exceeded after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    /// I/O failure while the request or response was in flight
    #[error("I/O failure: {0}")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Server answered with an error status
    #[error("HTTP {status}: {body_preview}")]
    Status {
        status: http::StatusCode,
        body_preview: String,
    },
}

/// Error returned by the request execution pipeline.
///
/// Every failure path produces exactly one of these. Configuration and
/// credential errors are final for the call; only [`TransportError::Http`]
/// may be retried by an outer policy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// A configuration value is present but malformed
    #[error("invalid configuration value for '{key}': {reason}")]
    Configuration { key: String, reason: String },

    /// A required configuration key is absent
    #[error("missing required configuration key '{key}'")]
    MissingConfiguration { key: String },

    /// Client certificate material could not be loaded or was rejected
    #[error("SSL configuration failed: {reason}")]
    SslConfiguration {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request carries no credential
    #[error("request has no credential attached")]
    MissingCredential,

    /// The credential is present but unusable for this call
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: String },

    /// Request URL is empty, unparseable or uses a forbidden scheme
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A request header name or value is not valid HTTP
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Network, TLS, timeout or server-status failure
    #[error("HTTP transport error: {kind}")]
    Http {
        #[source]
        kind: HttpFailureKind,
    },

    /// Server demands a follow-up action from the client (3xx)
    #[error("client action required: HTTP {status}{}", location_suffix(.location.as_deref()))]
    ClientActionRequired {
        status: http::StatusCode,
        location: Option<String>,
    },

    /// Response body cannot be handed to the caller as text
    #[error("invalid response data: {reason}")]
    InvalidResponseData { reason: String },

    /// Bearer token rejected by the server
    #[error("OAuth token rejected (HTTP {status}): {challenge}")]
    OAuth {
        status: http::StatusCode,
        challenge: String,
    },

    /// Every connection for this pool signature is checked out
    #[error("connection pool exhausted: all {max} connections in use")]
    PoolExhausted { max: usize },
}

fn location_suffix(location: Option<&str>) -> String {
    location.map(|l| format!(" -> {l}")).unwrap_or_default()
}

impl TransportError {
    pub(crate) fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn ssl(reason: impl Into<String>) -> Self {
        Self::SslConfiguration {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn ssl_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SslConfiguration {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn http(kind: HttpFailureKind) -> Self {
        Self::Http { kind }
    }

    /// `true` for transport-level failures.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http { .. })
    }

    /// Whether an outer retry policy may re-invoke the call.
    ///
    /// Client-side statuses (4xx) and TLS rejections are transport errors but
    /// will not change on retry, so only connect, timeout, I/O and 5xx qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { kind } => match kind {
                HttpFailureKind::Status { status, .. } => status.is_server_error(),
                HttpFailureKind::Tls(_) => false,
                HttpFailureKind::Connect(_)
                | HttpFailureKind::Timeout { .. }
                | HttpFailureKind::Io(_) => true,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_connect_error_preserves_source() {
        let err = TransportError::http(HttpFailureKind::Connect(Box::new(TestError(
            "connection refused",
        ))));

        let kind = err.source().unwrap();
        let root = kind.source().unwrap();
        let downcast = root.downcast_ref::<TestError>();
        assert_eq!(downcast.unwrap().0, "connection refused");
    }

    #[test]
    fn test_ssl_error_preserves_source() {
        let err = TransportError::ssl_with_source("bad key", TestError("not PEM"));
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "not PEM");

        assert!(TransportError::ssl("empty path").source().is_none());
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = TransportError::http(HttpFailureKind::Timeout {
            phase: TimeoutPhase::Read,
            after: Duration::from_secs(1),
        });
        assert!(timeout.is_retryable());

        let bad_gateway = TransportError::http(HttpFailureKind::Status {
            status: http::StatusCode::BAD_GATEWAY,
            body_preview: String::new(),
        });
        assert!(bad_gateway.is_retryable());

        let tls = TransportError::http(HttpFailureKind::Tls(Box::new(TestError("bad cert"))));
        assert!(tls.is_transport());
        assert!(!tls.is_retryable());

        let not_found = TransportError::http(HttpFailureKind::Status {
            status: http::StatusCode::NOT_FOUND,
            body_preview: String::new(),
        });
        assert!(not_found.is_transport());
        assert!(!not_found.is_retryable());

        assert!(!TransportError::MissingCredential.is_retryable());
        assert!(!TransportError::ssl("x").is_retryable());
        assert!(!TransportError::PoolExhausted { max: 1 }.is_retryable());
        assert!(!TransportError::config("http.Retry", "nope").is_retryable());
    }

    #[test]
    fn test_client_action_message() {
        let err = TransportError::ClientActionRequired {
            status: http::StatusCode::FOUND,
            location: Some("https://auth.example.com/login".to_owned()),
        };
        assert_eq!(
            err.to_string(),
            "client action required: HTTP 302 Found -> https://auth.example.com/login"
        );

        let err = TransportError::ClientActionRequired {
            status: http::StatusCode::SEE_OTHER,
            location: None,
        };
        assert_eq!(err.to_string(), "client action required: HTTP 303 See Other");
    }
}
