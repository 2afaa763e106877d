//! Single-call request pipeline: validate, acquire, resolve, configure, execute.

use std::sync::Arc;

use bytes::Bytes;
use tracing::Instrument;

use crate::config::{ConfigSource, TransportConfig};
use crate::connection::validate_url;
use crate::credential::Credential;
use crate::error::TransportError;
use crate::pool::{ConnectionPool, PoolSignature};
use crate::redaction::{LogFullBody, ResponseLogPolicy};
use crate::resolver::CredentialResolver;

/// One outbound call as produced by the caller's request builder.
///
/// Headers already carry any token or signature material; they are sent in
/// order, duplicates included.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub credential: Option<Credential>,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body: body.into(),
            credential: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn credential(mut self, credential: impl Into<Credential>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Entry point for one logical payment service.
///
/// Holds the validated configuration and a handle to the shared pool. Cheap to
/// share behind `Arc`; `execute` takes `&self` and is safe to call from many
/// tasks at once.
pub struct RequestExecutor {
    service_name: String,
    config: TransportConfig,
    pool: Arc<ConnectionPool>,
    log_policy: Arc<dyn ResponseLogPolicy>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Read and validate configuration for `service_name` from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] or
    /// [`TransportError::MissingConfiguration`]; see [`TransportConfig::from_source`].
    pub fn new(
        service_name: &str,
        source: &dyn ConfigSource,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, TransportError> {
        let config = TransportConfig::from_source(service_name, source)?;
        Ok(Self::with_config(service_name, config, pool))
    }

    /// Use an already built configuration.
    #[must_use]
    pub fn with_config(
        service_name: impl Into<String>,
        config: TransportConfig,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            config,
            pool,
            log_policy: Arc::new(LogFullBody),
        }
    }

    /// Replace how successful response bodies are logged.
    #[must_use]
    pub fn with_log_policy(mut self, policy: Arc<dyn ResponseLogPolicy>) -> Self {
        self.log_policy = policy;
        self
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Base endpoint from configuration, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.config.endpoint_base_url.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn signature(&self) -> PoolSignature {
        PoolSignature::from_config(&self.config)
    }

    /// Execute one call and return the response body.
    ///
    /// No retry happens here; see [`execute_with_retry`](crate::execute_with_retry).
    /// The pooled connection is returned on every exit path.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidUrl`] if the URL is empty or unusable
    /// - [`TransportError::MissingCredential`] if no credential is attached
    /// - [`TransportError::PoolExhausted`] if no connection is free
    /// - [`TransportError::SslConfiguration`] if certificate material cannot be loaded
    /// - any classified failure from the HTTP exchange itself
    pub async fn execute(&self, request: OutboundRequest) -> Result<String, TransportError> {
        let host = host_of(&request.url);
        let span = tracing::info_span!(
            "payment_call",
            service = %self.service_name,
            host = %host,
        );

        let result = self.execute_inner(request).instrument(span.clone()).await;

        span.in_scope(|| match &result {
            Ok(body) => {
                if let Some(rendered) = self.log_policy.render(body) {
                    tracing::info!(response = %rendered, "payment call succeeded");
                }
            }
            Err(e) if e.is_transport() => tracing::warn!(error = %e, "payment call failed"),
            Err(e) => tracing::debug!(error = %e, "payment call rejected"),
        });
        result
    }

    async fn execute_inner(&self, request: OutboundRequest) -> Result<String, TransportError> {
        let OutboundRequest {
            url,
            headers,
            body,
            credential,
        } = request;

        if url.trim().is_empty() {
            return Err(TransportError::InvalidUrl {
                url,
                reason: "URL is empty".to_owned(),
            });
        }
        validate_url(&url, self.config.transport)?;
        let credential = credential.ok_or(TransportError::MissingCredential)?;

        let call_config = self.config.with_endpoint(&url);
        let mut conn = self.pool.acquire(&PoolSignature::from_config(&call_config))?;

        CredentialResolver::resolve(&credential, &mut conn)?;
        conn.configure(&call_config)?;
        conn.execute(&url, body, &headers).await
    }
}

fn host_of(url: &str) -> String {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|u| u.host().map(ToOwned::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::credential::{CertificateCredential, TokenCredential};
    use crate::redaction::SuppressBody;
    use httpmock::prelude::*;

    fn executor(max: usize) -> RequestExecutor {
        RequestExecutor::with_config(
            "Invoice",
            TransportConfig {
                max_pool_connections: max,
                ..TransportConfig::for_testing()
            },
            Arc::new(ConnectionPool::new()),
        )
    }

    #[tokio::test]
    async fn empty_url_rejected_before_acquire() {
        let exec = executor(1);
        let err = exec
            .execute(OutboundRequest::new("", "x").credential(TokenCredential::new("t")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
        assert_eq!(exec.pool().stats(&exec.signature()).live, 0);
    }

    #[tokio::test]
    async fn missing_credential_rejected_before_acquire() {
        let exec = executor(1);
        let err = exec
            .execute(OutboundRequest::new("http://127.0.0.1:9/nvp", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MissingCredential));
        assert_eq!(exec.pool().stats(&exec.signature()).live, 0);
    }

    #[tokio::test]
    async fn certificate_failure_releases_connection() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });

        let exec = executor(1);
        let request = OutboundRequest::new(server.url("/nvp"), "x").credential(
            CertificateCredential::new("m", "p", "/missing/cert.pem", "/missing/key.pem"),
        );
        let err = exec.execute(request).await.unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));
        mock.assert_calls(0);

        let stats = exec.pool().stats(&exec.signature());
        assert_eq!((stats.live, stats.idle, stats.in_use), (1, 1, 0));
    }

    #[tokio::test]
    async fn getters_and_log_policy() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/nvp");
            then.status(200).body("ACK=Success");
        });

        let config = TransportConfig {
            endpoint_base_url: Some("https://api-3t.example.com/nvp".to_owned()),
            ..TransportConfig::for_testing()
        };
        let exec = RequestExecutor::with_config("Invoice", config, Arc::new(ConnectionPool::new()))
            .with_log_policy(Arc::new(SuppressBody));
        assert_eq!(exec.service_name(), "Invoice");
        assert_eq!(exec.endpoint(), Some("https://api-3t.example.com/nvp"));

        let body = exec
            .execute(OutboundRequest::new(server.url("/nvp"), "x").credential(TokenCredential::new("t")))
            .await
            .unwrap();
        assert_eq!(body, "ACK=Success");
        // Per-call endpoint never leaks into the shared configuration
        assert_eq!(exec.endpoint(), Some("https://api-3t.example.com/nvp"));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://api.example.com/nvp"), "api.example.com");
        assert_eq!(host_of("not a url"), "unknown");
    }
}
