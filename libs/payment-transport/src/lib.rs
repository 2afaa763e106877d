#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Request execution pipeline for payment service clients
//!
//! This crate sits between a service-specific request builder and the network:
//! - Transport configuration read from a key/value source (timeouts, proxy, retries, pool size)
//! - A bounded connection pool keyed by configuration signature (fail-fast when full)
//! - Per-call SSL mode: default TLS, or mutual TLS for certificate credentials
//! - HTTP-layer failure classification into [`TransportError`]
//! - An optional retry loop driven by the configured attempt budget
//!
//! Response bodies are returned as raw text; interpreting them is the caller's job.
//!
//! # Example
//!
//! ```ignore
//! use payment_transport::{ConnectionPool, OutboundRequest, RequestExecutor, TokenCredential};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(ConnectionPool::new());
//! let executor = RequestExecutor::new("Invoice", &settings, pool)?;
//!
//! let body = executor
//!     .execute(
//!         OutboundRequest::new("https://svcs.example.com/Invoice/CreateInvoice", payload)
//!             .header("X-PAYPAL-REQUEST-DATA-FORMAT", "NV")
//!             .credential(TokenCredential::new(token)),
//!     )
//!     .await?;
//! ```

mod config;
mod connection;
mod credential;
mod error;
mod executor;
mod pool;
mod redaction;
mod resolver;
mod retry;
mod secret;
mod tls;

pub use config::{
    ConfigSource, DEFAULT_MAX_RESPONSE_BYTES, ProxyConfig, TlsRootConfig, TransportConfig,
    TransportSecurity, keys,
};
pub use connection::{Connection, ERROR_BODY_PREVIEW_LIMIT, SslMode};
pub use credential::{CertificateCredential, Credential, SignatureCredential, TokenCredential};
pub use error::{HttpFailureKind, TimeoutPhase, TransportError};
pub use executor::{OutboundRequest, RequestExecutor};
pub use pool::{ConnectionPool, PoolSignature, PoolStats, PooledConnection};
pub use redaction::{LogBodyLength, LogFullBody, ResponseLogPolicy, SuppressBody};
pub use resolver::CredentialResolver;
pub use retry::{ExponentialBackoff, RetryPolicy, execute_with_retry};
pub use secret::SecretString;
pub use tls::ClientIdentity;
