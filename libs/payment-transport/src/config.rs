use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransportError;
use crate::secret::SecretString;

/// Configuration keys read by [`TransportConfig::from_source`].
pub mod keys {
    pub const END_POINT: &str = "service.EndPoint";
    pub const MODE: &str = "mode";
    pub const USE_HTTP_PROXY: &str = "http.UseProxy";
    pub const HTTP_PROXY_HOST: &str = "http.ProxyHost";
    pub const HTTP_PROXY_PORT: &str = "http.ProxyPort";
    pub const HTTP_PROXY_USERNAME: &str = "http.ProxyUserName";
    pub const HTTP_PROXY_PASSWORD: &str = "http.ProxyPassword";
    pub const HTTP_CONNECTION_TIMEOUT: &str = "http.ConnectionTimeOut";
    pub const HTTP_CONNECTION_READ_TIMEOUT: &str = "http.ReadTimeOut";
    pub const HTTP_CONNECTION_RETRY: &str = "http.Retry";
    pub const HTTP_CONNECTION_MAX_CONNECTION: &str = "http.MaxConnection";
    pub const HTTP_TRUST_STORE: &str = "http.TrustStore";
    pub const HTTP_TRUSTED_CA_FILE: &str = "http.TrustedCaFile";
    pub const HTTP_ALLOW_INSECURE: &str = "http.AllowInsecure";
    pub const HTTP_MAX_RESPONSE_BYTES: &str = "http.MaxResponseBytes";
}

/// Default cap on a response body (10 MiB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Read-only key/value source the transport configuration is assembled from.
///
/// Values are plain strings; parsing and validation happen in
/// [`TransportConfig::from_source`].
pub trait ConfigSource: Send + Sync {
    /// Raw value for `key`, if present.
    fn get(&self, key: &str) -> Option<String>;
}

impl<S: BuildHasher + Send + Sync> ConfigSource for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
///
/// Controls whether plain `http://` endpoints are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections (HTTPS only) - default and recommended
    #[default]
    TlsOnly,
    /// Allow insecure HTTP connections (for testing with mock servers only)
    ///
    /// **WARNING**: Never use in production; payment traffic would travel in clear text.
    AllowInsecureHttp,
}

/// HTTP proxy settings, present only when the proxy is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// Timeout, retry, proxy and TLS settings for one logical service.
///
/// Built once per service client and never mutated afterwards; per-call
/// endpoint changes go through [`TransportConfig::with_endpoint`], which
/// returns a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Base endpoint URL of the service (informational; calls carry full URLs)
    pub endpoint_base_url: Option<String>,

    /// Proxy settings (`None` = direct connection)
    pub proxy: Option<ProxyConfig>,

    /// TCP connect timeout in milliseconds (`0` = no timeout)
    pub connect_timeout_ms: u64,

    /// Response read timeout in milliseconds (`0` = no timeout)
    pub read_timeout_ms: u64,

    /// Attempt budget for the outer retry policy
    pub max_retries: u32,

    /// Upper bound on live connections per pool signature
    pub max_pool_connections: usize,

    /// Restricted runtime: no proxy, no client certificates, no keep-alive reuse
    pub runtime_sandbox_mode: bool,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Extra PEM trust anchors added on top of `tls_roots` (private CAs)
    pub trusted_ca_file: Option<PathBuf>,

    /// Transport security mode (default: `TlsOnly`)
    pub transport: TransportSecurity,

    /// Maximum response body size in bytes (default: 10 MiB)
    pub max_response_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint_base_url: None,
            proxy: None,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            max_retries: 2,
            max_pool_connections: 100,
            runtime_sandbox_mode: false,
            tls_roots: TlsRootConfig::default(),
            trusted_ca_file: None,
            transport: TransportSecurity::TlsOnly,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl TransportConfig {
    /// Create configuration for testing with mock servers (allows insecure HTTP)
    ///
    /// **WARNING**: Use only for local testing with mock servers, never in production.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            read_timeout_ms: 5_000,
            max_retries: 1,
            max_pool_connections: 4,
            transport: TransportSecurity::AllowInsecureHttp,
            max_response_bytes: 1024 * 1024,
            ..Default::default()
        }
    }

    /// Assemble and validate the configuration for `service_name`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Configuration`] if `service_name` is empty or a value is malformed
    /// - [`TransportError::MissingConfiguration`] if a required key is absent
    pub fn from_source(
        service_name: &str,
        source: &dyn ConfigSource,
    ) -> Result<Self, TransportError> {
        if service_name.trim().is_empty() {
            return Err(TransportError::config(
                "service_name",
                "service name must not be empty",
            ));
        }

        let reader = Reader { source };

        let proxy = if reader.flag(keys::USE_HTTP_PROXY)?.unwrap_or(false) {
            Some(ProxyConfig {
                host: reader.required(keys::HTTP_PROXY_HOST)?,
                port: reader.required_number(keys::HTTP_PROXY_PORT)?,
                username: reader.optional(keys::HTTP_PROXY_USERNAME),
                password: reader
                    .optional(keys::HTTP_PROXY_PASSWORD)
                    .map(SecretString::from),
            })
        } else {
            None
        };

        let runtime_sandbox_mode = match reader.optional(keys::MODE) {
            None => false,
            Some(mode) if mode.eq_ignore_ascii_case("sandbox") => true,
            Some(mode) if mode.eq_ignore_ascii_case("live") => false,
            Some(other) => {
                return Err(TransportError::config(
                    keys::MODE,
                    format!("expected 'sandbox' or 'live', got '{other}'"),
                ));
            }
        };

        let tls_roots = match reader.optional(keys::HTTP_TRUST_STORE) {
            None => TlsRootConfig::WebPki,
            Some(v) if v.eq_ignore_ascii_case("webpki") => TlsRootConfig::WebPki,
            Some(v) if v.eq_ignore_ascii_case("native") => TlsRootConfig::Native,
            Some(other) => {
                return Err(TransportError::config(
                    keys::HTTP_TRUST_STORE,
                    format!("expected 'webpki' or 'native', got '{other}'"),
                ));
            }
        };

        let transport = if reader.flag(keys::HTTP_ALLOW_INSECURE)?.unwrap_or(false) {
            tracing::warn!(
                service = service_name,
                "insecure HTTP allowed by configuration; use only against local mock servers"
            );
            TransportSecurity::AllowInsecureHttp
        } else {
            TransportSecurity::TlsOnly
        };

        let mut max_pool_connections: usize =
            reader.required_number(keys::HTTP_CONNECTION_MAX_CONNECTION)?;
        if max_pool_connections == 0 {
            tracing::warn!(
                service = service_name,
                "{} is 0; clamping pool size to 1",
                keys::HTTP_CONNECTION_MAX_CONNECTION
            );
            max_pool_connections = 1;
        }

        let config = Self {
            endpoint_base_url: reader.optional(keys::END_POINT),
            proxy,
            connect_timeout_ms: reader.required_number(keys::HTTP_CONNECTION_TIMEOUT)?,
            read_timeout_ms: reader.required_number(keys::HTTP_CONNECTION_READ_TIMEOUT)?,
            max_retries: reader.required_number(keys::HTTP_CONNECTION_RETRY)?,
            max_pool_connections,
            runtime_sandbox_mode,
            tls_roots,
            trusted_ca_file: reader.optional(keys::HTTP_TRUSTED_CA_FILE).map(PathBuf::from),
            transport,
            max_response_bytes: reader
                .optional_number(keys::HTTP_MAX_RESPONSE_BYTES)?
                .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES),
        };

        tracing::debug!(
            service = service_name,
            use_proxy = config.use_proxy(),
            connect_timeout_ms = config.connect_timeout_ms,
            read_timeout_ms = config.read_timeout_ms,
            max_retries = config.max_retries,
            max_pool_connections = config.max_pool_connections,
            sandbox = config.runtime_sandbox_mode,
            "transport configuration loaded"
        );

        Ok(config)
    }

    /// Copy of this configuration pointed at `endpoint`.
    #[must_use]
    pub fn with_endpoint(&self, endpoint: &str) -> Self {
        Self {
            endpoint_base_url: Some(endpoint.to_owned()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn use_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    /// Connect timeout, `None` when disabled.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    /// Read timeout, `None` when disabled.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.read_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

struct Reader<'a> {
    source: &'a dyn ConfigSource,
}

impl Reader<'_> {
    /// Trimmed value; blank values count as absent.
    fn optional(&self, key: &str) -> Option<String> {
        self.source
            .get(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, TransportError> {
        self.optional(key)
            .ok_or_else(|| TransportError::MissingConfiguration {
                key: key.to_owned(),
            })
    }

    fn optional_number<T: FromStr>(&self, key: &str) -> Result<Option<T>, TransportError> {
        self.optional(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|_| {
                    TransportError::config(
                        key,
                        format!("expected a non-negative integer, got '{raw}'"),
                    )
                })
            })
            .transpose()
    }

    fn required_number<T: FromStr>(&self, key: &str) -> Result<T, TransportError> {
        self.optional_number(key)?
            .ok_or_else(|| TransportError::MissingConfiguration {
                key: key.to_owned(),
            })
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, TransportError> {
        match self.optional(key) {
            None => Ok(None),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(other) => Err(TransportError::config(
                key,
                format!("expected 'true' or 'false', got '{other}'"),
            )),
        }
    }
}
