use std::error::Error as StdError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION, WWW_AUTHENTICATE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use rustls_pki_types::CertificateDer;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use crate::config::{ProxyConfig, TlsRootConfig, TransportConfig, TransportSecurity};
use crate::error::{HttpFailureKind, TimeoutPhase, TransportError};
use crate::secret::SecretString;
use crate::tls::{self, ClientIdentity};

/// Maximum body preview size kept in status errors (8KB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Idle keep-alive sockets are closed after this long.
const IDLE_SOCKET_TIMEOUT: Duration = Duration::from_secs(90);

type ConnectionService = BoxCloneService<Request<Full<Bytes>>, Response<Incoming>, TransportError>;

/// TLS mode a connection executes its next call with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Root store only, no client authentication
    #[default]
    Default,
    /// Mutual TLS with the identity loaded from these PEM files
    ClientCertificate { cert_path: PathBuf, key_path: PathBuf },
}

/// Everything the underlying hyper client is built from. A change in any of
/// these forces a rebuild; anything else is applied per call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BuildKey {
    proxy: Option<ProxyConfig>,
    connect_timeout_ms: u64,
    tls_roots: TlsRootConfig,
    trusted_ca_file: Option<PathBuf>,
    transport: TransportSecurity,
    sandbox: bool,
    ssl: SslMode,
    // Compared so that a certificate replaced on disk forces a rebuild
    client_chain: Option<Vec<CertificateDer<'static>>>,
}

struct Built {
    key: BuildKey,
    service: ConnectionService,
}

/// A reusable, individually configured HTTP channel.
///
/// Handed out by [`ConnectionPool`](crate::ConnectionPool); while checked out
/// it serves exactly one call at a time (`execute` takes `&mut self`).
pub struct Connection {
    id: u64,
    ssl_mode: SslMode,
    identity: Option<ClientIdentity>,
    config: Option<TransportConfig>,
    built: Option<Built>,
    checked_out: bool,
    requests_served: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("ssl_mode", &self.ssl_mode)
            .field("configured", &self.built.is_some())
            .field("checked_out", &self.checked_out)
            .field("requests_served", &self.requests_served)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            ssl_mode: SslMode::Default,
            identity: None,
            config: None,
            built: None,
            checked_out: false,
            requests_served: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn ssl_mode(&self) -> &SslMode {
        &self.ssl_mode
    }

    /// Identity used for mutual TLS, present in client-certificate mode.
    #[must_use]
    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn is_default_ssl(&self) -> bool {
        self.ssl_mode == SslMode::Default
    }

    #[must_use]
    pub fn is_checked_out(&self) -> bool {
        self.checked_out
    }

    pub(crate) fn set_checked_out(&mut self, checked_out: bool) {
        self.checked_out = checked_out;
    }

    /// Configuration applied by the last [`configure`](Self::configure) call.
    #[must_use]
    pub fn applied_config(&self) -> Option<&TransportConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Switch back to default SSL (no client certificate).
    pub fn use_default_ssl(&mut self) {
        self.ssl_mode = SslMode::Default;
        self.identity = None;
    }

    /// Switch to client-certificate SSL using PEM files at the given paths.
    ///
    /// The files are read on every call, so a certificate that was removed or
    /// replaced since the last call is never served from memory.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SslConfiguration`] if the material cannot be
    /// loaded; the connection mode is left unchanged in that case.
    pub fn setup_client_ssl(
        &mut self,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), TransportError> {
        let identity = ClientIdentity::load(cert_path, key_path)?;

        self.identity = Some(identity);
        self.ssl_mode = SslMode::ClientCertificate {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        };
        Ok(())
    }

    /// Apply timeouts, proxy and TLS settings.
    ///
    /// Idempotent: the underlying client is rebuilt only when a setting it
    /// depends on (or the SSL mode or loaded client certificate) differs from
    /// the last build.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SslConfiguration`] if TLS setup fails, or a client
    ///   certificate is requested in sandbox mode
    /// - [`TransportError::Configuration`] if the proxy address is unusable
    pub fn configure(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        if config.runtime_sandbox_mode && self.identity.is_some() {
            return Err(TransportError::ssl(
                "client certificates are not supported in sandbox runtime mode",
            ));
        }

        let proxy = if config.runtime_sandbox_mode && config.proxy.is_some() {
            tracing::warn!(
                connection_id = self.id,
                "proxy settings ignored in sandbox runtime mode"
            );
            None
        } else {
            config.proxy.clone()
        };

        let key = BuildKey {
            proxy,
            connect_timeout_ms: config.connect_timeout_ms,
            tls_roots: config.tls_roots,
            trusted_ca_file: config.trusted_ca_file.clone(),
            transport: config.transport,
            sandbox: config.runtime_sandbox_mode,
            ssl: self.ssl_mode.clone(),
            client_chain: self.identity.as_ref().map(|id| id.chain().to_vec()),
        };

        let unchanged = self.built.as_ref().is_some_and(|b| b.key == key);
        if !unchanged {
            let service = build_service(&key, config.connect_timeout(), self.identity.as_ref())?;
            tracing::debug!(
                connection_id = self.id,
                use_proxy = key.proxy.is_some(),
                default_ssl = key.ssl == SslMode::Default,
                "connection (re)configured"
            );
            self.built = Some(Built { key, service });
        }

        self.config = Some(config.clone());
        Ok(())
    }

    /// POST `payload` to `url` with `headers` in order and return the body.
    ///
    /// This is the only suspension point of a call. The connect timeout bounds
    /// establishing the connection. The response head must arrive within
    /// connect + read timeout of the call starting; reading the body gets its
    /// own read timeout.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidUrl`] / [`TransportError::InvalidHeader`] for malformed input
    /// - [`TransportError::Http`] for connect, TLS, timeout, I/O or 4xx/5xx status failures
    /// - [`TransportError::ClientActionRequired`] for 3xx
    /// - [`TransportError::OAuth`] for 401 with a `Bearer` challenge
    /// - [`TransportError::InvalidResponseData`] if a 2xx body is not UTF-8 or too large
    pub async fn execute(
        &mut self,
        url: &str,
        payload: Bytes,
        headers: &[(String, String)],
    ) -> Result<String, TransportError> {
        // The service is not Sync, so no borrow of `self.built` may live across an await
        let (mut service, request, read_timeout, head_budget, max_body) = {
            let (Some(built), Some(config)) = (self.built.as_ref(), self.config.as_ref()) else {
                return Err(TransportError::config(
                    "connection",
                    "connection used before configure()",
                ));
            };

            let uri = validate_url(url, config.transport)?;
            let request = build_request(uri, payload, headers)?;

            let read_timeout = config.read_timeout();
            let head_budget = read_timeout.map(|read| {
                config
                    .connect_timeout()
                    .map_or(read, |connect| connect.saturating_add(read))
            });
            (
                built.service.clone(),
                request,
                read_timeout,
                head_budget,
                config.max_response_bytes,
            )
        };

        let started = Instant::now();
        self.requests_served += 1;

        tracing::debug!(
            connection_id = self.id,
            host = request.uri().host().unwrap_or("unknown"),
            default_ssl = self.ssl_mode == SslMode::Default,
            "sending request"
        );

        let send = async {
            service.ready().await?;
            service.call(request).await
        };
        let response = within(head_budget, send)
            .await
            .ok_or_else(|| read_timeout_error(read_timeout))??;

        let (parts, body) = response.into_parts();
        let body = within(read_timeout, read_body(body, max_body))
            .await
            .ok_or_else(|| read_timeout_error(read_timeout))??;

        tracing::debug!(
            connection_id = self.id,
            status = parts.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            "response received"
        );

        classify_response(parts.status, &parts.headers, body, max_body)
    }
}

/// Parse `url` and check its scheme against the transport security mode.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] if the URL has no scheme or host,
/// or its scheme is not allowed.
pub fn validate_url(url: &str, transport: TransportSecurity) -> Result<Uri, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: url.to_owned(),
        reason,
    };

    let uri: Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;

    if uri.authority().is_none() {
        return Err(invalid("missing host/authority".to_owned()));
    }

    match uri.scheme_str() {
        Some("https") => Ok(uri),
        Some("http") => match transport {
            TransportSecurity::AllowInsecureHttp => Ok(uri),
            TransportSecurity::TlsOnly => Err(invalid(
                "HTTPS required (transport security is TlsOnly)".to_owned(),
            )),
        },
        Some(scheme) => Err(invalid(format!(
            "scheme '{scheme}' not supported; use http:// or https://"
        ))),
        None => Err(invalid("missing scheme".to_owned())),
    }
}

fn build_request(
    uri: Uri,
    payload: Bytes,
    headers: &[(String, String)],
) -> Result<Request<Full<Bytes>>, TransportError> {
    let mut request = Request::new(Full::new(payload));
    *request.method_mut() = Method::POST;
    *request.uri_mut() = uri;

    let map = request.headers_mut();
    for (name, value) in headers {
        let header_name =
            HeaderName::try_from(name.as_str()).map_err(|e| TransportError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value =
            HeaderValue::try_from(value.as_str()).map_err(|e| TransportError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        map.append(header_name, header_value);
    }
    Ok(request)
}

fn build_service(
    key: &BuildKey,
    connect_timeout: Option<Duration>,
    identity: Option<&ClientIdentity>,
) -> Result<ConnectionService, TransportError> {
    let tls_config = tls::client_config(key.tls_roots, key.trusted_ca_file.as_deref(), identity)?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(connect_timeout);

    if let Some(proxy) = &key.proxy {
        let tunnel = proxy_tunnel(proxy, http)?;
        let https = wrap_https(tunnel, tls_config, key.transport);
        return Ok(into_service(https, key.sandbox, connect_timeout));
    }

    let https = wrap_https(http, tls_config, key.transport);
    Ok(into_service(https, key.sandbox, connect_timeout))
}

fn proxy_tunnel(
    proxy: &ProxyConfig,
    http: HttpConnector,
) -> Result<Tunnel<HttpConnector>, TransportError> {
    let proxy_uri: Uri = format!("http://{}:{}", proxy.host, proxy.port)
        .parse()
        .map_err(|e: http::uri::InvalidUri| {
            TransportError::config(crate::config::keys::HTTP_PROXY_HOST, e.to_string())
        })?;

    let mut tunnel = Tunnel::new(proxy_uri, http);
    if let Some(username) = &proxy.username {
        let password = proxy.password.as_ref().map_or("", SecretString::expose);
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let mut auth = HeaderValue::try_from(format!("Basic {encoded}")).map_err(|e| {
            TransportError::config(crate::config::keys::HTTP_PROXY_USERNAME, e.to_string())
        })?;
        auth.set_sensitive(true);
        tunnel = tunnel.with_auth(auth);
    }
    Ok(tunnel)
}

fn wrap_https<C>(
    inner: C,
    tls_config: rustls::ClientConfig,
    transport: TransportSecurity,
) -> HttpsConnector<C> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls_config);
    match transport {
        TransportSecurity::AllowInsecureHttp => builder
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(inner),
        TransportSecurity::TlsOnly => builder
            .https_only()
            .enable_all_versions()
            .wrap_connector(inner),
    }
}

fn into_service<C>(
    connector: C,
    sandbox: bool,
    connect_timeout: Option<Duration>,
) -> ConnectionService
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let mut builder = Client::builder(TokioExecutor::new());
    // pool_timer is required for pool_idle_timeout to take effect
    builder
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(IDLE_SOCKET_TIMEOUT)
        .pool_max_idle_per_host(usize::from(!sandbox));

    let client: Client<C, Full<Bytes>> = builder.build(connector);
    client
        .map_err(move |e| map_client_error(e, connect_timeout))
        .boxed_clone()
}

enum FailureClass {
    TimedOut,
    Tls,
    Other,
}

/// Walk the source chain looking for a timeout or a rustls failure.
fn failure_class(err: &(dyn StdError + 'static)) -> FailureClass {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return FailureClass::Tls;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return FailureClass::TimedOut;
            }
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return FailureClass::Tls;
            }
        }
        current = e.source();
    }
    FailureClass::Other
}

fn map_client_error(
    err: hyper_util::client::legacy::Error,
    connect_timeout: Option<Duration>,
) -> TransportError {
    let kind = match failure_class(&err) {
        FailureClass::TimedOut if err.is_connect() => HttpFailureKind::Timeout {
            phase: TimeoutPhase::Connect,
            after: connect_timeout.unwrap_or_default(),
        },
        FailureClass::Tls => HttpFailureKind::Tls(Box::new(err)),
        FailureClass::TimedOut | FailureClass::Other => {
            if err.is_connect() {
                HttpFailureKind::Connect(Box::new(err))
            } else {
                HttpFailureKind::Io(Box::new(err))
            }
        }
    };
    TransportError::http(kind)
}

fn read_timeout_error(read_timeout: Option<Duration>) -> TransportError {
    TransportError::http(HttpFailureKind::Timeout {
        phase: TimeoutPhase::Read,
        after: read_timeout.unwrap_or_default(),
    })
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

enum BodyRead {
    Complete(Bytes),
    TooLarge,
}

async fn read_body(body: Incoming, limit: usize) -> Result<BodyRead, TransportError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(BodyRead::Complete(collected.to_bytes())),
        Err(e) if e.is::<LengthLimitError>() => Ok(BodyRead::TooLarge),
        Err(e) => Err(TransportError::http(HttpFailureKind::Io(e))),
    }
}

fn classify_response(
    status: StatusCode,
    headers: &http::HeaderMap,
    body: BodyRead,
    max_body: usize,
) -> Result<String, TransportError> {
    if status.is_success() {
        return match body {
            BodyRead::Complete(bytes) => {
                String::from_utf8(bytes.to_vec()).map_err(|e| TransportError::InvalidResponseData {
                    reason: format!("response body is not valid UTF-8: {e}"),
                })
            }
            BodyRead::TooLarge => Err(TransportError::InvalidResponseData {
                reason: format!("response body exceeds {max_body} bytes"),
            }),
        };
    }

    if status.is_redirection() {
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        return Err(TransportError::ClientActionRequired { status, location });
    }

    if status == StatusCode::UNAUTHORIZED
        && let Some(challenge) = headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.get(..6).is_some_and(|s| s.eq_ignore_ascii_case("bearer")))
    {
        return Err(TransportError::OAuth {
            status,
            challenge: challenge.to_owned(),
        });
    }

    let body_preview = match body {
        BodyRead::Complete(bytes) => {
            let end = bytes.len().min(ERROR_BODY_PREVIEW_LIMIT);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        BodyRead::TooLarge => String::new(),
    };
    Err(TransportError::http(HttpFailureKind::Status {
        status,
        body_preview,
    }))
}
