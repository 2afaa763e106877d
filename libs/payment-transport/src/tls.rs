//! TLS setup for connections.
//!
//! Default SSL uses the configured root store with no client authentication.
//! Client-certificate SSL adds an identity loaded from PEM files. Native root
//! certificates are read from the OS once per process and cached. An optional
//! PEM file of extra trust anchors is added on top of either store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use rustls_pki_types::pem::{self, PemObject};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::TlsRootConfig;
use crate::error::TransportError;

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// Counter for test verification that the loader only runs once.
#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }

    result.certs
}

/// Get cached native root certificates (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Get the crypto provider for TLS connections.
///
/// Uses the process-wide default provider if one is installed, otherwise
/// aws-lc-rs without installing it globally.
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn root_store(
    tls_roots: TlsRootConfig,
    trusted_ca_file: Option<&Path>,
) -> Result<rustls::RootCertStore, TransportError> {
    let mut store = rustls::RootCertStore::empty();
    match tls_roots {
        TlsRootConfig::WebPki => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsRootConfig::Native => {
            let certs = native_root_certs();
            if certs.is_empty() {
                return Err(TransportError::ssl(
                    "no native root CA certificates found in OS certificate store",
                ));
            }
            let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
            if ignored > 0 {
                tracing::warn!(
                    added,
                    ignored,
                    "some native root certificates could not be parsed"
                );
            }
            if added == 0 {
                return Err(TransportError::ssl(format!(
                    "no valid native root CA certificates parsed (found {}, all failed to parse)",
                    certs.len()
                )));
            }
        }
    }

    if let Some(path) = trusted_ca_file {
        let pem_data = read_file(path, "trusted CA")?;
        let anchors = CertificateDer::pem_slice_iter(&pem_data)
            .collect::<Result<Vec<_>, pem::Error>>()
            .map_err(|e| {
                TransportError::ssl_with_source(
                    format!("malformed trusted CA file {}", path.display()),
                    e,
                )
            })?;
        let (added, _) = store.add_parsable_certificates(anchors);
        if added == 0 {
            return Err(TransportError::ssl(format!(
                "no usable CA certificate in {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), added, "added trusted CA certificates");
    }
    Ok(store)
}

/// Client certificate chain and private key for mutual TLS.
pub struct ClientIdentity {
    cert_path: PathBuf,
    key_path: PathBuf,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    /// Load a certificate chain and private key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SslConfiguration`] if either path is empty,
    /// a file cannot be read, or it holds no usable certificate / key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        if cert_path.as_os_str().is_empty() {
            return Err(TransportError::ssl("certificate path is empty"));
        }
        if key_path.as_os_str().is_empty() {
            return Err(TransportError::ssl("certificate key path is empty"));
        }

        let cert_pem = read_file(cert_path, "certificate")?;
        let chain = CertificateDer::pem_slice_iter(&cert_pem)
            .collect::<Result<Vec<_>, pem::Error>>()
            .map_err(|e| {
                TransportError::ssl_with_source(
                    format!("malformed certificate file {}", cert_path.display()),
                    e,
                )
            })?;
        if chain.is_empty() {
            return Err(TransportError::ssl(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }

        let key_pem = read_file(key_path, "certificate key")?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| {
            TransportError::ssl_with_source(
                format!("no usable private key in {}", key_path.display()),
                e,
            )
        })?;

        tracing::debug!(
            cert_path = %cert_path.display(),
            chain_len = chain.len(),
            "loaded client certificate"
        );

        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            chain,
            key,
        })
    }

    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub(crate) fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| {
        TransportError::ssl_with_source(format!("cannot read {what} file {}", path.display()), e)
    })
}

/// Build a rustls `ClientConfig` for the given roots and optional client identity.
///
/// # Errors
///
/// Returns [`TransportError::SslConfiguration`] if the root store is unusable,
/// the trusted CA file cannot be read, or rustls rejects the client
/// certificate / key pair.
pub fn client_config(
    tls_roots: TlsRootConfig,
    trusted_ca_file: Option<&Path>,
    identity: Option<&ClientIdentity>,
) -> Result<rustls::ClientConfig, TransportError> {
    let roots = root_store(tls_roots, trusted_ca_file)?;

    let builder = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::ssl_with_source("failed to set TLS protocol versions", e))?
        .with_root_certificates(roots);

    match identity {
        None => Ok(builder.with_no_client_auth()),
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| {
                TransportError::ssl_with_source(
                    format!(
                        "client certificate {} rejected",
                        identity.cert_path.display()
                    ),
                    e,
                )
            }),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn generated_pair() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let certified = rcgen::generate_simple_self_signed(vec!["merchant.example".to_owned()])
            .unwrap();
        (
            write_temp(&certified.cert.pem()),
            write_temp(&certified.signing_key.serialize_pem()),
        )
    }

    #[test]
    fn test_native_roots_cached() {
        let initial_count = LOAD_COUNT.load(Ordering::SeqCst);
        let result1 = native_root_certs();
        let result2 = native_root_certs();

        let final_count = LOAD_COUNT.load(Ordering::SeqCst);
        assert!(final_count <= initial_count + 1);
        assert!(std::ptr::eq(result1, result2), "should return same slice");
    }

    #[test]
    fn test_default_config_with_webpki_roots() {
        let config = client_config(TlsRootConfig::WebPki, None, None).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_identity_roundtrip_into_client_config() {
        let (cert, key) = generated_pair();
        let identity = ClientIdentity::load(cert.path(), key.path()).unwrap();
        assert_eq!(identity.cert_path(), cert.path());

        let config = client_config(TlsRootConfig::WebPki, None, Some(&identity)).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_empty_paths_rejected() {
        let (cert, _key) = generated_pair();
        let err = ClientIdentity::load(Path::new(""), cert.path()).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));

        let err = ClientIdentity::load(cert.path(), Path::new("")).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));
    }

    #[test]
    fn test_unreadable_file_rejected() {
        let (_cert, key) = generated_pair();
        let err =
            ClientIdentity::load(Path::new("/nonexistent/merchant-cert.pem"), key.path())
                .unwrap_err();
        match err {
            TransportError::SslConfiguration { reason, source } => {
                assert!(reason.contains("cannot read certificate file"));
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_files_rejected() {
        let garbage = write_temp("this is not PEM at all");
        let (cert, key) = generated_pair();

        let err = ClientIdentity::load(garbage.path(), key.path()).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));

        let err = ClientIdentity::load(cert.path(), garbage.path()).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));
    }

    #[test]
    fn test_trusted_ca_file_extends_roots() {
        let (cert, _key) = generated_pair();
        let webpki_only = root_store(TlsRootConfig::WebPki, None).unwrap();
        let extended = root_store(TlsRootConfig::WebPki, Some(cert.path())).unwrap();
        assert_eq!(extended.len(), webpki_only.len() + 1);

        let err = client_config(
            TlsRootConfig::WebPki,
            Some(Path::new("/nonexistent/corp-ca.pem")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));

        let garbage = write_temp("not a certificate");
        let err = root_store(TlsRootConfig::WebPki, Some(garbage.path())).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let (cert, key) = generated_pair();
        let identity = ClientIdentity::load(cert.path(), key.path()).unwrap();
        let dbg = format!("{identity:?}");
        assert!(dbg.contains("chain_len"));
        assert!(!dbg.contains("PRIVATE KEY"));
    }
}
