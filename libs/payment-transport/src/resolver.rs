use crate::connection::{Connection, SslMode};
use crate::credential::Credential;
use crate::error::TransportError;

/// Maps a credential to the SSL mode of the connection serving the call.
///
/// Token and signature credentials travel in headers, so the connection uses
/// default SSL. Certificate credentials switch the connection to mutual TLS
/// with the identity named by the credential. The mode is set on every call,
/// so a connection never carries a previous caller's certificate forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialResolver;

impl CredentialResolver {
    /// Apply `credential` to `conn` and return the resulting SSL mode.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidCredential`] if a token or username is blank
    /// - [`TransportError::SslConfiguration`] if certificate paths are empty
    ///   or the files cannot be loaded
    pub fn resolve(
        credential: &Credential,
        conn: &mut Connection,
    ) -> Result<SslMode, TransportError> {
        match credential {
            Credential::Token(token) => {
                if token.access_token.is_empty() {
                    return Err(TransportError::InvalidCredential {
                        reason: "access token is empty".to_owned(),
                    });
                }
                conn.use_default_ssl();
            }
            Credential::Signature(signature) => {
                if signature.username.trim().is_empty() {
                    return Err(TransportError::InvalidCredential {
                        reason: "API username is empty".to_owned(),
                    });
                }
                conn.use_default_ssl();
            }
            Credential::Certificate(cert) => {
                conn.setup_client_ssl(&cert.certificate_path, &cert.certificate_key)?;
            }
        }

        tracing::debug!(
            connection_id = conn.id(),
            credential = credential.kind(),
            default_ssl = conn.is_default_ssl(),
            "credential resolved"
        );
        Ok(conn.ssl_mode().clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::credential::{CertificateCredential, SignatureCredential, TokenCredential};
    use std::path::PathBuf;

    fn pem_pair(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        let certified =
            rcgen::generate_simple_self_signed(vec!["merchant.example".to_owned()]).unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.signing_key.serialize_pem()).unwrap();
        (cert, key)
    }

    #[test]
    fn token_and_signature_use_default_ssl() {
        let mut conn = Connection::new(1);
        let mode =
            CredentialResolver::resolve(&TokenCredential::new("tok").into(), &mut conn).unwrap();
        assert_eq!(mode, SslMode::Default);

        let mode = CredentialResolver::resolve(
            &SignatureCredential::new("merchant", "pw", "sig").into(),
            &mut conn,
        )
        .unwrap();
        assert_eq!(mode, SslMode::Default);
    }

    #[test]
    fn certificate_then_token_resets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = pem_pair(&dir);
        let mut conn = Connection::new(1);

        let cert_cred: Credential =
            CertificateCredential::new("merchant", "pw", cert.clone(), key.clone()).into();
        let mode = CredentialResolver::resolve(&cert_cred, &mut conn).unwrap();
        assert_eq!(
            mode,
            SslMode::ClientCertificate {
                cert_path: cert,
                key_path: key
            }
        );

        let mode =
            CredentialResolver::resolve(&TokenCredential::new("tok").into(), &mut conn).unwrap();
        assert_eq!(mode, SslMode::Default);
        assert!(conn.is_default_ssl());
    }

    #[test]
    fn empty_certificate_path_fails() {
        let mut conn = Connection::new(1);
        let cred: Credential = CertificateCredential::new("merchant", "pw", "", "").into();
        let err = CredentialResolver::resolve(&cred, &mut conn).unwrap_err();
        assert!(matches!(err, TransportError::SslConfiguration { .. }));
    }

    #[test]
    fn blank_token_is_invalid() {
        let mut conn = Connection::new(1);
        let err = CredentialResolver::resolve(&TokenCredential::new("").into(), &mut conn)
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidCredential { .. }));

        let err = CredentialResolver::resolve(
            &SignatureCredential::new("  ", "pw", "sig").into(),
            &mut conn,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::InvalidCredential { .. }));
    }
}
