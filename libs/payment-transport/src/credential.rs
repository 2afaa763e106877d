//! Caller-supplied proof of identity for a call.
//!
//! Token and signature credentials authenticate through headers the request
//! builder has already embedded; only [`CertificateCredential`] changes how
//! the transport itself is set up.

use std::path::PathBuf;

use crate::secret::SecretString;

/// Closed set of credential variants a request can carry.
#[derive(Debug, Clone)]
pub enum Credential {
    Token(TokenCredential),
    Signature(SignatureCredential),
    Certificate(CertificateCredential),
}

impl Credential {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Signature(_) => "signature",
            Self::Certificate(_) => "certificate",
        }
    }

    #[must_use]
    pub fn application_id(&self) -> Option<&str> {
        match self {
            Self::Token(c) => c.application_id.as_deref(),
            Self::Signature(c) => c.application_id.as_deref(),
            Self::Certificate(c) => c.application_id.as_deref(),
        }
    }
}

/// Third-party access token obtained out of band.
#[derive(Debug, Clone)]
pub struct TokenCredential {
    pub access_token: SecretString,
    pub token_secret: Option<SecretString>,
    pub application_id: Option<String>,
}

impl TokenCredential {
    #[must_use]
    pub fn new(access_token: impl Into<SecretString>) -> Self {
        Self {
            access_token: access_token.into(),
            token_secret: None,
            application_id: None,
        }
    }
}

impl From<TokenCredential> for Credential {
    fn from(value: TokenCredential) -> Self {
        Self::Token(value)
    }
}

/// API username, password and signature.
#[derive(Debug, Clone)]
pub struct SignatureCredential {
    pub username: String,
    pub password: SecretString,
    pub signature: SecretString,
    pub application_id: Option<String>,
}

impl SignatureCredential {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<SecretString>,
        signature: impl Into<SecretString>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            signature: signature.into(),
            application_id: None,
        }
    }
}

impl From<SignatureCredential> for Credential {
    fn from(value: SignatureCredential) -> Self {
        Self::Signature(value)
    }
}

/// API username and password plus a client certificate for mutual TLS.
///
/// `certificate_path` is a PEM file with the certificate chain (leaf first);
/// `certificate_key` is a PEM file with the matching unencrypted private key.
#[derive(Debug, Clone)]
pub struct CertificateCredential {
    pub username: String,
    pub password: SecretString,
    pub certificate_path: PathBuf,
    pub certificate_key: PathBuf,
    pub application_id: Option<String>,
}

impl CertificateCredential {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<SecretString>,
        certificate_path: impl Into<PathBuf>,
        certificate_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            certificate_path: certificate_path.into(),
            certificate_key: certificate_key.into(),
            application_id: None,
        }
    }
}

impl From<CertificateCredential> for Credential {
    fn from(value: CertificateCredential) -> Self {
        Self::Certificate(value)
    }
}
