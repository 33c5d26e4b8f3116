//! Parses the key material stored in a certificate Secret, and the CSR of a CertificateRequest.
//!
//! Nothing here panics on malformed input, every failure is reported as an [`Error`] whose
//! [`Error::reason`] is the policy violation it amounts to.

use openssl::{
    pkey::{PKey, Private},
    x509::{X509Req, X509},
};
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use stackable_certificate_policy_pki::{pem, x509::Details};
use stackable_operator::k8s_openapi::{api::core::v1::Secret, ByteString};
use time::OffsetDateTime;

use crate::{
    crd::{CertificateRequest, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY},
    policy::Reason,
    utils::{asn1_time_to_datetime, Asn1TimeError},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Secret does not exist"))]
    SecretNotFound,

    #[snafu(display("Secret does not contain {key:?}"))]
    MissingKey { key: &'static str },

    #[snafu(display("Secret contains an empty {key:?}"))]
    EmptyKey { key: &'static str },

    #[snafu(display("Secret key {key:?} does not contain PEM data"))]
    NotPem { key: &'static str },

    #[snafu(display("Secret contains invalid private key data"))]
    ParsePrivateKey { source: openssl::error::ErrorStack },

    #[snafu(display("Secret contains an invalid certificate"))]
    ParseCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("Secret contains a certificate that could not be decoded"))]
    DecodeCertificate {
        source: stackable_certificate_policy_pki::x509::Error,
    },

    #[snafu(display("Secret contains a certificate with an invalid validity period"))]
    CertificateValidity { source: Asn1TimeError },

    #[snafu(display("Secret contains an invalid CA certificate"))]
    ParseCa { source: openssl::error::ErrorStack },

    #[snafu(display("Secret contains a private key that does not match the certificate"))]
    KeyPairMismatch,

    #[snafu(display("failed to read the public key of the certificate"))]
    CertificatePublicKey { source: openssl::error::ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The policy violation that this failure amounts to.
    pub fn reason(&self) -> Reason {
        match self {
            Error::SecretNotFound | Error::MissingKey { .. } => Reason::DoesNotExist,
            Error::EmptyKey { .. } | Error::NotPem { .. } | Error::ParseCa { .. } => {
                Reason::MissingData
            }
            Error::ParsePrivateKey { .. } => Reason::InvalidPrivateKey,
            Error::ParseCertificate { .. }
            | Error::DecodeCertificate { .. }
            | Error::CertificateValidity { .. } => Reason::InvalidCertificate,
            Error::KeyPairMismatch | Error::CertificatePublicKey { .. } => Reason::InvalidKeyPair,
        }
    }
}

/// The key material of a Secret that passed every structural check.
#[derive(Debug)]
pub struct SecretState {
    pub private_key: PKey<Private>,
    /// The PEM-encoded key, exactly as stored.
    pub private_key_pem: Vec<u8>,
    pub certificate: X509,
    /// The PEM-encoded certificate chain, exactly as stored.
    pub certificate_pem: Vec<u8>,
    pub details: Details,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// `ca.crt`, if present.
    pub ca: Option<Vec<X509>>,
}

/// Parses and cross-checks the contents of a certificate Secret.
///
/// Checks run in the order existence, emptiness, key decoding, certificate decoding, CA
/// decoding and finally key pair matching. The first failing check wins.
pub fn inspect_secret(secret: Option<&Secret>) -> Result<SecretState> {
    let secret = secret.context(SecretNotFoundSnafu)?;
    let key_pem = data(secret, TLS_KEY_KEY).context(MissingKeySnafu { key: TLS_KEY_KEY })?;
    let cert_pem = data(secret, TLS_CERT_KEY).context(MissingKeySnafu { key: TLS_CERT_KEY })?;
    ensure!(!key_pem.is_empty(), EmptyKeySnafu { key: TLS_KEY_KEY });
    ensure!(!cert_pem.is_empty(), EmptyKeySnafu { key: TLS_CERT_KEY });
    ensure!(
        !pem::split_pem_blocks(key_pem).is_empty(),
        NotPemSnafu { key: TLS_KEY_KEY }
    );
    ensure!(
        !pem::split_pem_certificates(cert_pem).is_empty(),
        NotPemSnafu { key: TLS_CERT_KEY }
    );

    let private_key = PKey::private_key_from_pem(key_pem).context(ParsePrivateKeySnafu)?;
    let certificate = X509::from_pem(cert_pem).context(ParseCertificateSnafu)?;
    let details = certificate
        .to_der()
        .context(ParseCertificateSnafu)
        .and_then(|der| Details::from_certificate_der(&der).context(DecodeCertificateSnafu))?;
    let not_before =
        asn1_time_to_datetime(certificate.not_before()).context(CertificateValiditySnafu)?;
    let not_after =
        asn1_time_to_datetime(certificate.not_after()).context(CertificateValiditySnafu)?;

    let ca = match data(secret, CA_CERT_KEY) {
        Some(ca_pem) => {
            ensure!(!ca_pem.is_empty(), EmptyKeySnafu { key: CA_CERT_KEY });
            ensure!(
                !pem::split_pem_certificates(ca_pem).is_empty(),
                NotPemSnafu { key: CA_CERT_KEY }
            );
            Some(X509::stack_from_pem(ca_pem).context(ParseCaSnafu)?)
        }
        None => None,
    };

    ensure!(
        certificate
            .public_key()
            .context(CertificatePublicKeySnafu)?
            .public_eq(&private_key),
        KeyPairMismatchSnafu
    );

    Ok(SecretState {
        private_key,
        private_key_pem: key_pem.to_vec(),
        certificate,
        certificate_pem: cert_pem.to_vec(),
        details,
        not_before,
        not_after,
        ca,
    })
}

/// Parses just the private key of a Secret, for comparing it against a new request.
pub fn inspect_private_key(secret: Option<&Secret>) -> Result<PKey<Private>> {
    let secret = secret.context(SecretNotFoundSnafu)?;
    let key_pem = data(secret, TLS_KEY_KEY).context(MissingKeySnafu { key: TLS_KEY_KEY })?;
    ensure!(!key_pem.is_empty(), EmptyKeySnafu { key: TLS_KEY_KEY });
    PKey::private_key_from_pem(key_pem).context(ParsePrivateKeySnafu)
}

fn data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(value)| value.as_slice())
}

#[derive(Debug, Snafu)]
pub enum RequestError {
    #[snafu(display("CertificateRequest does not contain a PEM-encoded CSR"))]
    RequestNotPem,

    #[snafu(display("failed to parse CSR"))]
    ParseRequest { source: openssl::error::ErrorStack },

    #[snafu(display("failed to decode CSR"))]
    DecodeRequest {
        source: stackable_certificate_policy_pki::x509::Error,
    },
}

/// A decoded PKCS#10 request.
#[derive(Debug)]
pub struct RequestState {
    pub request: X509Req,
    pub details: Details,
}

pub fn inspect_certificate_request(
    request: &CertificateRequest,
) -> Result<RequestState, RequestError> {
    let csr_pem = &request.spec.request.0;
    ensure!(
        pem::split_pem_blocks(csr_pem)
            .iter()
            .any(|block| block.label.contains("CERTIFICATE REQUEST")),
        RequestNotPemSnafu
    );
    let csr = X509Req::from_pem(csr_pem).context(ParseRequestSnafu)?;
    let details = csr
        .to_der()
        .context(ParseRequestSnafu)
        .and_then(|der| {
            Details::from_certificate_request_der(&der).context(DecodeRequestSnafu)
        })?;
    Ok(RequestState {
        request: csr,
        details,
    })
}
