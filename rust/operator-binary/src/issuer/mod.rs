//! In-process certificate issuers.
//!
//! Every issuer exposes the same capability: turn a [`CertificateRequest`] into a signed
//! certificate. The policy engine never cares which one produced a certificate, only what it
//! contains.

use openssl::{
    asn1::Asn1Integer,
    bn::{BigNum, MsbOption},
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier},
        X509Builder, X509NameBuilder, X509,
    },
};
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use stackable_certificate_policy_pki::oid;
use stackable_operator::k8s_openapi::api::core::v1::Secret;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    crd::{CertificateRequest, DEFAULT_DURATION},
    inspect::{self, inspect_certificate_request, inspect_private_key, inspect_secret},
    utils::{datetime_to_asn1_time, serial_hex},
};

mod request;

pub use request::{build_csr, encode_private_key, generate_private_key, new_certificate_request};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode CertificateRequest"))]
    InspectRequest { source: inspect::RequestError },

    #[snafu(display("CertificateRequest is not signed by the key it requests a certificate for"))]
    InvalidRequestSignature,

    #[snafu(display("failed to verify CertificateRequest signature"))]
    VerifyRequest { source: openssl::error::ErrorStack },

    #[snafu(display("self-signed certificates must be requested for the issuer's own key"))]
    SelfSignedKeyMismatch,

    #[snafu(display("requested duration is out of range"))]
    DurationOutOfRange,

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to generate CA key"))]
    GenerateCaKey { source: request::Error },

    #[snafu(display("CA Secret is invalid"))]
    InvalidCaSecret { source: inspect::Error },

    #[snafu(display("CA Secret does not contain a CA certificate"))]
    NotACa,

    #[snafu(display("Secret does not contain a usable private key"))]
    InvalidKeySecret { source: inspect::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A CA that signs leaf certificates with its own key.
pub struct CertificateAuthority {
    pub ca_cert: X509,
    pub ca_key: PKey<Private>,
    not_after: OffsetDateTime,
}

impl CertificateAuthority {
    /// Creates a fresh CA with a self-signed certificate, valid from `now` for `lifetime`.
    pub fn new_self_signed(
        common_name: &str,
        now: OffsetDateTime,
        lifetime: Duration,
    ) -> Result<Self> {
        let subject_name = X509NameBuilder::new()
            .and_then(|mut name| {
                name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
                Ok(name)
            })
            .context(BuildCertificateSnafu)?
            .build();
        let not_after = now + lifetime;
        let ca_key = generate_private_key(&Default::default()).context(GenerateCaKeySnafu)?;
        let ca_cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(&subject_name)?;
                x509.set_not_before(datetime_to_asn1_time(now)?.as_ref())?;
                x509.set_not_after(datetime_to_asn1_time(not_after)?.as_ref())?;
                x509.set_pubkey(&ca_key)?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let ctx = x509.x509v3_context(None, None);
                let exts = [
                    BasicConstraints::new().critical().ca().build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_cert_sign()
                        .crl_sign()
                        .build()?,
                ];
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&ca_key, request::signing_digest(&ca_key))?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        Ok(Self {
            ca_cert,
            ca_key,
            not_after,
        })
    }

    /// Loads a CA from a Secret in the usual `tls.crt`/`tls.key` layout.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let state = inspect_secret(Some(secret)).context(InvalidCaSecretSnafu)?;
        ensure!(state.details.is_ca(), NotACaSnafu);
        Ok(Self {
            ca_cert: state.certificate,
            ca_key: state.private_key,
            not_after: state.not_after,
        })
    }
}

/// The issuer back-ends that can run in-process.
pub enum Issuer {
    /// Signs every request with the requested key itself.
    SelfSigned { key: PKey<Private> },
    Ca(CertificateAuthority),
}

#[derive(Debug)]
pub struct SignedCertificate {
    pub certificate: X509,
    /// The PEM-encoded certificate, as stored in `tls.crt`.
    pub certificate_pem: Vec<u8>,
    /// The PEM-encoded issuing CA, as stored in `ca.crt`.
    pub ca_pem: Vec<u8>,
}

impl Issuer {
    /// A self-signed issuer for the key already stored in `secret`, for reissuing a Certificate
    /// without rotating its key.
    pub fn self_signed_from_secret(secret: &Secret) -> Result<Self> {
        let key = inspect_private_key(Some(secret)).context(InvalidKeySecretSnafu)?;
        Ok(Issuer::SelfSigned { key })
    }

    /// Signs `request`, valid from `now` for the requested duration.
    ///
    /// CA-issued certificates never outlive their CA.
    pub fn sign(
        &self,
        request: &CertificateRequest,
        now: OffsetDateTime,
    ) -> Result<SignedCertificate> {
        let state = inspect_certificate_request(request).context(InspectRequestSnafu)?;
        let csr = &state.request;
        let public_key = csr.public_key().context(VerifyRequestSnafu)?;
        ensure!(
            csr.verify(&public_key).context(VerifyRequestSnafu)?,
            InvalidRequestSignatureSnafu
        );

        let (signing_key, issuer_cert) = match self {
            Issuer::SelfSigned { key } => {
                ensure!(public_key.public_eq(key), SelfSignedKeyMismatchSnafu);
                (key, None)
            }
            Issuer::Ca(ca) => (&ca.ca_key, Some(ca)),
        };

        let duration = Duration::try_from(*request.spec.duration.unwrap_or(DEFAULT_DURATION))
            .ok()
            .filter(|duration| duration.is_positive())
            .context(DurationOutOfRangeSnafu)?;
        let mut not_after = now
            .checked_add(duration)
            .context(DurationOutOfRangeSnafu)?;
        if let Some(ca) = issuer_cert {
            not_after = not_after.min(ca.not_after);
        }

        let sans = state.details.extension(oid::SUBJECT_ALT_NAME);
        let certificate = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_version(3 - 1)?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                x509.set_subject_name(csr.subject_name())?;
                x509.set_issuer_name(match issuer_cert {
                    Some(ca) => ca.ca_cert.subject_name(),
                    None => csr.subject_name(),
                })?;
                x509.set_not_before(datetime_to_asn1_time(now)?.as_ref())?;
                x509.set_not_after(datetime_to_asn1_time(not_after)?.as_ref())?;
                x509.set_pubkey(&public_key)?;

                let mut exts = Vec::new();
                let mut basic_constraints = BasicConstraints::new();
                basic_constraints.critical();
                if request.spec.is_ca {
                    basic_constraints.ca();
                }
                exts.push(basic_constraints.build()?);
                exts.extend(request::usage_extensions(
                    &request.spec.usages(),
                    request.spec.is_ca,
                )?);
                if let Some(sans) = sans {
                    exts.push(request::raw_extension(
                        oid::SUBJECT_ALT_NAME,
                        sans.critical,
                        &sans.value,
                    )?);
                }
                let ctx = x509.x509v3_context(issuer_cert.map(|ca| &*ca.ca_cert), None);
                exts.push(SubjectKeyIdentifier::new().build(&ctx)?);
                if issuer_cert.is_some() {
                    exts.push(
                        AuthorityKeyIdentifier::new()
                            .issuer(false)
                            .keyid(false)
                            .build(&ctx)?,
                    );
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(signing_key, request::signing_digest(signing_key))?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();

        let certificate_pem = certificate.to_pem().context(SerializeCertificateSnafu)?;
        let ca_pem = match issuer_cert {
            Some(ca) => ca.ca_cert.to_pem().context(SerializeCertificateSnafu)?,
            None => certificate_pem.clone(),
        };
        let serial = serial_hex(&certificate);
        debug!(%serial, %not_after, "signed certificate");
        Ok(SignedCertificate {
            certificate,
            certificate_pem,
            ca_pem,
        })
    }
}

fn random_serial() -> Result<Asn1Integer, openssl::error::ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

/// Builds complete certificate Secrets the way cert-manager writes them.
#[cfg(test)]
pub mod testing {
    use std::collections::BTreeMap;

    use serde_json::{json, Map, Value};
    use stackable_certificate_policy_pki::x509::Details;
    use stackable_operator::{
        k8s_openapi::{
            apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry},
            ByteString,
        },
        kube::api::ObjectMeta,
    };

    use super::*;
    use crate::{
        crd::{Certificate, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY},
        metadata::{
            additional_output_data, expected_keystore_keys, expected_owner_reference,
            ExpectedMetadata,
        },
        policy::Options,
    };

    fn key_and_request(crt: &Certificate) -> (PKey<Private>, CertificateRequest) {
        let key = generate_private_key(&crt.spec.private_key()).unwrap();
        let csr = build_csr(&crt.spec, &key).unwrap();
        let request = new_certificate_request(crt, 1, &csr).unwrap();
        (key, request)
    }

    /// A CertificateRequest for `crt`, as the issuing controller would create it.
    pub fn certificate_request(crt: &Certificate) -> CertificateRequest {
        key_and_request(crt).1
    }

    /// A self-signed certificate for `crt`, as `(certificate PEM, private key PEM)`.
    pub fn self_signed_certificate(crt: &Certificate) -> (Vec<u8>, Vec<u8>) {
        let (key, request) = key_and_request(crt);
        let signed = Issuer::SelfSigned { key: key.clone() }
            .sign(&request, OffsetDateTime::now_utc())
            .unwrap();
        let key_pem = encode_private_key(&key, crt.spec.private_key().encoding()).unwrap();
        (signed.certificate_pem, key_pem)
    }

    fn fields<'a>(keys: impl IntoIterator<Item = &'a String>) -> Value {
        Value::Object(
            keys.into_iter()
                .map(|key| (format!("f:{key}"), json!({})))
                .collect(),
        )
    }

    pub fn issue_secret(crt: &Certificate) -> Secret {
        issue_secret_with_options(crt, &Options::default())
    }

    /// A CA-issued Secret for `crt` that is up to date under `options`, including the managed
    /// fields of `options.field_manager`.
    pub fn issue_secret_with_options(crt: &Certificate, options: &Options) -> Secret {
        let now = OffsetDateTime::now_utc();
        let (key, request) = key_and_request(crt);
        let ca =
            CertificateAuthority::new_self_signed("test CA", now, Duration::days(365)).unwrap();
        let signed = Issuer::Ca(ca).sign(&request, now).unwrap();
        let key_pem = encode_private_key(&key, crt.spec.private_key().encoding()).unwrap();

        let mut data = BTreeMap::from([
            (TLS_KEY_KEY.to_string(), key_pem.clone()),
            (TLS_CERT_KEY.to_string(), signed.certificate_pem.clone()),
            (CA_CERT_KEY.to_string(), signed.ca_pem.clone()),
        ]);
        for (key, value) in
            additional_output_data(crt, &key_pem, &signed.certificate_pem).unwrap()
        {
            data.insert(key.to_string(), value);
        }
        // keystores are only checked for presence
        for key in expected_keystore_keys(crt, true) {
            data.insert(key.to_string(), b"keystore".to_vec());
        }

        let details =
            Details::from_certificate_der(&signed.certificate.to_der().unwrap()).unwrap();
        let expected = ExpectedMetadata::new(crt, &details);
        let owner_references = options
            .owner_references_enabled
            .then(|| expected_owner_reference(crt))
            .flatten()
            .map(|owner| vec![owner]);

        let mut metadata_fields = Map::new();
        metadata_fields.insert("f:labels".to_string(), fields(expected.labels.keys()));
        metadata_fields.insert(
            "f:annotations".to_string(),
            fields(expected.annotations.keys()),
        );
        if let Some(owner_references) = &owner_references {
            metadata_fields.insert(
                "f:ownerReferences".to_string(),
                Value::Object(
                    owner_references
                        .iter()
                        .map(|owner| (format!("k:{{\"uid\":\"{}\"}}", owner.uid), json!({})))
                        .collect(),
                ),
            );
        }
        let managed_fields = ManagedFieldsEntry {
            manager: Some(options.field_manager.clone()),
            operation: Some("Apply".to_string()),
            fields_type: Some("FieldsV1".to_string()),
            fields_v1: Some(FieldsV1(json!({
                "f:metadata": metadata_fields,
                "f:data": fields(data.keys()),
            }))),
            ..ManagedFieldsEntry::default()
        };

        Secret {
            metadata: ObjectMeta {
                name: Some(crt.spec.secret_name.clone()),
                namespace: crt.metadata.namespace.clone(),
                labels: Some(expected.labels),
                annotations: Some(expected.annotations),
                owner_references,
                managed_fields: Some(vec![managed_fields]),
                ..ObjectMeta::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Secret::default()
        }
    }
}
