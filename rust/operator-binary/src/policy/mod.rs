//! Decides whether the Secret behind a [`Certificate`] is up to date.
//!
//! Evaluation is a pure function of its [`Input`]: the key material, CSR and managed fields are
//! parsed once into a [`Context`], and then each [`Check`] of a [`Chain`] is run in order until
//! one reports a [`PolicyViolation`].

use std::fmt::Display;

use stackable_operator::k8s_openapi::api::core::v1::Secret;
use time::OffsetDateTime;

use crate::{
    crd::{Certificate, CertificateRequest},
    inspect::{self, inspect_certificate_request, inspect_secret, RequestState, SecretState},
    metadata::{managed_fields, ManagedFields},
};

mod checks;
mod matching;
mod renewal;

pub use renewal::{renew_before, renewal_time};

/// The field manager that cert-manager's issuing controller applies Secrets as.
pub const DEFAULT_FIELD_MANAGER: &str = "cert-manager-certificates-issuing";

/// Why a Secret is not up to date, in the vocabulary of cert-manager's `Issuing` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Reason {
    DoesNotExist,
    MissingData,
    InvalidKeyPair,
    InvalidPrivateKey,
    InvalidCertificate,
    InvalidCertificateRequest,
    InvalidManagedFields,
    IncorrectIssuer,
    IncorrectCertificate,
    SecretMismatch,
    RequestChanged,
    Renewing,
    Expired,
    SecretMetadataMismatch,
    AdditionalOutputFormatsMismatch,
    SecretOwnerRefMismatch,
    SecretKeystoreMismatch,
}

/// What the issuing controller has to do about a violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Remediation {
    /// A new certificate must be requested.
    Reissue,
    /// The certificate is fine, only the Secret around it needs to be rewritten.
    UpdateSecret,
}

impl Reason {
    pub fn remediation(self) -> Remediation {
        match self {
            Reason::SecretMetadataMismatch
            | Reason::AdditionalOutputFormatsMismatch
            | Reason::SecretOwnerRefMismatch
            | Reason::SecretKeystoreMismatch => Remediation::UpdateSecret,
            _ => Remediation::Reissue,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyViolation {
    pub reason: Reason,
    pub message: String,
}

impl PolicyViolation {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Everything a policy evaluation looks at.
#[derive(Clone, Copy, Debug)]
pub struct Input<'a> {
    pub certificate: &'a Certificate,
    /// The Secret named by `spec.secretName`, if it exists.
    pub secret: Option<&'a Secret>,
    /// The CertificateRequest for the Certificate's current revision, if any.
    pub current_request: Option<&'a CertificateRequest>,
    pub now: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// The server-side apply field manager whose managed fields are authoritative.
    pub field_manager: String,
    /// Whether Secrets should be owned by their Certificate.
    pub owner_references_enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            owner_references_enabled: false,
        }
    }
}

/// The parsed view of an [`Input`] that checks run against.
pub struct Context<'a> {
    pub certificate: &'a Certificate,
    pub secret: Option<&'a Secret>,
    pub now: OffsetDateTime,
    pub options: &'a Options,
    pub secret_state: Result<SecretState, inspect::Error>,
    /// `None` if there is no current CertificateRequest.
    pub request: Option<(&'a CertificateRequest, Result<RequestState, inspect::RequestError>)>,
    /// `None` if there is no Secret.
    pub managed_fields: Option<Result<ManagedFields, managed_fields::Error>>,
}

impl<'a> Context<'a> {
    pub fn new(input: &Input<'a>, options: &'a Options) -> Self {
        Self {
            certificate: input.certificate,
            secret: input.secret,
            now: input.now,
            options,
            secret_state: inspect_secret(input.secret),
            request: input
                .current_request
                .map(|request| (request, inspect_certificate_request(request))),
            managed_fields: input
                .secret
                .map(|secret| ManagedFields::for_manager(secret, &options.field_manager)),
        }
    }

    /// The Secret, if it exists and its key material is sound.
    fn valid_secret(&self) -> Option<(&'a Secret, &SecretState)> {
        Some((self.secret?, self.secret_state.as_ref().ok()?))
    }

    fn managed(&self) -> Option<&ManagedFields> {
        self.managed_fields.as_ref()?.as_ref().ok()
    }
}

/// A single named policy check.
#[derive(Clone, Copy)]
pub struct Check {
    pub name: &'static str,
    evaluate: fn(&Context) -> Option<PolicyViolation>,
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Check").field(&self.name).finish()
    }
}

/// An ordered list of checks, the first violation wins.
#[derive(Clone, Debug)]
pub struct Chain(Vec<Check>);

impl Chain {
    /// Checks that can be fixed by rewriting the Secret.
    const SECRET_CHECKS: [Check; 4] = [
        checks::SECRET_METADATA,
        checks::ADDITIONAL_OUTPUT_FORMATS,
        checks::OWNER_REFERENCE,
        checks::KEYSTORES,
    ];

    /// Every check, in priority order: existence and parseability, identity, content, time and
    /// finally Secret metadata.
    pub fn full() -> Self {
        let mut chain = Self::issuance_prefix();
        chain.0.extend([checks::EXPIRED, checks::RENEWING]);
        chain.0.extend(Self::SECRET_CHECKS);
        chain
    }

    /// Whether a new certificate should be issued.
    pub fn issuance() -> Self {
        let mut chain = Self::issuance_prefix();
        chain.0.push(checks::RENEWING);
        chain
    }

    /// Whether the certificate should be reported as ready.
    pub fn readiness() -> Self {
        let mut chain = Self::issuance_prefix();
        chain.0.push(checks::EXPIRED);
        chain
    }

    /// Whether an up to date certificate's Secret needs to be rewritten.
    pub fn post_issuance() -> Self {
        let mut chain = Self(vec![checks::MANAGED_FIELDS]);
        chain.0.extend(Self::SECRET_CHECKS);
        chain
    }

    /// Whether a temporary certificate should be written while the real one is being issued.
    pub fn temporary_certificate() -> Self {
        Self(vec![checks::SECRET_STATE])
    }

    fn issuance_prefix() -> Self {
        Self(vec![
            checks::SECRET_STATE,
            checks::CERTIFICATE_REQUEST,
            checks::MANAGED_FIELDS,
            checks::ISSUER,
            checks::CERTIFICATE_NAME,
            checks::PRIVATE_KEY,
            checks::CERTIFICATE_CONTENT,
            checks::REQUEST_CHANGED,
        ])
    }

    pub fn check_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|check| check.name)
    }

    pub fn evaluate(&self, input: &Input, options: &Options) -> Option<PolicyViolation> {
        let ctx = Context::new(input, options);
        self.evaluate_context(&ctx)
    }

    pub fn evaluate_context(&self, ctx: &Context) -> Option<PolicyViolation> {
        self.0.iter().find_map(|check| (check.evaluate)(ctx))
    }
}

/// Evaluates the [full](Chain::full) chain.
pub fn evaluate(input: &Input, options: &Options) -> Option<PolicyViolation> {
    Chain::full().evaluate(input, options)
}

/// Formats a list of mismatches as `[a b c]`.
fn format_list<T: Display>(items: impl IntoIterator<Item = T>) -> String {
    let items = items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>();
    format!("[{}]", items.join(" "))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stackable_operator::{k8s_openapi::ByteString, kube::api::ObjectMeta};
    use time::Duration;

    use super::*;
    use crate::{
        crd::{
            AdditionalOutputFormat, AdditionalOutputFormatType, CertificatePrivateKey,
            GoDuration, Keystore, Keystores, OtherName, CERTIFICATE_NAME_ANNOTATION,
            ISSUER_NAME_ANNOTATION, PART_OF_CERT_MANAGER_LABEL, TLS_CERT_KEY,
        },
        issuer::testing::{certificate_request, issue_secret, issue_secret_with_options},
    };

    fn certificate() -> Certificate {
        serde_yaml::from_str(
            "
            apiVersion: cert-manager.io/v1
            kind: Certificate
            metadata:
              name: example
              namespace: default
              uid: 0b9c2f36-8a2e-4f0b-9d59-3f4c0e6f2a11
            spec:
              secretName: example-tls
              commonName: example.com
              dnsNames:
              - example.com
              - www.example.com
              duration: 24h
              issuerRef:
                name: ca-issuer
                kind: ClusterIssuer
            ",
        )
        .unwrap()
    }

    fn evaluate_at(
        certificate: &Certificate,
        secret: Option<&Secret>,
        request: Option<&CertificateRequest>,
        now: OffsetDateTime,
    ) -> Option<Reason> {
        Chain::full()
            .evaluate(
                &Input {
                    certificate,
                    secret,
                    current_request: request,
                    now,
                },
                &Options::default(),
            )
            .map(|violation| violation.reason)
    }

    fn evaluate_now(certificate: &Certificate, secret: Option<&Secret>) -> Option<Reason> {
        evaluate_at(certificate, secret, None, OffsetDateTime::now_utc())
    }

    #[test]
    fn test_up_to_date() {
        let certificate = certificate();
        let secret = issue_secret(&certificate);
        let request = certificate_request(&certificate);
        assert_eq!(evaluate_now(&certificate, Some(&secret)), None);
        assert_eq!(
            evaluate_at(
                &certificate,
                Some(&secret),
                Some(&request),
                OffsetDateTime::now_utc()
            ),
            None
        );
    }

    #[test]
    fn test_existence_outranks_metadata() {
        let certificate = certificate();
        assert_eq!(evaluate_now(&certificate, None), Some(Reason::DoesNotExist));

        let mut secret = issue_secret(&certificate);
        secret.data.as_mut().unwrap().remove(TLS_CERT_KEY);
        secret.metadata.labels = None;
        secret.metadata.annotations = None;
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::DoesNotExist)
        );
    }

    #[test]
    fn test_incorrect_issuer() {
        let mut certificate = certificate();
        let secret = issue_secret(&certificate);
        certificate.spec.issuer_ref.name = "other-issuer".to_string();
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::IncorrectIssuer)
        );

        // an unset kind means Issuer, an unset group means cert-manager.io
        let mut certificate = self::certificate();
        certificate.spec.issuer_ref.kind = None;
        let mut secret = issue_secret(&certificate);
        assert_eq!(evaluate_now(&certificate, Some(&secret)), None);
        certificate.spec.issuer_ref.group = Some("cert-manager.io".to_string());
        assert_eq!(evaluate_now(&certificate, Some(&secret)), None);
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(ISSUER_NAME_ANNOTATION.to_string(), "somebody-else".to_string());
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::IncorrectIssuer)
        );
    }

    #[test]
    fn test_incorrect_certificate() {
        let certificate = certificate();
        let mut secret = issue_secret(&certificate);
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(CERTIFICATE_NAME_ANNOTATION.to_string(), "other".to_string());
        let violation = Chain::full()
            .evaluate(
                &Input {
                    certificate: &certificate,
                    secret: Some(&secret),
                    current_request: None,
                    now: OffsetDateTime::now_utc(),
                },
                &Options::default(),
            )
            .unwrap();
        assert_eq!(violation.reason, Reason::IncorrectCertificate);
        assert!(violation.message.contains("\"other\""));
    }

    #[test]
    fn test_secret_mismatch() {
        let mut certificate = certificate();
        let secret = issue_secret(&certificate);
        certificate.spec.dns_names.push("api.example.com".to_string());
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::SecretMismatch)
        );

        let mut certificate = self::certificate();
        let secret = issue_secret(&certificate);
        certificate.spec.private_key = Some(CertificatePrivateKey {
            size: Some(4096),
            ..Default::default()
        });
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::SecretMismatch)
        );
    }

    #[test]
    fn test_request_changed() {
        let mut certificate = certificate();
        let secret = issue_secret(&certificate);
        let request = certificate_request(&certificate);
        certificate.spec.duration = Some(GoDuration::from_hours(48));
        assert_eq!(
            evaluate_at(
                &certificate,
                Some(&secret),
                Some(&request),
                OffsetDateTime::now_utc()
            ),
            Some(Reason::RequestChanged)
        );

        let mut broken = request.clone();
        broken.spec.request = ByteString(b"garbage".to_vec());
        assert_eq!(
            evaluate_at(
                &certificate,
                Some(&secret),
                Some(&broken),
                OffsetDateTime::now_utc()
            ),
            Some(Reason::InvalidCertificateRequest)
        );
    }

    #[test]
    fn test_unencodable_oids_are_violations() {
        let original = certificate();
        let secret = issue_secret(&original);
        let request = certificate_request(&original);

        let mut literal_subject = certificate();
        literal_subject.spec.literal_subject = Some("2.18446744073709551600=foo".to_string());
        let mut other_name = certificate();
        other_name.spec.other_names = vec![OtherName {
            oid: "2.18446744073709551600".to_string(),
            utf8_value: "value".to_string(),
        }];
        for certificate in [&literal_subject, &other_name] {
            assert_eq!(
                evaluate_now(certificate, Some(&secret)),
                Some(Reason::SecretMismatch)
            );
            assert_eq!(
                evaluate_at(
                    certificate,
                    Some(&secret),
                    Some(&request),
                    OffsetDateTime::now_utc()
                ),
                Some(Reason::RequestChanged)
            );
            let input = Input {
                certificate,
                secret: Some(&secret),
                current_request: Some(&request),
                now: OffsetDateTime::now_utc(),
            };
            for chain in [Chain::issuance(), Chain::readiness()] {
                assert_eq!(
                    chain
                        .evaluate(&input, &Options::default())
                        .map(|violation| violation.reason),
                    Some(Reason::RequestChanged)
                );
            }
            assert_eq!(
                Chain::temporary_certificate().evaluate(&input, &Options::default()),
                None
            );
        }
    }

    #[test]
    fn test_renewing_and_expired() {
        let certificate = certificate();
        let secret = issue_secret(&certificate);
        let now = OffsetDateTime::now_utc();
        // 24h certificate, renewed after two thirds of its lifetime
        assert_eq!(
            evaluate_at(&certificate, Some(&secret), None, now + Duration::hours(12)),
            None
        );
        assert_eq!(
            evaluate_at(&certificate, Some(&secret), None, now + Duration::hours(17)),
            Some(Reason::Renewing)
        );
        assert_eq!(
            evaluate_at(&certificate, Some(&secret), None, now + Duration::hours(25)),
            Some(Reason::Expired)
        );

        let input = Input {
            certificate: &certificate,
            secret: Some(&secret),
            current_request: None,
            now: now + Duration::hours(25),
        };
        let options = Options::default();
        assert_eq!(
            Chain::issuance()
                .evaluate(&input, &options)
                .map(|v| v.reason),
            Some(Reason::Renewing)
        );
        assert_eq!(
            Chain::readiness()
                .evaluate(&input, &options)
                .map(|v| v.reason),
            Some(Reason::Expired)
        );
    }

    #[test]
    fn test_metadata_mismatch_ignores_foreign_keys() {
        let certificate = certificate();
        let mut secret = issue_secret(&certificate);
        secret
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("team".to_string(), "platform".to_string());
        secret
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("example.com/note".to_string(), "hi".to_string());
        assert_eq!(evaluate_now(&certificate, Some(&secret)), None);

        secret
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(PART_OF_CERT_MANAGER_LABEL);
        let violation = Chain::post_issuance()
            .evaluate(
                &Input {
                    certificate: &certificate,
                    secret: Some(&secret),
                    current_request: None,
                    now: OffsetDateTime::now_utc(),
                },
                &Options::default(),
            )
            .unwrap();
        assert_eq!(violation.reason, Reason::SecretMetadataMismatch);
        assert_eq!(violation.reason.remediation(), Remediation::UpdateSecret);
        assert_eq!(
            violation.message,
            "Secret metadata does not match the Certificate: [missing label \"controller.cert-manager.io/fao\"]"
        );
    }

    #[test]
    fn test_additional_output_formats() {
        let mut certificate = certificate();
        let secret = issue_secret(&certificate);
        certificate.spec.additional_output_formats = vec![AdditionalOutputFormat {
            format: AdditionalOutputFormatType::CombinedPem,
        }];
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::AdditionalOutputFormatsMismatch)
        );
        let secret = issue_secret(&certificate);
        assert_eq!(evaluate_now(&certificate, Some(&secret)), None);

        // formats we wrote must go away once they are no longer requested
        certificate.spec.additional_output_formats.clear();
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::AdditionalOutputFormatsMismatch)
        );
    }

    #[test]
    fn test_owner_reference() {
        let certificate = certificate();
        let enabled = Options {
            owner_references_enabled: true,
            ..Options::default()
        };
        let owned = issue_secret_with_options(&certificate, &enabled);
        let unowned = issue_secret(&certificate);
        let evaluate = |secret: &Secret, options: &Options| {
            Chain::full()
                .evaluate(
                    &Input {
                        certificate: &certificate,
                        secret: Some(secret),
                        current_request: None,
                        now: OffsetDateTime::now_utc(),
                    },
                    options,
                )
                .map(|violation| violation.reason)
        };
        assert_eq!(evaluate(&owned, &enabled), None);
        assert_eq!(evaluate(&unowned, &Options::default()), None);
        assert_eq!(
            evaluate(&unowned, &enabled),
            Some(Reason::SecretOwnerRefMismatch)
        );
        assert_eq!(
            evaluate(&owned, &Options::default()),
            Some(Reason::SecretOwnerRefMismatch)
        );
    }

    #[test]
    fn test_keystores() {
        let mut certificate = certificate();
        let secret = issue_secret(&certificate);
        certificate.spec.keystores = Some(Keystores {
            pkcs12: Some(Keystore {
                create: true,
                ..Keystore::default()
            }),
            ..Keystores::default()
        });
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::SecretKeystoreMismatch)
        );
    }

    #[test]
    fn test_invalid_managed_fields() {
        let certificate = certificate();
        let mut secret = issue_secret(&certificate);
        secret.metadata.managed_fields.as_mut().unwrap()[0].fields_type =
            Some("FieldsV2".to_string());
        assert_eq!(
            evaluate_now(&certificate, Some(&secret)),
            Some(Reason::InvalidManagedFields)
        );
    }

    #[test]
    fn test_temporary_certificate_chain_only_checks_key_material() {
        let certificate = certificate();
        let mut secret = issue_secret(&certificate);
        secret.metadata = ObjectMeta::default();
        let input = Input {
            certificate: &certificate,
            secret: Some(&secret),
            current_request: None,
            now: OffsetDateTime::now_utc() + Duration::days(400),
        };
        assert_eq!(
            Chain::temporary_certificate().evaluate(&input, &Options::default()),
            None
        );
        assert_eq!(
            Chain::temporary_certificate()
                .check_names()
                .collect::<Vec<_>>(),
            vec!["SecretState"]
        );
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(["a", "b"]), "[a b]");
        assert_eq!(format_list(Vec::<String>::new()), "[]");
    }

    #[test]
    fn test_reason_names() {
        assert_eq!(Reason::SecretOwnerRefMismatch.to_string(), "SecretOwnerRefMismatch");
        let reason: &'static str = Reason::Expired.into();
        assert_eq!(reason, "Expired");
        assert_eq!(Reason::Expired.remediation(), Remediation::Reissue);
    }
}
