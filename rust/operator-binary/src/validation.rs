//! Conformance checks that an issuer produced a Secret that honours its Certificate.
//!
//! Unlike the policy engine these are strict: they are meant for exercising an issuer, and fail
//! loudly on the first thing that is off.

use std::collections::BTreeSet;

use snafu::{ensure, ResultExt as _, Snafu};
use stackable_operator::k8s_openapi::{api::core::v1::Secret, ByteString};
use time::Duration;

use crate::{
    crd::Certificate,
    inspect::{self, inspect_secret, SecretState},
    metadata::{self, additional_output_data},
};

/// Certificates may be issued a little before or after the moment they were requested.
pub const DURATION_TOLERANCE: Duration = Duration::seconds(30);

pub type Validation = fn(&Certificate, &Secret) -> Result<(), ValidationError>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no validation functions provided"))]
    NoValidations,

    #[snafu(display("validation failed"))]
    Validation { source: ValidationError },
}

#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("Secret does not hold a valid key pair"))]
    InvalidKeyPair { source: inspect::Error },

    #[snafu(display("expected common name {expected:?}, got {actual:?}"))]
    CommonNameMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[snafu(display("expected {field} {expected:?}, got {actual:?}"))]
    NamesMismatch {
        field: &'static str,
        expected: BTreeSet<String>,
        actual: BTreeSet<String>,
    },

    #[snafu(display("expected a lifetime of {expected}, got {actual}"))]
    DurationMismatch { expected: Duration, actual: Duration },

    #[snafu(display("Secret does not contain a CA certificate"))]
    MissingCa,

    #[snafu(display("failed to compute additional output formats"))]
    OutputFormat { source: metadata::OutputFormatError },

    #[snafu(display("additional output format {key:?} does not match"))]
    OutputFormatMismatch { key: &'static str },
}

/// Runs every validation against `secret`, stopping at the first failure.
pub fn validate_certificate(
    certificate: &Certificate,
    secret: &Secret,
    validations: &[Validation],
) -> Result<(), Error> {
    ensure!(!validations.is_empty(), NoValidationsSnafu);
    for validation in validations {
        validation(certificate, secret).context(ValidationSnafu)?;
    }
    Ok(())
}

fn secret_state(secret: &Secret) -> Result<SecretState, ValidationError> {
    inspect_secret(Some(secret)).context(InvalidKeyPairSnafu)
}

pub fn expect_valid_key_pair(_: &Certificate, secret: &Secret) -> Result<(), ValidationError> {
    secret_state(secret).map(drop)
}

/// The common name must be the requested one, and the DNS names must be the requested ones plus
/// at most the common name.
pub fn expect_common_name_and_dns_names_to_match(
    certificate: &Certificate,
    secret: &Secret,
) -> Result<(), ValidationError> {
    let state = secret_state(secret)?;
    let spec = &certificate.spec;
    let actual_cn = state.details.subject.common_name();
    if let Some(expected) = spec.common_name.as_deref().filter(|cn| !cn.is_empty()) {
        ensure!(
            actual_cn == Some(expected),
            CommonNameMismatchSnafu {
                expected,
                actual: actual_cn.map(str::to_string),
            }
        );
    }

    let expected = spec.dns_names.iter().cloned().collect::<BTreeSet<_>>();
    let actual = state
        .details
        .sans
        .dns_names
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>();
    let extra = actual.difference(&expected).collect::<Vec<_>>();
    let only_common_name_added = match extra.as_slice() {
        [] => true,
        [name] => actual_cn == Some(name.as_str()),
        _ => false,
    };
    ensure!(
        expected.is_subset(&actual) && only_common_name_added,
        NamesMismatchSnafu {
            field: "DNS names",
            expected,
            actual,
        }
    );
    Ok(())
}

pub fn expect_ip_uri_and_email_to_match(
    certificate: &Certificate,
    secret: &Secret,
) -> Result<(), ValidationError> {
    let state = secret_state(secret)?;
    let spec = &certificate.spec;
    let sans = &state.details.sans;
    for (field, expected, actual) in [
        (
            "IP addresses",
            normalize_ips(spec.ip_addresses.iter().cloned()),
            normalize_ips(sans.ip_addresses.iter().map(|ip| ip.to_string())),
        ),
        (
            "URIs",
            spec.uris.iter().cloned().collect(),
            sans.uniform_resource_identifiers.iter().cloned().collect(),
        ),
        (
            "email addresses",
            spec.email_addresses.iter().cloned().collect(),
            sans.rfc822_names.iter().cloned().collect(),
        ),
    ] {
        ensure!(
            expected == actual,
            NamesMismatchSnafu {
                field,
                expected,
                actual,
            }
        );
    }
    Ok(())
}

/// Parses and re-renders IP addresses, so that e.g. `::1` and `0:0::1` compare equal.
fn normalize_ips(ips: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    ips.into_iter()
        .map(|ip| {
            ip.parse::<std::net::IpAddr>()
                .map_or(ip, |parsed| parsed.to_string())
        })
        .collect()
}

/// The lifetime must be the requested duration, within [`DURATION_TOLERANCE`].
pub fn expect_duration_to_match(
    certificate: &Certificate,
    secret: &Secret,
) -> Result<(), ValidationError> {
    let state = secret_state(secret)?;
    let actual = state.not_after - state.not_before;
    let expected = Duration::try_from(*certificate.spec.duration()).unwrap_or(Duration::MAX);
    ensure!(
        (actual - expected).abs() <= DURATION_TOLERANCE,
        DurationMismatchSnafu { expected, actual }
    );
    Ok(())
}

/// For issuers that sign with a CA, `ca.crt` must be populated.
pub fn expect_ca_present(_: &Certificate, secret: &Secret) -> Result<(), ValidationError> {
    let state = secret_state(secret)?;
    ensure!(state.ca.is_some_and(|ca| !ca.is_empty()), MissingCaSnafu);
    Ok(())
}

pub fn expect_additional_output_formats_to_match(
    certificate: &Certificate,
    secret: &Secret,
) -> Result<(), ValidationError> {
    let state = secret_state(secret)?;
    let expected = additional_output_data(
        certificate,
        &state.private_key_pem,
        &state.certificate_pem,
    )
    .context(OutputFormatSnafu)?;
    for (key, value) in expected {
        let actual = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|ByteString(actual)| actual);
        ensure!(actual == Some(&value), OutputFormatMismatchSnafu { key });
    }
    Ok(())
}

/// Every validation that applies to any issuer.
pub const DEFAULT_VALIDATIONS: &[Validation] = &[
    expect_valid_key_pair,
    expect_common_name_and_dns_names_to_match,
    expect_ip_uri_and_email_to_match,
    expect_duration_to_match,
    expect_additional_output_formats_to_match,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crd::{
            AdditionalOutputFormat, AdditionalOutputFormatType, CertificateSpec, GoDuration,
            CA_CERT_KEY, COMBINED_PEM_KEY,
        },
        issuer::testing::issue_secret,
    };

    fn certificate() -> Certificate {
        Certificate::new(
            "example",
            CertificateSpec {
                secret_name: "example-tls".to_string(),
                common_name: Some("example.com".to_string()),
                dns_names: vec!["www.example.com".to_string()],
                ip_addresses: vec!["10.0.0.1".to_string()],
                uris: vec!["spiffe://cluster.local/example".to_string()],
                duration: Some(GoDuration::from_hours(2)),
                additional_output_formats: vec![AdditionalOutputFormat {
                    format: AdditionalOutputFormatType::CombinedPem,
                }],
                ..CertificateSpec::default()
            },
        )
    }

    #[test]
    fn test_requires_validations() {
        let certificate = certificate();
        assert!(matches!(
            validate_certificate(&certificate, &Secret::default(), &[]),
            Err(Error::NoValidations)
        ));
        assert_eq!(
            Error::NoValidations.to_string(),
            "no validation functions provided"
        );
    }

    #[test]
    fn test_issued_secret_passes() {
        let certificate = certificate();
        let secret = issue_secret(&certificate);
        validate_certificate(&certificate, &secret, DEFAULT_VALIDATIONS).unwrap();
        validate_certificate(&certificate, &secret, &[expect_ca_present]).unwrap();
    }

    #[test]
    fn test_first_failure_wins() {
        let certificate = certificate();
        let mut secret = issue_secret(&certificate);
        let data = secret.data.as_mut().unwrap();
        data.remove(CA_CERT_KEY);
        data.insert(COMBINED_PEM_KEY.to_string(), ByteString(b"stale".to_vec()));
        assert!(matches!(
            validate_certificate(
                &certificate,
                &secret,
                &[expect_ca_present, expect_additional_output_formats_to_match]
            ),
            Err(Error::Validation {
                source: ValidationError::MissingCa
            })
        ));
        assert!(matches!(
            validate_certificate(&certificate, &secret, DEFAULT_VALIDATIONS),
            Err(Error::Validation {
                source: ValidationError::OutputFormatMismatch { .. }
            })
        ));
    }

    #[test]
    fn test_spec_drift_is_detected() {
        let issued_for = certificate();
        let secret = issue_secret(&issued_for);

        let mut certificate = issued_for.clone();
        certificate.spec.dns_names.push("api.example.com".to_string());
        assert!(matches!(
            expect_common_name_and_dns_names_to_match(&certificate, &secret),
            Err(ValidationError::NamesMismatch { .. })
        ));

        let mut certificate = issued_for.clone();
        certificate.spec.email_addresses = vec!["admin@example.com".to_string()];
        assert!(matches!(
            expect_ip_uri_and_email_to_match(&certificate, &secret),
            Err(ValidationError::NamesMismatch {
                field: "email addresses",
                ..
            })
        ));

        let mut certificate = issued_for;
        certificate.spec.duration = Some(GoDuration::from_hours(3));
        assert!(matches!(
            expect_duration_to_match(&certificate, &secret),
            Err(ValidationError::DurationMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_secret() {
        assert!(matches!(
            expect_valid_key_pair(&certificate(), &Secret::default()),
            Err(ValidationError::InvalidKeyPair { .. })
        ));
    }
}
