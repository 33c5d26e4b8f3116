//! Field-by-field comparisons between a Certificate's spec and what was requested or issued.
//!
//! Every comparison returns the `spec.*` paths that disagree, so that a violation can name them.

use std::collections::BTreeSet;

use openssl::pkey::{Id, PKey, Private};
use stackable_certificate_policy_pki::{
    oid::format_object_identifier,
    sans::GeneralNames,
    subject::{
        RdnSequence, COUNTRY, LOCALITY, ORGANIZATION, ORGANIZATIONAL_UNIT, POSTAL_CODE, PROVINCE,
        SERIAL_NUMBER, STREET_ADDRESS,
    },
    value::{unmarshal_universal_value, universal_value_string, unwrap_explicit},
    x509::{self, Details},
};

use crate::{
    crd::{CertificateRequest, CertificateSpec, KeyUsage, PrivateKeyAlgorithm},
    identity,
};

/// Compares a CertificateRequest (and the CSR it carries) against the Certificate spec it should
/// have been created for.
pub fn request_mismatches(
    spec: &CertificateSpec,
    request: &CertificateRequest,
    csr: &Details,
) -> Vec<&'static str> {
    let mut violations = subject_mismatches(spec, &csr.subject);
    violations.extend(san_mismatches(spec, &csr.sans, false));

    if request.spec.is_ca != spec.is_ca {
        violations.push("spec.isCA");
    }
    if usage_set(&request.spec.usages()) != usage_set(&spec.usages()) {
        violations.push("spec.usages");
    }
    if request.spec.duration.unwrap_or(crate::crd::DEFAULT_DURATION) != spec.duration() {
        violations.push("spec.duration");
    }
    let (requested, desired) = (&request.spec.issuer_ref, &spec.issuer_ref);
    if requested.name != desired.name
        || requested.kind() != desired.kind()
        || requested.group() != desired.group()
    {
        violations.push("spec.issuerRef");
    }
    violations
}

/// Compares an issued certificate against the Certificate spec, tolerating issuers that copy the
/// common name into the DNS names or add one when none was asked for.
pub fn certificate_mismatches(spec: &CertificateSpec, details: &Details) -> Vec<&'static str> {
    let mut violations = subject_mismatches(spec, &details.subject);
    if spec.common_name.as_deref().unwrap_or_default().is_empty() {
        violations.retain(|path| *path != "spec.commonName");
    }
    violations.extend(san_mismatches(spec, &details.sans, true));
    if details.is_ca() != spec.is_ca {
        violations.push("spec.isCA");
    }
    let actual_ext_key_usages = details
        .ext_key_usages
        .iter()
        .map(|oid| oid.components().to_vec())
        .collect::<BTreeSet<_>>();
    if details.key_usage.unwrap_or_default() != expected_key_usage(spec)
        || actual_ext_key_usages != expected_ext_key_usages(spec)
    {
        violations.push("spec.usages");
    }
    violations
}

/// Compares the type and size of the stored private key against `spec.privateKey`.
pub fn private_key_mismatches(spec: &CertificateSpec, key: &PKey<Private>) -> Vec<&'static str> {
    let private_key = spec.private_key();
    let expected_id = match private_key.algorithm() {
        PrivateKeyAlgorithm::Rsa => Id::RSA,
        PrivateKeyAlgorithm::Ecdsa => Id::EC,
        PrivateKeyAlgorithm::Ed25519 => Id::ED25519,
    };
    if key.id() != expected_id {
        vec!["spec.privateKey.algorithm"]
    } else if expected_id != Id::ED25519 && key.bits() != private_key.size() {
        vec!["spec.privateKey.size"]
    } else {
        Vec::new()
    }
}

fn subject_mismatches(spec: &CertificateSpec, subject: &RdnSequence) -> Vec<&'static str> {
    if spec.literal_subject.as_deref().is_some_and(|s| !s.is_empty()) {
        return if literal_subject_matches(spec, subject) {
            Vec::new()
        } else {
            vec!["spec.literalSubject"]
        };
    }

    let x509 = spec.subject.clone().unwrap_or_default();
    let mut violations = Vec::new();
    if subject.common_name().unwrap_or_default() != spec.common_name.as_deref().unwrap_or_default()
    {
        violations.push("spec.commonName");
    }
    let serial_number = x509.serial_number.iter().map(String::as_str);
    for (path, attribute_type, expected) in [
        ("spec.subject.organizations", ORGANIZATION, strs(&x509.organizations)),
        ("spec.subject.countries", COUNTRY, strs(&x509.countries)),
        (
            "spec.subject.organizationalUnits",
            ORGANIZATIONAL_UNIT,
            strs(&x509.organizational_units),
        ),
        ("spec.subject.localities", LOCALITY, strs(&x509.localities)),
        ("spec.subject.provinces", PROVINCE, strs(&x509.provinces)),
        ("spec.subject.streetAddresses", STREET_ADDRESS, strs(&x509.street_addresses)),
        ("spec.subject.postalCodes", POSTAL_CODE, strs(&x509.postal_codes)),
        ("spec.subject.serialNumber", SERIAL_NUMBER, serial_number.collect()),
    ] {
        if !equal_unsorted(subject.values_of(attribute_type), expected) {
            violations.push(path);
        }
    }
    violations
}

/// Literal subjects are compared in their DER encoding, since their RDN order is significant.
fn literal_subject_matches(spec: &CertificateSpec, subject: &RdnSequence) -> bool {
    identity::subject(spec).is_ok_and(|expected| expected.to_der() == subject.to_der())
}

fn san_mismatches(
    spec: &CertificateSpec,
    sans: &GeneralNames,
    allow_common_name_in_dns_names: bool,
) -> Vec<&'static str> {
    let mut violations = Vec::new();

    let actual_dns_names = strs(&sans.dns_names);
    let dns_names_match = equal_unsorted(actual_dns_names.clone(), strs(&spec.dns_names))
        || (allow_common_name_in_dns_names
            && spec.common_name.as_deref().is_some_and(|cn| {
                let mut with_cn = strs(&spec.dns_names);
                with_cn.push(cn);
                equal_unsorted(actual_dns_names, with_cn)
            }));
    if !dns_names_match {
        violations.push("spec.dnsNames");
    }

    let ip_addresses_match = identity::ip_addresses(&spec.ip_addresses).is_ok_and(|expected| {
        expected.into_iter().collect::<BTreeSet<_>>()
            == sans.ip_addresses.iter().copied().collect::<BTreeSet<_>>()
            && spec.ip_addresses.len() == sans.ip_addresses.len()
    });
    if !ip_addresses_match {
        violations.push("spec.ipAddresses");
    }
    if !equal_unsorted(strs(&sans.uniform_resource_identifiers), strs(&spec.uris)) {
        violations.push("spec.uris");
    }
    if !equal_unsorted(strs(&sans.rfc822_names), strs(&spec.email_addresses)) {
        violations.push("spec.emailAddresses");
    }

    let mut actual_other_names = other_names(sans);
    let mut expected_other_names = spec
        .other_names
        .iter()
        .map(|name| (name.oid.clone(), Some(name.utf8_value.clone())))
        .collect::<Vec<_>>();
    actual_other_names.sort();
    expected_other_names.sort();
    if actual_other_names != expected_other_names {
        violations.push("spec.otherNames");
    }
    violations
}

/// The `otherName`s as `(oid, text)`, where text is `None` for non-string values.
fn other_names(sans: &GeneralNames) -> Vec<(String, Option<String>)> {
    sans.other_names
        .iter()
        .map(|name| {
            let text = unwrap_explicit(&name.value, 0)
                .and_then(|inner| unmarshal_universal_value(&inner).ok())
                .and_then(|value| universal_value_string(&value).map(str::to_string));
            (format_object_identifier(&name.type_id), text)
        })
        .collect()
}

fn usage_set(usages: &[KeyUsage]) -> BTreeSet<KeyUsage> {
    usages.iter().copied().collect()
}

/// The key usage bits an issued certificate carries. CAs always get `keyCertSign`.
fn expected_key_usage(spec: &CertificateSpec) -> x509::KeyUsage {
    let bits = spec
        .usages()
        .into_iter()
        .filter_map(KeyUsage::key_usage)
        .fold(x509::KeyUsage::default(), |acc, bit| acc | bit);
    if spec.is_ca {
        bits | x509::KeyUsage::KEY_CERT_SIGN
    } else {
        bits
    }
}

fn expected_ext_key_usages(spec: &CertificateSpec) -> BTreeSet<Vec<u64>> {
    spec.usages()
        .into_iter()
        .filter_map(KeyUsage::ext_key_usage)
        .map(<[u64]>::to_vec)
        .collect()
}

fn strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn equal_unsorted(mut a: Vec<&str>, mut b: Vec<&str>) -> bool {
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
