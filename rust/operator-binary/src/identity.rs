//! The X.509 identity (subject and subject alternative names) that a Certificate asks for.

use std::net::IpAddr;

use snafu::{ResultExt as _, Snafu};
use stackable_certificate_policy_pki::{
    oid::{self, parse_object_identifier},
    sans::{GeneralNames, OtherName},
    subject::{
        self, AttributeTypeAndValue, RdnSequence, COMMON_NAME, COUNTRY, LOCALITY, ORGANIZATION,
        ORGANIZATIONAL_UNIT, POSTAL_CODE, PROVINCE, SERIAL_NUMBER, STREET_ADDRESS,
    },
    value::{self, marshal_universal_value, Mutator, UniversalValue},
};

use crate::crd::CertificateSpec;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse literal subject {subject:?}"))]
    ParseLiteralSubject {
        source: subject::Error,
        subject: String,
    },

    #[snafu(display("failed to parse IP address {address:?}"))]
    ParseIpAddress {
        source: std::net::AddrParseError,
        address: String,
    },

    #[snafu(display("failed to parse otherName OID {oid:?}"))]
    ParseOtherNameOid { source: oid::Error, oid: String },

    #[snafu(display("failed to encode otherName value for {oid:?}"))]
    EncodeOtherNameValue { source: value::Error, oid: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The subject requested by `spec`.
///
/// A literal subject is used exactly as written. Otherwise every value gets its own RDN, in the
/// order C, ST, L, STREET, POSTALCODE, O, OU, CN, SERIALNUMBER.
pub fn subject(spec: &CertificateSpec) -> Result<RdnSequence> {
    if let Some(literal) = spec.literal_subject.as_deref().filter(|s| !s.is_empty()) {
        return literal.parse().context(ParseLiteralSubjectSnafu { subject: literal });
    }

    let x509 = spec.subject.clone().unwrap_or_default();
    let single = |value: &Option<String>| value.iter().cloned().collect::<Vec<_>>();
    let attributes: [(&[u64], Vec<String>); 9] = [
        (COUNTRY, x509.countries),
        (PROVINCE, x509.provinces),
        (LOCALITY, x509.localities),
        (STREET_ADDRESS, x509.street_addresses),
        (POSTAL_CODE, x509.postal_codes),
        (ORGANIZATION, x509.organizations),
        (ORGANIZATIONAL_UNIT, x509.organizational_units),
        (COMMON_NAME, single(&spec.common_name)),
        (SERIAL_NUMBER, single(&x509.serial_number)),
    ];
    Ok(RdnSequence(
        attributes
            .into_iter()
            .flat_map(|(attribute_type, values)| {
                values
                    .into_iter()
                    .filter(|value| !value.is_empty())
                    .map(move |value| vec![AttributeTypeAndValue::new(attribute_type, value)])
            })
            .collect(),
    ))
}

/// The subject alternative names requested by `spec`.
pub fn general_names(spec: &CertificateSpec) -> Result<GeneralNames> {
    Ok(GeneralNames {
        dns_names: spec.dns_names.clone(),
        ip_addresses: ip_addresses(&spec.ip_addresses)?,
        uniform_resource_identifiers: spec.uris.clone(),
        rfc822_names: spec.email_addresses.clone(),
        other_names: spec
            .other_names
            .iter()
            .map(|other_name| {
                let oid = &other_name.oid;
                Ok(OtherName {
                    type_id: parse_object_identifier(oid)
                        .context(ParseOtherNameOidSnafu { oid })?,
                    value: marshal_universal_value(
                        &UniversalValue::utf8_string(other_name.utf8_value.as_str()),
                        &[Mutator::WrapExplicit(0)],
                    )
                    .context(EncodeOtherNameValueSnafu { oid })?,
                })
            })
            .collect::<Result<_>>()?,
        ..GeneralNames::default()
    })
}

pub fn ip_addresses(addresses: &[String]) -> Result<Vec<IpAddr>> {
    addresses
        .iter()
        .map(|address| address.parse().context(ParseIpAddressSnafu { address }))
        .collect()
}
