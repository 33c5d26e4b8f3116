//! The subject alternative name extension (RFC 5280, section 4.2.1.6).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use snafu::{ensure, ResultExt as _, Snafu};
use yasna::{models::ObjectIdentifier, Tag, TagClass};

use crate::{
    der::{self, Element, TAG_OID, TAG_SEQUENCE},
    oid,
    subject::{self, RdnSequence},
    value::{self, RawValue},
    x509::Extension,
};

const TAG_OTHER_NAME: u64 = 0;
const TAG_RFC822_NAME: u64 = 1;
const TAG_DNS_NAME: u64 = 2;
const TAG_X400_ADDRESS: u64 = 3;
const TAG_DIRECTORY_NAME: u64 = 4;
const TAG_EDI_PARTY_NAME: u64 = 5;
const TAG_URI: u64 = 6;
const TAG_IP_ADDRESS: u64 = 7;
const TAG_REGISTERED_ID: u64 = 8;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode subject alternative names"))]
    Decode { source: yasna::ASN1Error },

    #[snafu(display("subject alternative names must be a SEQUENCE, not {tag:?}"))]
    NotASequence { tag: Tag },

    #[snafu(display("{name:?} contains non-ASCII characters, which are not allowed in an IA5String"))]
    InvalidIa5String { name: String },

    #[snafu(display("IP address must be 4 or 16 bytes long, not {len}"))]
    InvalidIpAddress { len: usize },

    #[snafu(display("malformed otherName"))]
    MalformedOtherName,

    #[snafu(display("failed to decode otherName value"))]
    OtherNameValue { source: value::Error },

    #[snafu(display("failed to decode directoryName"))]
    DirectoryName { source: subject::Error },

    #[snafu(display("general names of type [{tag}] are not supported"))]
    UnsupportedGeneralName { tag: u64 },

    #[snafu(display("unexpected general name tag {tag:?}"))]
    UnknownGeneralName { tag: Tag },
}

/// An `otherName` entry. `value` is the explicitly `[0]`-tagged value, as produced by
/// [`value::marshal_universal_value`] with [`value::Mutator::WrapExplicit`]`(0)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtherName {
    pub type_id: ObjectIdentifier,
    pub value: RawValue,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralNames {
    pub rfc822_names: Vec<String>,
    pub dns_names: Vec<String>,
    pub uniform_resource_identifiers: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub other_names: Vec<OtherName>,
    pub directory_names: Vec<RdnSequence>,
    pub registered_ids: Vec<ObjectIdentifier>,
}

impl GeneralNames {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn ia5_name(tag: u64, name: &str) -> Result<Vec<u8>, Error> {
    ensure!(name.is_ascii(), InvalidIa5StringSnafu { name });
    Ok(der::encode(Tag::context(tag), false, name.as_bytes()))
}

fn oid_content(oid: &ObjectIdentifier) -> Vec<u8> {
    let der = yasna::construct_der(|w| w.write_oid(oid));
    Element::from_der(&der).map_or_else(|_| Vec::new(), |element| element.content)
}

/// Encodes `names` into a subject alternative name extension.
///
/// The extension is marked critical when the certificate has no subject, as RFC 5280 requires.
pub fn marshal_sans(names: &GeneralNames, has_subject: bool) -> Result<Extension, Error> {
    let mut entries = Vec::new();
    // Same order as produced by most other X.509 libraries
    for name in &names.dns_names {
        entries.push(ia5_name(TAG_DNS_NAME, name)?);
    }
    for name in &names.rfc822_names {
        entries.push(ia5_name(TAG_RFC822_NAME, name)?);
    }
    for ip in &names.ip_addresses {
        let octets = match ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        entries.push(der::encode(Tag::context(TAG_IP_ADDRESS), false, &octets));
    }
    for name in &names.uniform_resource_identifiers {
        entries.push(ia5_name(TAG_URI, name)?);
    }
    for name in &names.other_names {
        let type_id = yasna::construct_der(|w| w.write_oid(&name.type_id));
        entries.push(der::encode_constructed(
            Tag::context(TAG_OTHER_NAME),
            [type_id.as_slice(), name.value.full_bytes.as_slice()],
        ));
    }
    for name in &names.directory_names {
        entries.push(der::encode(
            Tag::context(TAG_DIRECTORY_NAME),
            true,
            &name.to_der(),
        ));
    }
    for id in &names.registered_ids {
        entries.push(der::encode(
            Tag::context(TAG_REGISTERED_ID),
            false,
            &oid_content(id),
        ));
    }

    Ok(Extension {
        id: ObjectIdentifier::from_slice(oid::SUBJECT_ALT_NAME),
        critical: !has_subject,
        value: der::encode_constructed(TAG_SEQUENCE, entries.iter().map(Vec::as_slice)),
    })
}

/// Decodes the value of a subject alternative name extension.
pub fn unmarshal_sans(der: &[u8]) -> Result<GeneralNames, Error> {
    let sequence = Element::from_der(der).context(DecodeSnafu)?;
    ensure!(
        sequence.tag == TAG_SEQUENCE,
        NotASequenceSnafu { tag: sequence.tag }
    );

    let mut names = GeneralNames::default();
    for entry in sequence.children().context(DecodeSnafu)? {
        ensure!(
            matches!(entry.tag.tag_class, TagClass::ContextSpecific),
            UnknownGeneralNameSnafu { tag: entry.tag }
        );
        match entry.tag.tag_number {
            TAG_OTHER_NAME => names.other_names.push(decode_other_name(&entry)?),
            TAG_RFC822_NAME => names.rfc822_names.push(decode_ia5(&entry)?),
            TAG_DNS_NAME => names.dns_names.push(decode_ia5(&entry)?),
            TAG_URI => names.uniform_resource_identifiers.push(decode_ia5(&entry)?),
            TAG_IP_ADDRESS => names.ip_addresses.push(decode_ip(&entry.content)?),
            TAG_DIRECTORY_NAME => names
                .directory_names
                .push(RdnSequence::from_der(&entry.content).context(DirectoryNameSnafu)?),
            TAG_REGISTERED_ID => {
                let oid = der::encode(TAG_OID, false, &entry.content);
                names
                    .registered_ids
                    .push(yasna::parse_der(&oid, |r| r.read_oid()).context(DecodeSnafu)?);
            }
            tag @ (TAG_X400_ADDRESS | TAG_EDI_PARTY_NAME) => {
                return UnsupportedGeneralNameSnafu { tag }.fail()
            }
            _ => return UnknownGeneralNameSnafu { tag: entry.tag }.fail(),
        }
    }
    Ok(names)
}

fn decode_ia5(entry: &Element) -> Result<String, Error> {
    let name = String::from_utf8_lossy(&entry.content).into_owned();
    ensure!(entry.content.is_ascii(), InvalidIa5StringSnafu { name });
    Ok(name)
}

fn decode_ip(octets: &[u8]) -> Result<IpAddr, Error> {
    if let Ok(octets) = <[u8; 4]>::try_from(octets) {
        Ok(Ipv4Addr::from(octets).into())
    } else if let Ok(octets) = <[u8; 16]>::try_from(octets) {
        Ok(Ipv6Addr::from(octets).into())
    } else {
        InvalidIpAddressSnafu { len: octets.len() }.fail()
    }
}

fn decode_other_name(entry: &Element) -> Result<OtherName, Error> {
    ensure!(entry.constructed, MalformedOtherNameSnafu);
    let children = entry.children().context(DecodeSnafu)?;
    let [type_id, value] = children.as_slice() else {
        return MalformedOtherNameSnafu.fail();
    };
    ensure!(
        value.tag == Tag::context(0) && value.constructed,
        MalformedOtherNameSnafu
    );
    Ok(OtherName {
        type_id: yasna::parse_der(&type_id.full_bytes, |r| r.read_oid()).context(DecodeSnafu)?,
        value: RawValue::from_der(&value.full_bytes).context(OtherNameValueSnafu)?,
    })
}
