//! Extracts the parts of certificates and certificate requests that OpenSSL doesn't expose
//! in a structured way: raw extensions, and the subject as an [`RdnSequence`].

use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use yasna::{models::ObjectIdentifier, Tag};

use crate::{
    der::{Element, TAG_BOOLEAN, TAG_INTEGER, TAG_SEQUENCE, TAG_SET},
    oid,
    sans::{self, GeneralNames},
    subject::{self, RdnSequence},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode DER"))]
    Decode { source: yasna::ASN1Error },

    #[snafu(display("{structure} is truncated"))]
    Truncated { structure: &'static str },

    #[snafu(display("{structure} has unexpected tag {tag:?}"))]
    UnexpectedTag { structure: &'static str, tag: Tag },

    #[snafu(display("failed to decode {name}"))]
    DecodeName {
        source: subject::Error,
        name: &'static str,
    },

    #[snafu(display("failed to decode subject alternative names"))]
    DecodeSans { source: sans::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub id: ObjectIdentifier,
    pub critical: bool,
    /// The DER contents of the `extnValue` OCTET STRING.
    pub value: Vec<u8>,
}

/// The named bits of the key usage extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyUsage(pub u16);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: Self = Self(1 << 0);
    pub const CONTENT_COMMITMENT: Self = Self(1 << 1);
    pub const KEY_ENCIPHERMENT: Self = Self(1 << 2);
    pub const DATA_ENCIPHERMENT: Self = Self(1 << 3);
    pub const KEY_AGREEMENT: Self = Self(1 << 4);
    pub const KEY_CERT_SIGN: Self = Self(1 << 5);
    pub const CRL_SIGN: Self = Self(1 << 6);
    pub const ENCIPHER_ONLY: Self = Self(1 << 7);
    pub const DECIPHER_ONLY: Self = Self(1 << 8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for KeyUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BasicConstraints {
    pub ca: bool,
    pub path_len: Option<u64>,
}

/// The decoded, policy-relevant contents of a certificate or certificate request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Details {
    pub subject: RdnSequence,
    /// Only set for certificates.
    pub issuer: Option<RdnSequence>,
    pub extensions: Vec<Extension>,
    pub sans: GeneralNames,
    pub key_usage: Option<KeyUsage>,
    pub ext_key_usages: Vec<ObjectIdentifier>,
    pub basic_constraints: Option<BasicConstraints>,
}

impl Details {
    pub fn from_certificate_der(der: &[u8]) -> Result<Self> {
        let tbs = signed_content(der, "Certificate")?;
        let fields = tbs.children().context(DecodeSnafu)?;
        // version is optional, everything up to subjectPublicKeyInfo is mandatory
        let offset = usize::from(fields.first().map(|f| f.tag) == Some(Tag::context(0)));
        let field = |index: usize| {
            fields.get(offset + index).context(TruncatedSnafu {
                structure: "TBSCertificate",
            })
        };
        let issuer = field(2)?;
        let subject = field(4)?;
        field(5)?;
        let extensions = match fields[offset + 6..]
            .iter()
            .find(|f| f.tag == Tag::context(3))
        {
            Some(extensions) => decode_extensions(&extensions.content)?,
            None => Vec::new(),
        };
        Self::new(
            RdnSequence::from_der(&subject.full_bytes).context(DecodeNameSnafu { name: "subject" })?,
            Some(
                RdnSequence::from_der(&issuer.full_bytes)
                    .context(DecodeNameSnafu { name: "issuer" })?,
            ),
            extensions,
        )
    }

    pub fn from_certificate_request_der(der: &[u8]) -> Result<Self> {
        let info = signed_content(der, "CertificationRequest")?;
        let fields = info.children().context(DecodeSnafu)?;
        let [_version, subject, _spki, rest @ ..] = fields.as_slice() else {
            return TruncatedSnafu {
                structure: "CertificationRequestInfo",
            }
            .fail();
        };
        let mut extensions = Vec::new();
        if let Some(attributes) = rest.iter().find(|f| f.tag == Tag::context(0)) {
            for attribute in attributes.children().context(DecodeSnafu)? {
                let fields = attribute.children().context(DecodeSnafu)?;
                let [attribute_type, values] = fields.as_slice() else {
                    return TruncatedSnafu {
                        structure: "Attribute",
                    }
                    .fail();
                };
                if decode_oid(attribute_type)?.components().as_slice() != oid::EXTENSION_REQUEST {
                    continue;
                }
                expect_tag(values, TAG_SET, "Attribute values")?;
                for value in values.children().context(DecodeSnafu)? {
                    extensions.extend(decode_extensions(&value.full_bytes)?);
                }
            }
        }
        Self::new(
            RdnSequence::from_der(&subject.full_bytes).context(DecodeNameSnafu { name: "subject" })?,
            None,
            extensions,
        )
    }

    fn new(
        subject: RdnSequence,
        issuer: Option<RdnSequence>,
        extensions: Vec<Extension>,
    ) -> Result<Self> {
        let mut details = Self {
            subject,
            issuer,
            ..Self::default()
        };
        for extension in &extensions {
            let id = extension.id.components().as_slice();
            if id == oid::SUBJECT_ALT_NAME {
                details.sans = sans::unmarshal_sans(&extension.value).context(DecodeSansSnafu)?;
            } else if id == oid::KEY_USAGE {
                details.key_usage = Some(decode_key_usage(&extension.value)?);
            } else if id == oid::EXT_KEY_USAGE {
                details.ext_key_usages = yasna::parse_der(&extension.value, |r| {
                    let mut usages = Vec::new();
                    r.read_sequence_of(|r| {
                        usages.push(r.read_oid()?);
                        Ok(())
                    })?;
                    Ok(usages)
                })
                .context(DecodeSnafu)?;
            } else if id == oid::BASIC_CONSTRAINTS {
                details.basic_constraints = Some(decode_basic_constraints(&extension.value)?);
            }
        }
        details.extensions = extensions;
        Ok(details)
    }

    pub fn extension(&self, id: &[u64]) -> Option<&Extension> {
        self.extensions
            .iter()
            .find(|extension| extension.id.components().as_slice() == id)
    }

    pub fn is_ca(&self) -> bool {
        self.basic_constraints.is_some_and(|constraints| constraints.ca)
    }
}

/// Returns the signed part of a `SEQUENCE { content, signatureAlgorithm, signature }`.
fn signed_content(der: &[u8], structure: &'static str) -> Result<Element> {
    let outer = Element::from_der(der).context(DecodeSnafu)?;
    expect_tag(&outer, TAG_SEQUENCE, structure)?;
    let content = outer
        .children()
        .context(DecodeSnafu)?
        .into_iter()
        .next()
        .context(TruncatedSnafu { structure })?;
    expect_tag(&content, TAG_SEQUENCE, structure)?;
    Ok(content)
}

fn expect_tag(element: &Element, expected: Tag, structure: &'static str) -> Result<()> {
    ensure!(
        element.tag == expected,
        UnexpectedTagSnafu {
            structure,
            tag: element.tag
        }
    );
    Ok(())
}

fn decode_oid(element: &Element) -> Result<ObjectIdentifier> {
    yasna::parse_der(&element.full_bytes, |r| r.read_oid()).context(DecodeSnafu)
}

fn decode_extensions(der: &[u8]) -> Result<Vec<Extension>> {
    let extensions = Element::from_der(der).context(DecodeSnafu)?;
    expect_tag(&extensions, TAG_SEQUENCE, "Extensions")?;
    extensions
        .children()
        .context(DecodeSnafu)?
        .iter()
        .map(|extension| {
            let fields = extension.children().context(DecodeSnafu)?;
            // critical is DEFAULT FALSE, but some encoders write it out anyway
            let (id, critical, value) = match fields.as_slice() {
                [id, value] => (id, false, value),
                [id, critical, value] => {
                    expect_tag(critical, TAG_BOOLEAN, "Extension")?;
                    (id, critical.content.iter().any(|&b| b != 0), value)
                }
                _ => {
                    return TruncatedSnafu {
                        structure: "Extension",
                    }
                    .fail()
                }
            };
            Ok(Extension {
                id: decode_oid(id)?,
                critical,
                value: yasna::parse_der(&value.full_bytes, |r| r.read_bytes())
                    .context(DecodeSnafu)?,
            })
        })
        .collect()
}

fn decode_key_usage(der: &[u8]) -> Result<KeyUsage> {
    let (bytes, len) = yasna::parse_der(der, |r| r.read_bitvec_bytes()).context(DecodeSnafu)?;
    let bits = (0..len.min(16))
        .filter(|bit| bytes[bit / 8] & (0x80 >> (bit % 8)) != 0)
        .fold(0u16, |bits, bit| bits | 1 << bit);
    Ok(KeyUsage(bits))
}

fn decode_basic_constraints(der: &[u8]) -> Result<BasicConstraints> {
    let sequence = Element::from_der(der).context(DecodeSnafu)?;
    expect_tag(&sequence, TAG_SEQUENCE, "BasicConstraints")?;
    let mut constraints = BasicConstraints::default();
    for field in sequence.children().context(DecodeSnafu)? {
        if field.tag == TAG_BOOLEAN {
            constraints.ca = field.content.iter().any(|&b| b != 0);
        } else if field.tag == TAG_INTEGER {
            constraints.path_len = Some(
                yasna::parse_der(&field.full_bytes, |r| r.read_u64()).context(DecodeSnafu)?,
            );
        }
    }
    Ok(constraints)
}
