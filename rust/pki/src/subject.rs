//! X.509 distinguished names.
//!
//! The string form follows RFC 4514: RDNs are written in reverse order, separated by `,`, with
//! multi-valued RDNs joined by `+`. [`RdnSequence::to_string`] and [`RdnSequence::from_str`]
//! are exact inverses for every string that [`RdnSequence::to_string`] can produce, so a
//! literal subject survives the round trip through DER byte for byte.

use std::{fmt, str::FromStr};

use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use yasna::{models::ObjectIdentifier, Tag};

use crate::{
    der::{
        self, Element, TAG_BMP_STRING, TAG_IA5_STRING, TAG_PRINTABLE_STRING, TAG_SEQUENCE,
        TAG_SET, TAG_TELETEX_STRING, TAG_UNIVERSAL_STRING, TAG_UTF8_STRING, TAG_VISIBLE_STRING,
    },
    oid::{self, format_object_identifier, parse_object_identifier},
    value::is_strictly_printable,
};

pub const COUNTRY: &[u64] = &[2, 5, 4, 6];
pub const ORGANIZATION: &[u64] = &[2, 5, 4, 10];
pub const ORGANIZATIONAL_UNIT: &[u64] = &[2, 5, 4, 11];
pub const COMMON_NAME: &[u64] = &[2, 5, 4, 3];
pub const SERIAL_NUMBER: &[u64] = &[2, 5, 4, 5];
pub const LOCALITY: &[u64] = &[2, 5, 4, 7];
pub const PROVINCE: &[u64] = &[2, 5, 4, 8];
pub const STREET_ADDRESS: &[u64] = &[2, 5, 4, 9];
pub const POSTAL_CODE: &[u64] = &[2, 5, 4, 17];
pub const USER_ID: &[u64] = &[0, 9, 2342, 19200300, 100, 1, 1];

const ATTRIBUTE_TYPE_NAMES: &[(&[u64], &str)] = &[
    (COUNTRY, "C"),
    (ORGANIZATION, "O"),
    (ORGANIZATIONAL_UNIT, "OU"),
    (COMMON_NAME, "CN"),
    (SERIAL_NUMBER, "SERIALNUMBER"),
    (LOCALITY, "L"),
    (PROVINCE, "ST"),
    (STREET_ADDRESS, "STREET"),
    (POSTAL_CODE, "POSTALCODE"),
    (USER_ID, "UID"),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("distinguished name ended with an incomplete type/value pair"))]
    IncompleteAttribute,

    #[snafu(display("unexpected {separator:?} in attribute type at offset {offset}"))]
    UnexpectedSeparator { separator: char, offset: usize },

    #[snafu(display("unknown attribute type {name:?}"))]
    UnknownAttributeType { name: String },

    #[snafu(display("invalid attribute type {name:?}"))]
    InvalidAttributeType { source: oid::Error, name: String },

    #[snafu(display("distinguished name ends with an unterminated escape"))]
    TrailingEscape,

    #[snafu(display("{value:?} is not a valid hex-encoded attribute value"))]
    InvalidHexValue { value: String },

    #[snafu(display("attribute value is not valid UTF-8"))]
    InvalidUtf8,

    #[snafu(display("failed to decode DER"))]
    Decode { source: yasna::ASN1Error },

    #[snafu(display("expected {expected:?}, but found {found:?}"))]
    UnexpectedTag { expected: Tag, found: Tag },

    #[snafu(display("attribute values of type {tag:?} are not supported"))]
    UnsupportedAttributeValue { tag: Tag },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeTypeAndValue {
    pub attribute_type: ObjectIdentifier,
    pub value: String,
}

impl AttributeTypeAndValue {
    pub fn new(attribute_type: &[u64], value: impl Into<String>) -> Self {
        Self {
            attribute_type: ObjectIdentifier::from_slice(attribute_type),
            value: value.into(),
        }
    }
}

/// One set of attributes. The order is kept as-is when encoding, rather than sorted.
pub type RelativeDistinguishedName = Vec<AttributeTypeAndValue>;

/// A distinguished name, in DER order (most significant RDN first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RdnSequence(pub Vec<RelativeDistinguishedName>);

impl RdnSequence {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    /// All values of a given attribute type, in DER order.
    pub fn values_of(&self, attribute_type: &[u64]) -> Vec<&str> {
        self.0
            .iter()
            .flatten()
            .filter(|atv| atv.attribute_type.components().as_slice() == attribute_type)
            .map(|atv| atv.value.as_str())
            .collect()
    }

    /// The common name, if any. If there are several, the last (most specific) one wins.
    pub fn common_name(&self) -> Option<&str> {
        self.values_of(COMMON_NAME).pop()
    }

    pub fn to_der(&self) -> Vec<u8> {
        let rdns = self
            .0
            .iter()
            .map(|rdn| {
                let atvs = rdn.iter().map(encode_attribute).collect::<Vec<_>>();
                der::encode_constructed(TAG_SET, atvs.iter().map(Vec::as_slice))
            })
            .collect::<Vec<_>>();
        der::encode_constructed(TAG_SEQUENCE, rdns.iter().map(Vec::as_slice))
    }

    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let name = Element::from_der(der).context(DecodeSnafu)?;
        expect_tag(&name, TAG_SEQUENCE)?;
        let rdns = name
            .children()
            .context(DecodeSnafu)?
            .iter()
            .map(|rdn| {
                expect_tag(rdn, TAG_SET)?;
                rdn.children()
                    .context(DecodeSnafu)?
                    .iter()
                    .map(|atv| decode_attribute(&atv.full_bytes))
                    .collect::<Result<RelativeDistinguishedName, Error>>()
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self(rdns))
    }
}

fn expect_tag(element: &Element, expected: Tag) -> Result<(), Error> {
    ensure!(
        element.tag == expected,
        UnexpectedTagSnafu {
            expected,
            found: element.tag
        }
    );
    Ok(())
}

fn encode_attribute(atv: &AttributeTypeAndValue) -> Vec<u8> {
    let tag = if atv.value.bytes().all(is_strictly_printable) {
        TAG_PRINTABLE_STRING
    } else {
        TAG_UTF8_STRING
    };
    let value = der::encode(tag, false, atv.value.as_bytes());
    yasna::construct_der(|w| {
        w.write_sequence(|w| {
            w.next().write_oid(&atv.attribute_type);
            w.next().write_der(&value);
        })
    })
}

fn decode_attribute(der: &[u8]) -> Result<AttributeTypeAndValue, Error> {
    let (attribute_type, value) = yasna::parse_der(der, |r| {
        r.read_sequence(|r| {
            let attribute_type = r.next().read_oid()?;
            let value = r.next().read_der()?;
            Ok((attribute_type, value))
        })
    })
    .context(DecodeSnafu)?;
    let value = Element::from_der(&value).context(DecodeSnafu)?;
    Ok(AttributeTypeAndValue {
        attribute_type,
        value: decode_string(&value)?,
    })
}

/// Decodes any of the DirectoryString types (and IA5String) into text.
pub fn decode_string(element: &Element) -> Result<String, Error> {
    let content = &element.content;
    let tag = element.tag;
    if [
        TAG_UTF8_STRING,
        TAG_PRINTABLE_STRING,
        TAG_IA5_STRING,
        TAG_VISIBLE_STRING,
    ]
    .contains(&tag)
    {
        String::from_utf8(content.clone()).ok().context(InvalidUtf8Snafu)
    } else if tag == TAG_TELETEX_STRING {
        // Treated as Latin-1, like most other X.509 implementations do
        Ok(content.iter().map(|&b| char::from(b)).collect())
    } else if tag == TAG_BMP_STRING {
        ensure!(content.len() % 2 == 0, InvalidUtf8Snafu);
        let units = content
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16(&units).ok().context(InvalidUtf8Snafu)
    } else if tag == TAG_UNIVERSAL_STRING {
        ensure!(content.len() % 4 == 0, InvalidUtf8Snafu);
        content
            .chunks_exact(4)
            .map(|quad| char::from_u32(u32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]])))
            .collect::<Option<String>>()
            .context(InvalidUtf8Snafu)
    } else {
        UnsupportedAttributeValueSnafu { tag }.fail()
    }
}

fn attribute_type_name(attribute_type: &ObjectIdentifier) -> Option<&'static str> {
    ATTRIBUTE_TYPE_NAMES
        .iter()
        .find(|(oid, _)| attribute_type.components().as_slice() == *oid)
        .map(|(_, name)| *name)
}

fn attribute_type_from_name(name: &str) -> Result<ObjectIdentifier, Error> {
    if let Some((oid, _)) = ATTRIBUTE_TYPE_NAMES.iter().find(|(_, n)| *n == name) {
        return Ok(ObjectIdentifier::from_slice(oid));
    }
    ensure!(
        name.starts_with(|c: char| c.is_ascii_digit()),
        UnknownAttributeTypeSnafu { name }
    );
    parse_object_identifier(name).context(InvalidAttributeTypeSnafu { name })
}

impl fmt::Display for RdnSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.0.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            for (j, atv) in rdn.iter().enumerate() {
                if j > 0 {
                    f.write_str("+")?;
                }
                match attribute_type_name(&atv.attribute_type) {
                    Some(name) => f.write_str(name)?,
                    None => f.write_str(&format_object_identifier(&atv.attribute_type))?,
                }
                f.write_str("=")?;
                write_escaped(f, &atv.value)?;
            }
        }
        Ok(())
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    let last = value.len().saturating_sub(1);
    for (i, c) in value.char_indices() {
        let escape = match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => true,
            ' ' => i == 0 || i == last,
            '#' => i == 0,
            _ => false,
        };
        if escape {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    Ok(())
}

impl FromStr for RdnSequence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parser::default().parse(s)
    }
}

/// Accumulates the bytes of the attribute type or value that is currently being read.
#[derive(Default)]
struct Token {
    bytes: Vec<u8>,
    /// Unescaped spaces at the end of `bytes`, which are not part of the token.
    trailing_spaces: usize,
}

impl Token {
    fn push(&mut self, b: u8, escaped: bool) {
        if b == b' ' && !escaped {
            if self.bytes.is_empty() {
                // Unescaped leading whitespace is insignificant
                return;
            }
            self.trailing_spaces += 1;
        } else {
            self.trailing_spaces = 0;
        }
        self.bytes.push(b);
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self) -> Result<String, Error> {
        let mut bytes = std::mem::take(&mut self.bytes);
        bytes.truncate(bytes.len() - self.trailing_spaces);
        self.trailing_spaces = 0;
        String::from_utf8(bytes).ok().context(InvalidUtf8Snafu)
    }
}

#[derive(Default)]
struct Parser {
    rdns: Vec<RelativeDistinguishedName>,
    current: RelativeDistinguishedName,
    attribute_type: Option<ObjectIdentifier>,
    token: Token,
}

impl Parser {
    fn parse(mut self, s: &str) -> Result<RdnSequence, Error> {
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\\' {
                let next = *bytes.get(i + 1).context(TrailingEscapeSnafu)?;
                match bytes.get(i + 1..i + 3).and_then(decode_hex_pair) {
                    Some(decoded) => {
                        self.token.push(decoded, true);
                        i += 3;
                    }
                    None => {
                        self.token.push(next, true);
                        i += 2;
                    }
                }
                continue;
            }

            if self.attribute_type.is_none() {
                match b {
                    b'=' => {
                        let name = self.token.take()?;
                        ensure!(!name.is_empty(), IncompleteAttributeSnafu);
                        self.attribute_type = Some(attribute_type_from_name(&name)?);
                    }
                    b',' | b'+' | b';' => {
                        return UnexpectedSeparatorSnafu {
                            separator: char::from(b),
                            offset: i,
                        }
                        .fail()
                    }
                    _ => self.token.push(b, false),
                }
            } else {
                match b {
                    b',' | b';' => {
                        self.finish_attribute()?;
                        self.finish_rdn();
                    }
                    b'+' => self.finish_attribute()?,
                    b'#' if self.token.is_empty() => {
                        let end = bytes[i..]
                            .iter()
                            .position(|&b| matches!(b, b',' | b';' | b'+'))
                            .map_or(bytes.len(), |len| i + len);
                        let value = decode_hex_value(s[i + 1..end].trim())?;
                        self.token = Token {
                            bytes: value.into_bytes(),
                            trailing_spaces: 0,
                        };
                        i = end;
                        continue;
                    }
                    _ => self.token.push(b, false),
                }
            }
            i += 1;
        }

        if self.attribute_type.is_none() {
            // Only an entirely blank string is a valid (empty) name
            ensure!(
                self.token.is_empty() && self.rdns.is_empty() && self.current.is_empty(),
                IncompleteAttributeSnafu
            );
            return Ok(RdnSequence::default());
        }
        self.finish_attribute()?;
        self.finish_rdn();
        self.rdns.reverse();
        Ok(RdnSequence(self.rdns))
    }

    fn finish_attribute(&mut self) -> Result<(), Error> {
        let attribute_type = self
            .attribute_type
            .take()
            .context(IncompleteAttributeSnafu)?;
        self.current.push(AttributeTypeAndValue {
            attribute_type,
            value: self.token.take()?,
        });
        Ok(())
    }

    fn finish_rdn(&mut self) {
        self.rdns.push(std::mem::take(&mut self.current));
    }
}

fn decode_hex_digit(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).map(|d| d as u8)
}

fn decode_hex_pair(pair: &[u8]) -> Option<u8> {
    match pair {
        [hi, lo] => Some(decode_hex_digit(*hi)? << 4 | decode_hex_digit(*lo)?),
        _ => None,
    }
}

/// Decodes a `#`-prefixed attribute value: the hex encoding of a DER string.
fn decode_hex_value(hex: &str) -> Result<String, Error> {
    let der = (hex.len() % 2 == 0)
        .then(|| {
            hex.as_bytes()
                .chunks_exact(2)
                .map(decode_hex_pair)
                .collect::<Option<Vec<u8>>>()
        })
        .flatten()
        .context(InvalidHexValueSnafu { value: hex })?;
    let element = Element::from_der(&der).context(DecodeSnafu)?;
    decode_string(&element)
}
