//! Tagged ASN.1 values, as carried by `OtherName` subject alternative names.

use snafu::{ensure, Snafu};
use yasna::Tag;

use crate::der::{self, Element, TAG_IA5_STRING, TAG_PRINTABLE_STRING, TAG_UTF8_STRING};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("exactly one field must be set, but {set} were"))]
    AmbiguousValue { set: usize },

    #[snafu(display("failed to decode raw value"))]
    DecodeRaw { source: yasna::ASN1Error },

    #[snafu(display("raw value has trailing data"))]
    TrailingData,

    #[snafu(display("{value:?} contains non-ASCII characters, which are not allowed in an IA5String"))]
    InvalidIa5String { value: String },

    #[snafu(display("{value:?} contains characters that are not allowed in a PrintableString"))]
    InvalidPrintableString { value: String },

    #[snafu(display("{tag:?} does not contain valid UTF-8"))]
    InvalidUtf8String { tag: Tag },
}

/// A DER value of arbitrary type. `full_bytes` is authoritative, the other fields describe it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawValue {
    pub tag: Tag,
    pub constructed: bool,
    pub bytes: Vec<u8>,
    pub full_bytes: Vec<u8>,
}

impl RawValue {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        Element::from_der(der).map(Self::from).map_err(decode_error)
    }

    pub fn new(tag: Tag, constructed: bool, bytes: Vec<u8>) -> Self {
        Element::new(tag, constructed, bytes).into()
    }
}

impl From<Element> for RawValue {
    fn from(element: Element) -> Self {
        Self {
            tag: element.tag,
            constructed: element.constructed,
            bytes: element.content,
            full_bytes: element.full_bytes,
        }
    }
}

fn decode_error(err: yasna::ASN1Error) -> Error {
    if der::is_trailing_data(err.kind()) {
        Error::TrailingData
    } else {
        Error::DecodeRaw { source: err }
    }
}

/// A value that is either pre-encoded DER or one of the common string types.
///
/// Exactly one field must be non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UniversalValue {
    pub bytes: Vec<u8>,
    pub ia5_string: String,
    pub utf8_string: String,
    pub printable_string: String,
}

impl UniversalValue {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Self::default()
        }
    }

    pub fn ia5_string(value: impl Into<String>) -> Self {
        Self {
            ia5_string: value.into(),
            ..Self::default()
        }
    }

    pub fn utf8_string(value: impl Into<String>) -> Self {
        Self {
            utf8_string: value.into(),
            ..Self::default()
        }
    }

    pub fn printable_string(value: impl Into<String>) -> Self {
        Self {
            printable_string: value.into(),
            ..Self::default()
        }
    }

    /// Picks the narrowest string type that can represent `s`.
    pub fn for_text(s: &str) -> Self {
        if s.bytes().all(is_strictly_printable) {
            Self::printable_string(s)
        } else {
            Self::utf8_string(s)
        }
    }

    fn fields_set(&self) -> usize {
        [
            !self.bytes.is_empty(),
            !self.ia5_string.is_empty(),
            !self.utf8_string.is_empty(),
            !self.printable_string.is_empty(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Transformations applied to a [`RawValue`] after it has been encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutator {
    /// Wraps the value in an explicit context-specific tag.
    WrapExplicit(u64),
}

impl Mutator {
    fn apply(self, value: RawValue) -> RawValue {
        match self {
            Mutator::WrapExplicit(tag) => RawValue::new(Tag::context(tag), true, value.full_bytes),
        }
    }
}

pub fn marshal_universal_value(
    value: &UniversalValue,
    mutators: &[Mutator],
) -> Result<RawValue, Error> {
    let set = value.fields_set();
    ensure!(set == 1, AmbiguousValueSnafu { set });

    let raw = if !value.bytes.is_empty() {
        RawValue::from_der(&value.bytes)?
    } else if !value.ia5_string.is_empty() {
        ensure!(
            value.ia5_string.is_ascii(),
            InvalidIa5StringSnafu {
                value: &value.ia5_string
            }
        );
        RawValue::new(TAG_IA5_STRING, false, value.ia5_string.as_bytes().to_vec())
    } else if !value.utf8_string.is_empty() {
        RawValue::new(TAG_UTF8_STRING, false, value.utf8_string.as_bytes().to_vec())
    } else {
        ensure!(
            value.printable_string.bytes().all(is_printable),
            InvalidPrintableStringSnafu {
                value: &value.printable_string
            }
        );
        RawValue::new(
            TAG_PRINTABLE_STRING,
            false,
            value.printable_string.as_bytes().to_vec(),
        )
    };

    Ok(mutators
        .iter()
        .fold(raw, |raw, mutator| mutator.apply(raw)))
}

pub fn unmarshal_universal_value(raw: &RawValue) -> Result<UniversalValue, Error> {
    let element = if raw.full_bytes.is_empty() {
        Element::new(raw.tag, raw.constructed, raw.bytes.clone())
    } else {
        Element::from_der(&raw.full_bytes).map_err(decode_error)?
    };

    let string = || {
        String::from_utf8(element.content.clone())
            .ok()
            .ok_or_else(|| InvalidUtf8StringSnafu { tag: element.tag }.build())
    };
    if element.tag == TAG_IA5_STRING {
        let value = string()?;
        ensure!(value.is_ascii(), InvalidIa5StringSnafu { value });
        Ok(UniversalValue::ia5_string(value))
    } else if element.tag == TAG_UTF8_STRING {
        Ok(UniversalValue::utf8_string(string()?))
    } else if element.tag == TAG_PRINTABLE_STRING {
        let value = string()?;
        ensure!(
            value.bytes().all(is_printable),
            InvalidPrintableStringSnafu { value }
        );
        Ok(UniversalValue::printable_string(value))
    } else {
        Ok(UniversalValue::bytes(element.full_bytes.clone()))
    }
}

/// Whether `b` may appear in a PrintableString.
///
/// Also accepts `*` and `&`, which X.680 does not allow but which show up in the
/// PrintableStrings of wildcard certificates and some long-lived CA certificates.
pub fn is_printable(b: u8) -> bool {
    is_strictly_printable(b) || b == b'*' || b == b'&'
}

/// The exact PrintableString alphabet. Used to decide which string type a value is encoded
/// as, so that we never produce the lenient characters ourselves.
pub fn is_strictly_printable(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || (b'\''..=b')').contains(&b)
        || (b'+'..=b'/').contains(&b)
        || matches!(b, b' ' | b':' | b'=' | b'?')
}

/// Unwraps an explicitly tagged value, returning the inner element.
pub fn unwrap_explicit(raw: &RawValue, tag: u64) -> Option<RawValue> {
    if raw.tag != Tag::context(tag) || !raw.constructed {
        return None;
    }
    RawValue::from_der(&raw.bytes).ok()
}

/// Decodes the string form of a [`UniversalValue`], if it has one.
pub fn universal_value_string(value: &UniversalValue) -> Option<&str> {
    [
        &value.ia5_string,
        &value.utf8_string,
        &value.printable_string,
    ]
    .into_iter()
    .find(|s| !s.is_empty())
    .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_requires_exactly_one_field() {
        assert!(matches!(
            marshal_universal_value(&UniversalValue::default(), &[]),
            Err(Error::AmbiguousValue { set: 0 })
        ));
        let two = UniversalValue {
            utf8_string: "foo".to_string(),
            ia5_string: "bar".to_string(),
            ..UniversalValue::default()
        };
        assert!(matches!(
            marshal_universal_value(&two, &[]),
            Err(Error::AmbiguousValue { set: 2 })
        ));
        let all = UniversalValue {
            bytes: vec![0x05, 0x00],
            ia5_string: "a".to_string(),
            utf8_string: "b".to_string(),
            printable_string: "c".to_string(),
        };
        assert!(matches!(
            marshal_universal_value(&all, &[]),
            Err(Error::AmbiguousValue { set: 4 })
        ));
        for value in [
            UniversalValue::bytes(vec![0x05, 0x00]),
            UniversalValue::ia5_string("a"),
            UniversalValue::utf8_string("b"),
            UniversalValue::printable_string("c"),
        ] {
            marshal_universal_value(&value, &[]).unwrap();
        }
    }

    #[test]
    fn test_marshal_utf8_wrapped() {
        let raw = marshal_universal_value(
            &UniversalValue::utf8_string("3goats@acme.com"),
            &[Mutator::WrapExplicit(0)],
        )
        .unwrap();
        let mut expected = vec![0xa0, 0x11, 0x0c, 0x0f];
        expected.extend_from_slice(b"3goats@acme.com");
        assert_eq!(raw.full_bytes, expected);
        assert_eq!(raw.tag, Tag::context(0));

        let inner = unwrap_explicit(&raw, 0).unwrap();
        assert_eq!(
            unmarshal_universal_value(&inner).unwrap(),
            UniversalValue::utf8_string("3goats@acme.com")
        );
    }

    #[test]
    fn test_string_validation() {
        assert!(matches!(
            marshal_universal_value(&UniversalValue::ia5_string("héllo"), &[]),
            Err(Error::InvalidIa5String { .. })
        ));
        assert!(matches!(
            marshal_universal_value(&UniversalValue::printable_string("foo@bar"), &[]),
            Err(Error::InvalidPrintableString { .. })
        ));
        // Accepted for compatibility with certificates found in the wild
        marshal_universal_value(&UniversalValue::printable_string("*.example.com"), &[])
            .unwrap();
        marshal_universal_value(&UniversalValue::printable_string("Foo & Bar"), &[]).unwrap();
        assert!(is_printable(b'*'));
        assert!(!is_strictly_printable(b'*'));
    }

    #[test]
    fn test_bytes_must_be_a_single_element() {
        assert!(matches!(
            marshal_universal_value(&UniversalValue::bytes(vec![0x05, 0x00, 0x05, 0x00]), &[]),
            Err(Error::TrailingData)
        ));
        let raw = marshal_universal_value(&UniversalValue::bytes(vec![0x05, 0x00]), &[]).unwrap();
        assert_eq!(
            unmarshal_universal_value(&raw).unwrap(),
            UniversalValue::bytes(vec![0x05, 0x00])
        );
    }

    #[test]
    fn test_unmarshal_by_tag() {
        for value in [
            UniversalValue::ia5_string("foo"),
            UniversalValue::utf8_string("fo❤o"),
            UniversalValue::printable_string("Foo Bar"),
        ] {
            let raw = marshal_universal_value(&value, &[]).unwrap();
            assert_eq!(unmarshal_universal_value(&raw).unwrap(), value);
        }
    }

    #[test]
    fn test_unmarshal_rejects_trailing_data() {
        let raw = RawValue {
            tag: TAG_UTF8_STRING,
            constructed: false,
            bytes: b"a".to_vec(),
            full_bytes: vec![0x0c, 0x01, b'a', 0xff],
        };
        assert!(matches!(
            unmarshal_universal_value(&raw),
            Err(Error::TrailingData)
        ));
    }
}
