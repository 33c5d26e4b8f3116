//! Low-level helpers for working with arbitrary DER elements through [`yasna`].

use yasna::{models::TaggedDerValue, ASN1ErrorKind, ASN1Result, PCBit, Tag, TagClass};

pub const TAG_BOOLEAN: Tag = universal(1);
pub const TAG_INTEGER: Tag = universal(2);
pub const TAG_OCTET_STRING: Tag = universal(4);
pub const TAG_OID: Tag = universal(6);
pub const TAG_UTF8_STRING: Tag = universal(12);
pub const TAG_SEQUENCE: Tag = universal(16);
pub const TAG_SET: Tag = universal(17);
pub const TAG_PRINTABLE_STRING: Tag = universal(19);
pub const TAG_TELETEX_STRING: Tag = universal(20);
pub const TAG_IA5_STRING: Tag = universal(22);
pub const TAG_VISIBLE_STRING: Tag = universal(26);
pub const TAG_UNIVERSAL_STRING: Tag = universal(28);
pub const TAG_BMP_STRING: Tag = universal(30);

const fn universal(tag_number: u64) -> Tag {
    Tag {
        tag_class: TagClass::Universal,
        tag_number,
    }
}

/// A single decoded DER element, along with the exact bytes it was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub tag: Tag,
    pub constructed: bool,
    /// The contents octets, without identifier and length.
    pub content: Vec<u8>,
    /// The full TLV encoding.
    pub full_bytes: Vec<u8>,
}

impl Element {
    /// Decodes exactly one element, failing with [`ASN1ErrorKind::Extra`] if `der` has
    /// bytes left over.
    pub fn from_der(der: &[u8]) -> ASN1Result<Self> {
        let value = yasna::parse_der(der, |r| r.read_tagged_der())?;
        Ok(Self {
            tag: value.tag(),
            constructed: matches!(value.pcbit(), PCBit::Constructed),
            content: value.value().to_vec(),
            full_bytes: der.to_vec(),
        })
    }

    pub fn new(tag: Tag, constructed: bool, content: Vec<u8>) -> Self {
        let full_bytes = encode(tag, constructed, &content);
        Self {
            tag,
            constructed,
            content,
            full_bytes,
        }
    }

    /// Splits the content of a constructed element into its children.
    pub fn children(&self) -> ASN1Result<Vec<Element>> {
        split_elements(&self.content)?
            .iter()
            .map(|child| Element::from_der(child))
            .collect()
    }
}

/// Encodes a TLV with the given identifier and contents.
pub fn encode(tag: Tag, constructed: bool, content: &[u8]) -> Vec<u8> {
    let pcbit = if constructed {
        PCBit::Constructed
    } else {
        PCBit::Primitive
    };
    let value = TaggedDerValue::from_tag_pc_and_bytes(tag, pcbit, content.to_vec());
    yasna::construct_der(|w| w.write_tagged_der(&value))
}

/// Splits a concatenation of DER elements (such as the contents of a SEQUENCE or SET)
/// into the full encodings of each element, preserving their order.
///
/// SETs are not required to be sorted.
pub fn split_elements(content: &[u8]) -> ASN1Result<Vec<Vec<u8>>> {
    let wrapped = encode(TAG_SEQUENCE, true, content);
    yasna::parse_der(&wrapped, |r| {
        let mut elements = Vec::new();
        r.read_sequence_of(|r| {
            elements.push(r.read_der()?);
            Ok(())
        })?;
        Ok(elements)
    })
}

/// Concatenates the full encodings of `elements` into a constructed element.
pub fn encode_constructed<'a>(tag: Tag, elements: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let content = elements.into_iter().flatten().copied().collect::<Vec<u8>>();
    encode(tag, true, &content)
}

pub fn is_trailing_data(kind: ASN1ErrorKind) -> bool {
    matches!(kind, ASN1ErrorKind::Extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_round_trip() {
        let der = [0x0c, 0x03, b'f', b'o', b'o'];
        let element = Element::from_der(&der).unwrap();
        assert_eq!(element.tag, TAG_UTF8_STRING);
        assert!(!element.constructed);
        assert_eq!(element.content, b"foo");
        assert_eq!(Element::new(TAG_UTF8_STRING, false, b"foo".to_vec()), element);
    }

    #[test]
    fn test_element_rejects_trailing_data() {
        let err = Element::from_der(&[0x0c, 0x01, b'a', 0x00]).unwrap_err();
        assert!(is_trailing_data(err.kind()));
    }

    #[test]
    fn test_split_elements_preserves_order() {
        let b = encode(TAG_UTF8_STRING, false, b"b");
        let a = encode(TAG_UTF8_STRING, false, b"a");
        let set = encode_constructed(TAG_SET, [b.as_slice(), a.as_slice()]);
        let children = Element::from_der(&set).unwrap().children().unwrap();
        assert_eq!(
            children
                .iter()
                .map(|child| child.content.as_slice())
                .collect::<Vec<_>>(),
            vec![b"b".as_slice(), b"a".as_slice()]
        );
    }
}
