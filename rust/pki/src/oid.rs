use snafu::{ensure, Snafu};
use yasna::models::ObjectIdentifier;

pub const SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
pub const KEY_USAGE: &[u64] = &[2, 5, 29, 15];
pub const EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
pub const BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
pub const EXTENSION_REQUEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 14];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object identifier is empty"))]
    EmptyOid,

    #[snafu(display("object identifier {oid:?} has a malformed component {component:?}"))]
    MalformedOid { oid: String, component: String },

    #[snafu(display("object identifier {oid:?} cannot be DER encoded"))]
    UnencodableOid { oid: String },
}

/// Parses the dotted decimal form of an object identifier, such as `1.3.6.1.5.2.2`.
pub fn parse_object_identifier(oid: &str) -> Result<ObjectIdentifier, Error> {
    ensure!(!oid.is_empty(), EmptyOidSnafu);
    let components = oid
        .split('.')
        .map(|component| {
            // u64::from_str would also accept a leading '+'
            ensure!(
                !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit()),
                MalformedOidSnafu { oid, component }
            );
            component
                .parse::<u64>()
                .ok()
                .ok_or_else(|| MalformedOidSnafu { oid, component }.build())
        })
        .collect::<Result<Vec<u64>, Error>>()?;
    // yasna refuses (by panicking) to encode OIDs that X.690 can't represent
    let encodable = match components.as_slice() {
        [0..=1, second, ..] => *second < 40,
        // the first two arcs share one subidentifier, 40 * 2 + second
        [2, second, ..] => *second < u64::MAX - 80,
        _ => false,
    };
    ensure!(encodable, UnencodableOidSnafu { oid });
    Ok(ObjectIdentifier::new(components))
}

/// Renders an object identifier in dotted decimal form.
pub fn format_object_identifier(oid: &ObjectIdentifier) -> String {
    oid.components()
        .iter()
        .map(|component| component.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
