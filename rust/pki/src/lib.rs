//! DER codec for the parts of X.509 that certificate policy decisions depend on.
//!
//! Subjects ([`subject::RdnSequence`]) and subject alternative names
//! ([`sans::GeneralNames`]) are decoded into plain data structures that can be compared
//! field by field, and re-encoded into exactly the bytes they were built from.

pub mod der;
pub mod oid;
pub mod pem;
pub mod sans;
pub mod subject;
pub mod value;
pub mod x509;

pub use yasna::models::ObjectIdentifier;
