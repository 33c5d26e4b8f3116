pub mod controller;
pub mod crd;
pub mod identity;
pub mod inspect;
pub mod issuer;
pub mod lister;
pub mod metadata;
pub mod policy;
pub mod utils;
pub mod validation;
