pub mod oracle;
pub mod reference;

pub use oracle::{DigestOracle, HttpRegistry};
pub use reference::Reference;

use serde::Serialize;
use std::fmt::{Display, Formatter};

/// An `Image` is the pairing of a full image reference and the manifest
/// digest that the reference currently resolves to in its registry.
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct Image {
    pub reference: String,
    pub digest: String,
}

/// The [Display](std::fmt::Display) for an `Image` is the reference followed
/// by the digest. This format should typically not be used for anything
/// other than logging.
impl Display for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.reference, self.digest)
    }
}
