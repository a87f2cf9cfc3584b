//! Root descriptors.
//!
//! A root is a URI a consumer advertises to tool providers so they can scope
//! filesystem or workspace operations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Root {
    pub name: String,
    pub uri: String,
}
