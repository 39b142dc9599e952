//! Template fingerprinting.

use sha2::{Digest, Sha256};

use qscale_state::InstanceTemplate;

/// Hex SHA-256 of the JSON-serialized template.
///
/// Map fields are ordered, so equal templates always hash equally.
pub fn template_hash(template: &InstanceTemplate) -> String {
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
