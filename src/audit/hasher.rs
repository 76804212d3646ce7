//! AN-014: BLAKE3 desired-state hashing.
//!
//! A node's hash covers everything that would change what the adapter is
//! asked to create: kind, parameters (as written, templates unresolved) and
//! dependencies. The planner compares it against the snapshot to choose
//! between Verify and Update.

use crate::core::types::ResourceSpec;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple components.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Hash of a spec's desired state.
pub fn hash_desired_state(spec: &ResourceSpec) -> String {
    // Parameters keep declaration order, so the rendering is stable. Values
    // the emitter rejects still hash by their full Debug form.
    let params = serde_yaml_ng::to_string(&spec.parameters)
        .unwrap_or_else(|_| format!("{:?}", spec.parameters));
    let mut deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
    deps.sort_unstable();
    deps.dedup();
    let deps = deps.join(",");
    composite_hash(&[&spec.kind, &params, &deps])
}
