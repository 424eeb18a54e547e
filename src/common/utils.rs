//! Utility functions for dpasswd

/// Normalize a key: trims surrounding whitespace and rejects empty keys.
pub fn normalize_key(key: &str) -> crate::Result<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(crate::Error::EmptyKey);
    }
    Ok(key.to_string())
}

/// Map a string node ID onto the numeric ID used by the Raft engine.
///
/// Takes the first 8 bytes of the BLAKE3 digest. Raft reserves 0 for
/// "no node", so a zero digest prefix maps to 1.
pub fn raft_id(node_id: &str) -> u64 {
    let digest = blake3::hash(node_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix).max(1)
}
