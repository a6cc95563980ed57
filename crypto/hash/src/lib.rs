//! OBELISK Hash Functions
//!
//! BLAKE3 wrappers used for every 32-byte identifier, persisted key and
//! proof-of-work hash in the node.

pub use blake3;

/// Hash data using BLAKE3
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple inputs with BLAKE3
pub fn hash_many(inputs: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for input in inputs {
        hasher.update(input);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"obelisk"), hash(b"obelisk"));
        assert_ne!(hash(b"obelisk"), hash(b"obelisk2"));
    }

    #[test]
    fn test_hash_many_matches_concatenation() {
        assert_eq!(hash_many(&[b"ab", b"cd"]), hash(b"abcd"));
    }
}
