//! # Hashing Utilities
//!
//! BLAKE3 is the only hash in stakescope. It identifies gossip values (the
//! bloom filters in pull requests are built over these hashes) and binds
//! pong replies to the ping token they answer.

/// BLAKE3 over the concatenation of several slices, without allocating.
pub fn blake3_hashv(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// The first eight bytes of a digest as a little-endian integer. Used for
/// bloom indexing and pull-filter masks.
pub fn hash_prefix_u64(hash: &[u8; 32]) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashv_matches_concatenation() {
        assert_eq!(
            blake3_hashv(&[b"stake", b"scope"]),
            *blake3::hash(b"stakescope").as_bytes()
        );
    }

    #[test]
    fn prefix_is_little_endian() {
        let mut hash = [0u8; 32];
        hash[0] = 1;
        assert_eq!(hash_prefix_u64(&hash), 1);
        hash[7] = 0x80;
        assert_eq!(hash_prefix_u64(&hash), 0x8000_0000_0000_0001);
    }
}
