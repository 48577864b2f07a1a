use tollgate_core::types::Address;

/// BLAKE3 hash (32 bytes).
pub type Hash = [u8; 32];

/// Hash arbitrary data using BLAKE3.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Derive a 20-byte address from the concatenation of `parts`.
///
/// The address is the last 20 bytes of the BLAKE3 digest.
pub fn derive_address(parts: &[&[u8]]) -> Address {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[12..]);
    Address(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"tollgate test data";
        assert_eq!(hash(data), hash(data));
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(hash(b"data A"), hash(b"data B"));
    }

    #[test]
    fn test_derive_address_uses_digest_tail() {
        let digest = hash(b"abc");
        let addr = derive_address(&[b"a", b"bc"]);
        assert_eq!(&addr.0[..], &digest[12..]);
    }

    #[test]
    fn test_derive_address_order_matters() {
        assert_ne!(derive_address(&[b"a", b"b"]), derive_address(&[b"b", b"a"]));
    }
}
