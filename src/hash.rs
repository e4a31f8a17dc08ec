//! Deterministic hashing for state fingerprints.
//!
//! Fingerprints are compared across processes and across runs, so they
//! must not depend on a keyed hasher or on the standard library's hash
//! algorithm staying the same between releases.

/// Combine two u64 hashes deterministically.
#[inline]
pub fn hash_combine(a: u64, b: u64) -> u64 {
    let mut h = a;
    h = h.wrapping_mul(0x517cc1b727220a95);
    h = h.wrapping_add(b);
    h ^= h >> 32;
    h
}

/// Hash a byte slice deterministically (FNV-1a).
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Fold a sequence of f32 values by their bit patterns.
pub fn hash_f32s(values: &[f32]) -> u64 {
    values
        .iter()
        .fold(0xcbf29ce484222325, |h, v| hash_combine(h, v.to_bits() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_order_sensitive() {
        assert_ne!(hash_combine(1, 2), hash_combine(2, 1));
        assert_eq!(hash_combine(1, 2), hash_combine(1, 2));
    }

    #[test]
    fn test_hash_bytes_known_value() {
        // FNV-1a of the empty input is the offset basis.
        assert_eq!(hash_bytes(b""), 0xcbf29ce484222325);
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn test_hash_f32s_distinguishes_values() {
        assert_ne!(hash_f32s(&[1.0, 2.0]), hash_f32s(&[2.0, 1.0]));
        assert_ne!(hash_f32s(&[0.0]), hash_f32s(&[-0.0]));
    }
}
