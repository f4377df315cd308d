// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use sha1::{Digest as _, Sha1};

/// Width of a [`KeyDigest`] in bytes (160 bits).
pub const DIGEST_LEN: usize = 20;

/// A reserved digest value that can never be produced by [`KeyDigest::compute`]
/// in practice (see `spec.md` Design Notes on digest collisions); used to
/// mark an empty hash table slot.
pub const SENTINEL: [u8; DIGEST_LEN] = [0xFF; DIGEST_LEN];

/// A fixed-width, collision-resistant digest of a user key.
///
/// The hash index never stores the user key itself, only this digest - see
/// the Design Note in `spec.md` §9. Two distinct keys hashing to the same
/// digest would therefore be indistinguishable to the index; this is
/// accepted as negligible for a 160-bit cryptographic digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct KeyDigest([u8; DIGEST_LEN]);

impl KeyDigest {
    /// Computes the digest of a user key.
    #[must_use]
    pub fn compute(key: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key);
        let out = hasher.finalize();
        Self(out.into())
    }

    /// The reserved sentinel digest marking an empty index slot.
    #[must_use]
    pub const fn sentinel() -> Self {
        Self(SENTINEL)
    }

    /// Returns `true` if this digest is the reserved empty-slot sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL
    }

    /// Raw bytes of the digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Maps the digest onto a bucket index in a table of the given size.
    ///
    /// The digest is treated as a big-endian integer modulo `table_size`,
    /// per `spec.md` §4.2 ("Bucket for digest D is `D mod table_size`").
    #[must_use]
    pub fn bucket(&self, table_size: u32) -> u32 {
        // Fold the 160-bit digest down via its first 8 bytes; this is enough
        // entropy to distribute buckets evenly without a 160-bit modulo.
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[0..8]);
        let folded = u64::from_be_bytes(buf);
        (folded % u64::from(table_size)) as u32
    }
}

impl From<[u8; DIGEST_LEN]> for KeyDigest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn digest_is_deterministic() {
        let a = KeyDigest::compute(b"hello");
        let b = KeyDigest::compute(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_for_different_keys() {
        let a = KeyDigest::compute(b"hello");
        let b = KeyDigest::compute(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn sentinel_is_recognized() {
        assert!(KeyDigest::sentinel().is_sentinel());
        assert!(!KeyDigest::compute(b"a").is_sentinel());
    }

    #[test]
    fn bucket_is_in_range() {
        for key in [b"a".as_slice(), b"bb", b"ccc", b"dddd"] {
            let digest = KeyDigest::compute(key);
            assert!(digest.bucket(97) < 97);
        }
    }
}
