//! Configurable hashing for fetch/commit integrity and cache-address
//! content addressing.
//!
//! - **SHA-256**: verifies downloaded/committed files against a declared
//!   digest (spec §4.6 `verify_hash`, §4.3 fetch-complete verification).
//! - **BLAKE3**: the cache-address hash over a package's canonical key plus
//!   its resolved weak dependency keys (spec §4.3).

use sha2::{Digest, Sha256};
use std::fmt;

/// Hash algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit cryptographic hash). Used for fetch/commit
    /// integrity verification against a declared digest.
    #[default]
    Sha256,

    /// BLAKE3 (256-bit cryptographic hash). Used for the cache-address
    /// hash: fast, and its keyed/incremental API composes cleanly across
    /// a canonical key plus an arbitrary number of weak-resolution keys.
    Blake3,
}

impl HashAlgorithm {
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A hash value with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl Hash {
    fn new_unchecked(algorithm: HashAlgorithm, value: String) -> Self {
        Self { algorithm, value }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The first 16 hex chars (8 bytes) of the digest, used as the cache
    /// directory's hash-prefix shard (spec §4.3).
    pub fn short_prefix(&self) -> &str {
        &self.value[..16.min(self.value.len())]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Hasher that can compute hashes using any supported algorithm.
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Blake3(blake3::Hasher),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => HasherState::Blake3(blake3::Hasher::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        match &mut self.state {
            HasherState::Sha256(hasher) => {
                hasher.update(data);
            }
            HasherState::Blake3(hasher) => {
                hasher.update(data);
            }
        }
        self
    }

    pub fn finalize(self) -> Hash {
        let value = match self.state {
            HasherState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        };
        Hash::new_unchecked(self.algorithm, value)
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data).value
}

/// The cache-address hash (spec §4.3): BLAKE3 over the canonical key plus
/// the canonical keys of every resolved weak dependency, joined by `|`.
pub fn cache_address_hash(canonical_key: &str, resolved_weak_keys: &[String]) -> Hash {
    let mut hasher = Hasher::new(HashAlgorithm::Blake3);
    hasher.update(canonical_key.as_bytes());
    for key in resolved_weak_keys {
        hasher.update(b"|");
        hasher.update(key.as_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash() {
        let data = b"Hello, World!";
        let hash = hash_bytes(HashAlgorithm::Sha256, data);
        assert_eq!(hash.algorithm, HashAlgorithm::Sha256);
        assert_eq!(
            hash.value,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
        assert_eq!(hash.value.len(), 64);
    }

    #[test]
    fn test_blake3_hash_length() {
        let data = b"Hello, World!";
        let hash = hash_bytes(HashAlgorithm::Blake3, data);
        assert_eq!(hash.algorithm, HashAlgorithm::Blake3);
        assert_eq!(hash.value.len(), 64);
    }

    #[test]
    fn test_convenience_functions() {
        let data = b"test data";
        let sha = sha256(data);
        assert_eq!(sha.len(), 64);
    }

    #[test]
    fn test_hasher_incremental() {
        let data = b"Hello, World!";
        let full_hash = hash_bytes(HashAlgorithm::Sha256, data);
        let mut hasher = Hasher::new(HashAlgorithm::Sha256);
        hasher.update(b"Hello, ");
        hasher.update(b"World!");
        let incremental_hash = hasher.finalize();
        assert_eq!(full_hash, incremental_hash);
    }

    #[test]
    fn cache_address_hash_is_deterministic() {
        let a = cache_address_hash("foo.hello@v1", &["vendor.python@r4".to_string()]);
        let b = cache_address_hash("foo.hello@v1", &["vendor.python@r4".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.value.len(), 64);
    }

    #[test]
    fn cache_address_hash_sensitive_to_weak_keys() {
        let a = cache_address_hash("foo.hello@v1", &["vendor.python@r4".to_string()]);
        let b = cache_address_hash("foo.hello@v1", &["vendor.python@r5".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn cache_address_hash_no_weak_keys() {
        let a = cache_address_hash("foo.hello@v1", &[]);
        let b = cache_address_hash("foo.hello@v1", &[]);
        assert_eq!(a, b);
    }
}
