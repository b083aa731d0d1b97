//! Context Keys
//!
//! Name-based identifiers for context entries and step names. The hash is
//! computed once at construction with a Murmur3-style mixer, so repeated
//! map lookups on hot paths never rehash the underlying string.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const MURMUR_SEED: u32 = 0;

/// Murmur3 32-bit hash (x86 variant).
fn murmur3_32(bytes: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let chunks = bytes.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k ^= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    // Finalization mix
    h ^= bytes.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// A cheap, clonable identifier for context entries and step names.
///
/// Two keys are equal exactly when their names are equal. The 32-bit hash
/// is precomputed at construction and fed directly into the `Hash`
/// implementation, which keeps lookups in hashed collections from walking
/// the name bytes again.
///
/// # Example
///
/// ```
/// use flowrunner::ContextKey;
///
/// let a = ContextKey::new("reads");
/// let b: ContextKey = "reads".into();
/// assert_eq!(a, b);
/// assert_eq!(a.name(), "reads");
/// ```
#[derive(Clone)]
pub struct ContextKey {
    name: Arc<str>,
    hash: u32,
}

impl ContextKey {
    /// Creates a key for the given name.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name: Arc<str> = Arc::from(name.as_ref());
        let hash = murmur3_32(name.as_bytes(), MURMUR_SEED);
        Self { name, hash }
    }

    /// Returns the key's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the hash computed at construction.
    pub fn precomputed_hash(&self) -> u32 {
        self.hash
    }
}

impl PartialEq for ContextKey {
    fn eq(&self, other: &Self) -> bool {
        // Hash comparison first rejects almost all mismatches without
        // touching the name bytes.
        self.hash == other.hash && self.name == other.name
    }
}

impl Eq for ContextKey {}

impl Hash for ContextKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl PartialOrd for ContextKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContextKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({:?})", self.name)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ContextKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ContextKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&ContextKey> for ContextKey {
    fn from(key: &ContextKey) -> Self {
        key.clone()
    }
}

impl AsRef<str> for ContextKey {
    fn as_ref(&self) -> &str {
        &self.name
    }
}
