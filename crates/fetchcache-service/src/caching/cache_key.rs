use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The stable identity of a cached resource.
///
/// The key is the SHA-256 of the resource URL: the same URL always maps to
/// the same key, and the hex rendering doubles as the artifact's file name
/// inside the cache directory. Equality and ordering consider only the hash;
/// the originating URL is kept for diagnostics where it is known.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    source: Option<Arc<str>>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a resource URL.
    pub fn from_url(url: &Url) -> Self {
        let hash = Sha256::digest(url.as_str().as_bytes());
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        Self {
            source: Some(url.as_str().into()),
            hash,
        }
    }

    /// Reconstructs a [`CacheKey`] from its hex rendering.
    ///
    /// The originating URL is not recoverable; [`source`](Self::source) will
    /// be `None`. This is how the sweep re-creates keys from metadata
    /// records.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }

        let mut hash = [0; 32];
        for (byte, chunk) in hash.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let chunk = std::str::from_utf8(chunk).ok()?;
            *byte = u8::from_str_radix(chunk, 16).ok()?;
        }

        Some(Self { source: None, hash })
    }

    /// The URL this key was derived from, if known.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Returns the relative path for this cache key.
    ///
    /// The path is the sha-256 hash, hex-formatted.
    pub fn cache_path(&self) -> String {
        let mut path = String::with_capacity(64);
        for b in &self.hash {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }
}
