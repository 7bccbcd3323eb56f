//! Content and path digests.
//!
//! Objects and catalogs are addressed by a SHA-1 content hash; paths inside a
//! catalog are keyed by a 128-bit MD5 digest split into two signed halves so
//! it can serve as a composite SQL key.

use std::fmt;

use md5::{Digest as _, Md5};
use sha1::{Digest as _, Sha1};

pub const CONTENT_HASH_BYTES: usize = 20;
pub const PATH_HASH_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA-1",
        }
    }
}

/// Fixed-width cryptographic digest identifying an object or a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    digest: [u8; CONTENT_HASH_BYTES],
}

impl ContentHash {
    pub fn new(digest: [u8; CONTENT_HASH_BYTES]) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha1,
            digest,
        }
    }

    /// Digest of a byte buffer.
    pub fn of_buffer(buf: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        Self::new(hasher.finalize().into())
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let raw = hex::decode(hex_str).ok()?;
        let digest: [u8; CONTENT_HASH_BYTES] = raw.try_into().ok()?;
        Some(Self::new(digest))
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let digest: [u8; CONTENT_HASH_BYTES] = raw.try_into().ok()?;
        Some(Self::new(digest))
    }

    /// The all-zero digest, used for entries without content (directories, symlinks).
    pub fn is_null(&self) -> bool {
        self.digest.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Two-level sharded relative path inside a cache directory: `ab/cdef...`.
    pub fn cache_path(&self) -> String {
        let hex_form = self.to_hex();
        format!("{}/{}", &hex_form[..2], &hex_form[2..])
    }

    /// Path component under the repository data area, e.g. `/data/ab/cdef...C`
    /// for catalogs. `suffix` tags the object kind on the server side.
    pub fn url_path(&self, suffix: ObjectSuffix) -> String {
        format!("/data/{}{}", self.cache_path(), suffix.tag())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Server-side object kind tag appended to the sharded URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSuffix {
    Plain,
    Catalog,
    /// Chunk of a partitioned file.
    Partial,
}

impl ObjectSuffix {
    fn tag(&self) -> &'static str {
        match self {
            ObjectSuffix::Plain => "",
            ObjectSuffix::Catalog => "C",
            ObjectSuffix::Partial => "P",
        }
    }
}

/// Streaming SHA-1 used while inflating downloaded objects.
pub struct ContentHasher {
    inner: Sha1,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash::new(self.inner.finalize().into())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// 128-bit digest of an absolute in-repository path; the primary lookup key
/// inside a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PathHash {
    digest: [u8; PATH_HASH_BYTES],
}

impl PathHash {
    pub fn of_path(path: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(path.as_bytes());
        Self {
            digest: hasher.finalize().into(),
        }
    }

    pub fn from_halves(hi: i64, lo: i64) -> Self {
        let mut digest = [0u8; PATH_HASH_BYTES];
        digest[..8].copy_from_slice(&hi.to_le_bytes());
        digest[8..].copy_from_slice(&lo.to_le_bytes());
        Self { digest }
    }

    /// The two signed 64-bit halves used as the composite SQL key.
    pub fn halves(&self) -> (i64, i64) {
        let hi = i64::from_le_bytes(self.digest[..8].try_into().unwrap());
        let lo = i64::from_le_bytes(self.digest[8..].try_into().unwrap());
        (hi, lo)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Parent path of an absolute in-repository path ("" is the root).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last component of an absolute in-repository path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
