use crate::error::{RemoteError, Result};
use crate::reapi;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// SHA-256 of the empty blob
pub const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A content-store digest: SHA-256 hash and size in bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex SHA-256
    pub hash: String,
    /// Blob size
    pub size_bytes: i64,
}

impl Digest {
    /// Creates a new Digest from a hash string and size.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// Digest of the empty blob
    #[must_use]
    pub fn empty() -> Self {
        Self::new(EMPTY_HASH, 0)
    }

    /// Creates a Digest from in-memory content.
    #[must_use]
    pub fn from_bytes(content: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(content));
        Self {
            hash,
            size_bytes: content.len() as i64,
        }
    }

    /// Digest of the wire encoding of a message
    pub fn from_message(message: &impl prost::Message) -> (Self, Vec<u8>) {
        let bytes = message.encode_to_vec();
        (Self::from_bytes(&bytes), bytes)
    }

    /// Hash a local file without loading it into memory at once
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| RemoteError::io(e, path, "open for hashing"))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size: i64 = 0;
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| RemoteError::io(e, path, "read for hashing"))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as i64;
        }
        Ok(Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: size,
        })
    }

    /// Convert to the wire message
    #[must_use]
    pub fn to_proto(&self) -> reapi::Digest {
        reapi::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
        }
    }

    /// Convert from the wire message, validating its shape
    pub fn from_proto(proto: &reapi::Digest) -> Result<Self> {
        let valid_hash =
            proto.hash.len() == 64 && proto.hash.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid_hash || proto.size_bytes < 0 {
            return Err(RemoteError::invalid_digest(format!(
                "{}/{}",
                proto.hash, proto.size_bytes
            )));
        }
        Ok(Self::new(proto.hash.to_ascii_lowercase(), proto.size_bytes))
    }

    /// Convert an optional wire digest, failing when it is absent
    pub fn require(proto: Option<&reapi::Digest>, what: &str) -> Result<Self> {
        proto
            .ok_or_else(|| RemoteError::protocol(format!("{what} has no digest")))
            .and_then(Self::from_proto)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl From<&Digest> for reapi::Digest {
    fn from(digest: &Digest) -> Self {
        digest.to_proto()
    }
}
