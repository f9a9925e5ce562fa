//! LFS Object ID (OID) - SHA256 content hash.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::{Error, Result};

/// Length of an OID in hex characters.
pub const OID_HEX_LEN: usize = 64;

/// LFS Object ID - a SHA256 hash of the file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Parse an OID from a hex string.
    ///
    /// Only the canonical form is accepted: exactly 64 lowercase hex
    /// characters. Anything else could address the same object under a
    /// second name.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != OID_HEX_LEN {
            return Err(Error::InvalidOid(format!(
                "expected {} hex chars, got {}",
                OID_HEX_LEN,
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidOid(format!(
                "not a lowercase hex digest: {}",
                hex
            )));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes).map_err(|e| Error::InvalidOid(e.to_string()))?;
        Ok(Oid { bytes })
    }

    /// Compute the OID (SHA256 hash) of content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = OidHasher::new();
        hasher.update(content);
        hasher.finish().0
    }

    /// Get the OID as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl std::str::FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Oid::from_hex(s)
    }
}

/// Running SHA256 digest over streamed bytes.
///
/// Tracks the byte count alongside the hash so an upload can be checked
/// against both the declared OID and the declared size in one pass.
#[derive(Clone, Default)]
pub struct OidHasher {
    hasher: Sha256,
    len: u64,
}

impl OidHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the hasher, returning the digest and total length.
    pub fn finish(self) -> (Oid, u64) {
        let bytes: [u8; 32] = self.hasher.finalize().into();
        (Oid { bytes }, self.len)
    }
}
