//! Content digests and the hashed storage path scheme.

use std::fmt;

use anyhow::{bail, Error};
use openssl::sha::Sha256;

/// Length of a digest in hex form.
pub const DIGEST_HEX_LEN: usize = 64;

/// A SHA-256 content digest, used both as blob identity and as storage
/// key material.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Sentinel digest denoting "no parent".
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finish())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        if hex_str.len() != DIGEST_HEX_LEN {
            bail!("invalid digest length {} ('{}')", hex_str.len(), hex_str);
        }
        let bytes = hex::decode(hex_str)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(Digest(digest))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Map a digest to its storage key: a two character prefix directory,
/// then the remainder. This bounds the fan-out per directory on
/// filesystem-like stores.
pub fn hashed_path(digest: &Digest) -> String {
    let hex = digest.to_hex();
    format!("{}/{}", &hex[..2], &hex[2..])
}

#[test]
fn test_hashed_path() {
    let digest = Digest::compute(b"some content");
    let path = hashed_path(&digest);
    assert_eq!(path.len(), DIGEST_HEX_LEN + 1);
    assert_eq!(&path[2..3], "/");
    assert_eq!(path.replace('/', ""), digest.to_hex());

    let zero = hashed_path(&Digest::ZERO);
    assert_eq!(zero, format!("00/{}", "0".repeat(62)));
}

#[test]
fn test_digest_hex_roundtrip() {
    let digest = Digest::compute(b"roundtrip");
    let copy = Digest::from_hex(&digest.to_hex()).unwrap();
    assert_eq!(digest, copy);
    assert!(Digest::from_hex("beef").is_err());
}
