//! Shared-secret authentication for peer frames.
//!
//! With a [`ClusterSecret`] configured, every frame on the peer port carries
//! an HMAC-SHA256 tag. Frames that fail verification close the connection
//! without a reply.

use std::io;
use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC tag length (SHA-256 output).
pub const TAG_LEN: usize = 32;

/// A keyed MAC shared by every peer in the pool.
///
/// The `Debug` impl never prints key material.
#[derive(Clone)]
pub struct ClusterSecret {
    mac: HmacSha256,
}

impl ClusterSecret {
    pub fn from_password(password: &str) -> io::Result<Self> {
        let mac = HmacSha256::new_from_slice(password.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(Self { mac })
    }

    /// Reads the password from a file, ignoring trailing whitespace.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let password = contents.trim_end();
        if password.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cluster auth password file is empty",
            ));
        }
        Self::from_password(password)
    }

    pub fn sign(&self, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    /// Checks `tag` against `payload` in constant time.
    pub fn verify(&self, payload: &[u8], tag: &[u8]) -> bool {
        if tag.len() != TAG_LEN {
            return false;
        }
        bool::from(self.sign(payload).ct_eq(tag))
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSecret").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn signed_payload_verifies() {
        let secret = ClusterSecret::from_password("pool-secret").unwrap();
        let tag = secret.sign(b"bucket/update");
        assert!(secret.verify(b"bucket/update", &tag));
        assert!(!secret.verify(b"bucket/updatE", &tag));
    }

    #[test]
    fn other_password_rejects() {
        let a = ClusterSecret::from_password("a").unwrap();
        let b = ClusterSecret::from_password("b").unwrap();
        assert!(!b.verify(b"vote", &a.sign(b"vote")));
    }

    #[test]
    fn short_tag_rejects() {
        let secret = ClusterSecret::from_password("x").unwrap();
        assert!(!secret.verify(b"admin", &[0u8; 16]));
    }

    #[test]
    fn file_password_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let secret = ClusterSecret::from_file(file.path()).unwrap();
        let direct = ClusterSecret::from_password("from-file").unwrap();
        assert!(direct.verify(b"p", &secret.sign(b"p")));
    }

    #[test]
    fn empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ClusterSecret::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn debug_hides_key() {
        let secret = ClusterSecret::from_password("hunter2").unwrap();
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
