use std::fmt;
use sha2::{Digest, Sha256};

const TAG_UNRESPONSIVE: u8 = 0x00;
const TAG_ADDRESS: u8 = 0x01;

/// SHA-256 digest of a canonical hop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hashes a canonical path (`None` = unresponsive hop).
///
/// The encoding is length-prefixed: hop count as u64 BE, then per hop a tag
/// byte and, for addresses, a u32 BE byte length followed by the bytes. The
/// empty path hashes eight zero bytes.
pub fn fingerprint(path: &[Option<&str>]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update((path.len() as u64).to_be_bytes());

    for hop in path {
        match hop {
            None => hasher.update([TAG_UNRESPONSIVE]),
            Some(address) => {
                hasher.update([TAG_ADDRESS]);
                hasher.update((address.len() as u32).to_be_bytes());
                hasher.update(address.as_bytes());
            }
        }
    }

    Fingerprint(hasher.finalize().into())
}
