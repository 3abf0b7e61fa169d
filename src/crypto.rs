//! Key material, signatures, and hashing for the overlay handshake and the
//! account store.

use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use eyre::{eyre, Result, WrapErr};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::strkey;

/// 256-bit content hash, also the flood-memoization index.
pub type Hash = [u8; 32];

/// SHA-256 of an arbitrary byte string.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Abbreviated hex form used in log lines.
pub fn hex_abbrev(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

/// Cryptographically random 32-byte handshake nonce.
pub fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// 32-byte ed25519 public key identifying an account or a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Strkey form ("G..." 56 chars), the on-disk representation.
    pub fn to_strkey(&self) -> String {
        strkey::encode(strkey::VERSION_ACCOUNT, &self.0)
    }

    pub fn from_strkey(s: &str) -> Result<Self> {
        let key = strkey::decode(strkey::VERSION_ACCOUNT, s)
            .wrap_err_with(|| format!("invalid account strkey {:?}", s))?;
        Ok(PublicKey(key))
    }

    /// Short printable form for log lines.
    pub fn short_string(&self) -> String {
        let mut s = self.to_strkey();
        s.truncate(8);
        s
    }

    /// Verify an ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        vk.verify_strict(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_string())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strkey())
    }
}

/// Node signing identity, loaded from configuration.
#[derive(Clone)]
pub struct NodeSeed {
    key: SigningKey,
}

impl NodeSeed {
    /// Parse a 64-char hex seed.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).wrap_err("node seed must be hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre!("node seed must be exactly 32 bytes"))?;
        Ok(NodeSeed {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn from_bytes(seed: [u8; 32]) -> Self {
        NodeSeed {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Custom Debug that redacts the signing key to prevent accidental log leakage.
impl fmt::Debug for NodeSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSeed")
            .field("public_key", &self.public_key())
            .field("key", &"<redacted>")
            .finish()
    }
}
