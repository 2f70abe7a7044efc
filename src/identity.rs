//! # Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the process
//! - [`Identity`]: 32-byte public key, used directly as the peer id
//! - [`PeerAddress`]: a peer id paired with a network address
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 public key.** The peer id is self-certifying and
//! doubles as a point in the 256-bit XOR keyspace the DHT routes over.
//!
//! The fingerprint (hex of the first [`FINGERPRINT_LEN`] bytes) is for logs
//! and display only. Routing always uses the full 32 bytes.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Number of public-key bytes shown in a fingerprint.
pub const FINGERPRINT_LEN: usize = 8;

/// Length of the persisted keypair encoding (secret || public).
pub const KEYPAIR_LEN: usize = 64;

#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Decode the 64-byte `secret || public` form, rejecting material whose
    /// public half does not belong to the secret half.
    pub fn from_keypair_bytes(
        bytes: &[u8; KEYPAIR_LEN],
    ) -> Result<Self, ed25519_dalek::SignatureError> {
        let signing_key = SigningKey::from_keypair_bytes(bytes)?;
        Ok(Self { signing_key })
    }

    pub fn to_keypair_bytes(&self) -> [u8; KEYPAIR_LEN] {
        self.signing_key.to_keypair_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn fingerprint(&self) -> String {
        self.identity().fingerprint()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Short, stable, human-readable id for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..FINGERPRINT_LEN])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Rejects trivially invalid ids and bytes that are not an Ed25519 point.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xff) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

/// Compare two XOR distances as big-endian 256-bit integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.fingerprint())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Where a peer can be reached. Produced by lookups and inbound traffic and
/// never treated as authoritative without a fresh query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: Identity,
    pub address: String,
}

impl PeerAddress {
    pub fn new(peer_id: Identity, address: impl Into<String>) -> Self {
        Self {
            peer_id,
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.peer_id.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equals_public_key() {
        for _ in 0..50 {
            let kp = Keypair::generate();
            assert_eq!(*kp.identity().as_bytes(), kp.public_key_bytes());
            assert!(kp.identity().is_valid());
        }
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_is_big_endian() {
        let mut small = [0u8; 32];
        small[31] = 0xff;
        let mut large = [0u8; 32];
        large[0] = 0x01;
        assert_eq!(distance_cmp(&small, &large), Ordering::Less);
        assert_eq!(distance_cmp(&large, &small), Ordering::Greater);
        assert_eq!(distance_cmp(&large, &large), Ordering::Equal);
    }

    #[test]
    fn fingerprint_is_stable_prefix() {
        let kp = Keypair::generate();
        let fp = kp.fingerprint();
        assert_eq!(fp.len(), FINGERPRINT_LEN * 2);
        assert_eq!(fp, kp.fingerprint());
        assert!(kp.identity().to_hex().starts_with(&fp));
    }

    #[test]
    fn hex_roundtrip_and_length_check() {
        let id = Keypair::generate().identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn keypair_bytes_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_keypair_bytes(&kp.to_keypair_bytes()).unwrap();
        assert_eq!(restored.identity(), kp.identity());

        let mut mismatched = kp.to_keypair_bytes();
        mismatched[32..].copy_from_slice(&Keypair::generate().public_key_bytes());
        assert!(Keypair::from_keypair_bytes(&mismatched).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"block 42");
        assert!(kp.verify(b"block 42", &sig));
        assert!(!kp.verify(b"block 43", &sig));
    }

    #[test]
    fn trivially_invalid_identities_rejected() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xffu8; 32]).is_valid());
    }

    #[test]
    fn debug_shows_fingerprint_only() {
        let kp = Keypair::generate();
        let debug = format!("{:?}", kp.identity());
        assert_eq!(debug, format!("Identity({})", kp.fingerprint()));
        let debug = format!("{kp:?}");
        assert!(!debug.contains(&hex::encode(kp.secret_key_bytes())));
    }
}
