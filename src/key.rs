//! Keys, signatures, hashes and sealed payloads.
//!
//! Agents sign their session logs with ed25519. Private transactions are
//! sealed with XChaCha20-Poly1305 under a symmetric read key that the
//! permission layer hands out to group members.

use blake3::Hasher;
use chacha20poly1305::Key;
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::XNonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::KeyInit;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use rand_core::OsRng;
use rand_core::RngCore;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// A public key, 32 bytes on the ed25519 curve. Identifies an agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPub(pub [u8; 32]);

/// A secret key, 32 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySec(pub [u8; 32]);

/// A keypair bundles a public and secret key together.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub key_pub: KeyPub,
    pub key_sec: KeySec,
}

/// A signature, 64 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

/// A blake3 hash, 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

/// A symmetric key used to seal private transactions.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadKey(pub [u8; 32]);

/// Names a read key without revealing it: the first 16 bytes of its hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

/// A sealed payload: nonce plus ciphertext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "hex_array")]
    pub nonce: [u8; 24],
    #[serde(with = "hex_vec")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The ciphertext was tampered with or the key is wrong.
    #[error("authentication failed while opening sealed payload")]
    AuthenticationFailed,
    /// The cipher refused the plaintext (only happens for absurd lengths).
    #[error("sealing failed")]
    SealFailed,
}

/// Hash a message using blake3.
pub fn hash(message: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(message);
    let result = hasher.finalize();
    return Hash(*result.as_bytes());
}

impl KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> KeyPair {
        let signing = SigningKey::generate(&mut OsRng);
        return KeyPair::from_signing(&signing);
    }

    /// Derive a keypair from a fixed seed. Useful for reproducible replicas.
    pub fn from_seed(seed: [u8; 32]) -> KeyPair {
        let signing = SigningKey::from_bytes(&seed);
        return KeyPair::from_signing(&signing);
    }

    fn from_signing(signing: &SigningKey) -> KeyPair {
        let verifying = signing.verifying_key();
        return KeyPair {
            key_pub: KeyPub(verifying.to_bytes()),
            key_sec: KeySec(signing.to_bytes()),
        };
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = SigningKey::from_bytes(&self.key_sec.0);
        return Signature(signing.sign(message).to_bytes());
    }
}

impl KeyPub {
    /// Verify a signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let verifying = match VerifyingKey::from_bytes(&self.0) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        return verifying.verify(message, &sig).is_ok();
    }
}

impl ReadKey {
    /// Generate a fresh random read key.
    pub fn generate() -> ReadKey {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        return ReadKey(bytes);
    }

    /// The public name of this key.
    pub fn id(&self) -> KeyId {
        let digest = hash(&self.0);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest.0[..16]);
        return KeyId(id);
    }

    /// Seal a message using XChaCha20-Poly1305 with a random nonce.
    pub fn seal(&self, message: &[u8]) -> Result<Sealed, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, message)
            .map_err(|_| CryptoError::SealFailed)?;
        return Ok(Sealed {
            nonce: nonce_bytes,
            ciphertext,
        });
    }

    /// Open a sealed payload.
    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let nonce = XNonce::from_slice(&sealed.nonce);
        return cipher
            .decrypt(nonce, sealed.ciphertext.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed);
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    return bytes.iter().map(|b| format!("{:02x}", b)).collect();
}

pub(crate) fn unhex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    for i in (0..text.len()).step_by(2) {
        out.push(u8::from_str_radix(&text[i..i + 2], 16).ok()?);
    }
    return Some(out);
}

pub(crate) fn unhex_array<const N: usize>(text: &str) -> Option<[u8; N]> {
    let bytes = unhex(text)?;
    return bytes.try_into().ok();
}

mod hex_array {
    use super::*;

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        return s.serialize_str(&hex(bytes));
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(d)?;
        return unhex_array(&text).ok_or_else(|| serde::de::Error::custom("bad hex length"));
    }
}

mod hex_vec {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        return s.serialize_str(&hex(bytes));
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        return unhex(&text).ok_or_else(|| serde::de::Error::custom("bad hex"));
    }
}

/// Fixed-size byte newtypes travel as lowercase hex strings.
macro_rules! hex_newtype_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                return hex_array::serialize(&self.0, s);
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<$name, D::Error> {
                return hex_array::deserialize(d).map($name);
            }
        }
    };
}

hex_newtype_serde!(KeyPub);
hex_newtype_serde!(Signature);
hex_newtype_serde!(Hash);
hex_newtype_serde!(KeyId);

impl std::fmt::Debug for KeyPub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "KeyPub({})", hex(&self.0[..8]));
    }
}

impl std::fmt::Debug for KeySec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "KeySec(..)");
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "KeyPair {{ pub: {} }}", hex(&self.key_pub.0));
    }
}

impl std::fmt::Debug for ReadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "ReadKey({})", hex(&self.id().0));
    }
}

impl std::fmt::Debug for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "KeyId({})", hex(&self.0));
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "Signature({})", hex(&self.0[..8]));
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "Hash({})", hex(&self.0));
    }
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "Sealed {{ nonce: {}, ciphertext: {} bytes }}", hex(&self.nonce), self.ciphertext.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate();
        let message = b"hello world";
        let signature = pair.sign(message);
        assert!(pair.key_pub.verify(message, &signature));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let pair = KeyPair::generate();
        let signature = pair.sign(b"hello world");
        assert!(!pair.key_pub.verify(b"wrong message", &signature));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let pair_a = KeyPair::generate();
        let pair_b = KeyPair::generate();
        let signature = pair_a.sign(b"hello world");
        assert!(!pair_b.key_pub.verify(b"hello world", &signature));
    }

    #[test]
    fn seeded_keypairs_are_reproducible() {
        let a = KeyPair::from_seed([7u8; 32]);
        let b = KeyPair::from_seed([7u8; 32]);
        assert_eq!(a.key_pub, b.key_pub);
    }

    #[test]
    fn hash_differs_for_different_input() {
        assert_eq!(hash(b"hello world"), hash(b"hello world"));
        assert_ne!(hash(b"hello world"), hash(b"hello world!"));
    }

    #[test]
    fn seal_and_open() {
        let key = ReadKey::generate();
        let sealed = key.seal(b"secret message").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), b"secret message");
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let key = ReadKey::generate();
        let other = ReadKey::generate();
        let sealed = key.seal(b"secret").unwrap();
        assert_eq!(other.open(&sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn open_fails_with_tampered_ciphertext() {
        let key = ReadKey::generate();
        let mut sealed = key.seal(b"secret").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn key_ids_are_stable_and_distinct() {
        let key = ReadKey::generate();
        assert_eq!(key.id(), key.id());
        assert_ne!(key.id(), ReadKey::generate().id());
    }

    #[test]
    fn public_keys_travel_as_hex() {
        let pair = KeyPair::from_seed([1u8; 32]);
        let json = serde_json::to_string(&pair.key_pub).unwrap();
        assert_eq!(json.len(), 64 + 2);
        let back: KeyPub = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair.key_pub);
    }

    #[test]
    fn unhex_rejects_odd_and_non_hex() {
        assert!(unhex("abc").is_none());
        assert!(unhex("zz").is_none());
        assert_eq!(unhex("00ff"), Some(vec![0x00, 0xff]));
    }
}
