//! # Crypto Adaptor
//!
//! Thin wrappers around the cryptographic primitives the protocol relies on:
//!
//! - **Command signatures**: Ed25519 over transmission bytes; every queue
//!   side holds its own signing keypair
//! - **Sealed bodies**: ephemeral-static X25519 agreement feeding a SHA-256
//!   KDF and ChaCha20-Poly1305; the sender needs only the recipient's public
//!   encryption key
//! - **Hashing**: SHA-256 for the per-direction message hash chain and for
//!   certificate SPKI fingerprints
//!
//! Public keys travel on the wire as base64url SubjectPublicKeyInfo DER, so
//! key bytes are self-describing and a future algorithm change does not
//! change the grammar. At the protocol layer every failure from this module
//! collapses into `AUTH` without distinguishing cause.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::encoding;

/// Length of an Ed25519 signature on the wire
pub const SIGNATURE_SIZE: usize = 64;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410)
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// DER prefix of an X25519 SubjectPublicKeyInfo (RFC 8410)
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key encoding")]
    BadKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("sealing failed")]
    Seal,
    #[error("opening sealed data failed")]
    Open,
}

fn spki(prefix: &[u8; 12], raw: &[u8; 32]) -> Vec<u8> {
    let mut der = Vec::with_capacity(prefix.len() + raw.len());
    der.extend_from_slice(prefix);
    der.extend_from_slice(raw);
    der
}

fn spki_raw(prefix: &[u8; 12], der: &[u8]) -> Result<[u8; 32], CryptoError> {
    if der.len() != prefix.len() + 32 || &der[..prefix.len()] != prefix {
        return Err(CryptoError::BadKey);
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&der[prefix.len()..]);
    Ok(raw)
}

/// Ed25519 signing keypair held by one side of a queue.
#[derive(Clone)]
pub struct SignKeyPair {
    key: SigningKey,
}

impl SignKeyPair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public(&self) -> VerifyKey {
        VerifyKey(self.key.verifying_key())
    }

    /// Sign `data`, returning the raw 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.key.sign(data).to_bytes().to_vec()
    }

    /// Secret seed for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }
}

impl std::fmt::Debug for SignKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignKeyPair")
            .field("public", &self.public())
            .finish()
    }
}

/// Public half of a signing keypair; what queues store to authenticate
/// commands.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyKey(VerifyingKey);

impl VerifyKey {
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig: [u8; SIGNATURE_SIZE] = signature
            .try_into()
            .map_err(|_| CryptoError::BadSignature)?;
        let sig = Signature::from_bytes(&sig);
        self.0
            .verify(data, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Wire form: base64url of the SPKI DER.
    pub fn encoded(&self) -> String {
        encoding::b64url_encode(&spki(&ED25519_SPKI_PREFIX, self.0.as_bytes()))
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let der = encoding::b64url_decode(s).map_err(|_| CryptoError::BadKey)?;
        Self::from_spki(&der)
    }

    pub fn from_spki(der: &[u8]) -> Result<Self, CryptoError> {
        let raw = spki_raw(&ED25519_SPKI_PREFIX, der)?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|_| CryptoError::BadKey)?;
        Ok(Self(key))
    }

    /// Raw 32 key bytes for persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|_| CryptoError::BadKey)?;
        Ok(Self(key))
    }
}

impl std::fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyKey({})", self.encoded())
    }
}

/// X25519 keypair owned by the receiving side of a queue; the public half
/// is handed out in the invitation so senders can seal bodies to it.
#[derive(Clone)]
pub struct EncKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EncKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> EncKey {
        EncKey(self.public)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        let secret = StaticSecret::from(raw);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }
}

impl std::fmt::Debug for EncKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncKeyPair")
            .field("public", &self.public())
            .finish()
    }
}

/// Public encryption key of a peer, as carried in invitations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncKey(PublicKey);

impl EncKey {
    pub fn encoded(&self) -> String {
        encoding::b64url_encode(&spki(&X25519_SPKI_PREFIX, self.0.as_bytes()))
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let der = encoding::b64url_decode(s).map_err(|_| CryptoError::BadKey)?;
        let raw = spki_raw(&X25519_SPKI_PREFIX, &der)?;
        Ok(Self(PublicKey::from(raw)))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self(PublicKey::from(raw)))
    }
}

impl std::fmt::Debug for EncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncKey({})", self.encoded())
    }
}

fn derive_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// Seal `plaintext` to the holder of `to`.
///
/// Output layout: `ephemeral_pub(32) || nonce(12) || ciphertext`. A fresh
/// ephemeral keypair per message makes sealed blobs unlinkable even for
/// identical plaintext.
pub fn seal(to: &EncKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&to.0);
    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &to.0);

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let mut blob = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(ephemeral_pub.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`seal`] with the recipient keypair.
pub fn open(keys: &EncKeyPair, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < 32 + NONCE_SIZE {
        return Err(CryptoError::Open);
    }
    let mut ephemeral_raw = [0u8; 32];
    ephemeral_raw.copy_from_slice(&blob[..32]);
    let ephemeral_pub = PublicKey::from(ephemeral_raw);
    let nonce = &blob[32..32 + NONCE_SIZE];
    let ciphertext = &blob[32 + NONCE_SIZE..];

    let shared = keys.secret.diffie_hellman(&ephemeral_pub);
    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &keys.public);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Open)
}

/// SHA-256 digest, used for the message hash chain and key fingerprints.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = SignKeyPair::generate();
        let sig = keys.sign(b"transmission bytes");
        assert!(keys.public().verify(b"transmission bytes", &sig).is_ok());
        assert!(keys.public().verify(b"other bytes", &sig).is_err());

        let other = SignKeyPair::generate();
        assert!(other.public().verify(b"transmission bytes", &sig).is_err());
    }

    #[test]
    fn verify_key_wire_round_trip() {
        let keys = SignKeyPair::generate();
        let encoded = keys.public().encoded();
        let decoded = VerifyKey::decode(&encoded).unwrap();
        assert_eq!(decoded, keys.public());
    }

    #[test]
    fn enc_key_wire_round_trip() {
        let keys = EncKeyPair::generate();
        let decoded = EncKey::decode(&keys.public().encoded()).unwrap();
        assert_eq!(decoded, keys.public());
    }

    #[test]
    fn spki_prefix_mismatch_is_rejected() {
        // an encryption key does not decode as a signing key
        let keys = EncKeyPair::generate();
        assert!(VerifyKey::decode(&keys.public().encoded()).is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let keys = EncKeyPair::generate();
        let blob = seal(&keys.public(), b"hello there").unwrap();
        assert_eq!(open(&keys, &blob).unwrap(), b"hello there");
    }

    #[test]
    fn tampered_blob_fails_to_open() {
        let keys = EncKeyPair::generate();
        let mut blob = seal(&keys.public(), b"hello there").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&keys, &blob).is_err());
    }

    #[test]
    fn wrong_recipient_fails_to_open() {
        let keys = EncKeyPair::generate();
        let other = EncKeyPair::generate();
        let blob = seal(&keys.public(), b"hello there").unwrap();
        assert!(open(&other, &blob).is_err());
    }

    #[test]
    fn keypair_persistence_round_trip() {
        let sign = SignKeyPair::generate();
        let restored = SignKeyPair::from_bytes(&sign.to_bytes()).unwrap();
        assert_eq!(restored.public(), sign.public());

        let enc = EncKeyPair::generate();
        let restored = EncKeyPair::from_bytes(&enc.to_bytes()).unwrap();
        assert_eq!(restored.public(), enc.public());
    }
}
