//! Curve, cipher and hash primitives
//!
//! - secp256k1 ECDSA (RFC 6979, 64-byte `r || s` signatures)
//! - secp256k1 ECDH, raw public keys as 64 bytes `x || y`
//! - AES-256-GCM with a random 96-bit nonce prepended to the ciphertext
//! - SHA-256 for measurements and key derivation

use super::enclave::TeeError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const PUBLIC_KEY_SIZE: usize = 64;
pub const PRIVATE_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

pub type Hash = [u8; HASH_SIZE];
pub type RawSignature = [u8; SIGNATURE_SIZE];
pub type RawPublicKey = [u8; PUBLIC_KEY_SIZE];

/// An ECDH key pair; the private half is wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: [u8; PRIVATE_KEY_SIZE],
    #[zeroize(skip)]
    public: RawPublicKey,
}

impl KeyPair {
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }

    pub fn public_key(&self) -> &RawPublicKey {
        &self.public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

fn raw_public(point: &PublicKey) -> RawPublicKey {
    let encoded = point.to_encoded_point(false);
    let mut raw = [0u8; PUBLIC_KEY_SIZE];
    // Uncompressed SEC1 is 0x04 || x || y
    raw.copy_from_slice(&encoded.as_bytes()[1..]);
    raw
}

fn sec1_from_raw(raw: &RawPublicKey) -> [u8; PUBLIC_KEY_SIZE + 1] {
    let mut sec1 = [0u8; PUBLIC_KEY_SIZE + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    sec1
}

/// Parse a raw 64-byte public key
pub fn parse_public_key(raw: &RawPublicKey) -> Result<PublicKey, TeeError> {
    PublicKey::from_sec1_bytes(&sec1_from_raw(raw))
        .map_err(|_| TeeError::CryptoError("invalid public key".into()))
}

/// Generate a fresh ECDH key pair
pub fn make_key_pair() -> KeyPair {
    let secret = SecretKey::random(&mut rand::thread_rng());
    let mut private = [0u8; PRIVATE_KEY_SIZE];
    private.copy_from_slice(&secret.to_bytes());
    KeyPair {
        private,
        public: raw_public(&secret.public_key()),
    }
}

/// Agree on a shared secret: the x coordinate of `priv * peer_pub`
pub fn make_shared_key(
    private_key: &[u8; PRIVATE_KEY_SIZE],
    peer_public: &RawPublicKey,
) -> Result<[u8; 32], TeeError> {
    let secret = SecretKey::from_slice(private_key)
        .map_err(|_| TeeError::CryptoError("invalid private key".into()))?;
    let peer = parse_public_key(peer_public)?;
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Signing identity of a (simulated) secure monitor or enclave platform
#[derive(Clone)]
pub struct PlatformSigner {
    signing_key: SigningKey,
}

impl PlatformSigner {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8; PRIVATE_KEY_SIZE]) -> Result<Self, TeeError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|_| TeeError::CryptoError("invalid signing key".into()))?;
        Ok(Self { signing_key })
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.signing_key.to_bytes().into()
    }

    pub fn sign(&self, message: &[u8]) -> RawSignature {
        let sig: Signature = self.signing_key.sign(message);
        sig.to_bytes().into()
    }

    pub fn public_key(&self) -> RawPublicKey {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut raw = [0u8; PUBLIC_KEY_SIZE];
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }
}

/// Check an ECDSA signature; any malformed input is a failed check
pub fn verify(public_key: &RawPublicKey, message: &[u8], signature: &RawSignature) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1_from_raw(public_key)) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

pub fn hash(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Derive a 32-byte key for one purpose from a shared secret
pub fn derive_key(secret: &[u8], label: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(secret);
    h.update(label);
    h.finalize().into()
}

/// AES-256-GCM seal; output is `nonce || ciphertext || tag`
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, TeeError> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| TeeError::CryptoError(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt`]; fails on any tampering
pub fn decrypt(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, TeeError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(TeeError::IntegrityError("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    Aes256Gcm::new(key.into())
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| TeeError::IntegrityError("authentication tag mismatch".into()))
}
