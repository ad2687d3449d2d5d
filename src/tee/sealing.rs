//! Sealed containers
//!
//! Layout: `body_length: u32 | reserved[16] | body`. The reserved block holds
//! the plaintext length and the auth text length as little-endian u32, the
//! rest is zero. The body is `nonce || AES-256-GCM(plaintext || auth_text)`,
//! so the auth text is both encrypted and authenticated.

use super::crypto::{self, NONCE_SIZE, TAG_SIZE};
use super::enclave::TeeError;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Auth text expected by [`unseal`]
pub const SEAL_AUTH_TEXT: &[u8] = b"dtee sealed data\0";

const RESERVED_SIZE: usize = 16;
const HEADER_SIZE: usize = 4 + RESERVED_SIZE;

/// Symmetric key used for sealing
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key derived from an agreed ECDH secret
    pub fn from_shared(shared: &[u8]) -> Self {
        Self(crypto::derive_key(shared, b"dtee-sealing-key-v1"))
    }

    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// A sealed payload plus its authenticated side text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub plaintext_len: u32,
    pub auth_len: u32,
    pub body: Vec<u8>,
}

impl SealedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.plaintext_len.to_le_bytes());
        out.extend_from_slice(&self.auth_len.to_le_bytes());
        out.extend_from_slice(&[0u8; RESERVED_SIZE - 8]);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TeeError> {
        if data.len() < HEADER_SIZE {
            return Err(TeeError::SealingError("sealed container too short".into()));
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let body_len = word(0) as usize;
        let body = &data[HEADER_SIZE..];
        if body.len() != body_len {
            return Err(TeeError::SealingError(format!(
                "body length {} does not match header {}",
                body.len(),
                body_len
            )));
        }
        Ok(Self {
            plaintext_len: word(4),
            auth_len: word(8),
            body: body.to_vec(),
        })
    }

    /// Size of the serialized container
    pub fn sealed_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Serialized size of a container for the given lengths
pub fn calc_sealed_size(plaintext_len: usize, auth_len: usize) -> usize {
    HEADER_SIZE + NONCE_SIZE + plaintext_len + auth_len + TAG_SIZE
}

pub fn seal(key: &SealingKey, plaintext: &[u8]) -> Result<SealedBlob, TeeError> {
    seal_with_aad(key, plaintext, SEAL_AUTH_TEXT)
}

pub fn seal_with_aad(key: &SealingKey, plaintext: &[u8], auth_text: &[u8]) -> Result<SealedBlob, TeeError> {
    let plaintext_len = u32::try_from(plaintext.len())
        .map_err(|_| TeeError::SealingError("plaintext too large".into()))?;
    let auth_len = u32::try_from(auth_text.len())
        .map_err(|_| TeeError::SealingError("auth text too large".into()))?;

    let mut message = Vec::with_capacity(plaintext.len() + auth_text.len());
    message.extend_from_slice(plaintext);
    message.extend_from_slice(auth_text);
    let body = crypto::encrypt(key.as_bytes(), &message, &[]);
    message.zeroize();

    Ok(SealedBlob {
        plaintext_len,
        auth_len,
        body: body?,
    })
}

/// Recover `(plaintext, auth_text)` without checking the auth text
pub fn unseal_parts(key: &SealingKey, blob: &SealedBlob) -> Result<(Vec<u8>, Vec<u8>), TeeError> {
    let mut message = crypto::decrypt(key.as_bytes(), &blob.body, &[])?;
    let split = blob.plaintext_len as usize;
    if message.len() != split + blob.auth_len as usize {
        message.zeroize();
        return Err(TeeError::IntegrityError("sealed lengths do not match body".into()));
    }
    let auth = message.split_off(split);
    Ok((message, auth))
}

/// Recover the plaintext, failing closed unless the auth text matches
pub fn unseal_with_aad(key: &SealingKey, blob: &SealedBlob, expected_auth: &[u8]) -> Result<Vec<u8>, TeeError> {
    let (mut plaintext, auth) = unseal_parts(key, blob)?;
    if auth != expected_auth {
        plaintext.zeroize();
        return Err(TeeError::IntegrityError("auth text mismatch".into()));
    }
    Ok(plaintext)
}

pub fn unseal(key: &SealingKey, blob: &SealedBlob) -> Result<Vec<u8>, TeeError> {
    unseal_with_aad(key, blob, SEAL_AUTH_TEXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_lengths() {
        let key = SealingKey::generate();
        for len in [0usize, 1, 16, 100_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blob = seal(&key, &data).unwrap();
            assert_eq!(blob.sealed_size(), calc_sealed_size(len, SEAL_AUTH_TEXT.len()));
            assert_eq!(unseal(&key, &blob).unwrap(), data);
        }
    }

    #[test]
    fn test_parts_return_aad() {
        let key = SealingKey::from_shared(&[3u8; 32]);
        let blob = seal_with_aad(&key, b"secret", b"context").unwrap();
        let (plain, aad) = unseal_parts(&key, &blob).unwrap();
        assert_eq!(plain, b"secret");
        assert_eq!(aad, b"context");
        assert!(unseal(&key, &blob).is_err());
    }

    #[test]
    fn test_corrupted_tag_fails() {
        let key = SealingKey::generate();
        let mut blob = seal(&key, b"payload").unwrap();
        let last = blob.body.len() - 1;
        blob.body[last] ^= 0xFF;
        assert!(matches!(unseal(&key, &blob), Err(TeeError::IntegrityError(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = seal(&SealingKey::generate(), b"payload").unwrap();
        assert!(unseal(&SealingKey::generate(), &blob).is_err());
    }

    #[test]
    fn test_container_layout() {
        let key = SealingKey::generate();
        let blob = seal(&key, b"abc").unwrap();
        let bytes = blob.to_bytes();
        assert_eq!(&bytes[0..4], &(blob.body.len() as u32).to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(SEAL_AUTH_TEXT.len() as u32).to_le_bytes());
        assert_eq!(&bytes[12..20], &[0u8; 8]);
        assert_eq!(SealedBlob::from_bytes(&bytes).unwrap(), blob);
        assert!(SealedBlob::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_tampered_lengths_fail() {
        let key = SealingKey::generate();
        let mut blob = seal(&key, b"abcdef").unwrap();
        blob.plaintext_len = 2;
        assert!(unseal(&key, &blob).is_err());
    }
}
