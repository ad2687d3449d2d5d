//! Key Exchange: attested ECDH and the secure channel built on it
//!
//! 1. Client sends its ECDH public key
//! 2. The compute node's enclave answers with its own key, the secure
//!    monitor's signature over it, its report and the agreed secret sealed
//!    to the platform
//! 3. Client verifies the report against the image it expects and derives
//!    the same secret
//!
//! The session keeps only the sealed copy on the wire; forwarded calls hand
//! it back so the node can recover the key without storing client state.

use super::attestation::{verify_report, Report};
use super::crypto::{self, KeyPair, RawPublicKey, RawSignature};
use super::enclave::{EnclaveHost, TeeError};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SESSION_KEY_LABEL: &[u8] = b"dtee-session-key-v1";
const CALL_AAD: &[u8] = b"dtee-call";

/// Handshake initiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInit {
    pub pub_key: RawPublicKey,
}

/// Handshake response message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub pub_key: RawPublicKey,
    pub signature: RawSignature,
    pub report: Report,
    pub sealed_shared_key: Vec<u8>,
}

/// Symmetric key protecting forwarded call buffers
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_shared(shared: &[u8; 32]) -> Self {
        Self(crypto::derive_key(shared, SESSION_KEY_LABEL))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TeeError> {
        crypto::encrypt(&self.0, plaintext, CALL_AAD)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, TeeError> {
        crypto::decrypt(&self.0, ciphertext, CALL_AAD)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Outcome of a completed key exchange
#[derive(Debug, Clone)]
pub struct Session {
    pub id: uuid::Uuid,
    pub key: SessionKey,
    /// Agreed secret sealed by the node's platform
    pub sealed_shared_key: Vec<u8>,
    pub peer_report: Report,
    pub established_at: DateTime<Utc>,
}

/// Server side: run key agreement in a fresh enclave created from `image`
pub async fn respond(host: &EnclaveHost, image: &str, init: &HandshakeInit) -> Result<HandshakeResponse, TeeError> {
    let (attestation, report) = host.attest_key(image, &init.pub_key).await?;
    Ok(HandshakeResponse {
        pub_key: attestation.pub_key,
        signature: attestation.signature,
        report,
        sealed_shared_key: attestation.sealed_shared_key,
    })
}

/// Client side of the handshake
pub struct KeyExchange {
    pair: KeyPair,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    pub fn new() -> Self {
        Self {
            pair: crypto::make_key_pair(),
        }
    }

    pub fn init(&self) -> HandshakeInit {
        HandshakeInit {
            pub_key: *self.pair.public_key(),
        }
    }

    /// Verify the node's report against `enclave_path` and derive the session
    pub fn complete(self, response: &HandshakeResponse, enclave_path: &Path) -> Result<Session, TeeError> {
        verify_report(&response.report, &response.pub_key, &response.signature, enclave_path)?;
        let mut shared = crypto::make_shared_key(self.pair.private_key(), &response.pub_key)?;
        let key = SessionKey::from_shared(&shared);
        shared.zeroize();

        let session = Session {
            id: uuid::Uuid::new_v4(),
            key,
            sealed_shared_key: response.sealed_shared_key.clone(),
            peer_report: response.report,
            established_at: Utc::now(),
        };
        info!(
            "Session {} established with enclave {}",
            &session.id.to_string()[..8],
            &hex::encode(response.report.enclave.hash)[..16]
        );
        Ok(session)
    }
}

/// State of a secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Established,
    Closed,
}

/// Which end of the handshake a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Responder,
}

impl ChannelRole {
    fn tag(self) -> u8 {
        match self {
            ChannelRole::Initiator => 0,
            ChannelRole::Responder => 1,
        }
    }

    fn peer(self) -> Self {
        match self {
            ChannelRole::Initiator => ChannelRole::Responder,
            ChannelRole::Responder => ChannelRole::Initiator,
        }
    }
}

/// An encrypted message on the secure channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMessage {
    pub channel_id: String,
    pub sequence: u64,
    /// `nonce || ciphertext || tag`, hex encoded
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered, replay-protected messages under a session key
pub struct SecureChannel {
    pub channel_id: String,
    pub state: ChannelState,
    role: ChannelRole,
    key: Option<SessionKey>,
    send_counter: u64,
    recv_counter: u64,
    pub established_at: DateTime<Utc>,
}

impl SecureChannel {
    /// Both ends build their channel from the same session key and id,
    /// each with its own role
    pub fn new(channel_id: &str, key: SessionKey, role: ChannelRole) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            state: ChannelState::Established,
            role,
            key: Some(key),
            send_counter: 0,
            recv_counter: 0,
            established_at: Utc::now(),
        }
    }

    /// The client's end of a completed handshake
    pub fn from_session(session: &Session) -> Self {
        Self::new(&session.id.to_string(), session.key.clone(), ChannelRole::Initiator)
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    fn aad(&self, sender: ChannelRole, sequence: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.channel_id.len() + 9);
        aad.extend_from_slice(self.channel_id.as_bytes());
        aad.push(sender.tag());
        aad.extend_from_slice(&sequence.to_le_bytes());
        aad
    }

    fn key(&self) -> Result<&SessionKey, TeeError> {
        self.key
            .as_ref()
            .ok_or_else(|| TeeError::EnclaveError("Channel not established".into()))
    }

    /// Encrypt a message for the secure channel
    pub fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<SecureMessage, TeeError> {
        let seq = self.send_counter;
        let sealed = crypto::encrypt(&self.key()?.0, plaintext, &self.aad(self.role, seq))?;
        self.send_counter += 1;

        Ok(SecureMessage {
            channel_id: self.channel_id.clone(),
            sequence: seq,
            ciphertext: hex::encode(sealed),
            timestamp: Utc::now(),
        })
    }

    /// Decrypt a message from the secure channel
    pub fn decrypt_message(&mut self, msg: &SecureMessage) -> Result<Vec<u8>, TeeError> {
        if msg.channel_id != self.channel_id {
            return Err(TeeError::IntegrityError("Message for another channel".into()));
        }
        // Check for replay
        if msg.sequence < self.recv_counter {
            return Err(TeeError::IntegrityError("Replay detected".into()));
        }

        let sealed = hex::decode(&msg.ciphertext)
            .map_err(|e| TeeError::SealingError(format!("Hex decode: {}", e)))?;
        let plaintext = crypto::decrypt(&self.key()?.0, &sealed, &self.aad(self.role.peer(), msg.sequence))?;

        self.recv_counter = msg.sequence + 1;
        Ok(plaintext)
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.key = None;
        self.state = ChannelState::Closed;
        info!("Secure channel {} closed", &self.channel_id[..8.min(self.channel_id.len())]);
    }

    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established && self.key.is_some()
    }
}
