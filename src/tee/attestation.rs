//! Attestation reports and their verification
//!
//! A report binds a running enclave to a signed image:
//! 1. The secure monitor signs the key the enclave exchanges with peers
//! 2. The secure monitor signs the enclave's runtime hash
//! 3. The runtime hash must equal `H(image measurement || nonce)`
//!
//! Verification short-circuits; the first failing step is the rejection reason.

use super::crypto::{
    self, Hash, PlatformSigner, RawPublicKey, RawSignature, HASH_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
use super::enclave::TeeError;
use super::image;
use log::warn;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Serialized size of a [`Report`]
pub const REPORT_SIZE: usize =
    HASH_SIZE + SIGNATURE_SIZE + PUBLIC_KEY_SIZE + HASH_SIZE + SIGNATURE_SIZE + 8 + PUBLIC_KEY_SIZE;

/// Secure monitor part of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmReport {
    pub hash: Hash,
    pub signature: RawSignature,
    /// Key that signs enclave hashes and exchanged keys
    pub pub_key: RawPublicKey,
}

/// Enclave part of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclaveReport {
    /// `H(measurement || nonce)`
    pub hash: Hash,
    pub signature: RawSignature,
    pub nonce: u64,
}

/// Attestation report produced at enclave creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub sm: SmReport,
    pub enclave: EnclaveReport,
    pub device_pub_key: RawPublicKey,
}

/// Why a report was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestationFailure {
    #[error("exchanged public key is not signed by the secure monitor")]
    PubKeySignature,

    #[error("enclave hash is not signed by the secure monitor")]
    MeasurementSignature,

    #[error("enclave hash does not match the image measurement")]
    MeasurementMismatch,

    #[error("cannot read image measurement: {0}")]
    Image(String),

    #[error("malformed report: expected 328 bytes, got {0}")]
    Malformed(usize),
}

/// Runtime hash of an enclave created from an image with this measurement
pub fn update_enclave_hash(measurement: &Hash, nonce: u64) -> Hash {
    let mut h = Sha256::new();
    h.update(measurement);
    h.update(nonce.to_le_bytes());
    h.finalize().into()
}

impl Report {
    /// Report for a freshly created enclave
    pub fn issue(sm: &PlatformSigner, device: &PlatformSigner, measurement: &Hash, nonce: u64) -> Self {
        let sm_pub_key = sm.public_key();
        let sm_hash = crypto::hash(&sm_pub_key);
        let enclave_hash = update_enclave_hash(measurement, nonce);
        Self {
            sm: SmReport {
                hash: sm_hash,
                signature: device.sign(&sm_hash),
                pub_key: sm_pub_key,
            },
            enclave: EnclaveReport {
                hash: enclave_hash,
                signature: sm.sign(&enclave_hash),
                nonce,
            },
            device_pub_key: device.public_key(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPORT_SIZE);
        out.extend_from_slice(&self.sm.hash);
        out.extend_from_slice(&self.sm.signature);
        out.extend_from_slice(&self.sm.pub_key);
        out.extend_from_slice(&self.enclave.hash);
        out.extend_from_slice(&self.enclave.signature);
        out.extend_from_slice(&self.enclave.nonce.to_le_bytes());
        out.extend_from_slice(&self.device_pub_key);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AttestationFailure> {
        if data.len() != REPORT_SIZE {
            return Err(AttestationFailure::Malformed(data.len()));
        }
        let mut pos = 0;
        let mut take = move |len: usize| {
            let part = &data[pos..pos + len];
            pos += len;
            part
        };
        fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            out
        }

        let sm = SmReport {
            hash: arr(take(HASH_SIZE)),
            signature: arr(take(SIGNATURE_SIZE)),
            pub_key: arr(take(PUBLIC_KEY_SIZE)),
        };
        let enclave = EnclaveReport {
            hash: arr(take(HASH_SIZE)),
            signature: arr(take(SIGNATURE_SIZE)),
            nonce: u64::from_le_bytes(arr(take(8))),
        };
        let device_pub_key = arr(take(PUBLIC_KEY_SIZE));
        Ok(Self {
            sm,
            enclave,
            device_pub_key,
        })
    }
}

/// Check a report against the key it vouches for and the image on disk
pub fn verify_report(
    report: &Report,
    pub_key: &RawPublicKey,
    pub_key_signature: &RawSignature,
    enclave_path: &Path,
) -> Result<(), TeeError> {
    if !crypto::verify(&report.sm.pub_key, pub_key, pub_key_signature) {
        return Err(AttestationFailure::PubKeySignature.into());
    }

    if !crypto::verify(&report.sm.pub_key, &report.enclave.hash, &report.enclave.signature) {
        return Err(AttestationFailure::MeasurementSignature.into());
    }

    let measurement = image::read_measurement(enclave_path)
        .map_err(|e| AttestationFailure::Image(e.to_string()))?;
    if update_enclave_hash(&measurement, report.enclave.nonce) != report.enclave.hash {
        return Err(AttestationFailure::MeasurementMismatch.into());
    }

    Ok(())
}

/// [`verify_report`] as a yes/no answer, logging the rejection
pub fn is_report_valid(
    report: &Report,
    pub_key: &RawPublicKey,
    pub_key_signature: &RawSignature,
    enclave_path: &Path,
) -> bool {
    match verify_report(report, pub_key, pub_key_signature, enclave_path) {
        Ok(()) => true,
        Err(e) => {
            warn!("Rejected report for {}: {}", enclave_path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::crypto::make_key_pair;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        report: Report,
        pub_key: RawPublicKey,
        signature: RawSignature,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let measurement = crypto::hash(b"enclave code");
        let path = image::write_image(dir.path(), "echo", &measurement).unwrap();

        let sm = PlatformSigner::generate();
        let device = PlatformSigner::generate();
        let report = Report::issue(&sm, &device, &measurement, 0xDEAD_BEEF);
        let pub_key = *make_key_pair().public_key();
        let signature = sm.sign(&pub_key);

        Fixture {
            _dir: dir,
            path,
            report,
            pub_key,
            signature,
        }
    }

    fn rejection(f: &Fixture, report: &Report, signature: &RawSignature) -> Option<AttestationFailure> {
        match verify_report(report, &f.pub_key, signature, &f.path) {
            Ok(()) => None,
            Err(TeeError::Attestation(reason)) => Some(reason),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_valid_report_accepted() {
        let f = fixture();
        assert!(is_report_valid(&f.report, &f.pub_key, &f.signature, &f.path));
    }

    #[test]
    fn test_flipped_pub_key_signature() {
        let f = fixture();
        let mut sig = f.signature;
        sig[0] ^= 0x01;
        assert_eq!(
            rejection(&f, &f.report, &sig),
            Some(AttestationFailure::PubKeySignature)
        );
    }

    #[test]
    fn test_flipped_enclave_signature() {
        let f = fixture();
        let mut report = f.report;
        report.enclave.signature[63] ^= 0x80;
        assert_eq!(
            rejection(&f, &report, &f.signature),
            Some(AttestationFailure::MeasurementSignature)
        );
    }

    #[test]
    fn test_flipped_enclave_hash() {
        let f = fixture();
        let mut report = f.report;
        report.enclave.hash[5] ^= 0x04;
        // The signature no longer covers the hash
        assert_eq!(
            rejection(&f, &report, &f.signature),
            Some(AttestationFailure::MeasurementSignature)
        );
    }

    #[test]
    fn test_wrong_image() {
        let f = fixture();
        let other = image::write_image(f._dir.path(), "other", &[9u8; 32]).unwrap();
        assert!(matches!(
            verify_report(&f.report, &f.pub_key, &f.signature, &other),
            Err(TeeError::Attestation(AttestationFailure::MeasurementMismatch))
        ));
    }

    #[test]
    fn test_missing_image() {
        let f = fixture();
        let missing = f._dir.path().join("absent.signed.so");
        assert!(matches!(
            verify_report(&f.report, &f.pub_key, &f.signature, &missing),
            Err(TeeError::Attestation(AttestationFailure::Image(_)))
        ));
    }

    #[test]
    fn test_report_layout() {
        let f = fixture();
        let bytes = f.report.to_bytes();
        assert_eq!(bytes.len(), 328);
        assert_eq!(&bytes[256..264], &0xDEAD_BEEFu64.to_le_bytes());
        assert_eq!(Report::from_bytes(&bytes).unwrap(), f.report);
        assert_eq!(
            Report::from_bytes(&bytes[..300]),
            Err(AttestationFailure::Malformed(300))
        );
    }
}
