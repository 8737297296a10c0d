//! Report decryption.
//!
//! A fetched report envelope carries a cleartext timestamp and confidence
//! byte, the finder's ephemeral P-224 public key, 10 bytes of ciphertext
//! and a 16-byte GCM tag. The shared secret is derived via ECDH between
//! the beacon's private scalar and the ephemeral key, run through the
//! X9.63 KDF (SHA-256), and split into an AES-128-GCM key and IV.
//!
//! Decryption is pure with respect to process state; a failed report is
//! skipped by the caller, never crashing the poll cycle.

use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::EcPoint;
use openssl::symm::{Cipher, decrypt_aead};

use fmbridge_types::{EncryptedReport, LocationFix, from_apple_epoch};

use crate::beacon::{Beacon, PRIVATE_KEY_LEN, p224};
use crate::error::{Error, Result};
use crate::traits::ReportDecrypter;

/// Cleartext prefix: timestamp (4) + confidence (1).
const HEADER_LEN: usize = 5;
/// Uncompressed P-224 point: tag byte + two 28-byte coordinates.
const EPHEMERAL_KEY_LEN: usize = 1 + 2 * PRIVATE_KEY_LEN;
/// Encrypted location payload.
const CIPHERTEXT_LEN: usize = 10;
/// AES-GCM authentication tag.
const TAG_LEN: usize = 16;

/// Standard envelope size.
const ENVELOPE_LEN: usize = HEADER_LEN + EPHEMERAL_KEY_LEN + CIPHERTEXT_LEN + TAG_LEN;
/// Some finders emit one extra byte between the header and the key.
const ENVELOPE_LEN_EXTENDED: usize = ENVELOPE_LEN + 1;

/// The production [`ReportDecrypter`] backed by OpenSSL.
#[derive(Debug, Default, Clone, Copy)]
pub struct FindMyDecrypter;

impl FindMyDecrypter {
    /// Create a decrypter.
    pub fn new() -> Self {
        Self
    }
}

impl ReportDecrypter for FindMyDecrypter {
    fn decrypt(&self, beacon: &Beacon, report: &EncryptedReport) -> Result<LocationFix> {
        if report.beacon != *beacon.id() {
            return Err(Error::decryption(format!(
                "report key tag {} does not match beacon {}",
                report.beacon,
                beacon.id()
            )));
        }

        let payload = &report.payload;
        let key_offset = match payload.len() {
            ENVELOPE_LEN => HEADER_LEN,
            ENVELOPE_LEN_EXTENDED => HEADER_LEN + 1,
            other => {
                return Err(Error::decryption(format!(
                    "unexpected envelope size {} (expected {} or {})",
                    other, ENVELOPE_LEN, ENVELOPE_LEN_EXTENDED
                )));
            }
        };

        let timestamp_secs =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let timestamp = from_apple_epoch(timestamp_secs)?;

        let ephemeral = &payload[key_offset..key_offset + EPHEMERAL_KEY_LEN];
        let ciphertext =
            &payload[key_offset + EPHEMERAL_KEY_LEN..key_offset + EPHEMERAL_KEY_LEN + CIPHERTEXT_LEN];
        let tag = &payload[key_offset + EPHEMERAL_KEY_LEN + CIPHERTEXT_LEN..];

        let shared_secret = ecdh_shared_secret(beacon, ephemeral)?;
        let derived = x963_kdf(&shared_secret, ephemeral);
        let (aes_key, iv) = derived.split_at(16);

        let plaintext = decrypt_aead(Cipher::aes_128_gcm(), aes_key, Some(iv), &[], ciphertext, tag)
            .map_err(|_| {
                Error::decryption("authentication failed (wrong key or corrupted report)")
            })?;

        let fix = LocationFix::from_plaintext(report.beacon.clone(), timestamp, &plaintext)?;
        Ok(fix)
    }
}

/// ECDH: x coordinate of (ephemeral public point x beacon private scalar).
fn ecdh_shared_secret(beacon: &Beacon, ephemeral: &[u8]) -> Result<[u8; PRIVATE_KEY_LEN]> {
    let group = p224()?;
    let mut ctx = BigNumContext::new().map_err(crypto_err)?;

    let ephemeral_point =
        EcPoint::from_bytes(&group, ephemeral, &mut ctx).map_err(|_| {
            Error::decryption("ephemeral key is not a valid P-224 point")
        })?;

    let mut shared = EcPoint::new(&group).map_err(crypto_err)?;
    shared
        .mul(
            &group,
            &ephemeral_point,
            beacon.private_key().private_key(),
            &ctx,
        )
        .map_err(crypto_err)?;

    let mut x = BigNum::new().map_err(crypto_err)?;
    let mut y = BigNum::new().map_err(crypto_err)?;
    shared
        .affine_coordinates(&group, &mut x, &mut y, &mut ctx)
        .map_err(crypto_err)?;

    let bytes = x.to_vec_padded(PRIVATE_KEY_LEN as i32).map_err(crypto_err)?;
    let mut secret = [0u8; PRIVATE_KEY_LEN];
    secret.copy_from_slice(&bytes);
    Ok(secret)
}

/// ANSI X9.63 KDF with SHA-256, counter 1, shared info = ephemeral key.
///
/// One block suffices: 32 bytes split into AES key and IV.
fn x963_kdf(secret: &[u8], ephemeral: &[u8]) -> [u8; 32] {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(secret);
    hasher.update(&1u32.to_be_bytes());
    hasher.update(ephemeral);
    hasher.finish()
}

fn crypto_err(err: openssl::error::ErrorStack) -> Error {
    Error::decryption(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ec::{EcKey, PointConversionForm};
    use openssl::symm::encrypt_aead;
    use time::OffsetDateTime;

    use fmbridge_types::APPLE_EPOCH_OFFSET;

    fn test_beacon() -> Beacon {
        Beacon::from_bytes(&crate::beacon::tests::TEST_KEY, None).unwrap()
    }

    fn other_beacon() -> Beacon {
        let mut key = crate::beacon::tests::TEST_KEY;
        key[3] ^= 0x55;
        Beacon::from_bytes(&key, None).unwrap()
    }

    /// Build a valid envelope the way a finder device would.
    fn encrypt_report(beacon: &Beacon, plaintext: &[u8; CIPHERTEXT_LEN], ts_secs: u32) -> Vec<u8> {
        let group = p224().unwrap();
        let mut ctx = BigNumContext::new().unwrap();

        let ephemeral = EcKey::generate(&group).unwrap();
        let ephemeral_bytes = ephemeral
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .unwrap();
        assert_eq!(ephemeral_bytes.len(), EPHEMERAL_KEY_LEN);

        let mut shared = EcPoint::new(&group).unwrap();
        shared
            .mul(
                &group,
                beacon.private_key().public_key(),
                ephemeral.private_key(),
                &ctx,
            )
            .unwrap();
        let mut x = BigNum::new().unwrap();
        let mut y = BigNum::new().unwrap();
        shared
            .affine_coordinates(&group, &mut x, &mut y, &mut ctx)
            .unwrap();
        let secret = x.to_vec_padded(PRIVATE_KEY_LEN as i32).unwrap();

        let derived = x963_kdf(&secret, &ephemeral_bytes);
        let (aes_key, iv) = derived.split_at(16);

        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_128_gcm(),
            aes_key,
            Some(iv),
            &[],
            plaintext,
            &mut tag,
        )
        .unwrap();

        let mut envelope = Vec::with_capacity(ENVELOPE_LEN);
        envelope.extend_from_slice(&ts_secs.to_be_bytes());
        envelope.push(0x01); // confidence
        envelope.extend_from_slice(&ephemeral_bytes);
        envelope.extend_from_slice(&ciphertext);
        envelope.extend_from_slice(&tag);
        envelope
    }

    fn plaintext_bytes(lat: i32, lon: i32, accuracy: u8) -> [u8; CIPHERTEXT_LEN] {
        let mut bytes = [0u8; CIPHERTEXT_LEN];
        bytes[0..4].copy_from_slice(&lat.to_be_bytes());
        bytes[4..8].copy_from_slice(&lon.to_be_bytes());
        bytes[8] = accuracy;
        bytes[9] = 0;
        bytes
    }

    fn report_for(beacon: &Beacon, payload: Vec<u8>) -> EncryptedReport {
        EncryptedReport {
            beacon: beacon.id().clone(),
            payload,
            published: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_decrypt_round_trip() {
        let beacon = test_beacon();
        let payload = encrypt_report(&beacon, &plaintext_bytes(525_200_000, 134_050_000, 40), 1000);
        let report = report_for(&beacon, payload);

        let fix = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap();

        assert!((fix.latitude - 52.52).abs() < 1e-6);
        assert!((fix.longitude - 13.405).abs() < 1e-6);
        assert_eq!(fix.accuracy, 40);
        assert_eq!(fix.timestamp.unix_timestamp(), APPLE_EPOCH_OFFSET + 1000);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let beacon = test_beacon();
        let other = other_beacon();
        let payload = encrypt_report(&other, &plaintext_bytes(0, 0, 0), 1000);

        // Report filed under the wrong beacon's id: tag check catches it.
        let report = report_for(&other, payload.clone());
        let err = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));

        // Same ciphertext filed under the right id: GCM catches it.
        let report = report_for(&beacon, payload);
        let err = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_decrypt_corrupted_ciphertext_fails() {
        let beacon = test_beacon();
        let mut payload = encrypt_report(&beacon, &plaintext_bytes(1, 2, 3), 1000);
        let last = payload.len() - 1;
        payload[last] ^= 0xFF; // flip a tag bit

        let report = report_for(&beacon, payload);
        let err = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_decrypt_truncated_envelope_fails() {
        let beacon = test_beacon();
        let report = report_for(&beacon, vec![0u8; 40]);

        let err = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_decrypt_extended_envelope() {
        let beacon = test_beacon();
        let mut payload = encrypt_report(&beacon, &plaintext_bytes(100_000_000, 200_000_000, 7), 42);
        payload.insert(HEADER_LEN, 0x00); // the extra byte some finders emit

        let report = report_for(&beacon, payload);
        let fix = FindMyDecrypter::new().decrypt(&beacon, &report).unwrap();
        assert_eq!(fix.accuracy, 7);
    }
}
