//! Beacon key material.
//!
//! An OpenHaystack beacon is configured as a base64-encoded P-224 private
//! scalar. Everything else is derived from it: the advertisement key (the
//! public point's x coordinate), its SHA-256 hash (the id Apple's fetch
//! endpoint keys reports by) and the numeric Traccar device id.

use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::nid::Nid;
use openssl::pkey::Private;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use fmbridge_types::BeaconId;

use crate::error::{Error, Result};

/// Length of a P-224 private scalar in bytes.
pub const PRIVATE_KEY_LEN: usize = 28;

/// A tracked beacon and its key material.
///
/// Immutable once loaded from configuration; the set of beacons is fixed
/// for a process lifetime.
pub struct Beacon {
    id: BeaconId,
    label: Option<String>,
    key: EcKey<Private>,
    adv_key: [u8; PRIVATE_KEY_LEN],
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private scalar stays out of Debug output.
        f.debug_struct("Beacon")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl Beacon {
    /// Load a beacon from its base64-encoded private key.
    pub fn from_b64(encoded: &str, label: Option<String>) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Key(format!("not valid base64: {}", e)))?;
        if bytes.len() != PRIVATE_KEY_LEN {
            return Err(Error::Key(format!(
                "expected {} key bytes, got {}",
                PRIVATE_KEY_LEN,
                bytes.len()
            )));
        }
        Self::from_bytes(&bytes, label)
    }

    /// Load a beacon from its raw private scalar.
    pub fn from_bytes(bytes: &[u8], label: Option<String>) -> Result<Self> {
        let group = p224()?;
        let mut ctx = BigNumContext::new().map_err(key_err)?;

        let scalar = BigNum::from_slice(bytes).map_err(key_err)?;
        if scalar.num_bits() == 0 {
            return Err(Error::Key("private scalar is zero".to_string()));
        }

        let mut public = EcPoint::new(&group).map_err(key_err)?;
        public.mul_generator(&group, &scalar, &ctx).map_err(key_err)?;

        let mut x = BigNum::new().map_err(key_err)?;
        let mut y = BigNum::new().map_err(key_err)?;
        public
            .affine_coordinates(&group, &mut x, &mut y, &mut ctx)
            .map_err(key_err)?;

        let adv_vec = x.to_vec_padded(PRIVATE_KEY_LEN as i32).map_err(key_err)?;
        let mut adv_key = [0u8; PRIVATE_KEY_LEN];
        adv_key.copy_from_slice(&adv_vec);

        let key = EcKey::from_private_components(&group, &scalar, &public).map_err(key_err)?;
        key.check_key()
            .map_err(|_| Error::Key("private scalar is not a valid P-224 key".to_string()))?;

        let hashed = openssl::sha::sha256(&adv_key);
        Ok(Self {
            id: BeaconId::from_hashed_key(&hashed),
            label,
            key,
            adv_key,
        })
    }

    /// The beacon's identifier (base64 SHA-256 of the advertisement key).
    pub fn id(&self) -> &BeaconId {
        &self.id
    }

    /// Optional human label from configuration.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Label if configured, otherwise the identifier string.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.id.as_str())
    }

    /// The advertisement key (public x coordinate).
    pub fn advertisement_key(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.adv_key
    }

    /// The private EC key, for the decryptor's ECDH step.
    pub(crate) fn private_key(&self) -> &EcKey<Private> {
        &self.key
    }
}

pub(crate) fn p224() -> Result<EcGroup> {
    EcGroup::from_curve_name(Nid::SECP224R1).map_err(key_err)
}

fn key_err(err: openssl::error::ErrorStack) -> Error {
    Error::Key(err.to_string())
}
