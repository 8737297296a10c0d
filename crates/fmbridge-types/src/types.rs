//! Core data types for the FindMy to Traccar bridge.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Seconds between the Unix epoch and Apple's reference date (2001-01-01 UTC).
///
/// Report envelope timestamps count seconds from the Apple epoch.
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Convert a seconds-since-Apple-epoch value into an [`OffsetDateTime`].
pub fn from_apple_epoch(secs: u32) -> ParseResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(APPLE_EPOCH_OFFSET + i64::from(secs))
        .map_err(|_| ParseError::InvalidValue(format!("timestamp out of range: {}", secs)))
}

/// Identifier of a tracked beacon.
///
/// For OpenHaystack beacons this is the base64-encoded SHA-256 of the
/// advertisement key (the id Apple's fetch endpoint keys reports by).
/// For plist-sourced devices it is the export's device label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconId {
    id: String,
    device_id: u32,
}

impl BeaconId {
    /// Build an id from a hashed advertisement key.
    pub fn from_hashed_key(hash: &[u8]) -> Self {
        Self {
            id: BASE64.encode(hash),
            device_id: fold_device_id(hash),
        }
    }

    /// Build an id from a plist export's device label.
    pub fn from_label(label: &str) -> Self {
        Self {
            id: label.to_string(),
            device_id: fold_device_id(label.as_bytes()),
        }
    }

    /// The identifier string sent to Apple's fetch endpoint (or the label).
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Stable numeric device id in `0..1_000_000`, used as the Traccar
    /// unique id for this beacon.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl PartialEq for BeaconId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BeaconId {}

impl std::hash::Hash for BeaconId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Interpret the bytes as a big-endian integer reduced mod 1,000,000.
///
/// Matches the id scheme the Traccar devices were originally registered
/// under, so existing device entries keep working.
fn fold_device_id(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc * 256 + u32::from(*b)) % 1_000_000)
}

/// An encrypted location report fetched from Apple's network.
///
/// Transient: produced by the report fetcher, consumed immediately by the
/// decryptor, never persisted.
#[derive(Debug, Clone)]
pub struct EncryptedReport {
    /// The beacon this report belongs to.
    pub beacon: BeaconId,
    /// The raw report envelope (timestamp, ephemeral key, ciphertext, tag).
    pub payload: Vec<u8>,
    /// When Apple's network published the report.
    pub published: OffsetDateTime,
}

/// A decrypted location fix ready to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// The beacon this fix belongs to.
    pub beacon: BeaconId,
    /// When the finder device observed the beacon.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Confidence radius in meters.
    pub accuracy: u8,
    /// Raw status byte reported by the finder.
    pub status: u8,
}

/// Size of the decrypted report payload in bytes.
pub const PLAINTEXT_LEN: usize = 10;

impl LocationFix {
    /// Parse a decrypted 10-byte report payload.
    ///
    /// Layout: latitude (i32 BE, degrees x 1e7), longitude (i32 BE,
    /// degrees x 1e7), accuracy (u8, meters), status (u8).
    pub fn from_plaintext(
        beacon: BeaconId,
        timestamp: OffsetDateTime,
        bytes: &[u8],
    ) -> ParseResult<Self> {
        if bytes.len() < PLAINTEXT_LEN {
            return Err(ParseError::InsufficientBytes {
                expected: PLAINTEXT_LEN,
                actual: bytes.len(),
            });
        }

        let lat_raw = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let lon_raw = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let latitude = f64::from(lat_raw) / 10_000_000.0;
        let longitude = f64::from(lon_raw) / 10_000_000.0;

        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ParseError::InvalidValue(format!(
                "latitude out of range: {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ParseError::InvalidValue(format!(
                "longitude out of range: {}",
                longitude
            )));
        }

        Ok(Self {
            beacon,
            timestamp,
            latitude,
            longitude,
            accuracy: bytes[8],
            status: bytes[9],
        })
    }
}

/// Authentication state of the Apple account session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No usable session material; polling is gated off.
    Unauthenticated,
    /// Login succeeded but a 2FA code is outstanding.
    AwaitingTwoFactor,
    /// Session material is valid; polling may proceed.
    Authenticated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::AwaitingTwoFactor => write!(f, "awaiting_2fa"),
            Self::Authenticated => write!(f, "authenticated"),
        }
    }
}

/// Opaque session material returned by a successful login.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountTokens {
    /// Apple directory services id of the account.
    pub dsid: String,
    /// Bearer token for the FindMy report gateway.
    pub search_party_token: String,
}

impl fmt::Debug for AccountTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token must not end up in logs.
        f.debug_struct("AccountTokens")
            .field("dsid", &self.dsid)
            .field("search_party_token", &"<redacted>")
            .finish()
    }
}
