//! Platform-agnostic types for the FindMy to Traccar bridge.
//!
//! This crate provides the shared data model used by the pipeline crates:
//! beacon identifiers, encrypted report envelopes, decrypted location
//! fixes and the session state machine's states.
//!
//! Parsing of decrypted report payloads lives here so it can be tested
//! without any network or crypto dependencies.

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    AccountTokens, BeaconId, EncryptedReport, LocationFix, SessionState, from_apple_epoch,
    APPLE_EPOCH_OFFSET, PLAINTEXT_LEN,
};
