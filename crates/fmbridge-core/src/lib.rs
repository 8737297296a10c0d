//! Core pipeline library for the FindMy-to-Traccar bridge.
//!
//! This crate turns encrypted FindMy location reports into decrypted
//! location fixes, end to end: beacon key handling, the Apple account
//! session, report fetching, envelope decryption and plist export
//! ingestion.
//!
//! # Pipeline
//!
//! - **Beacons**: P-224 key material and derived beacon identities
//! - **Session**: authentication state machine with persisted tokens
//! - **Fetch**: batched report retrieval with per-beacon isolation
//! - **Decrypt**: ECDH + AES-GCM envelope decryption
//! - **Plists**: pre-decrypted AirTag export files
//!
//! External collaborators (the account API, the decryption backend, the
//! forwarding target) sit behind traits so the pipeline logic can be
//! exercised with the fakes in [`mock`].
//!
//! # Quick Start
//!
//! ```no_run
//! use fmbridge_core::{
//!     AnisetteClient, AppleHttpClient, Beacon, CredentialStore, FindMyDecrypter,
//!     SessionManager, fetch,
//! };
//! use fmbridge_core::client::DEFAULT_FETCH_URL;
//! use fmbridge_core::traits::ReportDecrypter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let beacon = Beacon::from_b64("<base64 private key>", Some("bike".to_string()))?;
//!
//! let anisette = AnisetteClient::new("http://localhost:6969")?;
//! let api = AppleHttpClient::new("http://localhost:8080", DEFAULT_FETCH_URL)?;
//! let store = CredentialStore::new("/var/lib/fmbridge");
//!
//! let mut session = SessionManager::new(api, anisette, store);
//! session.restore()?;
//!
//! let ids = vec![beacon.id().clone()];
//! let outcome = fetch::fetch_reports(&mut session, &ids, None).await?;
//!
//! let decrypter = FindMyDecrypter::new();
//! for report in &outcome.reports {
//!     let fix = decrypter.decrypt(&beacon, report)?;
//!     println!("{} at {}, {}", fix.beacon, fix.latitude, fix.longitude);
//! }
//! # Ok(())
//! # }
//! ```

pub mod anisette;
pub mod beacon;
pub mod client;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod mock;
pub mod plist;
pub mod retry;
pub mod session;
pub mod store;
pub mod traits;

// Core exports
pub use anisette::{AnisetteClient, AnisetteHeaders, AnisetteProvider};
pub use beacon::Beacon;
pub use client::AppleHttpClient;
pub use decrypt::FindMyDecrypter;
pub use error::{Error, Result};
pub use fetch::{FetchFailure, FetchOutcome};
pub use plist::{PlistRecord, PlistSource, ScanOutcome};
pub use retry::{RetryConfig, with_retry};
pub use session::SessionManager;
pub use store::{CredentialStore, PersistedSession};
pub use traits::{
    AccountCredentials, AppleApi, ForwardStatus, LocationSink, LoginOutcome, RawReport,
    ReportDecrypter, TwoFactorChallenge,
};
