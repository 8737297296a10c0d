//! Polling bridge forwarding FindMy location reports into Traccar.
//!
//! This crate wires the pipeline in `fmbridge-core` into a long-running
//! service that:
//! - Polls Apple's network for encrypted beacon reports on a schedule
//! - Decrypts reports with the configured beacon keys
//! - Ingests pre-decrypted AirTag plist exports from a watched directory
//! - Forwards fixes to a Traccar instance, suppressing duplicates
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/fmbridge/config.toml`:
//!
//! ```toml
//! [apple]
//! auth_url = "http://127.0.0.1:8090"
//!
//! [anisette]
//! url = "http://127.0.0.1:6969"
//!
//! [traccar]
//! url = "http://127.0.0.1:5055"
//!
//! [poll]
//! interval_secs = 3600
//!
//! [[beacons]]
//! private_key = "<base64 P-224 private key>"
//! label = "bike"
//! ```
//!
//! Every setting can also come from `FMBRIDGE_*` environment variables
//! (see [`Config::apply_env`]), which win over the file.
//!
//! # Commands
//!
//! - `fmbridge run` - poll and forward in the foreground (default)
//! - `fmbridge init` - authenticate the Apple account interactively

pub mod config;
pub mod forwarder;
pub mod init;
pub mod scheduler;

pub use config::Config;
pub use forwarder::TraccarForwarder;
pub use scheduler::{CycleSummary, Scheduler};

use fmbridge_core::plist::PlistSource;

/// Build the plist source configured for export ingestion, if any.
pub fn plist_source(config: &Config) -> Option<PlistSource> {
    config.plists.dir.as_ref().map(PlistSource::new)
}
