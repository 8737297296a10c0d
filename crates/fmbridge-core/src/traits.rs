//! Trait abstractions for the bridge's external collaborators.
//!
//! The Apple account API, the report decryption library and the forwarding
//! target are injected capabilities behind narrow interfaces, so the
//! pipeline's retry and failure-isolation logic can be tested with fakes
//! (see [`crate::mock`]).

use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;

use fmbridge_types::{AccountTokens, LocationFix};

use crate::anisette::AnisetteHeaders;
use crate::beacon::Beacon;
use crate::error::Result;

/// Apple account credentials entered by the operator during init.
#[derive(Clone)]
pub struct AccountCredentials {
    /// The Apple ID (email).
    pub apple_id: String,
    /// The account password.
    pub password: String,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("apple_id", &self.apple_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque context for an outstanding 2FA challenge.
///
/// Only the account API interprets the contents; the session manager just
/// carries it between `begin_login` and `submit_2fa`.
#[derive(Debug, Clone)]
pub struct TwoFactorChallenge {
    /// Server-issued continuation token for the challenge.
    pub context: String,
}

/// Outcome of a login attempt.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Login completed without a 2FA challenge.
    Authenticated(AccountTokens),
    /// A 2FA code must be submitted to finish the login.
    TwoFactorRequired(TwoFactorChallenge),
}

/// One report entry as returned by the fetch endpoint, before it is
/// matched back to a configured beacon.
#[derive(Debug, Clone)]
pub struct RawReport {
    /// The hashed-advertisement-key id the report was filed under.
    pub id: String,
    /// The raw report envelope.
    pub payload: Vec<u8>,
    /// When Apple's network published the report.
    pub published: OffsetDateTime,
}

/// The Apple account and report-fetch API.
///
/// A version-pinned external protocol; implementations translate these
/// operations onto the wire without the pipeline caring how.
#[async_trait]
pub trait AppleApi: Send + Sync {
    /// Start a login with account credentials.
    async fn login(
        &self,
        credentials: &AccountCredentials,
        anisette: &AnisetteHeaders,
    ) -> Result<LoginOutcome>;

    /// Complete an outstanding 2FA challenge.
    ///
    /// Returns [`crate::Error::AuthenticationRejected`] when the code is
    /// wrong; the challenge stays valid for another attempt.
    async fn submit_2fa(
        &self,
        challenge: &TwoFactorChallenge,
        code: &str,
        anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens>;

    /// Silently exchange expiring tokens for fresh ones.
    async fn refresh(
        &self,
        tokens: &AccountTokens,
        anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens>;

    /// Fetch the latest encrypted reports for a set of beacon ids in one
    /// batched call.
    async fn fetch_reports(
        &self,
        tokens: &AccountTokens,
        ids: &[String],
        since: Option<OffsetDateTime>,
        anisette: &AnisetteHeaders,
    ) -> Result<Vec<RawReport>>;
}

/// The report decryption capability.
///
/// Pure with respect to process state: the result depends only on the
/// beacon's key and the report bytes.
pub trait ReportDecrypter: Send + Sync {
    /// Decrypt one report with the beacon's private key.
    fn decrypt(
        &self,
        beacon: &Beacon,
        report: &fmbridge_types::EncryptedReport,
    ) -> Result<LocationFix>;
}

/// Whether a fix was submitted or suppressed by the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    /// The fix was submitted to the target platform.
    Sent,
    /// The fix was not newer than the last forwarded one; no request issued.
    Skipped,
}

/// A destination for decrypted location fixes.
#[async_trait]
pub trait LocationSink: Send + Sync {
    /// Submit one fix to the target platform.
    async fn forward(&self, fix: &LocationFix) -> Result<ForwardStatus>;
}
