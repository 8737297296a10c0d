//! In-memory fakes for the pipeline's injected capabilities.
//!
//! These implement the traits in [`crate::traits`] with scriptable
//! failure injection, so session, fetch and scheduling logic can be
//! exercised without an Apple account, an anisette server or a Traccar
//! instance.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;

use fmbridge_types::{AccountTokens, BeaconId, EncryptedReport, LocationFix};

use crate::anisette::{AnisetteHeaders, AnisetteProvider};
use crate::beacon::Beacon;
use crate::error::{Error, Result};
use crate::traits::{
    AccountCredentials, AppleApi, ForwardStatus, LocationSink, LoginOutcome, RawReport,
    ReportDecrypter, TwoFactorChallenge,
};

/// Anisette provider returning a fixed header set.
#[derive(Debug, Default)]
pub struct MockAnisette;

impl MockAnisette {
    /// Create a provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnisetteProvider for MockAnisette {
    async fn fetch_headers(&self) -> Result<AnisetteHeaders> {
        let mut map = std::collections::HashMap::new();
        map.insert("X-Apple-I-MD".to_string(), "mock-attestation".to_string());
        Ok(AnisetteHeaders::from_map(map))
    }
}

/// Scriptable fake of the Apple account API.
pub struct MockAppleApi {
    two_factor_code: Option<String>,
    reports: Mutex<Vec<RawReport>>,
    failing_beacons: Mutex<HashSet<String>>,
    expire_once: AtomicBool,
    refresh_ok: AtomicBool,
    fetch_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockAppleApi {
    /// Create an API that logs in without a 2FA challenge.
    pub fn new() -> Self {
        Self {
            two_factor_code: None,
            reports: Mutex::new(Vec::new()),
            failing_beacons: Mutex::new(HashSet::new()),
            expire_once: AtomicBool::new(false),
            refresh_ok: AtomicBool::new(true),
            fetch_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// Require the given 2FA code to complete a login.
    pub fn with_two_factor(mut self, code: &str) -> Self {
        self.two_factor_code = Some(code.to_string());
        self
    }

    /// Queue a report to be returned by matching fetches.
    pub fn push_report(&self, id: &str, payload: Vec<u8>, published: OffsetDateTime) {
        self.reports.lock().unwrap().push(RawReport {
            id: id.to_string(),
            payload,
            published,
        });
    }

    /// Fail any fetch whose requested ids include this beacon.
    pub fn fail_beacon(&self, id: &str) {
        self.failing_beacons.lock().unwrap().insert(id.to_string());
    }

    /// Let a previously failing beacon fetch successfully again.
    pub fn heal_beacon(&self, id: &str) {
        self.failing_beacons.lock().unwrap().remove(id);
    }

    /// Make the next fetch fail as if the tokens had expired.
    pub fn expire_tokens_once(&self) {
        self.expire_once.store(true, Ordering::SeqCst);
    }

    /// Control whether token refreshes succeed.
    pub fn set_refresh_ok(&self, ok: bool) {
        self.refresh_ok.store(ok, Ordering::SeqCst);
    }

    /// Number of fetch calls made so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh calls made so far.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn tokens() -> AccountTokens {
        AccountTokens {
            dsid: "1234567".to_string(),
            search_party_token: "mock-token".to_string(),
        }
    }
}

impl Default for MockAppleApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppleApi for MockAppleApi {
    async fn login(
        &self,
        _credentials: &AccountCredentials,
        _anisette: &AnisetteHeaders,
    ) -> Result<LoginOutcome> {
        match &self.two_factor_code {
            Some(_) => Ok(LoginOutcome::TwoFactorRequired(TwoFactorChallenge {
                context: "mock-ctx".to_string(),
            })),
            None => Ok(LoginOutcome::Authenticated(Self::tokens())),
        }
    }

    async fn submit_2fa(
        &self,
        _challenge: &TwoFactorChallenge,
        code: &str,
        _anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens> {
        match &self.two_factor_code {
            Some(expected) if expected == code => Ok(Self::tokens()),
            _ => Err(Error::AuthenticationRejected("wrong code".to_string())),
        }
    }

    async fn refresh(
        &self,
        _tokens: &AccountTokens,
        _anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_ok.load(Ordering::SeqCst) {
            Ok(Self::tokens())
        } else {
            Err(Error::AuthenticationRequired)
        }
    }

    async fn fetch_reports(
        &self,
        _tokens: &AccountTokens,
        ids: &[String],
        _since: Option<OffsetDateTime>,
        _anisette: &AnisetteHeaders,
    ) -> Result<Vec<RawReport>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if self.expire_once.swap(false, Ordering::SeqCst) {
            return Err(Error::AuthenticationRequired);
        }

        let failing = self.failing_beacons.lock().unwrap();
        if ids.iter().any(|id| failing.contains(id)) {
            return Err(Error::transient("fetch_reports", "injected failure"));
        }

        let reports = self.reports.lock().unwrap();
        Ok(reports
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }
}

/// Build a 10-byte location plaintext the way a finder encrypts it.
pub fn mock_plaintext(latitude: f64, longitude: f64, accuracy: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    bytes.extend_from_slice(&((latitude * 1e7) as i32).to_be_bytes());
    bytes.extend_from_slice(&((longitude * 1e7) as i32).to_be_bytes());
    bytes.push(accuracy);
    bytes.push(0);
    bytes
}

/// Payload prefix that makes [`MockDecrypter`] fail.
pub const POISON_PAYLOAD: &[u8] = b"FAIL";

/// Decrypter fake that treats report payloads as plaintext fixes.
///
/// A payload starting with [`POISON_PAYLOAD`] fails as an undecryptable
/// report would.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockDecrypter;

impl MockDecrypter {
    /// Create a decrypter.
    pub fn new() -> Self {
        Self
    }
}

impl ReportDecrypter for MockDecrypter {
    fn decrypt(&self, _beacon: &Beacon, report: &EncryptedReport) -> Result<LocationFix> {
        if report.payload.starts_with(POISON_PAYLOAD) {
            return Err(Error::decryption("injected failure"));
        }
        let fix =
            LocationFix::from_plaintext(report.beacon.clone(), report.published, &report.payload)?;
        Ok(fix)
    }
}

/// Sink fake that records every forwarded fix.
#[derive(Debug, Default)]
pub struct MockSink {
    sent: Mutex<Vec<LocationFix>>,
    failing_beacons: Mutex<HashSet<BeaconId>>,
}

impl MockSink {
    /// Create a sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every forward for this beacon.
    pub fn fail_beacon(&self, beacon: &BeaconId) {
        self.failing_beacons.lock().unwrap().insert(beacon.clone());
    }

    /// All fixes forwarded so far, in order.
    pub fn sent(&self) -> Vec<LocationFix> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocationSink for MockSink {
    async fn forward(&self, fix: &LocationFix) -> Result<ForwardStatus> {
        if self.failing_beacons.lock().unwrap().contains(&fix.beacon) {
            return Err(Error::transient("forward", "injected failure"));
        }
        self.sent.lock().unwrap().push(fix.clone());
        Ok(ForwardStatus::Sent)
    }
}
