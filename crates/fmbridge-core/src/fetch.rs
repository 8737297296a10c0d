//! Batched report fetching with per-beacon failure isolation.
//!
//! The fetch endpoint accepts many beacon ids in one call, so the happy
//! path is a single batched request. When that batch fails transiently the
//! cycle falls back to one request per beacon, so a single problematic id
//! cannot starve the others. An authentication failure aborts the whole
//! fetch immediately; retrying per beacon would just repeat it.

use time::OffsetDateTime;
use tracing::{debug, warn};

use fmbridge_types::{BeaconId, EncryptedReport};

use crate::anisette::AnisetteProvider;
use crate::error::{Error, Result};
use crate::session::SessionManager;
use crate::traits::{AppleApi, RawReport};

/// A beacon whose reports could not be fetched this cycle.
#[derive(Debug)]
pub struct FetchFailure {
    /// The affected beacon.
    pub beacon: BeaconId,
    /// Why its fetch failed.
    pub error: Error,
}

/// The result of one fetch cycle over all configured beacons.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Reports matched back to their beacons, in gateway order.
    pub reports: Vec<EncryptedReport>,
    /// Beacons that produced no reports because their fetch failed.
    pub failures: Vec<FetchFailure>,
}

/// Fetch encrypted reports for the given beacons.
///
/// Tries one batched call first; on a transient batch failure each beacon
/// is retried individually so the failure is isolated to the beacons it
/// actually affects. [`Error::AuthenticationRequired`] propagates
/// unchanged so the session manager's refresh-or-reset handling applies.
pub async fn fetch_reports<A: AppleApi, P: AnisetteProvider>(
    session: &mut SessionManager<A, P>,
    beacons: &[BeaconId],
    since: Option<OffsetDateTime>,
) -> Result<FetchOutcome> {
    if beacons.is_empty() {
        return Ok(FetchOutcome::default());
    }

    let ids: Vec<String> = beacons.iter().map(|b| b.as_str().to_string()).collect();
    match session.fetch_reports(&ids, since).await {
        Ok(raw) => Ok(FetchOutcome {
            reports: match_reports(raw, beacons),
            failures: Vec::new(),
        }),
        Err(Error::AuthenticationRequired) => Err(Error::AuthenticationRequired),
        Err(batch_err) if beacons.len() > 1 => {
            warn!(
                "batched fetch for {} beacons failed ({}); retrying individually",
                beacons.len(),
                batch_err
            );
            let mut outcome = FetchOutcome::default();
            for beacon in beacons {
                let id = vec![beacon.as_str().to_string()];
                match session.fetch_reports(&id, since).await {
                    Ok(raw) => outcome
                        .reports
                        .extend(match_reports(raw, std::slice::from_ref(beacon))),
                    Err(Error::AuthenticationRequired) => {
                        return Err(Error::AuthenticationRequired);
                    }
                    Err(error) => outcome.failures.push(FetchFailure {
                        beacon: beacon.clone(),
                        error,
                    }),
                }
            }
            Ok(outcome)
        }
        Err(err) => Ok(FetchOutcome {
            reports: Vec::new(),
            failures: vec![FetchFailure {
                beacon: beacons[0].clone(),
                error: err,
            }],
        }),
    }
}

/// Match raw gateway entries back to the beacons we asked about.
///
/// Entries filed under an id we did not request are dropped; the gateway
/// is authoritative about ids, but a mismatch here means a bug or a stale
/// response, not report material we can decrypt.
fn match_reports(raw: Vec<RawReport>, beacons: &[BeaconId]) -> Vec<EncryptedReport> {
    let mut reports = Vec::with_capacity(raw.len());
    for entry in raw {
        match beacons.iter().find(|b| b.as_str() == entry.id) {
            Some(beacon) => reports.push(EncryptedReport {
                beacon: beacon.clone(),
                payload: entry.payload,
                published: entry.published,
            }),
            None => debug!("dropping report for unrequested id {}", entry.id),
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAnisette, MockAppleApi};
    use crate::store::CredentialStore;
    use crate::traits::AccountCredentials;

    async fn ready_session(
        api: MockAppleApi,
    ) -> (SessionManager<MockAppleApi, MockAnisette>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let mut session = SessionManager::new(api, MockAnisette::new(), store);
        let creds = AccountCredentials {
            apple_id: "u".into(),
            password: "p".into(),
        };
        session.begin_login(&creds).await.unwrap();
        (session, dir)
    }

    fn beacon_ids(n: usize) -> Vec<BeaconId> {
        (0..n)
            .map(|i| BeaconId::from_label(&format!("beacon-{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_beacon_set_is_a_no_op() {
        let api = MockAppleApi::new();
        let (mut session, _dir) = ready_session(api).await;

        let outcome = fetch_reports(&mut session, &[], None).await.unwrap();
        assert!(outcome.reports.is_empty());
        assert!(outcome.failures.is_empty());
        assert_eq!(session.api_ref().fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_batched_fetch_matches_reports() {
        let beacons = beacon_ids(2);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].as_str(), vec![1, 2, 3], OffsetDateTime::UNIX_EPOCH);
        api.push_report(beacons[1].as_str(), vec![4, 5, 6], OffsetDateTime::UNIX_EPOCH);
        let (mut session, _dir) = ready_session(api).await;

        let outcome = fetch_reports(&mut session, &beacons, None).await.unwrap();
        assert_eq!(outcome.reports.len(), 2);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.reports[0].beacon, beacons[0]);
        assert_eq!(outcome.reports[1].payload, vec![4, 5, 6]);
        // One batched call serves every beacon.
        assert_eq!(session.api_ref().fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_unrequested_ids_are_dropped() {
        let beacons = beacon_ids(1);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].as_str(), vec![1], OffsetDateTime::UNIX_EPOCH);
        api.push_report("someone-else", vec![2], OffsetDateTime::UNIX_EPOCH);
        let (mut session, _dir) = ready_session(api).await;

        let outcome = fetch_reports(&mut session, &beacons, None).await.unwrap();
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].payload, vec![1]);
    }

    #[tokio::test]
    async fn test_batch_failure_falls_back_to_per_beacon() {
        let beacons = beacon_ids(3);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].as_str(), vec![1], OffsetDateTime::UNIX_EPOCH);
        api.push_report(beacons[2].as_str(), vec![3], OffsetDateTime::UNIX_EPOCH);
        // Any request that includes this beacon fails transiently.
        api.fail_beacon(beacons[1].as_str());
        let (mut session, _dir) = ready_session(api).await;

        let outcome = fetch_reports(&mut session, &beacons, None).await.unwrap();

        // The two healthy beacons still produced their reports.
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].beacon, beacons[1]);
        assert!(outcome.failures[0].error.is_retryable());
        // One failed batch plus three individual calls.
        assert_eq!(session.api_ref().fetch_calls(), 4);
    }

    #[tokio::test]
    async fn test_single_beacon_failure_has_no_fallback() {
        let beacons = beacon_ids(1);
        let api = MockAppleApi::new();
        api.fail_beacon(beacons[0].as_str());
        let (mut session, _dir) = ready_session(api).await;

        let outcome = fetch_reports(&mut session, &beacons, None).await.unwrap();
        assert!(outcome.reports.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(session.api_ref().fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_the_fetch() {
        let beacons = beacon_ids(2);
        let api = MockAppleApi::new();
        api.expire_tokens_once();
        api.set_refresh_ok(false);
        let (mut session, _dir) = ready_session(api).await;

        let err = fetch_reports(&mut session, &beacons, None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRequired));
        assert!(!session.is_ready());
    }
}
