//! The steady-state poll scheduler.
//!
//! One cycle fetches encrypted reports for every configured beacon,
//! decrypts them, folds in any plist exports and forwards the resulting
//! fixes. Failures are isolated at every stage: a beacon whose fetch,
//! decryption or forwarding fails is counted and skipped, and the cycle
//! carries on with the rest. Nothing that happens during a cycle stops
//! the scheduler.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use fmbridge_core::anisette::AnisetteProvider;
use fmbridge_core::plist::PlistSource;
use fmbridge_core::traits::{AppleApi, ForwardStatus, LocationSink, ReportDecrypter};
use fmbridge_core::{Beacon, CredentialStore, SessionManager, fetch};
use fmbridge_types::{BeaconId, LocationFix};

use time::OffsetDateTime;

/// Counters from one completed poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Fixes submitted to the sink.
    pub forwarded: usize,
    /// Fixes suppressed as not newer than already-forwarded ones.
    pub suppressed: usize,
    /// Beacons whose report fetch failed.
    pub fetch_failures: usize,
    /// Reports that could not be decrypted.
    pub decrypt_failures: usize,
    /// Beacons whose forwarding was aborted by a sink failure.
    pub forward_failures: usize,
    /// Plist files skipped as unreadable.
    pub plist_files_skipped: usize,
}

/// Drives poll cycles at the configured interval until stopped.
pub struct Scheduler<A: AppleApi, P: AnisetteProvider, D: ReportDecrypter, S: LocationSink> {
    session: SessionManager<A, P>,
    beacons: Vec<Beacon>,
    decrypter: D,
    sink: S,
    plists: Option<PlistSource>,
    store: CredentialStore,
    interval: Duration,
    idle_logged: bool,
}

impl<A: AppleApi, P: AnisetteProvider, D: ReportDecrypter, S: LocationSink>
    Scheduler<A, P, D, S>
{
    /// Create a scheduler over the given pipeline components.
    pub fn new(
        session: SessionManager<A, P>,
        beacons: Vec<Beacon>,
        decrypter: D,
        sink: S,
        plists: Option<PlistSource>,
        store: CredentialStore,
        interval: Duration,
    ) -> Self {
        Self {
            session,
            beacons,
            decrypter,
            sink,
            plists,
            store,
            interval,
            idle_logged: false,
        }
    }

    /// Run cycles until the stop signal flips to `true`.
    ///
    /// A fresh start polls immediately; after a restart the persisted poll
    /// marker defers the first cycle so frequent restarts cannot turn into
    /// frequent polls against Apple.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        if let Some(delay) = self.initial_delay() {
            info!(
                "last poll was recent; deferring the first cycle by {:?}",
                delay
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.changed() => return,
            }
        }

        loop {
            let summary = self.run_cycle().await;
            debug!("cycle complete: {:?}", summary);

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = stop.changed() => {
                    info!("stop requested, scheduler exiting");
                    return;
                }
            }
        }
    }

    fn initial_delay(&self) -> Option<Duration> {
        let last = self.store.last_poll_at().ok().flatten()?;
        let elapsed = OffsetDateTime::now_utc() - last;
        let elapsed: Duration = elapsed.try_into().ok()?;
        if elapsed < self.interval {
            Some(self.interval - elapsed)
        } else {
            None
        }
    }

    /// Run one poll cycle.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let mut per_beacon: HashMap<BeaconId, Vec<LocationFix>> = HashMap::new();

        self.fetch_and_decrypt(&mut summary, &mut per_beacon).await;

        if let Some(plists) = &self.plists {
            let outcome = plists.scan();
            summary.plist_files_skipped = outcome.skipped.len();
            for record in outcome.records {
                per_beacon
                    .entry(record.beacon)
                    .or_default()
                    .extend(record.fixes);
            }
        }

        self.forward_all(&mut summary, per_beacon).await;
        summary
    }

    async fn fetch_and_decrypt(
        &mut self,
        summary: &mut CycleSummary,
        per_beacon: &mut HashMap<BeaconId, Vec<LocationFix>>,
    ) {
        if self.beacons.is_empty() {
            return;
        }

        if !self.session.is_ready() {
            if !self.idle_logged {
                info!("session not authenticated; idling until the init flow completes");
                self.idle_logged = true;
            }
            return;
        }
        self.idle_logged = false;

        let since = self.store.last_poll_at().ok().flatten();
        let ids: Vec<BeaconId> = self.beacons.iter().map(|b| b.id().clone()).collect();

        let outcome = match fetch::fetch_reports(&mut self.session, &ids, since).await {
            Ok(outcome) => outcome,
            // Only authorization loss escapes the fetcher; partial trouble
            // comes back as per-beacon failures in the outcome.
            Err(e) => {
                warn!("session lost authorization; idling until re-authenticated ({})", e);
                self.idle_logged = true;
                return;
            }
        };

        summary.fetch_failures = outcome.failures.len();
        for failure in &outcome.failures {
            warn!("no reports for {} this cycle: {}", failure.beacon, failure.error);
        }

        for report in &outcome.reports {
            let Some(beacon) = self.beacons.iter().find(|b| *b.id() == report.beacon) else {
                continue;
            };
            match self.decrypter.decrypt(beacon, report) {
                Ok(fix) => per_beacon.entry(fix.beacon.clone()).or_default().push(fix),
                Err(e) => {
                    summary.decrypt_failures += 1;
                    warn!("undecryptable report for {}: {}", beacon.display_name(), e);
                }
            }
        }

        // An empty yield still pushes the next startDate forward, but a
        // failed beacon must stay inside the next cycle's fetch window, so
        // the marker only advances when every beacon was actually served.
        if outcome.failures.is_empty() {
            if let Err(e) = self.store.record_poll(OffsetDateTime::now_utc()) {
                warn!("could not persist the poll marker: {}", e);
            }
        }
    }

    async fn forward_all(
        &mut self,
        summary: &mut CycleSummary,
        per_beacon: HashMap<BeaconId, Vec<LocationFix>>,
    ) {
        for (beacon, mut fixes) in per_beacon {
            // Oldest first, so the sink's high-water mark never jumps
            // past a fix that still needs forwarding.
            fixes.sort_by_key(|fix| fix.timestamp);

            for fix in &fixes {
                match self.sink.forward(fix).await {
                    Ok(ForwardStatus::Sent) => summary.forwarded += 1,
                    Ok(ForwardStatus::Skipped) => summary.suppressed += 1,
                    Err(e) => {
                        // Stop this beacon's batch; forwarding a newer fix
                        // after a failure would strand the failed one
                        // behind the mark.
                        summary.forward_failures += 1;
                        warn!("forwarding for {} aborted: {}", beacon, e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmbridge_core::mock::{
        MockAnisette, MockAppleApi, MockDecrypter, MockSink, POISON_PAYLOAD, mock_plaintext,
    };
    use fmbridge_core::traits::AccountCredentials;

    fn test_beacons(n: usize) -> Vec<Beacon> {
        (0..n)
            .map(|i| {
                let mut key = [0x5au8; 28];
                key[27] = (i + 1) as u8;
                Beacon::from_bytes(&key, Some(format!("beacon-{}", i))).unwrap()
            })
            .collect()
    }

    async fn scheduler_for(
        api: MockAppleApi,
        beacons: Vec<Beacon>,
        sink: MockSink,
        plists: Option<PlistSource>,
    ) -> (
        Scheduler<MockAppleApi, MockAnisette, MockDecrypter, MockSink>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let mut session = SessionManager::new(api, MockAnisette::new(), store.clone());
        let creds = AccountCredentials {
            apple_id: "u".into(),
            password: "p".into(),
        };
        session.begin_login(&creds).await.unwrap();

        let scheduler = Scheduler::new(
            session,
            beacons,
            MockDecrypter::new(),
            sink,
            plists,
            store,
            Duration::from_secs(3600),
        );
        (scheduler, dir)
    }

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_forwards_decrypted_fixes() {
        let beacons = test_beacons(2);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), mock_plaintext(52.52, 13.405, 30), ts(1000));
        api.push_report(beacons[1].id().as_str(), mock_plaintext(48.85, 2.35, 12), ts(2000));

        let (mut scheduler, _dir) = scheduler_for(api, beacons, MockSink::new(), None).await;
        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.forwarded, 2);
        assert_eq!(summary.decrypt_failures, 0);
        assert_eq!(summary.fetch_failures, 0);
        assert_eq!(scheduler.sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_undecryptable_report_is_counted_and_skipped() {
        let beacons = test_beacons(2);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), POISON_PAYLOAD.to_vec(), ts(1000));
        api.push_report(beacons[1].id().as_str(), mock_plaintext(1.0, 2.0, 3), ts(2000));

        let (mut scheduler, _dir) = scheduler_for(api, beacons, MockSink::new(), None).await;
        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.decrypt_failures, 1);
        assert_eq!(summary.forwarded, 1);
    }

    #[tokio::test]
    async fn test_one_failing_beacon_does_not_starve_the_rest() {
        let beacons = test_beacons(3);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.0, 1.0, 1), ts(1000));
        api.push_report(beacons[2].id().as_str(), mock_plaintext(3.0, 3.0, 3), ts(3000));
        api.fail_beacon(beacons[1].id().as_str());

        let (mut scheduler, _dir) = scheduler_for(api, beacons, MockSink::new(), None).await;
        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.fetch_failures, 1);
        assert_eq!(summary.forwarded, 2);
    }

    #[tokio::test]
    async fn test_failed_beacon_fetch_is_recovered_next_cycle() {
        let beacons = test_beacons(2);
        let flaky = beacons[1].id().clone();
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.0, 1.0, 1), ts(1000));
        api.push_report(flaky.as_str(), mock_plaintext(2.0, 2.0, 2), ts(1000));
        api.fail_beacon(flaky.as_str());

        let (mut scheduler, _dir) = scheduler_for(api, beacons, MockSink::new(), None).await;

        let first = scheduler.run_cycle().await;
        assert_eq!(first.fetch_failures, 1);
        assert_eq!(first.forwarded, 1);
        // The marker must not move past the failed beacon's window; its
        // pre-failure reports have to stay inside the next startDate.
        assert!(scheduler.store.last_poll_at().unwrap().is_none());

        scheduler.session.api_ref().heal_beacon(flaky.as_str());
        let second = scheduler.run_cycle().await;
        assert_eq!(second.fetch_failures, 0);
        assert!(
            scheduler.sink.sent().iter().any(|fix| fix.beacon == flaky),
            "the recovered beacon's fix was never forwarded"
        );
        assert!(scheduler.store.last_poll_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fixes_are_forwarded_oldest_first() {
        let beacons = test_beacons(1);
        let api = MockAppleApi::new();
        // Gateway order is newest first; the sink must see them ascending.
        api.push_report(beacons[0].id().as_str(), mock_plaintext(2.0, 2.0, 2), ts(3000));
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.0, 1.0, 1), ts(1000));
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.5, 1.5, 1), ts(2000));

        let (mut scheduler, _dir) = scheduler_for(api, beacons, MockSink::new(), None).await;
        scheduler.run_cycle().await;

        let sent = scheduler.sink.sent();
        let times: Vec<i64> = sent.iter().map(|f| f.timestamp.unix_timestamp()).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_forward_failure_aborts_only_that_beacon() {
        let beacons = test_beacons(2);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.0, 1.0, 1), ts(1000));
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.5, 1.5, 1), ts(2000));
        api.push_report(beacons[1].id().as_str(), mock_plaintext(2.0, 2.0, 2), ts(1000));

        let sink = MockSink::new();
        sink.fail_beacon(beacons[0].id());

        let (mut scheduler, _dir) = scheduler_for(api, beacons, sink, None).await;
        let summary = scheduler.run_cycle().await;

        // One abort for the failing beacon, not one per stranded fix.
        assert_eq!(summary.forward_failures, 1);
        assert_eq!(summary.forwarded, 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_session_idles_without_fetching() {
        let beacons = test_beacons(1);
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let session = SessionManager::new(MockAppleApi::new(), MockAnisette::new(), store.clone());

        let mut scheduler = Scheduler::new(
            session,
            beacons,
            MockDecrypter::new(),
            MockSink::new(),
            None,
            store.clone(),
            Duration::from_secs(3600),
        );

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary, CycleSummary::default());
        assert_eq!(scheduler.session.api_ref().fetch_calls(), 0);
        // An idle cycle is not a poll; the marker stays unset.
        assert!(store.last_poll_at().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plists_are_ingested_alongside_reports() {
        use plist::{Dictionary, Value};

        let plist_dir = tempfile::tempdir().unwrap();
        let mut location = Dictionary::new();
        location.insert(
            "timestamp".into(),
            Value::Date(plist::Date::from(
                std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            )),
        );
        location.insert("latitude".into(), Value::Real(50.0));
        location.insert("longitude".into(), Value::Real(8.0));
        let mut export = Dictionary::new();
        export.insert("identifier".into(), Value::String("tag-1".into()));
        export.insert(
            "locations".into(),
            Value::Array(vec![Value::Dictionary(location)]),
        );
        Value::Dictionary(export)
            .to_file_xml(plist_dir.path().join("tag.plist"))
            .unwrap();
        std::fs::write(plist_dir.path().join("broken.plist"), b"junk").unwrap();

        let (mut scheduler, _dir) = scheduler_for(
            MockAppleApi::new(),
            Vec::new(),
            MockSink::new(),
            Some(PlistSource::new(plist_dir.path())),
        )
        .await;
        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.forwarded, 1);
        assert_eq!(summary.plist_files_skipped, 1);
        assert_eq!(scheduler.sink.sent()[0].latitude, 50.0);
    }

    #[tokio::test]
    async fn test_poll_marker_advances_after_a_ready_cycle() {
        let beacons = test_beacons(1);
        let (mut scheduler, _dir) = scheduler_for(
            MockAppleApi::new(),
            beacons,
            MockSink::new(),
            None,
        )
        .await;

        assert!(scheduler.store.last_poll_at().unwrap().is_none());
        scheduler.run_cycle().await;
        assert!(scheduler.store.last_poll_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rerun_suppresses_already_forwarded_fixes() {
        let beacons = test_beacons(1);
        let api = MockAppleApi::new();
        api.push_report(beacons[0].id().as_str(), mock_plaintext(1.0, 1.0, 1), ts(1000));

        // MockSink has no high-water logic, so use the summary deltas of a
        // sink that does.
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let mut session = SessionManager::new(api, MockAnisette::new(), store.clone());
        session
            .begin_login(&AccountCredentials {
                apple_id: "u".into(),
                password: "p".into(),
            })
            .await
            .unwrap();

        struct OnceSink(MockSink, tokio::sync::Mutex<std::collections::HashMap<BeaconId, OffsetDateTime>>);
        #[async_trait::async_trait]
        impl LocationSink for OnceSink {
            async fn forward(
                &self,
                fix: &LocationFix,
            ) -> fmbridge_core::Result<ForwardStatus> {
                let mut marks = self.1.lock().await;
                if marks.get(&fix.beacon).is_some_and(|m| fix.timestamp <= *m) {
                    return Ok(ForwardStatus::Skipped);
                }
                marks.insert(fix.beacon.clone(), fix.timestamp);
                self.0.forward(fix).await
            }
        }

        let sink = OnceSink(MockSink::new(), tokio::sync::Mutex::new(Default::default()));
        let mut scheduler = Scheduler::new(
            session,
            beacons,
            MockDecrypter::new(),
            sink,
            None,
            store,
            Duration::from_secs(3600),
        );

        let first = scheduler.run_cycle().await;
        assert_eq!(first.forwarded, 1);

        // Apple re-serves the same report; the sink suppresses it.
        let second = scheduler.run_cycle().await;
        assert_eq!(second.forwarded, 0);
        assert_eq!(second.suppressed, 1);
    }
}
