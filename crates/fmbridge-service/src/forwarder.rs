//! Traccar forwarding with duplicate suppression.
//!
//! Fixes are submitted to Traccar's OsmAnd endpoint as one POST per fix,
//! keyed by the beacon's numeric device id. Apple re-serves recent reports
//! on every poll, so the forwarder keeps an in-memory high-water mark per
//! beacon and only submits fixes strictly newer than the last success.
//!
//! The mark is deliberately not persisted. After a restart the first cycle
//! re-forwards the newest already-known fixes; Traccar treats a replayed
//! position for an existing timestamp as an update, so the cost is a few
//! redundant requests, not duplicated tracks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use fmbridge_core::retry::{RetryConfig, with_retry};
use fmbridge_core::traits::{ForwardStatus, LocationSink};
use fmbridge_core::{Error, Result};
use fmbridge_types::{BeaconId, LocationFix};

use time::OffsetDateTime;

/// Request timeout for Traccar submissions.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Forwards location fixes to a Traccar OsmAnd endpoint.
pub struct TraccarForwarder {
    http: reqwest::Client,
    url: String,
    retry: RetryConfig,
    high_water: Mutex<HashMap<BeaconId, OffsetDateTime>>,
}

impl TraccarForwarder {
    /// Create a forwarder for the given OsmAnd endpoint URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_retry_config(url, RetryConfig::for_network())
    }

    /// Create a forwarder with explicit retry behavior.
    pub fn with_retry_config(url: impl Into<String>, retry: RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::from_reqwest("traccar_client", e))?;
        Ok(Self {
            http,
            url: url.into(),
            retry,
            high_water: Mutex::new(HashMap::new()),
        })
    }

    async fn submit(&self, fix: &LocationFix) -> Result<()> {
        let params = [
            ("id", fix.beacon.device_id().to_string()),
            ("timestamp", fix.timestamp.unix_timestamp().to_string()),
            ("lat", fix.latitude.to_string()),
            ("lon", fix.longitude.to_string()),
            ("accuracy", fix.accuracy.to_string()),
        ];

        let response = self
            .http
            .post(&self.url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::from_reqwest("forward_fix", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::transient(
                "forward_fix",
                format!("traccar answered {}", status),
            ));
        }
        if !status.is_success() {
            return Err(Error::protocol(
                "forward_fix",
                format!("traccar answered {}", status),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LocationSink for TraccarForwarder {
    /// Submit one fix, suppressing anything not strictly newer than the
    /// beacon's last forwarded fix.
    ///
    /// The mark only advances on a confirmed submission, so a failed
    /// request leaves the fix eligible for the next cycle.
    async fn forward(&self, fix: &LocationFix) -> Result<ForwardStatus> {
        {
            let high_water = self.high_water.lock().await;
            if let Some(latest) = high_water.get(&fix.beacon) {
                if fix.timestamp <= *latest {
                    debug!(
                        "suppressing fix for {} at {} (already forwarded through {})",
                        fix.beacon, fix.timestamp, latest
                    );
                    return Ok(ForwardStatus::Skipped);
                }
            }
        }

        with_retry(&self.retry, "forward_fix", || self.submit(fix)).await?;

        let mut high_water = self.high_water.lock().await;
        let entry = high_water
            .entry(fix.beacon.clone())
            .or_insert(fix.timestamp);
        if fix.timestamp > *entry {
            *entry = fix.timestamp;
        }
        Ok(ForwardStatus::Sent)
    }
}
