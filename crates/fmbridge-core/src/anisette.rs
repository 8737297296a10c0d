//! Anisette device-attestation client.
//!
//! Apple's account and report endpoints require anisette headers on every
//! attested request. A self-hosted anisette server provides them as a flat
//! JSON object; this client fetches that object on demand and carries no
//! state between calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Device-attestation headers for one Apple request.
#[derive(Debug, Clone, Default)]
pub struct AnisetteHeaders(HashMap<String, String>);

impl AnisetteHeaders {
    /// Wrap an already-fetched header map (used by tests and mocks).
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self(map)
    }

    /// Iterate over the header name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the header set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A source of anisette attestation headers.
///
/// Behind a trait so the session manager can be tested without an
/// anisette server (see [`crate::mock::MockAnisette`]).
#[async_trait]
pub trait AnisetteProvider: Send + Sync {
    /// Fetch a fresh set of attestation headers.
    async fn fetch_headers(&self) -> Result<AnisetteHeaders>;
}

/// Stateless client for a configured anisette endpoint.
pub struct AnisetteClient {
    http: reqwest::Client,
    url: String,
}

/// Request timeout for anisette calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl AnisetteClient {
    /// Create a client for the given anisette endpoint URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::from_reqwest("anisette_client", e))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AnisetteProvider for AnisetteClient {
    /// Any failure here fails the dependent Apple operation, never the
    /// process; it propagates as a transient error to the caller's retry
    /// logic.
    async fn fetch_headers(&self) -> Result<AnisetteHeaders> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::from_reqwest("fetch_anisette", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(
                "fetch_anisette",
                format!("anisette server answered {}", status),
            ));
        }

        let raw: HashMap<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest("fetch_anisette", e))?;

        let mut headers = HashMap::with_capacity(raw.len());
        for (name, value) in raw {
            match value {
                serde_json::Value::String(s) => {
                    headers.insert(name, s);
                }
                // Non-string fields (e.g. a nested routing hint) are not
                // header material.
                other => debug!("ignoring non-string anisette field {}: {}", name, other),
            }
        }

        if headers.is_empty() {
            return Err(Error::protocol(
                "fetch_anisette",
                "anisette server returned no headers",
            ));
        }

        Ok(AnisetteHeaders(headers))
    }
}
