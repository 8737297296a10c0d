//! HTTP implementation of the Apple account API.
//!
//! Two endpoint families are involved. Account operations (login, 2FA,
//! token refresh) go to a configured authentication service speaking a
//! small JSON protocol. Report fetches go to the search-party gateway,
//! authenticated with HTTP basic auth over the account's dsid and
//! search-party token. Both carry anisette attestation headers on every
//! request.
//!
//! This is a version-pinned external protocol: field names and shapes
//! here match what the remote side actually speaks, not the crate's own
//! naming conventions.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use fmbridge_types::AccountTokens;

use crate::anisette::AnisetteHeaders;
use crate::error::{Error, Result};
use crate::traits::{AccountCredentials, AppleApi, LoginOutcome, RawReport, TwoFactorChallenge};

/// The production report-fetch gateway.
pub const DEFAULT_FETCH_URL: &str = "https://gateway.icloud.com/acsnservice/fetch";

/// Request timeout for account and gateway calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the Apple account and report-fetch endpoints.
pub struct AppleHttpClient {
    http: reqwest::Client,
    auth_url: String,
    fetch_url: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    apple_id: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: String,
    dsid: Option<String>,
    search_party_token: Option<String>,
    context: Option<String>,
}

#[derive(Serialize)]
struct TwoFactorRequest<'a> {
    context: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    dsid: String,
    search_party_token: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    dsid: &'a str,
    search_party_token: &'a str,
}

#[derive(Serialize)]
struct FetchRequest {
    search: Vec<FetchQuery>,
}

#[derive(Serialize)]
struct FetchQuery {
    ids: Vec<String>,
    #[serde(rename = "startDate", skip_serializing_if = "Option::is_none")]
    start_date: Option<i64>,
}

#[derive(Deserialize)]
struct FetchResponse {
    #[serde(default)]
    results: Vec<FetchEntry>,
}

#[derive(Deserialize)]
struct FetchEntry {
    id: String,
    payload: String,
    #[serde(rename = "datePublished")]
    date_published: i64,
}

impl AppleHttpClient {
    /// Create a client for the given authentication service and fetch
    /// gateway URLs.
    pub fn new(auth_url: impl Into<String>, fetch_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::from_reqwest("apple_client", e))?;
        Ok(Self {
            http,
            auth_url: auth_url.into(),
            fetch_url: fetch_url.into(),
        })
    }

    fn auth_endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.auth_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize>(
        &self,
        operation: &'static str,
        url: &str,
        body: &B,
        anisette: &AnisetteHeaders,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.post(url).json(body);
        for (name, value) in anisette.iter() {
            request = request.header(name, value);
        }
        request
            .send()
            .await
            .map_err(|e| Error::from_reqwest(operation, e))
    }
}

/// Classify a non-success status for an account operation.
fn account_status_error(operation: &'static str, status: StatusCode, body: String) -> Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::AuthenticationRejected(format!("{} answered {}", operation, status))
    } else if status.is_server_error() {
        Error::transient(operation, format!("server answered {}", status))
    } else {
        Error::protocol(operation, format!("unexpected status {}: {}", status, body))
    }
}

#[async_trait]
impl AppleApi for AppleHttpClient {
    async fn login(
        &self,
        credentials: &AccountCredentials,
        anisette: &AnisetteHeaders,
    ) -> Result<LoginOutcome> {
        let body = LoginRequest {
            apple_id: &credentials.apple_id,
            password: &credentials.password,
        };
        let response = self
            .post_json("login", &self.auth_endpoint("login"), &body, anisette)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(account_status_error("login", status, body));
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest("login", e))?;
        match parsed.status.as_str() {
            "authenticated" => match (parsed.dsid, parsed.search_party_token) {
                (Some(dsid), Some(search_party_token)) => {
                    Ok(LoginOutcome::Authenticated(AccountTokens {
                        dsid,
                        search_party_token,
                    }))
                }
                _ => Err(Error::protocol(
                    "login",
                    "authenticated response is missing token fields",
                )),
            },
            "two_factor_required" => {
                let context = parsed.context.ok_or_else(|| {
                    Error::protocol("login", "2FA response is missing the challenge context")
                })?;
                Ok(LoginOutcome::TwoFactorRequired(TwoFactorChallenge {
                    context,
                }))
            }
            other => Err(Error::protocol(
                "login",
                format!("unknown login status '{}'", other),
            )),
        }
    }

    async fn submit_2fa(
        &self,
        challenge: &TwoFactorChallenge,
        code: &str,
        anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens> {
        let body = TwoFactorRequest {
            context: &challenge.context,
            code,
        };
        let response = self
            .post_json("submit_2fa", &self.auth_endpoint("2fa"), &body, anisette)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(account_status_error("submit_2fa", status, body));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest("submit_2fa", e))?;
        Ok(AccountTokens {
            dsid: tokens.dsid,
            search_party_token: tokens.search_party_token,
        })
    }

    async fn refresh(
        &self,
        tokens: &AccountTokens,
        anisette: &AnisetteHeaders,
    ) -> Result<AccountTokens> {
        let body = RefreshRequest {
            dsid: &tokens.dsid,
            search_party_token: &tokens.search_party_token,
        };
        let response = self
            .post_json("refresh", &self.auth_endpoint("refresh"), &body, anisette)
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // Expired refresh material surfaces as a session-level auth
            // failure, not a rejected credential.
            return Err(Error::AuthenticationRequired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(account_status_error("refresh", status, body));
        }

        let fresh: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest("refresh", e))?;
        Ok(AccountTokens {
            dsid: fresh.dsid,
            search_party_token: fresh.search_party_token,
        })
    }

    async fn fetch_reports(
        &self,
        tokens: &AccountTokens,
        ids: &[String],
        since: Option<OffsetDateTime>,
        anisette: &AnisetteHeaders,
    ) -> Result<Vec<RawReport>> {
        let body = FetchRequest {
            search: vec![FetchQuery {
                ids: ids.to_vec(),
                start_date: since.map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64),
            }],
        };

        let mut request = self
            .http
            .post(&self.fetch_url)
            .basic_auth(&tokens.dsid, Some(&tokens.search_party_token))
            .json(&body);
        for (name, value) in anisette.iter() {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::from_reqwest("fetch_reports", e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthenticationRequired);
        }
        if status.is_server_error() {
            return Err(Error::transient(
                "fetch_reports",
                format!("gateway answered {}", status),
            ));
        }
        if !status.is_success() {
            return Err(Error::protocol(
                "fetch_reports",
                format!("gateway answered {}", status),
            ));
        }

        let parsed: FetchResponse = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest("fetch_reports", e))?;

        let mut reports = Vec::with_capacity(parsed.results.len());
        for entry in parsed.results {
            // One undecodable entry never discards the rest of the batch.
            let payload = match BASE64.decode(&entry.payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("skipping report for {}: payload not base64 ({})", entry.id, e);
                    continue;
                }
            };
            let published = match OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(entry.date_published) * 1_000_000,
            ) {
                Ok(t) => t,
                Err(_) => {
                    warn!(
                        "skipping report for {}: bad publish time {}",
                        entry.id, entry.date_published
                    );
                    continue;
                }
            };
            reports.push(RawReport {
                id: entry.id,
                payload,
                published,
            });
        }
        debug!("gateway returned {} usable reports", reports.len());
        Ok(reports)
    }
}
