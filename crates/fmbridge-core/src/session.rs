//! Apple account session management.
//!
//! The session is an explicit state machine (`unauthenticated` →
//! `awaiting_2fa` → `authenticated`) so the steady-state poll loop can
//! cheaply check readiness without re-entering authentication logic. The
//! interactive 2FA bootstrap drives the machine from the `init` command;
//! the scheduler only ever asks [`SessionManager::is_ready`] and calls
//! the gated fetch.
//!
//! Session material is persisted through the [`CredentialStore`] on every
//! state transition and destroyed on irrecoverable auth failure.

use time::OffsetDateTime;
use tracing::{info, warn};

use fmbridge_types::{AccountTokens, SessionState};

use crate::anisette::AnisetteProvider;
use crate::error::{Error, Result};
use crate::store::{CredentialStore, PersistedSession};
use crate::traits::{AccountCredentials, AppleApi, LoginOutcome, RawReport, TwoFactorChallenge};

/// Owns the authentication state machine and the persisted session.
pub struct SessionManager<A: AppleApi, P: AnisetteProvider> {
    api: A,
    anisette: P,
    store: CredentialStore,
    state: SessionState,
    tokens: Option<AccountTokens>,
    challenge: Option<TwoFactorChallenge>,
}

impl<A: AppleApi, P: AnisetteProvider> SessionManager<A, P> {
    /// Create a manager in the `unauthenticated` state.
    pub fn new(api: A, anisette: P, store: CredentialStore) -> Self {
        Self {
            api,
            anisette,
            store,
            state: SessionState::Unauthenticated,
            tokens: None,
            challenge: None,
        }
    }

    /// Attempt to restore a persisted session on startup.
    ///
    /// With valid persisted material the machine transitions directly to
    /// `authenticated`; whether the tokens still work is settled by the
    /// first gated call (which falls back to a silent refresh).
    pub fn restore(&mut self) -> Result<SessionState> {
        if let Some(persisted) = self.store.load_session()? {
            let prefix: String = persisted.tokens.dsid.chars().take(4).collect();
            info!(
                "restored session for account {}... (refreshed {})",
                prefix, persisted.refreshed_at
            );
            self.tokens = Some(persisted.tokens);
            self.state = SessionState::Authenticated;
        } else {
            info!("no persisted session; run the init flow to authenticate");
        }
        Ok(self.state)
    }

    /// Current state of the machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True only in the `authenticated` state.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Start a login with the operator's credentials.
    ///
    /// Valid from any state; an existing session is replaced.
    pub async fn begin_login(&mut self, credentials: &AccountCredentials) -> Result<SessionState> {
        let anisette = self.anisette.fetch_headers().await?;
        match self.api.login(credentials, &anisette).await? {
            LoginOutcome::Authenticated(tokens) => {
                self.install_tokens(tokens)?;
            }
            LoginOutcome::TwoFactorRequired(challenge) => {
                info!("login requires a 2FA code");
                self.challenge = Some(challenge);
                self.state = SessionState::AwaitingTwoFactor;
            }
        }
        Ok(self.state)
    }

    /// Complete an outstanding 2FA challenge.
    ///
    /// Only valid in `awaiting_2fa`; from any other state this fails with
    /// [`Error::AuthenticationRequired`] and changes nothing. A rejected
    /// code leaves the machine in `awaiting_2fa` so the operator can try
    /// again with a fresh code.
    pub async fn submit_2fa(&mut self, code: &str) -> Result<SessionState> {
        let challenge = match (&self.state, &self.challenge) {
            (SessionState::AwaitingTwoFactor, Some(challenge)) => challenge.clone(),
            _ => return Err(Error::AuthenticationRequired),
        };

        let anisette = self.anisette.fetch_headers().await?;
        let tokens = self.api.submit_2fa(&challenge, code, &anisette).await?;
        self.challenge = None;
        self.install_tokens(tokens)?;
        Ok(self.state)
    }

    /// Fetch reports for the given beacon ids, gated on readiness.
    ///
    /// On an authorization failure this attempts exactly one silent token
    /// refresh before surfacing a re-authentication requirement; a failed
    /// refresh resets the machine to `unauthenticated` and clears the
    /// persisted session.
    pub async fn fetch_reports(
        &mut self,
        ids: &[String],
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<RawReport>> {
        if !self.is_ready() {
            return Err(Error::AuthenticationRequired);
        }
        let tokens = self.tokens.clone().ok_or(Error::AuthenticationRequired)?;

        let anisette = self.anisette.fetch_headers().await?;
        match self.api.fetch_reports(&tokens, ids, since, &anisette).await {
            Err(Error::AuthenticationRequired) => {
                info!("authorization failed, attempting silent token refresh");
                let tokens = match self.try_refresh(&tokens).await {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!("token refresh failed ({}); session reset, re-run init", e);
                        self.reset()?;
                        return Err(Error::AuthenticationRequired);
                    }
                };
                let anisette = self.anisette.fetch_headers().await?;
                match self.api.fetch_reports(&tokens, ids, since, &anisette).await {
                    Err(Error::AuthenticationRequired) => {
                        warn!("refreshed tokens still rejected; session reset, re-run init");
                        self.reset()?;
                        Err(Error::AuthenticationRequired)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// The underlying account API.
    pub fn api_ref(&self) -> &A {
        &self.api
    }

    /// Drop all session state, persisted and in-memory.
    pub fn reset(&mut self) -> Result<()> {
        self.state = SessionState::Unauthenticated;
        self.tokens = None;
        self.challenge = None;
        self.store.clear_session()
    }

    async fn try_refresh(&mut self, tokens: &AccountTokens) -> Result<AccountTokens> {
        let anisette = self.anisette.fetch_headers().await?;
        let fresh = self.api.refresh(tokens, &anisette).await?;
        self.install_tokens(fresh.clone())?;
        Ok(fresh)
    }

    fn install_tokens(&mut self, tokens: AccountTokens) -> Result<()> {
        self.store.save_session(&PersistedSession {
            tokens: tokens.clone(),
            refreshed_at: OffsetDateTime::now_utc(),
        })?;
        self.tokens = Some(tokens);
        self.state = SessionState::Authenticated;
        info!("session is authenticated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAnisette, MockAppleApi};

    fn manager(
        api: MockAppleApi,
    ) -> (SessionManager<MockAppleApi, MockAnisette>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        (SessionManager::new(api, MockAnisette::new(), store), dir)
    }

    #[tokio::test]
    async fn test_starts_unauthenticated() {
        let (session, _dir) = manager(MockAppleApi::new());
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_login_without_2fa() {
        let (mut session, _dir) = manager(MockAppleApi::new());
        let creds = AccountCredentials {
            apple_id: "user@example.com".into(),
            password: "pw".into(),
        };

        let state = session.begin_login(&creds).await.unwrap();
        assert_eq!(state, SessionState::Authenticated);
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_login_with_2fa_challenge() {
        let (mut session, _dir) = manager(MockAppleApi::new().with_two_factor("123456"));
        let creds = AccountCredentials {
            apple_id: "user@example.com".into(),
            password: "pw".into(),
        };

        let state = session.begin_login(&creds).await.unwrap();
        assert_eq!(state, SessionState::AwaitingTwoFactor);
        assert!(!session.is_ready());

        // Wrong code: rejected, state unchanged, retry possible.
        let err = session.submit_2fa("000000").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRejected(_)));
        assert_eq!(session.state(), SessionState::AwaitingTwoFactor);

        // Correct code completes the login.
        let state = session.submit_2fa("123456").await.unwrap();
        assert_eq!(state, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_submit_2fa_while_unauthenticated_has_no_side_effects() {
        let (mut session, _dir) = manager(MockAppleApi::new());

        let err = session.submit_2fa("123456").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRequired));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.store.load_session().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_persisted_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store
            .save_session(&PersistedSession {
                tokens: AccountTokens {
                    dsid: "7654321".into(),
                    search_party_token: "tok".into(),
                },
                refreshed_at: OffsetDateTime::now_utc(),
            })
            .unwrap();

        let mut session =
            SessionManager::new(MockAppleApi::new(), MockAnisette::new(), store);
        let state = session.restore().unwrap();
        assert_eq!(state, SessionState::Authenticated);
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_fetch_gated_when_not_ready() {
        let (mut session, _dir) = manager(MockAppleApi::new());
        let err = session.fetch_reports(&["x".to_string()], None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_silent_refresh_recovers_authorization() {
        let api = MockAppleApi::new();
        api.expire_tokens_once();
        let (mut session, _dir) = manager(api);

        let creds = AccountCredentials {
            apple_id: "u".into(),
            password: "p".into(),
        };
        session.begin_login(&creds).await.unwrap();

        // First fetch hits the expired-token failure, refreshes silently
        // and succeeds on the retry.
        let reports = session.fetch_reports(&[], None).await.unwrap();
        assert!(reports.is_empty());
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_failed_refresh_resets_session() {
        let api = MockAppleApi::new();
        api.expire_tokens_once();
        api.set_refresh_ok(false);
        let (mut session, _dir) = manager(api);

        let creds = AccountCredentials {
            apple_id: "u".into(),
            password: "p".into(),
        };
        session.begin_login(&creds).await.unwrap();
        assert!(session.store.load_session().unwrap().is_some());

        let err = session.fetch_reports(&[], None).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRequired));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        // Irrecoverable auth failure destroys the persisted session.
        assert!(session.store.load_session().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ready_until_auth_failure() {
        let (mut session, _dir) = manager(MockAppleApi::new());
        let creds = AccountCredentials {
            apple_id: "u".into(),
            password: "p".into(),
        };
        session.begin_login(&creds).await.unwrap();

        for _ in 0..3 {
            session.fetch_reports(&[], None).await.unwrap();
            assert!(session.is_ready());
        }
    }
}
