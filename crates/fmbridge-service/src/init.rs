//! Interactive authentication bootstrap.
//!
//! `fmbridge init` walks the operator through the Apple login once,
//! including the 2FA exchange, and leaves the session persisted for the
//! polling service to pick up. The poll loop itself never prompts.

use std::io::{BufRead, Write};

use anyhow::{Context, bail};
use tracing::info;

use fmbridge_core::anisette::AnisetteProvider;
use fmbridge_core::traits::{AccountCredentials, AppleApi};
use fmbridge_core::{Error, SessionManager};
use fmbridge_types::SessionState;

/// Drive a full login on the given session, prompting through `input` and
/// `output`.
///
/// A rejected 2FA code re-prompts; any other failure aborts with the
/// underlying error.
pub async fn run_init<A, P, R, W>(
    session: &mut SessionManager<A, P>,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<()>
where
    A: AppleApi,
    P: AnisetteProvider,
    R: BufRead,
    W: Write,
{
    let apple_id = prompt(input, output, "Apple ID: ")?;
    let password = prompt(input, output, "Password: ")?;
    let credentials = AccountCredentials { apple_id, password };

    let mut state = session
        .begin_login(&credentials)
        .await
        .context("login failed")?;

    while state == SessionState::AwaitingTwoFactor {
        let code = prompt(input, output, "2FA code: ")?;
        match session.submit_2fa(&code).await {
            Ok(new_state) => state = new_state,
            Err(Error::AuthenticationRejected(reason)) => {
                writeln!(output, "Code rejected ({}), try again.", reason)?;
            }
            Err(e) => return Err(e).context("2FA submission failed"),
        }
    }

    if state != SessionState::Authenticated {
        bail!("login ended in unexpected state {:?}", state);
    }

    info!("authentication complete; session persisted");
    writeln!(output, "Authenticated. The bridge can now poll for reports.")?;
    Ok(())
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> anyhow::Result<String> {
    write!(output, "{}", label)?;
    output.flush()?;

    let mut line = String::new();
    let read = input.read_line(&mut line)?;
    if read == 0 {
        bail!("input closed before '{}' was answered", label.trim_end());
    }
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use fmbridge_core::CredentialStore;
    use fmbridge_core::mock::{MockAnisette, MockAppleApi};

    fn session(
        api: MockAppleApi,
    ) -> (SessionManager<MockAppleApi, MockAnisette>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        (SessionManager::new(api, MockAnisette::new(), store), dir)
    }

    #[tokio::test]
    async fn test_init_without_2fa() {
        let (mut session, _dir) = session(MockAppleApi::new());
        let mut input = Cursor::new("user@example.com\npw\n");
        let mut output = Vec::new();

        run_init(&mut session, &mut input, &mut output)
            .await
            .unwrap();

        assert!(session.is_ready());
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Apple ID:"));
        assert!(text.contains("Authenticated"));
    }

    #[tokio::test]
    async fn test_init_with_2fa_retry() {
        let (mut session, _dir) = session(MockAppleApi::new().with_two_factor("424242"));
        // One wrong code, then the right one.
        let mut input = Cursor::new("user@example.com\npw\n000000\n424242\n");
        let mut output = Vec::new();

        run_init(&mut session, &mut input, &mut output)
            .await
            .unwrap();

        assert!(session.is_ready());
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Code rejected"));
    }

    #[tokio::test]
    async fn test_init_fails_when_input_runs_out() {
        let (mut session, _dir) = session(MockAppleApi::new().with_two_factor("424242"));
        // No 2FA code supplied.
        let mut input = Cursor::new("user@example.com\npw\n");
        let mut output = Vec::new();

        let result = run_init(&mut session, &mut input, &mut output).await;
        assert!(result.is_err());
        assert!(!session.is_ready());
    }
}
