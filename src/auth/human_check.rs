//! The `HumanCheck` collaborator: Turnstile verification is an external
//! concern (`SPEC_FULL.md` Non-goals — contract only); this defines the
//! seam a join attempt's optional `turnstileToken` calls through, with a
//! no-op implementation for local development and practice sessions.

use anyhow::Error;

/// Verifies a client-supplied proof-of-humanity token against whatever
/// external challenge service is configured. A session only calls this on
/// a fresh `join`, never on `rejoin` (the persistent-id has already
/// cleared the check once).
pub trait HumanCheck: Send + Sync {
    fn verify<'a>(
        &'a self,
        token: Option<&'a str>,
    ) -> futures_util::future::BoxFuture<'a, Result<bool, Error>>;
}

/// A `HumanCheck` that passes every attempt, used when no Turnstile secret
/// is configured (local development, practice sessions).
pub struct NoopHumanCheck;

impl HumanCheck for NoopHumanCheck {
    fn verify<'a>(
        &'a self,
        _token: Option<&'a str>,
    ) -> futures_util::future::BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async { Ok(true) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_passes_a_missing_token() {
        assert!(NoopHumanCheck.verify(None).await.unwrap());
    }

    #[tokio::test]
    async fn noop_passes_any_supplied_token() {
        assert!(NoopHumanCheck.verify(Some("whatever")).await.unwrap());
    }
}
