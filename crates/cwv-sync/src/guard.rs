use std::collections::HashSet;
use std::sync::Arc;

use cwv_core::PipelineError;
use tokio::sync::Mutex;

/// Refuses a second run for the same trigger token.
///
/// Claims are never released: the guard only protects against the same
/// trigger firing twice within one process, not against later triggers.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim(&self, token: &str) -> Result<(), PipelineError> {
        let mut claimed = self.claimed.lock().await;
        if !claimed.insert(token.to_string()) {
            return Err(PipelineError::AlreadyRunning(token.to_string()));
        }
        Ok(())
    }

    pub async fn is_claimed(&self, token: &str) -> bool {
        self.claimed.lock().await.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_for_same_token_is_refused() {
        let guard = RunGuard::new();
        guard.claim("cli").await.unwrap();
        let err = guard.claim("cli").await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning(t) if t == "cli"));
        assert!(guard.is_claimed("cli").await);
    }

    #[tokio::test]
    async fn clones_share_claims_and_distinct_tokens_pass() {
        let guard = RunGuard::new();
        let other = guard.clone();
        guard.claim("cron:2026-03-01T06:00").await.unwrap();
        assert!(other.claim("cron:2026-03-01T06:00").await.is_err());
        other.claim("cron:2026-03-02T06:00").await.unwrap();
    }
}
