//! Cooperative cancellation for one session.
//!
//! A [`SessionToken`] ORs a process-local source, an optional external
//! source, and an optional deadline. It is only checked at loop boundaries;
//! in-flight I/O is never interrupted by it.

use std::future::pending;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a token reports cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// [`SessionToken::cancel`] was called.
    Explicit,
    /// The externally supplied source fired.
    External,
    /// The deadline passed.
    Timeout,
    /// Neither a local nor an external source was configured.
    Unconfigured,
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    local: Option<CancellationToken>,
    external: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionToken {
    /// Token with a local source only.
    pub fn new() -> Self {
        Self {
            local: Some(CancellationToken::new()),
            external: None,
            deadline: None,
        }
    }

    /// Token cancelled by either a local source or `external`.
    pub fn with_external(external: CancellationToken) -> Self {
        Self {
            external: Some(external),
            ..Self::new()
        }
    }

    /// Token driven by `external` alone; [`cancel`](Self::cancel) is a no-op.
    pub fn external_only(external: CancellationToken) -> Self {
        Self {
            local: None,
            external: Some(external),
            deadline: None,
        }
    }

    /// Token with no source at all. It reports cancelled from the start.
    pub fn unconfigured() -> Self {
        Self {
            local: None,
            external: None,
            deadline: None,
        }
    }

    /// Also cancel once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Cancel the local source.
    pub fn cancel(&self) {
        if let Some(local) = &self.local {
            local.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Reason for cancellation, or `None` while still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.local.is_none() && self.external.is_none() {
            return Some(CancelReason::Unconfigured);
        }
        if self.local.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(CancelReason::Explicit);
        }
        if self.external.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(CancelReason::External);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(CancelReason::Timeout);
        }
        None
    }

    /// Resolve once any source fires.
    pub async fn cancelled(&self) -> CancelReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        let local = async {
            match &self.local {
                Some(t) => t.cancelled().await,
                None => pending().await,
            }
        };
        let external = async {
            match &self.external {
                Some(t) => t.cancelled().await,
                None => pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => pending().await,
            }
        };
        tokio::select! {
            _ = local => CancelReason::Explicit,
            _ = external => CancelReason::External,
            _ = deadline => CancelReason::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_live() {
        let token = SessionToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Explicit));
    }

    #[test]
    fn test_unconfigured_is_cancelled() {
        let token = SessionToken::unconfigured();
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Unconfigured));
    }

    #[test]
    fn test_external_source() {
        let external = CancellationToken::new();
        let token = SessionToken::with_external(external.clone());
        assert!(!token.is_cancelled());
        external.cancel();
        assert_eq!(token.reason(), Some(CancelReason::External));

        let only = SessionToken::external_only(CancellationToken::new());
        only.cancel();
        assert!(!only.is_cancelled(), "no local source to cancel");
    }

    #[test]
    fn test_clones_share_state() {
        let token = SessionToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let token = SessionToken::new().with_timeout(Duration::from_secs(30));
        assert!(!token.is_cancelled());
        assert_eq!(token.cancelled().await, CancelReason::Timeout);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_external() {
        let external = CancellationToken::new();
        let token = SessionToken::with_external(external.clone());
        let waiter = tokio::spawn(async move { token.cancelled().await });
        external.cancel();
        assert_eq!(waiter.await.unwrap(), CancelReason::External);
    }
}
