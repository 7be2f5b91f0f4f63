//! Bearer credential lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetlink_core::config::SessionConfig;

use super::authenticator::Authenticator;
use super::error::AuthError;

/// A bearer token and its absolute expiry. Replaced wholesale on every
/// successful authentication.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Remaining lifetime is below `buffer`.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
        self.expires_at.signed_duration_since(now) < buffer
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens for a relay host.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a usable token for `host`, refreshing first if needed.
    async fn token_for_host(&self, host: &str) -> Result<String, AuthError>;
}

/// Token manager timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct TokenTiming {
    /// Refresh when less than this much lifetime remains.
    pub refresh_buffer: Duration,
    /// Minimum spacing between refresh attempts; also the auto-refresh tick.
    pub min_refresh_interval: Duration,
}

impl Default for TokenTiming {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for TokenTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            refresh_buffer: config.refresh_buffer(),
            min_refresh_interval: config.min_refresh_interval(),
        }
    }
}

/// Owns one bearer credential and keeps it fresh.
pub struct TokenManager {
    authenticator: Arc<dyn Authenticator>,
    timing: TokenTiming,
    credential: RwLock<Option<Credential>>,
    last_attempt: Mutex<Option<Instant>>,
    /// Serializes refreshes so concurrent callers trigger one round trip.
    refresh_gate: tokio::sync::Mutex<()>,
    auto_refresh: Mutex<Option<CancellationToken>>,
}

impl TokenManager {
    pub fn new(authenticator: Arc<dyn Authenticator>, timing: TokenTiming) -> Self {
        Self {
            authenticator,
            timing,
            credential: RwLock::new(None),
            last_attempt: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            auto_refresh: Mutex::new(None),
        }
    }

    /// Create with default timing (5 min buffer, 1 min minimum interval).
    pub fn with_defaults(authenticator: Arc<dyn Authenticator>) -> Self {
        Self::new(authenticator, TokenTiming::default())
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    /// Seed the manager with a credential obtained elsewhere (e.g. a cache).
    pub fn set_credential(&self, credential: Credential) {
        *self.credential.write() = Some(credential);
    }

    pub fn clear(&self) {
        *self.credential.write() = None;
    }

    /// True if no credential is held or its remaining lifetime is below the
    /// refresh buffer.
    pub fn needs_refresh(&self) -> bool {
        self.credential
            .read()
            .as_ref()
            .is_none_or(|c| c.needs_refresh_at(Utc::now(), self.timing.refresh_buffer))
    }

    /// The current token, if one is held and not expired.
    pub fn current_token(&self) -> Result<String, AuthError> {
        let guard = self.credential.read();
        let credential = guard.as_ref().ok_or(AuthError::NoCredential)?;
        if credential.is_expired() {
            return Err(AuthError::Expired {
                expires_at: credential.expires_at,
            });
        }
        Ok(credential.token.clone())
    }

    /// Authenticate unconditionally and replace the credential.
    pub async fn authenticate(&self) -> Result<Credential, AuthError> {
        let _gate = self.refresh_gate.lock().await;
        *self.last_attempt.lock() = Some(Instant::now());
        self.authenticate_locked().await
    }

    /// Refresh the credential if it is stale, at most once per minimum
    /// interval. A rate-limited call is a successful no-op.
    pub async fn ensure_valid(&self) -> Result<(), AuthError> {
        if !self.needs_refresh() {
            return Ok(());
        }
        let _gate = self.refresh_gate.lock().await;
        if !self.needs_refresh() {
            return Ok(());
        }
        {
            let mut last = self.last_attempt.lock();
            if let Some(at) = *last
                && at.elapsed() < self.timing.min_refresh_interval
            {
                debug!("Token refresh attempted recently, skipping");
                return Ok(());
            }
            *last = Some(Instant::now());
        }
        self.authenticate_locked().await.map(|_| ())
    }

    async fn authenticate_locked(&self) -> Result<Credential, AuthError> {
        match self.authenticator.authenticate().await {
            Ok(credential) => {
                info!(expires_at = %credential.expires_at, "Authenticated with cloud");
                *self.credential.write() = Some(credential.clone());
                Ok(credential)
            }
            Err(e) => {
                warn!(error = %e, "Authentication failed");
                Err(e)
            }
        }
    }

    /// Start the background refresh loop. Returns `false` if it is already
    /// running. The loop exits when `ctx` is cancelled or
    /// [`stop_auto_refresh`](Self::stop_auto_refresh) is called.
    pub fn start_auto_refresh(self: &Arc<Self>, ctx: &CancellationToken) -> bool {
        let stop = {
            let mut slot = self.auto_refresh.lock();
            if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return false;
            }
            let stop = ctx.child_token();
            *slot = Some(stop.clone());
            stop
        };

        let this = Arc::clone(self);
        let tick = self.timing.min_refresh_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = timer.tick() => {
                        tokio::select! {
                            () = stop.cancelled() => break,
                            result = this.ensure_valid() => {
                                if let Err(e) = result {
                                    warn!(error = %e, "Background token refresh failed");
                                }
                            }
                        }
                    }
                }
            }
            debug!("Token auto refresh stopped");
        });
        info!(tick_secs = tick.as_secs(), "Token auto refresh started");
        true
    }

    /// Stop the background refresh loop. Returns `false` if it was not running.
    pub fn stop_auto_refresh(&self) -> bool {
        match self.auto_refresh.lock().take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.auto_refresh
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn token_for_host(&self, _host: &str) -> Result<String, AuthError> {
        self.ensure_valid().await?;
        self.current_token()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Authenticator returning a token with a fixed lifetime, or failing.
    pub(crate) struct FakeAuthenticator {
        pub calls: AtomicUsize,
        pub lifetime: chrono::Duration,
        pub fail: bool,
    }

    impl FakeAuthenticator {
        pub(crate) fn lasting(lifetime: chrono::Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime: chrono::Duration::zero(),
                fail: true,
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for FakeAuthenticator {
        async fn authenticate(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AuthError::Rejected {
                    status: 401,
                    body: "denied".into(),
                });
            }
            Ok(Credential::new(format!("token-{n}"), Utc::now() + self.lifetime))
        }
    }

    fn manager(auth: &Arc<FakeAuthenticator>) -> Arc<TokenManager> {
        Arc::new(TokenManager::with_defaults(
            Arc::clone(auth) as Arc<dyn Authenticator>
        ))
    }

    #[test]
    fn needs_refresh_lifecycle() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let mgr = manager(&auth);
        assert!(mgr.needs_refresh());

        mgr.set_credential(Credential::new("t", Utc::now() + chrono::Duration::hours(1)));
        assert!(!mgr.needs_refresh());

        mgr.set_credential(Credential::new("t", Utc::now() + chrono::Duration::minutes(4)));
        assert!(mgr.needs_refresh());
    }

    #[test]
    fn credential_expiry_and_redaction() {
        let now = Utc::now();
        let credential = Credential::new("secret-token", now - chrono::Duration::seconds(1));
        assert!(credential.is_expired_at(now));
        assert!(!format!("{credential:?}").contains("secret-token"));
    }

    #[test]
    fn current_token_errors() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let mgr = manager(&auth);
        assert!(matches!(mgr.current_token(), Err(AuthError::NoCredential)));

        mgr.set_credential(Credential::new("old", Utc::now() - chrono::Duration::minutes(1)));
        assert!(matches!(mgr.current_token(), Err(AuthError::Expired { .. })));
    }

    #[tokio::test]
    async fn ensure_valid_is_noop_when_fresh() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let mgr = manager(&auth);
        mgr.set_credential(Credential::new("t", Utc::now() + chrono::Duration::hours(1)));

        mgr.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_valid_is_rate_limited() {
        // Tokens that are always inside the refresh buffer.
        let auth = FakeAuthenticator::lasting(chrono::Duration::minutes(2));
        let mgr = manager(&auth);

        mgr.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 1);
        assert_eq!(mgr.current_token().unwrap(), "token-1");

        mgr.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        mgr.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 2);
        assert_eq!(mgr.current_token().unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_still_counts_toward_interval() {
        let auth = FakeAuthenticator::failing();
        let mgr = manager(&auth);

        let err = mgr.ensure_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 401, .. }));

        mgr.ensure_valid().await.unwrap();
        assert_eq!(auth.calls(), 1);
        assert!(mgr.credential().is_none());
    }

    #[tokio::test]
    async fn explicit_authenticate_ignores_rate_limit() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let mgr = manager(&auth);
        mgr.authenticate().await.unwrap();
        let credential = mgr.authenticate().await.unwrap();
        assert_eq!(credential.token, "token-2");
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn token_source_refreshes_first() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::hours(1));
        let mgr = manager(&auth);
        let token = mgr.token_for_host("any-host").await.unwrap();
        assert_eq!(token, "token-1");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_start_stop_idempotent() {
        let auth = FakeAuthenticator::lasting(chrono::Duration::minutes(2));
        let mgr = manager(&auth);
        let ctx = CancellationToken::new();

        assert!(mgr.start_auto_refresh(&ctx));
        assert!(!mgr.start_auto_refresh(&ctx));
        assert!(mgr.is_auto_refreshing());

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(auth.calls() >= 1);

        assert!(mgr.stop_auto_refresh());
        assert!(!mgr.stop_auto_refresh());
        assert!(!mgr.is_auto_refreshing());

        let calls = auth.calls();
        tokio::time::sleep(Duration::from_secs(300)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(auth.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_exits_with_context_and_swallows_errors() {
        let auth = FakeAuthenticator::failing();
        let mgr = manager(&auth);
        let ctx = CancellationToken::new();
        assert!(mgr.start_auto_refresh(&ctx));

        tokio::time::sleep(Duration::from_secs(125)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(auth.calls() >= 1);

        ctx.cancel();
        assert!(!mgr.is_auto_refreshing());
        // A cancelled context leaves the manager restartable.
        let fresh = CancellationToken::new();
        assert!(mgr.start_auto_refresh(&fresh));
        fresh.cancel();
    }
}
