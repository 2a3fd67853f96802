//! Token store and refresh coordinator.
//!
//! Holds the current access/refresh pair and decides, under an async
//! mutex, whether an auth failure warrants a network refresh. When many
//! in-flight requests see a 401 at once only the first one refreshes; the
//! rest observe the new token generation and simply retry.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::callbacks::{CallbackHandle, CallbackRegistry};
use crate::error::Error;

/// Listener invoked with the new refresh token after every refresh.
pub type RefreshListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Response body of `POST /oauth/token`.
#[derive(Debug, Deserialize)]
#[serde(from = "RawTokenGrant")]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Absent when the server does not rotate refresh tokens.
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct RawTokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl From<RawTokenGrant> for TokenGrant {
    fn from(raw: RawTokenGrant) -> Self {
        Self {
            access_token: SecretString::from(raw.access_token),
            refresh_token: raw.refresh_token.map(SecretString::from),
            expires_in: raw.expires_in,
        }
    }
}

/// What the coordinator did for a caller that reported an auth failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller performed the network refresh.
    Refreshed,
    /// Another caller refreshed after this caller's attempt was sent.
    AlreadyRefreshed,
    /// The last refresh is inside the freshness window; nothing was done.
    Fresh,
}

#[derive(Default)]
struct TokenState {
    access_token: Option<SecretString>,
    refresh_token: Option<SecretString>,
    last_refreshed_at: Option<Instant>,
    expires_at: Option<DateTime<Utc>>,
    generation: u64,
}

/// Token snapshot taken right before a request attempt.
#[derive(Clone)]
pub(crate) struct TokenSnapshot {
    pub access_token: Option<SecretString>,
    pub generation: u64,
}

pub(crate) struct TokenStore {
    state: RwLock<TokenState>,
    refresh_lock: Mutex<()>,
    listeners: CallbackRegistry<RefreshListener>,
    refresh_window: Duration,
}

impl TokenStore {
    pub(crate) fn new(refresh_window: Duration) -> Self {
        Self {
            state: RwLock::new(TokenState::default()),
            refresh_lock: Mutex::new(()),
            listeners: CallbackRegistry::default(),
            refresh_window,
        }
    }

    // ── Reads (never block on the refresh lock) ──────────────────────

    pub(crate) fn access_token(&self) -> Option<SecretString> {
        self.read(|s| s.access_token.clone())
    }

    pub(crate) fn refresh_token(&self) -> Option<SecretString> {
        self.read(|s| s.refresh_token.clone())
    }

    pub(crate) fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.expires_at)
    }

    pub(crate) fn snapshot(&self) -> TokenSnapshot {
        self.read(|s| TokenSnapshot {
            access_token: s.access_token.clone(),
            generation: s.generation,
        })
    }

    fn generation(&self) -> u64 {
        self.read(|s| s.generation)
    }

    fn refreshed_within(&self, window: Duration) -> bool {
        self.read(|s| s.last_refreshed_at)
            .is_some_and(|at| at.elapsed() < window)
    }

    fn read<T>(&self, f: impl FnOnce(&TokenState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Install a grant and return the refresh token now in effect.
    ///
    /// `fallback` replaces the stored refresh token when the grant does not
    /// carry one.
    fn install(&self, grant: TokenGrant, fallback: Option<SecretString>) -> Option<SecretString> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.access_token = Some(grant.access_token);
        if let Some(refresh_token) = grant.refresh_token.or(fallback) {
            state.refresh_token = Some(refresh_token);
        }
        state.last_refreshed_at = Some(Instant::now());
        state.expires_at = grant
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        state.generation += 1;
        state.refresh_token.clone()
    }

    // ── Listeners ────────────────────────────────────────────────────

    pub(crate) fn add_listener(&self, listener: RefreshListener) -> CallbackHandle {
        self.listeners.add(listener)
    }

    fn notify(&self, refresh_token: &SecretString) {
        let listeners = self.listeners.snapshot();
        debug!(listeners = listeners.len(), "notifying refresh token listeners");
        for listener in listeners {
            listener(refresh_token.expose_secret());
        }
    }

    // ── Grants ───────────────────────────────────────────────────────

    /// Install the grant from an initial authentication.
    ///
    /// Serialized with refreshes; listeners are not notified. When the
    /// response carries no refresh token, `presented_refresh_token` (the one
    /// the caller logged in with) is kept instead. Nothing is stored if the
    /// exchange fails.
    pub(crate) async fn authenticate<F, Fut>(
        &self,
        presented_refresh_token: Option<SecretString>,
        exchange: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenGrant, Error>>,
    {
        let _guard = self.refresh_lock.lock().await;
        let grant = exchange().await?;
        self.install(grant, presented_refresh_token);
        Ok(())
    }

    /// Coordinated refresh.
    ///
    /// With `observed = Some(generation)` the caller is reacting to an auth
    /// failure on a request sent with that token generation: the refresh is
    /// skipped if someone else already refreshed since, or if the last
    /// refresh is within the freshness window. With `observed = None` the
    /// refresh always happens.
    ///
    /// Listeners are notified before this returns. On failure the stored
    /// tokens are untouched.
    pub(crate) async fn refresh<F, Fut>(
        &self,
        observed: Option<u64>,
        exchange: F,
    ) -> Result<RefreshOutcome, Error>
    where
        F: FnOnce(SecretString) -> Fut,
        Fut: Future<Output = Result<TokenGrant, Error>>,
    {
        let _guard = self.refresh_lock.lock().await;

        if let Some(observed) = observed {
            if self.generation() != observed {
                debug!("token already refreshed by a concurrent request");
                return Ok(RefreshOutcome::AlreadyRefreshed);
            }
            if self.refreshed_within(self.refresh_window) {
                debug!(
                    window_ms = u64::try_from(self.refresh_window.as_millis()).unwrap_or(u64::MAX),
                    "token refreshed recently, reusing it"
                );
                return Ok(RefreshOutcome::Fresh);
            }
        }

        let refresh_token = self
            .refresh_token()
            .ok_or_else(|| Error::InvalidCredentials {
                message: "no refresh token available".into(),
            })?;

        info!("refreshing access token");
        let grant = exchange(refresh_token).await?;

        if let Some(new_refresh_token) = self.install(grant, None) {
            self.notify(&new_refresh_token);
        }
        Ok(RefreshOutcome::Refreshed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant {
            access_token: SecretString::from(access.to_owned()),
            refresh_token: Some(SecretString::from(refresh.to_owned())),
            expires_in: Some(3600),
        }
    }

    async fn logged_in_store(window: Duration, access: &str, refresh: &str) -> TokenStore {
        let store = TokenStore::new(window);
        store
            .authenticate(None, || async { Ok(grant(access, refresh)) })
            .await
            .unwrap();
        store
    }

    #[test]
    fn grant_without_refresh_token_deserializes() {
        let grant: TokenGrant = serde_json::from_value(serde_json::json!({
            "access_token": "A",
            "expires_in": 3600,
            "token_type": "Bearer"
        }))
        .unwrap();
        assert_eq!(grant.access_token.expose_secret(), "A");
        assert!(grant.refresh_token.is_none());
        assert_eq!(grant.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn rotation_keeps_old_refresh_token_when_none_returned() {
        let store = logged_in_store(Duration::ZERO, "A", "B").await;

        store
            .refresh(None, |_| async {
                Ok(TokenGrant {
                    access_token: SecretString::from("C".to_owned()),
                    refresh_token: None,
                    expires_in: None,
                })
            })
            .await
            .unwrap();

        assert_eq!(store.access_token().unwrap().expose_secret(), "C");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "B");
        assert!(store.expires_at().is_none());
    }

    #[tokio::test]
    async fn rejected_authentication_keeps_previous_tokens() {
        let store = logged_in_store(Duration::ZERO, "A", "B").await;

        let err = store
            .authenticate(Some(SecretString::from("bad".to_owned())), || async {
                Err(Error::InvalidCredentials {
                    message: "Unauthorized".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials { .. }));
        assert_eq!(store.access_token().unwrap().expose_secret(), "A");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "B");
    }

    #[tokio::test]
    async fn authentication_keeps_presented_refresh_token_when_none_returned() {
        let store = TokenStore::new(Duration::ZERO);
        store
            .authenticate(Some(SecretString::from("presented".to_owned())), || async {
                Ok(TokenGrant {
                    access_token: SecretString::from("A".to_owned()),
                    refresh_token: None,
                    expires_in: None,
                })
            })
            .await
            .unwrap();

        assert_eq!(store.refresh_token().unwrap().expose_secret(), "presented");
    }

    #[tokio::test]
    async fn tokens_absent_until_first_grant() {
        let store = TokenStore::new(Duration::from_secs(5));
        assert!(store.access_token().is_none());
        assert!(store.expires_at().is_none());

        store
            .authenticate(None, || async { Ok(grant("A", "B")) })
            .await
            .unwrap();

        assert_eq!(store.access_token().unwrap().expose_secret(), "A");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "B");
        assert!(store.expires_at().unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn concurrent_auth_failures_refresh_once() {
        let store = Arc::new(logged_in_store(Duration::ZERO, "old", "r0").await);
        let observed = store.snapshot().generation;

        let exchanges = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let exchanges = Arc::clone(&exchanges);
            tasks.push(tokio::spawn(async move {
                store
                    .refresh(Some(observed), |_| async move {
                        exchanges.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(grant("new", "r1"))
                    })
                    .await
            }));
        }

        let mut refreshed = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                RefreshOutcome::Refreshed => refreshed += 1,
                RefreshOutcome::AlreadyRefreshed => {}
                RefreshOutcome::Fresh => panic!("window is zero"),
            }
        }

        assert_eq!(refreshed, 1);
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().unwrap().expose_secret(), "new");
    }

    #[tokio::test]
    async fn recent_refresh_is_reused_inside_window() {
        let store = logged_in_store(Duration::from_secs(5), "A", "B").await;
        let observed = store.snapshot().generation;

        let exchanges = AtomicUsize::new(0);
        let outcome = store
            .refresh(Some(observed), |_| async {
                exchanges.fetch_add(1, Ordering::SeqCst);
                Ok(grant("C", "D"))
            })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Fresh);
        assert_eq!(exchanges.load(Ordering::SeqCst), 0);
        assert_eq!(store.access_token().unwrap().expose_secret(), "A");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_token_refreshes_after_window() {
        let store = logged_in_store(Duration::from_secs(5), "A", "B").await;
        let observed = store.snapshot().generation;

        tokio::time::advance(Duration::from_secs(6)).await;

        let outcome = store
            .refresh(Some(observed), |refresh| async move {
                assert_eq!(refresh.expose_secret(), "B");
                Ok(grant("C", "D"))
            })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(store.access_token().unwrap().expose_secret(), "C");
    }

    #[tokio::test]
    async fn failed_refresh_leaves_tokens_untouched() {
        let store = logged_in_store(Duration::ZERO, "A", "B").await;

        let err = store
            .refresh(None, |_| async {
                Err(Error::InvalidCredentials {
                    message: "revoked".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials { .. }));
        assert_eq!(store.access_token().unwrap().expose_secret(), "A");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "B");
    }

    #[tokio::test]
    async fn listeners_notified_before_refresh_returns() {
        let store = logged_in_store(Duration::ZERO, "A", "B").await;
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        store.add_listener(Arc::new(move |token: &str| {
            sink.lock().unwrap().push(token.to_owned());
        }));
        let sink = Arc::clone(&seen);
        let removed = store.add_listener(Arc::new(move |token: &str| {
            sink.lock().unwrap().push(format!("removed:{token}"));
        }));
        assert!(removed.remove());

        store
            .refresh(None, |_| async { Ok(grant("A", "fresh-refresh")) })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["fresh-refresh".to_owned()]);
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_is_invalid_credentials() {
        let store = TokenStore::new(Duration::ZERO);
        let err = store
            .refresh(None, |_| async { Ok(grant("A", "B")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials { .. }));
    }
}
