use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::errors::Result;

/// Kalshi session tokens are refreshed well before the exchange drops them.
const AUTH_TTL_SECS: u64 = 25 * 60;

#[derive(Clone, Debug)]
pub(crate) struct Session {
    pub(crate) token: String,
    pub(crate) member_id: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AuthCache {
    inner: Arc<Mutex<AuthCacheState>>,
}

impl Default for AuthCache {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuthCacheState::default())),
        }
    }
}

#[derive(Default)]
struct AuthCacheState {
    session: Option<Session>,
    expires_at: Option<Instant>,
}

impl AuthCacheState {
    fn is_valid(&self) -> bool {
        matches!(
            (&self.session, self.expires_at),
            (Some(_), Some(exp)) if Instant::now() < exp
        )
    }

    fn clear(&mut self) {
        self.session = None;
        self.expires_at = None;
    }

    fn update(&mut self, session: Session, expires_at: Instant) {
        self.session = Some(session);
        self.expires_at = Some(expires_at);
    }
}

impl AuthCache {
    /// Returns the cached token, or runs `login` and caches its session.
    ///
    /// The lock is held across `login`, so concurrent callers that find the
    /// cache empty wait for a single login instead of starting their own.
    /// `rejected` is a token the venue just refused; it is replaced even if
    /// it has not expired yet, unless another caller already replaced it.
    pub(crate) async fn token_or_login<F, Fut>(
        &self,
        rejected: Option<&str>,
        login: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session>>,
    {
        let mut guard = self.inner.lock().await;
        if guard.is_valid() {
            if let Some(session) = &guard.session {
                if rejected != Some(session.token.as_str()) {
                    return Ok(session.token.clone());
                }
            }
        }
        guard.clear();
        let session = login().await?;
        let token = session.token.clone();
        guard.update(session, Instant::now() + Duration::from_secs(AUTH_TTL_SECS));
        Ok(token)
    }

    /// Drops the cached session and returns it, if any.
    pub(crate) async fn take(&self) -> Option<Session> {
        let mut guard = self.inner.lock().await;
        let session = guard.session.take();
        guard.clear();
        session
    }

    pub(crate) async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        guard.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::errors::Error;

    fn session(token: &str) -> Session {
        Session {
            token: token.into(),
            member_id: Some("m1".into()),
        }
    }

    #[tokio::test]
    async fn test_cached_token_skips_login() {
        let cache = AuthCache::default();
        let counter = AtomicUsize::new(0);
        let logins = &counter;
        let login = move || async move {
            logins.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(session("abc"))
        };
        assert_eq!(cache.token_or_login(None, login).await.unwrap(), "abc");
        assert_eq!(cache.token_or_login(None, login).await.unwrap(), "abc");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        cache.token_or_login(None, login).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let cache = AuthCache::default();
        let counter = AtomicUsize::new(0);
        let logins = &counter;
        let login = move || async move {
            logins.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Error>(session("shared"))
        };
        let (a, b, c) = tokio::join!(
            cache.token_or_login(None, login),
            cache.token_or_login(None, login),
            cache.token_or_login(None, login),
        );
        assert_eq!(a.unwrap(), "shared");
        assert_eq!(b.unwrap(), "shared");
        assert_eq!(c.unwrap(), "shared");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_replaced_once() {
        let cache = AuthCache::default();
        let counter = AtomicUsize::new(0);
        let logins = &counter;
        let login = move || async move {
            let n = logins.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(session(&format!("t{n}")))
        };
        let first = cache.token_or_login(None, login).await.unwrap();
        let fresh = cache.token_or_login(Some(first.as_str()), login).await.unwrap();
        assert_eq!(fresh, "t1");
        // a second caller holding the same stale token reuses the new one
        assert_eq!(cache.token_or_login(Some(first.as_str()), login).await.unwrap(), "t1");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_cache_empty() {
        let cache = AuthCache::default();
        let err = cache
            .token_or_login(None, || async { Err(Error::Auth("denied".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(cache.take().await.is_none());
    }

    #[tokio::test]
    async fn test_take_clears_session() {
        let cache = AuthCache::default();
        cache
            .token_or_login(None, || async { Ok::<_, Error>(session("abc")) })
            .await
            .unwrap();
        let taken = cache.take().await.unwrap();
        assert_eq!(taken.token, "abc");
        assert!(cache.take().await.is_none());
    }
}
