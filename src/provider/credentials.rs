//! # Credential Cache
//!
//! Short-lived store credentials (Vault client tokens, Infisical access
//! tokens, GCP OAuth2 tokens) cached in memory and refreshed ahead of
//! expiry. Nothing here is ever persisted.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::crd::EnvSecretRef;
use crate::provider::StoreError;

/// A credential freshly issued by an auth endpoint
#[derive(Debug)]
pub struct IssuedToken {
    pub token: Zeroizing<String>,
    /// Lifetime; `None` for credentials that do not expire
    pub ttl: Option<Duration>,
}

struct CachedToken {
    token: Zeroizing<String>,
    refresh_at: Option<Instant>,
}

/// Single-slot credential cache
///
/// Concurrent callers that find the cache empty or stale wait on the same
/// lock, so at most one login request is in flight per store.
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
    refresh_margin: Duration,
}

impl TokenCache {
    #[must_use]
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            refresh_margin,
        }
    }

    /// Return the cached credential, calling `issue` when it is missing or
    /// within the refresh margin of its expiry
    pub async fn get_or_refresh<F, Fut>(&self, issue: F) -> Result<Zeroizing<String>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IssuedToken, StoreError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.refresh_at.is_none_or(|at| Instant::now() < at) {
                return Ok(cached.token.clone());
            }
            tracing::debug!("Cached store credential is about to expire, refreshing");
        }

        let issued = issue().await?;
        let refresh_at = issued
            .ttl
            .map(|ttl| Instant::now() + ttl.saturating_sub(self.refresh_margin));
        let token = issued.token.clone();
        *slot = Some(CachedToken {
            token: issued.token,
            refresh_at,
        });
        Ok(token)
    }

    /// Drop the cached credential so the next call logs in again
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

/// Resolve a credential reference from the environment or a mounted file
pub async fn resolve_secret_ref(reference: &EnvSecretRef) -> Result<Zeroizing<String>, StoreError> {
    match (&reference.env, &reference.file) {
        (Some(var), None) => std::env::var(var)
            .map(|value| Zeroizing::new(value.trim().to_string()))
            .map_err(|e| StoreError::unauthenticated(format!("credential env var {var}: {e}"))),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .map(|value| Zeroizing::new(value.trim().to_string()))
            .map_err(|e| StoreError::unauthenticated(format!("credential file {path}: {e}"))),
        _ => Err(StoreError::invalid_input(
            "credential reference must set exactly one of env or file",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn issued(token: &str, ttl: Option<Duration>) -> IssuedToken {
        IssuedToken {
            token: Zeroizing::new(token.to_string()),
            ttl,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cached_until_margin() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = cache
                .get_or_refresh(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(issued("t1", Some(Duration::from_secs(120))))
                })
                .await
                .unwrap();
            assert_eq!(token.as_str(), "t1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 120s TTL minus 60s margin: refreshed after 60s
        tokio::time::advance(Duration::from_secs(61)).await;
        let token = cache
            .get_or_refresh(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(issued("t2", Some(Duration::from_secs(120))))
            })
            .await
            .unwrap();
        assert_eq!(token.as_str(), "t2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let cache = TokenCache::new(Duration::from_secs(0));
        cache
            .get_or_refresh(|| async { Ok(issued("static", None)) })
            .await
            .unwrap();
        cache.invalidate().await;
        let token = cache
            .get_or_refresh(|| async { Ok(issued("fresh", None)) })
            .await
            .unwrap();
        assert_eq!(token.as_str(), "fresh");
    }

    #[tokio::test]
    async fn test_resolve_secret_ref_requires_one_source() {
        let err = resolve_secret_ref(&EnvSecretRef::default()).await.unwrap_err();
        assert_eq!(err.kind, crate::provider::StoreErrorKind::InvalidInput);
    }
}
