//! Credential lifecycle management.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use skyferry_common::{Error, Result};

use super::credential::{Credential, ProviderKind, RefreshedToken};
use super::store::TokenStore;

/// Something that can mint a new access token from a refresh token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Call the provider's token endpoint.
    ///
    /// # Errors
    /// - `AuthenticationRejected` if the provider refused the refresh token
    /// - `Network` on transport failures
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken>;
}

/// Produces always-valid bearer tokens for one provider.
///
/// The in-memory credential is an immutable `Arc<Credential>`; a refresh
/// swaps in a new value. Refreshing happens under the write lock, so
/// concurrent callers facing an expired token wait for one in-flight refresh
/// instead of starting their own.
pub struct CredentialManager {
    provider: ProviderKind,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    cached: RwLock<Option<Arc<Credential>>>,
}

impl CredentialManager {
    /// Create a manager for `provider`.
    pub fn new(
        provider: ProviderKind,
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            provider,
            store,
            refresher,
            cached: RwLock::new(None),
        }
    }

    /// Provider this manager serves.
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Postconditions
    /// - Returns a non-expired access token
    ///
    /// # Errors
    /// - `AuthenticationMissing` if nothing is stored or no refresh token exists
    /// - `AuthenticationRejected` if the refresh was denied
    pub async fn access_token(&self) -> Result<String> {
        let credential = self.credential().await?;
        Ok(credential.access_token.clone())
    }

    /// Get the current valid credential, refreshing if necessary.
    pub async fn credential(&self) -> Result<Arc<Credential>> {
        {
            let cached = self.cached.read().await;
            if let Some(credential) = cached.as_ref() {
                if !credential.is_expired() {
                    return Ok(credential.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(credential) = cached.as_ref() {
            if !credential.is_expired() {
                return Ok(credential.clone());
            }
        }

        let key = self.provider.store_key();
        let stored = self.store.load(key).await?.ok_or_else(|| {
            Error::AuthenticationMissing(format!(
                "No {} credential stored. Please sign in again",
                self.provider
            ))
        })?;

        // Another process may already have refreshed it
        if !stored.is_expired() {
            debug!(provider = %self.provider, "Using stored credential");
            let credential = Arc::new(stored);
            *cached = Some(credential.clone());
            return Ok(credential);
        }

        let refresh_token = stored.refresh_token.as_deref().ok_or_else(|| {
            Error::AuthenticationMissing(format!(
                "The {} credential has expired and carries no refresh token",
                self.provider
            ))
        })?;

        info!(provider = %self.provider, "Refreshing expired access token");

        let token = match self.refresher.refresh(refresh_token).await {
            Ok(token) => token,
            Err(err) => {
                warn!(provider = %self.provider, "Token refresh failed: {}", err);
                return Err(err);
            }
        };

        let renewed = stored.renewed(&token, Utc::now());
        self.store.save(key, &renewed).await?;

        let credential = Arc::new(renewed);
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Persist a credential obtained through the consent flow.
    ///
    /// A previously stored refresh token survives if the new credential has
    /// none.
    pub async fn store_consented(&self, credential: Credential) -> Result<()> {
        let key = self.provider.store_key();
        let previous = self.store.load(key).await?;
        let merged = credential.merged_over(previous.as_ref());

        self.store.save(key, &merged).await?;
        *self.cached.write().await = Some(Arc::new(merged));

        info!(provider = %self.provider, "Stored new credential");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    /// Store wrapper that counts writes.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryTokenStore,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl TokenStore for CountingStore {
        async fn load(&self, key: &str) -> Result<Option<Credential>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, credential: &Credential) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, credential).await
        }
    }

    struct FakeRefresher {
        calls: AtomicUsize,
        reject: bool,
        delay: StdDuration,
    }

    impl FakeRefresher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reject: false,
                delay: StdDuration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.reject {
                return Err(Error::AuthenticationRejected("invalid_grant".to_string()));
            }
            assert_eq!(refresh_token, "refresh");
            Ok(RefreshedToken {
                access_token: format!("fresh-{}", n),
                refresh_token: None,
                expires_in: StdDuration::from_secs(3600),
            })
        }
    }

    fn expired() -> Credential {
        Credential {
            access_token: "stale".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Utc::now() - Duration::hours(1),
        }
    }

    async fn seeded(credential: Credential) -> Arc<CountingStore> {
        let store = Arc::new(CountingStore::default());
        store
            .inner
            .save(ProviderKind::Google.store_key(), &credential)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let manager = CredentialManager::new(
            ProviderKind::Google,
            Arc::new(MemoryTokenStore::new()),
            Arc::new(FakeRefresher::new()),
        );

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationMissing(_)));
    }

    #[tokio::test]
    async fn test_valid_stored_credential_is_not_refreshed() {
        let store = seeded(Credential {
            access_token: "valid".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
        })
        .await;
        let refresher = Arc::new(FakeRefresher::new());
        let manager = CredentialManager::new(ProviderKind::Google, store.clone(), refresher.clone());

        assert_eq!(manager.access_token().await.unwrap(), "valid");
        assert_eq!(manager.access_token().await.unwrap(), "valid");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshes_once_and_persists() {
        let store = seeded(expired()).await;
        let refresher = Arc::new(FakeRefresher::new());
        let manager = CredentialManager::new(ProviderKind::Google, store.clone(), refresher.clone());

        let token = manager.access_token().await.unwrap();

        assert_eq!(token, "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);

        let persisted = store
            .load(ProviderKind::Google.store_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.access_token, "fresh-1");
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh"));
        assert!(!persisted.is_expired());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let store = seeded(expired()).await;
        let refresher = Arc::new(FakeRefresher {
            delay: StdDuration::from_millis(50),
            ..FakeRefresher::new()
        });
        let manager = Arc::new(CredentialManager::new(
            ProviderKind::Google,
            store.clone(),
            refresher.clone(),
        ));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move { manager.access_token().await }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "fresh-1");
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh() {
        let store = seeded(expired()).await;
        let refresher = Arc::new(FakeRefresher {
            reject: true,
            ..FakeRefresher::new()
        });
        let manager = CredentialManager::new(ProviderKind::Google, store.clone(), refresher);

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationRejected(_)));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_missing() {
        let store = seeded(Credential {
            access_token: "stale".to_string(),
            refresh_token: None,
            expires_at: Utc::now() - Duration::hours(1),
        })
        .await;
        let manager =
            CredentialManager::new(ProviderKind::Google, store, Arc::new(FakeRefresher::new()));

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationMissing(_)));
    }

    #[tokio::test]
    async fn test_store_consented_keeps_previous_refresh_token() {
        let store = seeded(expired()).await;
        let manager =
            CredentialManager::new(ProviderKind::Google, store.clone(), Arc::new(FakeRefresher::new()));

        manager
            .store_consented(Credential {
                access_token: "consented".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await
            .unwrap();

        let persisted = store
            .load(ProviderKind::Google.store_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.access_token, "consented");
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(manager.access_token().await.unwrap(), "consented");
    }
}
