//! OAuth token store
//!
//! Persists one [`TokenRecord`] per token type and owns the per-type locks
//! that serialize writers. Reads never take the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use crate::{
    error::{AppError, AppResult},
    storage::{InMemoryTokenStorage, RedisTokenStorage},
};

/// Default buffer subtracted from expiry to avoid racing server-side expiry
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(300);

/// Token type used by every CRM backend client
pub const OAUTH_TOKEN_TYPE: &str = "oauth";

/// Persisted credential set, unique on `token_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// True iff `now >= expires_at - safety_margin`
    pub fn is_expired_at(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(safety_margin).unwrap_or(chrono::Duration::zero());
        self.expires_at
            .checked_sub_signed(margin)
            .map_or(true, |refresh_at| now >= refresh_at)
    }
}

/// Storage backend behind the token store
pub enum TokenStoreBackend {
    Redis(Arc<RedisTokenStorage>),
    InMemory(Arc<InMemoryTokenStorage>),
}

impl TokenStoreBackend {
    async fn get(&self, token_type: &str) -> AppResult<Option<TokenRecord>> {
        match self {
            TokenStoreBackend::Redis(storage) => storage.get(token_type).await,
            TokenStoreBackend::InMemory(storage) => storage.get(token_type).await,
        }
    }

    async fn put(&self, record: &TokenRecord) -> AppResult<()> {
        match self {
            TokenStoreBackend::Redis(storage) => storage.put(record).await,
            TokenStoreBackend::InMemory(storage) => storage.put(record).await,
        }
    }

    async fn delete(&self, token_type: &str) -> AppResult<bool> {
        match self {
            TokenStoreBackend::Redis(storage) => storage.delete(token_type).await,
            TokenStoreBackend::InMemory(storage) => storage.delete(token_type).await,
        }
    }

    async fn token_types(&self) -> AppResult<Vec<String>> {
        match self {
            TokenStoreBackend::Redis(storage) => storage.token_types().await,
            TokenStoreBackend::InMemory(storage) => storage.token_types().await,
        }
    }

    async fn ping(&self) -> AppResult<()> {
        match self {
            TokenStoreBackend::Redis(storage) => storage.ping().await,
            TokenStoreBackend::InMemory(_) => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TokenStoreBackend::Redis(_) => "redis",
            TokenStoreBackend::InMemory(_) => "memory",
        }
    }
}

/// Credential lifecycle shared by all backend clients
pub struct TokenStore {
    backend: TokenStoreBackend,
    safety_margin: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TokenStore {
    pub fn new(backend: TokenStoreBackend, safety_margin: Duration) -> Self {
        Self {
            backend,
            safety_margin,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store with the default safety margin
    pub fn in_memory() -> Self {
        Self::new(
            TokenStoreBackend::InMemory(Arc::new(InMemoryTokenStorage::new())),
            DEFAULT_SAFETY_MARGIN,
        )
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Check the storage backend is reachable
    pub async fn ping(&self) -> AppResult<()> {
        self.backend.ping().await
    }

    fn key_lock(&self, token_type: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(token_type.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive write access to one token type
    pub async fn lock(&self, token_type: &str) -> OwnedMutexGuard<()> {
        self.key_lock(token_type).lock_owned().await
    }

    /// Upsert the record for `token_type`, expiring `expires_in` from now
    ///
    /// A `None` refresh token keeps the stored one; the provider's refresh
    /// responses usually omit it.
    #[instrument(skip(self, access_token, refresh_token))]
    pub async fn save(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: Duration,
        token_type: &str,
    ) -> AppResult<TokenRecord> {
        let _guard = self.lock(token_type).await;
        self.save_locked(access_token, refresh_token, expires_in, token_type)
            .await
    }

    /// [`save`](Self::save) for callers already holding the type's lock
    pub(crate) async fn save_locked(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: Duration,
        token_type: &str,
    ) -> AppResult<TokenRecord> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(expires_in)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "token lifetime of {}s is out of range",
                    expires_in.as_secs()
                ))
            })?;
        let existing = self.backend.get(token_type).await?;

        let (created_at, updated_at, stored_refresh) = match &existing {
            Some(record) => {
                // updated_at strictly increases even if the clock has not moved
                let updated_at = if now > record.updated_at {
                    now
                } else {
                    record.updated_at + chrono::Duration::microseconds(1)
                };
                (record.created_at, updated_at, record.refresh_token.clone())
            }
            None => (now, now, None),
        };

        let record = TokenRecord {
            token_type: token_type.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string).or(stored_refresh),
            expires_at,
            created_at,
            updated_at,
        };
        self.backend.put(&record).await?;

        debug!(
            token_type = %token_type,
            expires_at = %record.expires_at,
            created = existing.is_none(),
            "Token record saved"
        );
        Ok(record)
    }

    pub async fn get(&self, token_type: &str) -> AppResult<Option<TokenRecord>> {
        self.backend.get(token_type).await
    }

    /// Whether the token needs refreshing; a missing record counts as expired
    pub async fn is_expired(&self, token_type: &str) -> AppResult<bool> {
        Ok(match self.backend.get(token_type).await? {
            Some(record) => record.is_expired_at(Utc::now(), self.safety_margin),
            None => true,
        })
    }

    pub async fn delete(&self, token_type: &str) -> AppResult<bool> {
        let _guard = self.lock(token_type).await;
        let removed = self.backend.delete(token_type).await?;
        if removed {
            info!(token_type = %token_type, "Token record deleted");
        }
        Ok(removed)
    }

    /// Remove records whose access token expired more than `grace` ago
    ///
    /// Token types whose lock is held (a refresh or save in flight) are
    /// skipped. Safe to run concurrently with normal traffic.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self, grace: Duration) -> AppResult<usize> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let mut removed = 0;

        for token_type in self.backend.token_types().await? {
            let lock = self.key_lock(&token_type);
            let Ok(_guard) = lock.try_lock() else {
                debug!(token_type = %token_type, "Token in use, skipping cleanup");
                continue;
            };

            // Re-read under the lock: a writer may have refreshed it meanwhile
            let stale = match self.backend.get(&token_type).await? {
                Some(record) => Utc::now() >= record.expires_at + grace,
                None => false,
            };
            if stale && self.backend.delete(&token_type).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Cleaned up expired token records");
        }
        Ok(removed)
    }
}
