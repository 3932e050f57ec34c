//! Access token provider
//!
//! Hands out valid access tokens to the backend clients. Refreshes are
//! single-flight per token type: concurrent callers that find the token
//! expired queue on the type's lock, and only the first one actually calls
//! the refresher. The rest re-read the store and reuse its result.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, AppResult};

use super::{
    refresh::TokenRefresher,
    store::{TokenRecord, TokenStore},
};

pub struct TokenProvider {
    store: Arc<TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    token_type: String,
}

impl TokenProvider {
    pub fn new(
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        token_type: impl Into<String>,
    ) -> Self {
        Self {
            store,
            refresher,
            token_type: token_type.into(),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    fn is_fresh(&self, record: &TokenRecord) -> bool {
        !record.is_expired_at(Utc::now(), self.store.safety_margin())
    }

    /// A valid access token, refreshing proactively when near expiry
    pub async fn access_token(&self) -> AppResult<String> {
        if let Some(record) = self.store.get(&self.token_type).await? {
            if self.is_fresh(&record) {
                return Ok(record.access_token);
            }
        }

        let _guard = self.store.lock(&self.token_type).await;
        let record = self.store.get(&self.token_type).await?;
        match record {
            Some(record) if self.is_fresh(&record) => {
                debug!(token_type = %self.token_type, "Token refreshed by concurrent caller");
                Ok(record.access_token)
            }
            record => self.refresh_locked(record).await,
        }
    }

    /// Refresh after the upstream rejected `stale_token`
    ///
    /// If another caller already replaced the token, that replacement is
    /// returned without a second refresh.
    pub async fn refresh_after_rejection(&self, stale_token: &str) -> AppResult<String> {
        let _guard = self.store.lock(&self.token_type).await;
        let record = self.store.get(&self.token_type).await?;
        match record {
            Some(record) if record.access_token != stale_token && self.is_fresh(&record) => {
                debug!(token_type = %self.token_type, "Rejected token already replaced");
                Ok(record.access_token)
            }
            record => self.refresh_locked(record).await,
        }
    }

    /// Store a refresh token so the first call can obtain an access token
    ///
    /// Does nothing when a record already exists.
    pub async fn seed(&self, refresh_token: &str) -> AppResult<bool> {
        let _guard = self.store.lock(&self.token_type).await;
        if self.store.get(&self.token_type).await?.is_some() {
            return Ok(false);
        }
        self.store
            .save_locked("", Some(refresh_token), std::time::Duration::ZERO, &self.token_type)
            .await?;
        info!(token_type = %self.token_type, "Seeded token record from configured refresh token");
        Ok(true)
    }

    #[instrument(skip(self, record), fields(token_type = %self.token_type))]
    async fn refresh_locked(&self, record: Option<TokenRecord>) -> AppResult<String> {
        let refresh_token = record
            .and_then(|r| r.refresh_token)
            .ok_or_else(|| {
                AppError::Authentication(format!(
                    "no refresh token stored for '{}'",
                    self.token_type
                ))
            })?;

        let refreshed = match self.refresher.refresh(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                metrics::counter!("crm_token_refresh_total", "result" => "failure").increment(1);
                warn!(error = %e, "Access token refresh failed");
                return Err(match e {
                    AppError::Authentication(_) => e,
                    other => AppError::Authentication(other.to_string()),
                });
            }
        };

        let record = self
            .store
            .save_locked(
                &refreshed.access_token,
                refreshed.refresh_token.as_deref(),
                refreshed.expires_in,
                &self.token_type,
            )
            .await
            .map_err(|e| match e {
                AppError::Configuration(detail) => {
                    AppError::Authentication(format!("unusable refresh response: {}", detail))
                }
                other => other,
            })?;

        metrics::counter!("crm_token_refresh_total", "result" => "success").increment(1);
        info!(expires_at = %record.expires_at, "Access token refreshed");
        Ok(record.access_token)
    }
}
