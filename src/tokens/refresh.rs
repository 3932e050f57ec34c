//! OAuth refresh against the Zoho accounts server

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use crate::{
    config::Config,
    error::{AppError, AppResult},
};

/// Lifetime assumed when the accounts server omits `expires_in`
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Outcome of a successful refresh
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Rotated refresh token, if the server issued one
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

/// Exchanges a refresh token for a new access token
///
/// Failures must surface as [`AppError::Authentication`].
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> AppResult<RefreshedToken>;
}

/// Token endpoint response; errors arrive as HTTP 200 with an `error` field
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

/// Refresher calling `POST {accounts_url}/oauth/v2/token`
pub struct ZohoOAuthRefresher {
    client: reqwest::Client,
    accounts_url: String,
    client_id: String,
    client_secret: String,
}

impl ZohoOAuthRefresher {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            accounts_url: config.zoho_accounts_url.trim_end_matches('/').to_string(),
            client_id: config.zoho_client_id.clone(),
            client_secret: config.zoho_client_secret.clone(),
        }
    }
}

#[async_trait]
impl TokenRefresher for ZohoOAuthRefresher {
    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str) -> AppResult<RefreshedToken> {
        let url = format!("{}/oauth/v2/token", self.accounts_url);
        debug!(url = %url, "Refreshing OAuth access token");

        let response = self
            .client
            .post(&url)
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Token refresh request failed");
                AppError::Authentication(format!("token refresh request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            AppError::Authentication(format!("failed to read token refresh response: {}", e))
        })?;

        if !status.is_success() {
            warn!(status = %status, "Token refresh rejected");
            return Err(AppError::Authentication(format!(
                "token refresh rejected with status {}",
                status
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, "Failed to parse token refresh response");
            AppError::Authentication(format!("invalid token refresh response: {}", e))
        })?;

        if let Some(code) = parsed.error {
            warn!(error_code = %code, "Token refresh returned an error");
            return Err(AppError::Authentication(format!(
                "token refresh failed: {}",
                code
            )));
        }

        let access_token = parsed.access_token.ok_or_else(|| {
            AppError::Authentication("token refresh response missing access_token".to_string())
        })?;

        Ok(RefreshedToken {
            access_token,
            refresh_token: parsed.refresh_token,
            expires_in: Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
        })
    }
}
