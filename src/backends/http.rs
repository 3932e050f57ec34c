//! Authenticated HTTP transport shared by the backend clients
//!
//! Owns the token handshake (proactive refresh, one reactive refresh and
//! replay on 401), the optional client-side rate limit, and the
//! classification of every transport outcome into [`AppError`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, RETRY_AFTER},
    RequestBuilder, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, error, warn};

use crate::{
    error::{AppError, AppResult},
    tiers::Tier,
    tokens::TokenProvider,
};

type TierRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Authorization scheme expected by the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: Zoho-oauthtoken <token>`
    ZohoOAuth,
}

impl AuthScheme {
    fn header_value(&self, token: &str) -> String {
        match self {
            AuthScheme::Bearer => format!("Bearer {}", token),
            AuthScheme::ZohoOAuth => format!("Zoho-oauthtoken {}", token),
        }
    }
}

pub struct CrmHttp {
    client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    tier: Tier,
    scheme: AuthScheme,
    limiter: Option<TierRateLimiter>,
}

impl CrmHttp {
    pub fn new(
        client: reqwest::Client,
        tokens: Arc<TokenProvider>,
        tier: Tier,
        scheme: AuthScheme,
    ) -> Self {
        Self {
            client,
            tokens,
            tier,
            scheme,
            limiter: None,
        }
    }

    /// Throttle outgoing requests to `per_second`; zero or `None` disables it
    pub fn with_rate_limit(mut self, per_second: Option<u32>) -> Self {
        self.limiter = per_second
            .and_then(NonZeroU32::new)
            .map(|n| RateLimiter::direct(Quota::per_second(n)));
        self
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Send an authenticated request and classify the response
    ///
    /// `build` is called again for the replay after a 401, so it must be
    /// side-effect free.
    pub async fn send<F>(&self, build: F) -> AppResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let token = self.tokens.access_token().await?;
        let response = self.dispatch(&build, &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return classify(self.tier, response).await;
        }

        warn!(tier = %self.tier, "Upstream rejected access token, refreshing");
        let token = self.tokens.refresh_after_rejection(&token).await?;
        let response = self.dispatch(&build, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            error!(tier = %self.tier, "Upstream rejected refreshed access token");
            return Err(AppError::Authentication(format!(
                "{} rejected refreshed credentials",
                self.tier
            )));
        }
        classify(self.tier, response).await
    }

    async fn dispatch<F>(&self, build: &F, token: &str) -> AppResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        build(&self.client)
            .header(AUTHORIZATION, self.scheme.header_value(token))
            .send()
            .await
            .map_err(|e| transport_error(self.tier, e))
    }
}

/// Reclassify a reqwest failure; the reqwest error itself never escapes
pub(crate) fn transport_error(tier: Tier, err: reqwest::Error) -> AppError {
    let detail = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_decode() || err.is_body() {
        "failed to read response body"
    } else {
        "request failed"
    };
    warn!(tier = %tier, error = %err, "{}", detail);
    AppError::backend(tier, None, detail)
}

/// Error body returned by the Zoho v2 API
#[derive(Debug, Deserialize)]
struct ZohoErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

async fn classify(tier: Tier, response: Response) -> AppResult<Response> {
    let status = response.status();
    debug!(tier = %tier, status = %status, "Upstream response status");

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = parse_retry_after(response.headers(), Utc::now());
        warn!(tier = %tier, retry_after = ?retry_after, "Upstream rate limit hit");
        return Err(AppError::RateLimited { retry_after });
    }

    let path = response.url().path().to_string();
    let text = response.text().await.unwrap_or_default();
    error!(tier = %tier, status = %status, body = %text, "Upstream request failed");

    match status {
        StatusCode::UNAUTHORIZED => Err(AppError::Authentication(format!(
            "{} rejected credentials",
            tier
        ))),
        StatusCode::NOT_FOUND => Err(AppError::NotFound(path)),
        _ => {
            let detail = serde_json::from_str::<ZohoErrorBody>(&text)
                .map(|body| format!("{}: {}", body.code, body.message))
                .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
            Err(AppError::backend(tier, Some(status.as_u16()), detail))
        }
    }
}

/// Decode a JSON body; `None` for 204 or an empty body
pub(crate) async fn read_json<T: DeserializeOwned>(
    tier: Tier,
    response: Response,
) -> AppResult<Option<T>> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(tier, e))?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&body) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            error!(tier = %tier, error = %e, body = %body, "Failed to parse upstream response");
            Err(AppError::backend(tier, None, "invalid response body"))
        }
    }
}

/// `Retry-After` as delta seconds or an HTTP date
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Map a Zoho error code reported inside a 2xx body
pub(crate) fn zoho_code_error(tier: Tier, code: &str, message: &str) -> AppError {
    match code {
        "INVALID_TOKEN" | "AUTHENTICATION_FAILURE" | "OAUTH_SCOPE_MISMATCH" => {
            AppError::Authentication(format!("{}: {}", code, message))
        }
        "RECORD_NOT_FOUND" | "NOT_FOUND" | "INVALID_URL_PATTERN" => {
            AppError::NotFound(format!("{}: {}", code, message))
        }
        "TOO_MANY_REQUESTS" | "LIMIT_EXCEEDED" => AppError::RateLimited { retry_after: None },
        "INTERNAL_ERROR" => AppError::backend(tier, Some(500), format!("{}: {}", code, message)),
        _ => AppError::backend(tier, Some(400), format!("{}: {}", code, message)),
    }
}
