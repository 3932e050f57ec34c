//! Redis token storage
//!
//! One hash per token type, fields mirroring the credential schema:
//! `access_token`, `refresh_token`, `expires_at`, `created_at`, `updated_at`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::error::{AppError, AppResult};
use crate::tokens::TokenRecord;

/// Redis-backed token record storage
pub struct RedisTokenStorage {
    conn: redis::aio::ConnectionManager,
}

impl RedisTokenStorage {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    /// Read a record, `None` if the hash does not exist
    pub async fn get(&self, token_type: &str) -> AppResult<Option<TokenRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(keys::token(token_type)).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(token_type, &fields).map(Some)
    }

    /// Write every field of the record in one transaction
    pub async fn put(&self, record: &TokenRecord) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::token(&record.token_type);
        let fields = [
            ("access_token", record.access_token.clone()),
            ("refresh_token", record.refresh_token.clone().unwrap_or_default()),
            ("expires_at", record.expires_at.to_rfc3339()),
            ("created_at", record.created_at.to_rfc3339()),
            ("updated_at", record.updated_at.to_rfc3339()),
        ];

        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete a record, returning whether it existed
    pub async fn delete(&self, token_type: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(keys::token(token_type)).await?;
        Ok(removed > 0)
    }

    /// Every stored token type
    pub async fn token_types(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> =
                conn.scan_match(format!("{}*", keys::TOKEN_PREFIX)).await?;
            while let Some(key) = iter.next_item().await {
                if let Some(token_type) = key.strip_prefix(keys::TOKEN_PREFIX) {
                    found.push(token_type.to_string());
                }
            }
        }
        Ok(found)
    }

    /// Round-trip check used by readiness probes
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

fn record_from_fields(
    token_type: &str,
    fields: &HashMap<String, String>,
) -> AppResult<TokenRecord> {
    let text = |name: &str| -> AppResult<&String> {
        fields.get(name).ok_or_else(|| {
            AppError::Storage(format!("token record '{}' missing field {}", token_type, name))
        })
    };
    let timestamp = |name: &str| -> AppResult<DateTime<Utc>> {
        let raw = text(name)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                AppError::Storage(format!(
                    "token record '{}' has invalid {}: {}",
                    token_type, name, e
                ))
            })
    };

    let refresh_token = fields
        .get("refresh_token")
        .filter(|t| !t.is_empty())
        .cloned();

    Ok(TokenRecord {
        token_type: token_type.to_string(),
        access_token: text("access_token")?.clone(),
        refresh_token,
        expires_at: timestamp("expires_at")?,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}

/// Storage key layout
pub mod keys {
    pub const TOKEN_PREFIX: &str = "crm:tokens:";

    /// Hash holding one token record
    pub fn token(token_type: &str) -> String {
        format!("{}{}", TOKEN_PREFIX, token_type)
    }
}
