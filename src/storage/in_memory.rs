//! In-memory token storage
//!
//! Same API as [`RedisTokenStorage`](super::RedisTokenStorage). Used for
//! local development without Redis and by the test suites. Records vanish on
//! restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::AppResult;
use crate::tokens::TokenRecord;

/// Map-backed token record storage
///
/// Uses RwLock for interior mutability, allowing concurrent reads.
#[derive(Default)]
pub struct InMemoryTokenStorage {
    data: RwLock<HashMap<String, TokenRecord>>,
}

impl InMemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, token_type: &str) -> AppResult<Option<TokenRecord>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(token_type).cloned())
    }

    pub async fn put(&self, record: &TokenRecord) -> AppResult<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(record.token_type.clone(), record.clone());
        Ok(())
    }

    pub async fn delete(&self, token_type: &str) -> AppResult<bool> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        Ok(data.remove(token_type).is_some())
    }

    pub async fn token_types(&self) -> AppResult<Vec<String>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.keys().cloned().collect())
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
