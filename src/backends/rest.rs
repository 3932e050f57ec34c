//! Tier 3: REST v2 fallback
//!
//! One upstream call per operation wherever the API allows it. List and
//! search return at most a single page.

use async_trait::async_trait;
use tracing::instrument;

use crate::{error::AppResult, tiers::Tier};

use super::{
    http::CrmHttp,
    models::{BulkUpdateOutcome, Fields, ListQuery, Record},
    zoho::{ZohoApi, MAX_PAGE_SIZE, MAX_WRITE_BATCH},
    CrmBackend,
};

pub struct RestBackend {
    api: ZohoApi,
}

impl RestBackend {
    pub fn new(http: CrmHttp, api_domain: &str) -> Self {
        Self {
            api: ZohoApi::new(http, api_domain),
        }
    }
}

fn page_size(limit: usize) -> u32 {
    u32::try_from(limit).unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

#[async_trait]
impl CrmBackend for RestBackend {
    fn tier(&self) -> Tier {
        Tier::Rest
    }

    async fn get_one(&self, module: &str, id: &str) -> AppResult<Record> {
        self.api.fetch_record(module, id).await
    }

    async fn get_many(
        &self,
        module: &str,
        query: &ListQuery,
        limit: usize,
    ) -> AppResult<Vec<Record>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = ListQuery {
            per_page: page_size(limit),
            ..query.clone()
        };
        let mut records = self.api.fetch_page(module, &query).await?.records;
        records.truncate(limit);
        Ok(records)
    }

    async fn update(&self, module: &str, id: &str, fields: &Fields) -> AppResult<Record> {
        self.api.update_record(module, id, fields).await
    }

    #[instrument(skip(self, records), fields(tier = "REST", count = records.len()))]
    async fn bulk_update(&self, module: &str, records: &[Record]) -> AppResult<BulkUpdateOutcome> {
        let mut outcome = BulkUpdateOutcome::default();
        for chunk in records.chunks(MAX_WRITE_BATCH) {
            outcome.merge(self.api.put_batch(module, chunk).await?);
        }
        Ok(outcome)
    }

    async fn search(&self, module: &str, criteria: &str, limit: usize) -> AppResult<Vec<Record>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut records = self
            .api
            .search_page(module, criteria, 1, page_size(limit))
            .await?
            .records;
        records.truncate(limit);
        Ok(records)
    }

    async fn health_check(&self) -> AppResult<()> {
        self.api.org().await
    }
}
