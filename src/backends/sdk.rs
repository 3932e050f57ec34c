//! Tier 2: bulk SDK channel
//!
//! Pages through list and search results until the limit is met, and splits
//! bulk writes into 100-record batches sent a few at a time.

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, instrument};

use crate::{error::AppResult, tiers::Tier};

use super::{
    http::CrmHttp,
    models::{BulkUpdateOutcome, Fields, ListQuery, Record},
    zoho::{Page, ZohoApi, MAX_PAGE_SIZE, MAX_WRITE_BATCH},
    CrmBackend,
};

/// Batches in flight at once during a bulk update
const BATCH_CONCURRENCY: usize = 4;

pub struct SdkBackend {
    api: ZohoApi,
}

impl SdkBackend {
    pub fn new(http: CrmHttp, api_domain: &str) -> Self {
        Self {
            api: ZohoApi::new(http, api_domain),
        }
    }

    /// Collect pages from `fetch` until `limit` records or the last page
    async fn collect_pages<F, Fut>(
        first_page: u32,
        limit: usize,
        fetch: F,
    ) -> AppResult<Vec<Record>>
    where
        F: Fn(u32) -> Fut,
        Fut: std::future::Future<Output = AppResult<Page>>,
    {
        let mut records = Vec::new();
        let mut page = first_page.max(1);
        while records.len() < limit {
            let batch = fetch(page).await?;
            let fetched = batch.records.len();
            records.extend(batch.records);
            debug!(page, fetched, total = records.len(), "Fetched page");
            if !batch.more_records || fetched == 0 {
                break;
            }
            page += 1;
        }
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl CrmBackend for SdkBackend {
    fn tier(&self) -> Tier {
        Tier::Sdk
    }

    async fn get_one(&self, module: &str, id: &str) -> AppResult<Record> {
        self.api.fetch_record(module, id).await
    }

    #[instrument(skip(self, query), fields(tier = "SDK"))]
    async fn get_many(
        &self,
        module: &str,
        query: &ListQuery,
        limit: usize,
    ) -> AppResult<Vec<Record>> {
        Self::collect_pages(query.page, limit, |page| {
            let query = ListQuery {
                page,
                per_page: MAX_PAGE_SIZE,
                ..query.clone()
            };
            async move { self.api.fetch_page(module, &query).await }
        })
        .await
    }

    async fn update(&self, module: &str, id: &str, fields: &Fields) -> AppResult<Record> {
        self.api.update_record(module, id, fields).await
    }

    #[instrument(skip(self, records), fields(tier = "SDK", count = records.len()))]
    async fn bulk_update(
        &self,
        module: &str,
        records: &[Record],
    ) -> AppResult<BulkUpdateOutcome> {
        let batches: Vec<_> = records
            .chunks(MAX_WRITE_BATCH)
            .map(|chunk| self.api.put_batch(module, chunk))
            .collect();
        let outcomes: Vec<BulkUpdateOutcome> = stream::iter(batches)
            .buffered(BATCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut outcome = BulkUpdateOutcome::default();
        for batch in outcomes {
            outcome.merge(batch);
        }
        debug!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Bulk update complete"
        );
        Ok(outcome)
    }

    #[instrument(skip(self), fields(tier = "SDK"))]
    async fn search(&self, module: &str, criteria: &str, limit: usize) -> AppResult<Vec<Record>> {
        Self::collect_pages(1, limit, |page| async move {
            self.api
                .search_page(module, criteria, page, MAX_PAGE_SIZE)
                .await
        })
        .await
    }

    async fn health_check(&self) -> AppResult<()> {
        self.api.current_user().await
    }
}
