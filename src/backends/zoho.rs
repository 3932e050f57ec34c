//! Zoho CRM v2 REST primitives
//!
//! The SDK and REST tiers talk to the same v2 API and differ only in how
//! they batch and page. Both build on these calls.

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};

use super::{
    http::{read_json, zoho_code_error, CrmHttp},
    models::{
        BulkUpdateOutcome, DataEnvelope, Fields, ListQuery, Record, RecordFailure, WriteResult,
    },
};

/// Maximum records per v2 write call
pub const MAX_WRITE_BATCH: usize = 100;

/// Maximum page size for v2 list and search calls
pub const MAX_PAGE_SIZE: u32 = 200;

/// One page of records
#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub more_records: bool,
}

pub struct ZohoApi {
    http: CrmHttp,
    base_url: String,
}

impl ZohoApi {
    pub fn new(http: CrmHttp, api_domain: &str) -> Self {
        Self {
            http,
            base_url: format!("{}/crm/v2", api_domain.trim_end_matches('/')),
        }
    }

    fn module_url(&self, module: &str) -> String {
        format!("{}/{}", self.base_url, module)
    }

    #[instrument(skip(self), fields(tier = %self.http.tier()))]
    pub async fn fetch_record(&self, module: &str, id: &str) -> AppResult<Record> {
        let url = format!("{}/{}", self.module_url(module), id);
        debug!(url = %url, "Fetching record");

        let response = self.http.send(|c| c.get(&url)).await?;
        let envelope: Option<DataEnvelope<Value>> = read_json(self.http.tier(), response).await?;

        envelope
            .and_then(|e| e.data.into_iter().next())
            .and_then(Record::from_value)
            .ok_or_else(|| AppError::NotFound(format!("{}/{}", module, id)))
    }

    #[instrument(skip(self, query), fields(tier = %self.http.tier(), page = query.page))]
    pub async fn fetch_page(&self, module: &str, query: &ListQuery) -> AppResult<Page> {
        let url = self.module_url(module);
        let params = query.to_params();
        debug!(url = %url, "Fetching record page");

        let response = self.http.send(|c| c.get(&url).query(&params)).await?;
        self.read_page(response).await
    }

    #[instrument(skip(self), fields(tier = %self.http.tier()))]
    pub async fn search_page(
        &self,
        module: &str,
        criteria: &str,
        page: u32,
        per_page: u32,
    ) -> AppResult<Page> {
        let url = format!("{}/search", self.module_url(module));
        let params = [
            ("criteria", criteria.to_string()),
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        debug!(url = %url, "Searching records");

        let response = self.http.send(|c| c.get(&url).query(&params)).await?;
        self.read_page(response).await
    }

    async fn read_page(&self, response: reqwest::Response) -> AppResult<Page> {
        let envelope: Option<DataEnvelope<Value>> = read_json(self.http.tier(), response).await?;
        let Some(envelope) = envelope else {
            return Ok(Page::default());
        };
        Ok(Page {
            more_records: envelope.info.map(|i| i.more_records).unwrap_or(false),
            records: envelope
                .data
                .into_iter()
                .filter_map(Record::from_value)
                .collect(),
        })
    }

    /// `PUT /{module}/{id}` with a single record
    #[instrument(skip(self, fields), fields(tier = %self.http.tier()))]
    pub async fn update_record(
        &self,
        module: &str,
        id: &str,
        fields: &Fields,
    ) -> AppResult<Record> {
        let url = format!("{}/{}", self.module_url(module), id);
        let body = json!({ "data": [Value::Object(fields.clone())] });

        let response = self.http.send(|c| c.put(&url).json(&body)).await?;
        let results = self.read_write_results(response).await?;
        single_write_result(self.http.tier(), id, results)
    }

    /// `PUT /{module}` with up to [`MAX_WRITE_BATCH`] records
    #[instrument(skip(self, records), fields(tier = %self.http.tier(), count = records.len()))]
    pub async fn put_batch(
        &self,
        module: &str,
        records: &[Record],
    ) -> AppResult<BulkUpdateOutcome> {
        if records.len() > MAX_WRITE_BATCH {
            return Err(AppError::Configuration(format!(
                "batch of {} exceeds the {} record limit",
                records.len(),
                MAX_WRITE_BATCH
            )));
        }
        let url = self.module_url(module);
        let data: Vec<Value> = records.iter().map(Record::to_value).collect();
        let body = json!({ "data": data });

        let response = self.http.send(|c| c.put(&url).json(&body)).await?;
        let results = self.read_write_results(response).await?;
        Ok(batch_outcome(records, results))
    }

    /// `GET /org`, used as a liveness probe
    pub async fn org(&self) -> AppResult<()> {
        let url = format!("{}/org", self.base_url);
        self.http.send(|c| c.get(&url)).await?;
        Ok(())
    }

    /// `GET /users?type=CurrentUser`, used as a liveness probe
    pub async fn current_user(&self) -> AppResult<()> {
        let url = format!("{}/users", self.base_url);
        self.http
            .send(|c| c.get(&url).query(&[("type", "CurrentUser")]))
            .await?;
        Ok(())
    }

    async fn read_write_results(&self, response: reqwest::Response) -> AppResult<Vec<WriteResult>> {
        let envelope: Option<DataEnvelope<WriteResult>> =
            read_json(self.http.tier(), response).await?;
        Ok(envelope.map(|e| e.data).unwrap_or_default())
    }
}

/// Turn the one write result of a single-record update into the record
pub(crate) fn single_write_result(
    tier: crate::tiers::Tier,
    id: &str,
    results: Vec<WriteResult>,
) -> AppResult<Record> {
    let result = results
        .into_iter()
        .next()
        .ok_or_else(|| AppError::backend(tier, None, "empty write response"))?;
    if !result.is_success() {
        return Err(zoho_code_error(tier, &result.code, &result.message));
    }
    let mut details = result.details;
    details.remove("id");
    Ok(Record::new(id, details))
}

/// Pair write results with the submitted records by position
pub(crate) fn batch_outcome(records: &[Record], results: Vec<WriteResult>) -> BulkUpdateOutcome {
    let mut outcome = BulkUpdateOutcome::default();
    for (index, record) in records.iter().enumerate() {
        match results.get(index) {
            Some(result) if result.is_success() => outcome
                .succeeded
                .push(result.record_id().unwrap_or_else(|| record.id.clone())),
            Some(result) => outcome.failed.push(RecordFailure {
                id: result.record_id().unwrap_or_else(|| record.id.clone()),
                code: result.code.clone(),
                message: result.message.clone(),
            }),
            None => outcome.failed.push(RecordFailure {
                id: record.id.clone(),
                code: "NO_RESULT".to_string(),
                message: "upstream returned no result for record".to_string(),
            }),
        }
    }
    outcome
}
