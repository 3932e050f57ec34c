//! Tier 1: agent-tool channel
//!
//! Each operation is a JSON-RPC 2.0 `tools/call` against the CRM's MCP
//! endpoint. Tool results carry the same `{data, info}` envelope as the v2
//! API, either as structured content or as JSON text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    tiers::Tier,
};

use super::{
    http::{read_json, zoho_code_error, CrmHttp},
    models::{BulkUpdateOutcome, DataEnvelope, Fields, ListQuery, Record, WriteResult},
    zoho::{batch_outcome, single_write_result, MAX_PAGE_SIZE, MAX_WRITE_BATCH},
    CrmBackend,
};

/// Tool names exposed by the MCP server
pub mod tools {
    pub const GET_RECORD: &str = "get_record";
    pub const LIST_RECORDS: &str = "list_records";
    pub const UPDATE_RECORD: &str = "update_record";
    pub const BULK_UPDATE_RECORDS: &str = "bulk_update_records";
    pub const SEARCH_RECORDS: &str = "search_records";
}

/// Server-defined JSON-RPC error codes
const RPC_UNAUTHORIZED: i64 = -32001;
const RPC_NOT_FOUND: i64 = -32002;
const RPC_RATE_LIMITED: i64 = -32029;
const RPC_INTERNAL: i64 = -32603;
const RPC_SERVER_ERROR: i64 = -32000;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'static str,
    params: ToolCall<'a>,
}

#[derive(Debug, Serialize)]
struct ToolCall<'a> {
    name: &'a str,
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<ToolResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default)]
    structured_content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ToolResult {
    fn first_text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|item| item.kind == "text")
            .and_then(|item| item.text.as_deref())
    }

    /// Structured payload, falling back to JSON in the first text item
    fn payload(self) -> Option<Value> {
        if self.structured_content.is_some() {
            return self.structured_content;
        }
        serde_json::from_str(self.first_text()?).ok()
    }
}

pub struct McpBackend {
    http: CrmHttp,
    url: String,
}

impl McpBackend {
    pub fn new(http: CrmHttp, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
        }
    }

    #[instrument(skip(self, arguments), fields(tier = "MCP"))]
    async fn call_tool(&self, tool: &str, arguments: Value) -> AppResult<Option<Value>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: Uuid::new_v4().to_string(),
            method: "tools/call",
            params: ToolCall {
                name: tool,
                arguments,
            },
        };
        debug!(url = %self.url, request_id = %request.id, "Calling MCP tool");

        let response = self.http.send(|c| c.post(&self.url).json(&request)).await?;
        let rpc: RpcResponse = read_json(self.tier(), response)
            .await?
            .ok_or_else(|| AppError::backend(self.tier(), None, "empty JSON-RPC response"))?;

        if let Some(err) = rpc.error {
            return Err(self.rpc_error(err));
        }
        let result = rpc
            .result
            .ok_or_else(|| {
                AppError::backend(self.tier(), None, "JSON-RPC response without result")
            })?;

        if result.is_error {
            return Err(self.tool_error(tool, &result));
        }
        Ok(result.payload())
    }

    fn rpc_error(&self, err: RpcError) -> AppError {
        error!(code = err.code, message = %err.message, "MCP JSON-RPC error");
        match err.code {
            RPC_UNAUTHORIZED => AppError::Authentication(err.message),
            RPC_RATE_LIMITED => AppError::RateLimited { retry_after: None },
            RPC_NOT_FOUND => AppError::NotFound(err.message),
            RPC_INTERNAL | RPC_SERVER_ERROR => {
                AppError::backend(self.tier(), Some(500), format!("JSON-RPC {}", err.code))
            }
            code => AppError::backend(self.tier(), Some(400), format!("JSON-RPC {}", code)),
        }
    }

    /// Tool-level failure; the text may be a Zoho error object
    fn tool_error(&self, tool: &str, result: &ToolResult) -> AppError {
        let text = result.first_text().unwrap_or_default();
        error!(tool, text = %text, "MCP tool reported an error");

        #[derive(Deserialize)]
        struct ToolErrorBody {
            code: String,
            #[serde(default)]
            message: String,
        }

        match serde_json::from_str::<ToolErrorBody>(text) {
            Ok(body) => zoho_code_error(self.tier(), &body.code, &body.message),
            Err(_) => AppError::backend(self.tier(), Some(500), format!("tool {} failed", tool)),
        }
    }

    fn records(&self, payload: Option<Value>) -> AppResult<Vec<Record>> {
        let Some(payload) = payload else {
            return Ok(Vec::new());
        };
        let envelope: DataEnvelope<Value> = serde_json::from_value(payload).map_err(|e| {
            error!(error = %e, "Unexpected MCP tool payload");
            AppError::backend(self.tier(), None, "invalid tool payload")
        })?;
        Ok(envelope.data.into_iter().filter_map(Record::from_value).collect())
    }

    fn write_results(&self, payload: Option<Value>) -> AppResult<Vec<WriteResult>> {
        let Some(payload) = payload else {
            return Ok(Vec::new());
        };
        let envelope: DataEnvelope<WriteResult> = serde_json::from_value(payload).map_err(|e| {
            error!(error = %e, "Unexpected MCP write payload");
            AppError::backend(self.tier(), None, "invalid tool payload")
        })?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl CrmBackend for McpBackend {
    fn tier(&self) -> Tier {
        Tier::Mcp
    }

    async fn get_one(&self, module: &str, id: &str) -> AppResult<Record> {
        let payload = self
            .call_tool(tools::GET_RECORD, json!({ "module": module, "record_id": id }))
            .await?;
        let records = self.records(payload)?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{}/{}", module, id)))
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
        let per_page = u32::try_from(limit).unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let mut arguments = json!({
            "module": module,
            "page": query.page,
            "per_page": per_page,
        });
        if !query.ids.is_empty() {
            arguments["ids"] = json!(query.ids);
        }
        if !query.fields.is_empty() {
            arguments["fields"] = json!(query.fields);
        }
        if let Some(sort_by) = &query.sort_by {
            arguments["sort_by"] = json!(sort_by);
            arguments["sort_order"] = json!(query.sort_order.as_str());
        }

        let payload = self.call_tool(tools::LIST_RECORDS, arguments).await?;
        let mut records = self.records(payload)?;
        records.truncate(limit);
        Ok(records)
    }

    async fn update(&self, module: &str, id: &str, fields: &Fields) -> AppResult<Record> {
        let payload = self
            .call_tool(
                tools::UPDATE_RECORD,
                json!({ "module": module, "record_id": id, "data": fields }),
            )
            .await?;
        single_write_result(Tier::Mcp, id, self.write_results(payload)?)
    }

    async fn bulk_update(&self, module: &str, records: &[Record]) -> AppResult<BulkUpdateOutcome> {
        let mut outcome = BulkUpdateOutcome::default();
        for chunk in records.chunks(MAX_WRITE_BATCH) {
            let data: Vec<Value> = chunk.iter().map(Record::to_value).collect();
            let payload = self
                .call_tool(
                    tools::BULK_UPDATE_RECORDS,
                    json!({ "module": module, "records": data }),
                )
                .await?;
            outcome.merge(batch_outcome(chunk, self.write_results(payload)?));
        }
        Ok(outcome)
    }

    async fn search(&self, module: &str, criteria: &str, limit: usize) -> AppResult<Vec<Record>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let per_page = u32::try_from(limit).unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let payload = self
            .call_tool(
                tools::SEARCH_RECORDS,
                json!({ "module": module, "criteria": criteria, "per_page": per_page }),
            )
            .await?;
        let mut records = self.records(payload)?;
        records.truncate(limit);
        Ok(records)
    }

    async fn health_check(&self) -> AppResult<()> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": "tools/list",
        });
        let response = self.http.send(|c| c.post(&self.url).json(&request)).await?;
        let rpc: Option<RpcResponse> = read_json(Tier::Mcp, response).await?;
        match rpc.and_then(|r| r.error) {
            Some(err) => Err(self.rpc_error(err)),
            None => Ok(()),
        }
    }
}
