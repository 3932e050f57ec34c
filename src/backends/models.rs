//! Tier-neutral CRM data types
//!
//! Records are carried as an opaque id plus the raw field map. Every backend
//! translates its wire format into these types so callers cannot tell which
//! tier served a request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tiers::Tier;

/// Field map of a CRM record
pub type Fields = Map<String, Value>;

/// A CRM record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Split a raw JSON object into id and fields
    ///
    /// Numeric ids are normalized to strings.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = match fields.remove("id")? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { id, fields })
    }

    /// JSON object with the id folded back in
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object)
    }
}

/// Sort direction for list queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Paging and projection for `get_many`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    /// Restrict the listing to these record ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 200,
            ids: Vec::new(),
            fields: Vec::new(),
            sort_by: None,
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(field.into());
        self.sort_order = order;
        self
    }

    /// Query-string pairs in Zoho v2 form
    pub(crate) fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("page", self.page.to_string()),
            ("per_page", self.per_page.to_string()),
        ];
        if !self.ids.is_empty() {
            params.push(("ids", self.ids.join(",")));
        }
        if !self.fields.is_empty() {
            params.push(("fields", self.fields.join(",")));
        }
        if let Some(sort_by) = &self.sort_by {
            params.push(("sort_by", sort_by.clone()));
            params.push(("sort_order", self.sort_order.as_str().to_string()));
        }
        params
    }
}

/// Per-record failure inside a bulk update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Outcome of a bulk update; partial success is not an error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<RecordFailure>,
}

impl BulkUpdateOutcome {
    pub fn merge(&mut self, other: BulkUpdateOutcome) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Result of probing one backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub tier: Tier,
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of a Zoho v2 write response (`data[]`)
#[derive(Debug, Deserialize)]
pub(crate) struct WriteResult {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub details: Fields,
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success") || self.code == "SUCCESS"
    }

    pub fn record_id(&self) -> Option<String> {
        match self.details.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Zoho v2 envelope shared by list, get, search and write responses
#[derive(Debug, Deserialize)]
pub(crate) struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub info: Option<PageInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageInfo {
    #[serde(default)]
    pub more_records: bool,
}
