//! Wire types for the Marketo REST API.
//!
//! # Design
//! Lead records have an open-ended, per-instance set of fields, so a lead is a
//! `serde_json::Map` rather than a struct. The surrounding envelopes and the
//! activity rows have a fixed shape and get typed structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marketo lead ids are positive integers.
pub type LeadId = u64;

/// Field name to value mapping for a single lead.
pub type LeadFields = Map<String, Value>;

/// Response of the identity endpoint's client-credentials exchange.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Error body returned by the identity endpoint on a rejected exchange.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IdentityError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// One `{code, message}` pair from an envelope's `errors` or a record's
/// `reasons` list. Marketo sends codes as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// The envelope wrapping every REST response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
    #[serde(default = "Vec::new")]
    pub result: Vec<T>,
    #[serde(default)]
    pub more_result: bool,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Request body for `POST /leads.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncLeadsRequest<'a> {
    pub action: &'a str,
    pub lookup_field: &'a str,
    pub input: Vec<LeadFields>,
}

/// Per-record outcome of a sync-leads call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    #[serde(default)]
    pub id: Option<LeadId>,
    pub status: String,
    #[serde(default)]
    pub reasons: Vec<ApiErrorDetail>,
}

/// A single field transition inside a lead-change activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub name: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
}

/// One row of `activities/leadchanges.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeadChange {
    pub id: u64,
    pub lead_id: LeadId,
    pub activity_date: String,
    #[serde(default)]
    pub activity_type_id: Option<u32>,
    #[serde(default)]
    pub fields: Vec<FieldChange>,
}

impl LeadChange {
    /// Flattens the row to `{"id": lead_id, field: new_value, ..}`.
    pub fn new_values(&self) -> LeadFields {
        let mut values = LeadFields::new();
        values.insert("id".to_string(), Value::from(self.lead_id));
        for field in &self.fields {
            values.insert(field.name.clone(), field.new_value.clone());
        }
        values
    }

    /// Rows without field transitions are emitted for newly created leads.
    pub fn is_new_lead(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One page of lead changes plus the cursor for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    pub changes: Vec<LeadChange>,
    pub next_page_token: Option<String>,
    pub more_result: bool,
}
