//! Request builder and response parser for the Marketo REST API.
//!
//! # Design
//! `MarketoApi` holds only endpoint configuration and carries no mutable state
//! between calls. Each operation is split into a `build_*` method that
//! produces an `HttpRequest` and a `parse_*` method that consumes an
//! `HttpResponse`. `Client` drives the round-trip and owns the access token;
//! everything here stays deterministic and free of I/O.
//!
//! Marketo answers most application failures with `200 OK` and
//! `success: false`, so every `parse_*` goes through the envelope check in
//! addition to the HTTP status check.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{MarketoError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::types::{
    ApiErrorDetail, ChangePage, Envelope, IdentityError, LeadChange, LeadFields, LeadId,
    SyncLeadsRequest, SyncStatus, TokenResponse,
};

/// Default REST API version segment.
pub const DEFAULT_API_VERSION: &str = "v1";

/// Largest `batchSize` Marketo accepts for activity queries.
pub const MAX_PAGE_SIZE: u32 = 300;

/// Marketo error codes for an invalid or expired access token.
const TOKEN_REJECTED_CODES: [&str; 2] = ["601", "602"];

const LEAD_NOT_FOUND_CODE: &str = "1004";

/// Codes Marketo uses when the submitted data itself is at fault. Only an
/// update maps them to `Validation`; on reads they stay `Api`.
const VALIDATION_CODES: [&str; 7] = ["609", "610", "1001", "1003", "1005", "1006", "1007"];

/// The kind of call a failed envelope answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    Update,
}

/// Stateless request builder / response parser for one Marketo instance.
#[derive(Debug, Clone)]
pub struct MarketoApi {
    identity_endpoint: String,
    api_endpoint: String,
    api_version: String,
    page_size: u32,
}

impl MarketoApi {
    pub fn new(identity_endpoint: &str, api_endpoint: &str) -> Self {
        Self {
            identity_endpoint: identity_endpoint.trim_end_matches('/').to_string(),
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_api_version(mut self, version: &str) -> Self {
        self.api_version = version.trim_matches('/').to_string();
        self
    }

    /// Sets the `batchSize` for change queries, clamped to `1..=300`.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}/{resource}", self.api_endpoint, self.api_version)
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn build_token_request(&self, client_id: &str, client_secret: &str) -> Result<HttpRequest> {
        let query = encode_query(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])?;
        Ok(HttpRequest {
            method: HttpMethod::Get,
            path: format!("{}/oauth/token?{query}", self.identity_endpoint),
            headers: Vec::new(),
            body: None,
        })
    }

    /// Identity failures are always `Auth`, whatever the status.
    pub fn parse_token(&self, response: HttpResponse) -> Result<TokenResponse> {
        if !response.is_success() {
            let detail = serde_json::from_str::<IdentityError>(&response.body)
                .ok()
                .map(|err| err.error_description.unwrap_or(err.error))
                .unwrap_or_else(|| response.body.clone());
            return Err(MarketoError::Auth {
                message: format!("identity endpoint returned {}: {detail}", response.status),
            });
        }
        serde_json::from_str(&response.body).map_err(|e| MarketoError::Auth {
            message: format!("malformed token response: {e}"),
        })
    }

    // -----------------------------------------------------------------------
    // Leads
    // -----------------------------------------------------------------------

    pub fn build_get_lead<S: AsRef<str>>(
        &self,
        token: &str,
        id: LeadId,
        fields: &[S],
    ) -> Result<HttpRequest> {
        let mut path = self.resource_url(&format!("lead/{id}.json"));
        if !fields.is_empty() {
            let joined = join(fields);
            path.push('?');
            path.push_str(&encode_query(&[("fields", joined.as_str())])?);
        }
        Ok(authorized_get(token, path))
    }

    /// An empty `result` list means the id is unknown.
    pub fn parse_get_lead(&self, id: LeadId, response: HttpResponse) -> Result<LeadFields> {
        let envelope: Envelope<LeadFields> = parse_envelope(&response, Some(id), Operation::Read)?;
        envelope
            .result
            .into_iter()
            .next()
            .ok_or(MarketoError::NotFound { id })
    }

    pub fn build_get_leads<S: AsRef<str>>(
        &self,
        token: &str,
        ids: &[LeadId],
        fields: &[S],
    ) -> Result<HttpRequest> {
        let filter_values = ids
            .iter()
            .map(LeadId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let joined = join(fields);
        let mut params = vec![("filterType", "id"), ("filterValues", filter_values.as_str())];
        if !fields.is_empty() {
            params.push(("fields", joined.as_str()));
        }
        let path = format!("{}?{}", self.resource_url("leads.json"), encode_query(&params)?);
        Ok(authorized_get(token, path))
    }

    pub fn parse_get_leads(&self, response: HttpResponse) -> Result<Vec<LeadFields>> {
        let envelope: Envelope<LeadFields> = parse_envelope(&response, None, Operation::Read)?;
        Ok(envelope.result)
    }

    /// Builds an `updateOnly` sync keyed on `id`, so unknown ids are skipped
    /// rather than created.
    pub fn build_update_lead(
        &self,
        token: &str,
        id: LeadId,
        fields: &LeadFields,
    ) -> Result<HttpRequest> {
        let mut record = fields.clone();
        record.insert("id".to_string(), serde_json::Value::from(id));
        let body = SyncLeadsRequest {
            action: "updateOnly",
            lookup_field: "id",
            input: vec![record],
        };
        let body =
            serde_json::to_string(&body).map_err(|e| MarketoError::Serialization(e.to_string()))?;
        Ok(HttpRequest {
            method: HttpMethod::Post,
            path: self.resource_url("leads.json"),
            headers: vec![
                authorization(token),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body: Some(body),
        })
    }

    pub fn parse_update_lead(&self, id: LeadId, response: HttpResponse) -> Result<SyncStatus> {
        let envelope: Envelope<SyncStatus> = parse_envelope(&response, Some(id), Operation::Update)?;
        let status = envelope.result.into_iter().next().ok_or_else(|| MarketoError::Api {
            status: response.status,
            code: String::new(),
            message: "sync response carried no record status".to_string(),
        })?;

        if matches!(status.status.as_str(), "updated" | "created") {
            return Ok(status);
        }
        Err(match status.reasons.first() {
            Some(reason) if reason.code == LEAD_NOT_FOUND_CODE => MarketoError::NotFound { id },
            Some(reason) => MarketoError::Validation {
                code: reason.code.clone(),
                message: reason.message.clone(),
            },
            None => MarketoError::Validation {
                code: String::new(),
                message: format!("lead {id} was {}", status.status),
            },
        })
    }

    // -----------------------------------------------------------------------
    // Activities
    // -----------------------------------------------------------------------

    /// `since` is a date or datetime string, e.g. `2015-08-04`.
    pub fn build_paging_token(&self, token: &str, since: &str) -> Result<HttpRequest> {
        let path = format!(
            "{}?{}",
            self.resource_url("activities/pagingtoken.json"),
            encode_query(&[("sinceDatetime", since)])?
        );
        Ok(authorized_get(token, path))
    }

    pub fn parse_paging_token(&self, response: HttpResponse) -> Result<String> {
        let envelope: Envelope<serde::de::IgnoredAny> = parse_envelope(&response, None, Operation::Read)?;
        envelope.next_page_token.ok_or_else(|| MarketoError::Api {
            status: response.status,
            code: String::new(),
            message: "paging token response carried no nextPageToken".to_string(),
        })
    }

    pub fn build_lead_changes<S: AsRef<str>>(
        &self,
        token: &str,
        page_token: &str,
        fields: &[S],
    ) -> Result<HttpRequest> {
        let joined = join(fields);
        let batch_size = self.page_size.to_string();
        let path = format!(
            "{}?{}",
            self.resource_url("activities/leadchanges.json"),
            encode_query(&[
                ("nextPageToken", page_token),
                ("fields", joined.as_str()),
                ("batchSize", batch_size.as_str()),
            ])?
        );
        Ok(authorized_get(token, path))
    }

    pub fn parse_lead_changes(&self, response: HttpResponse) -> Result<ChangePage> {
        let envelope: Envelope<LeadChange> = parse_envelope(&response, None, Operation::Read)?;
        Ok(ChangePage {
            changes: envelope.result,
            next_page_token: envelope.next_page_token,
            more_result: envelope.more_result,
        })
    }

    /// `true` when the response says the bearer token was refused, either by
    /// HTTP status or by envelope error code.
    pub fn token_rejected(&self, response: &HttpResponse) -> bool {
        if response.status == 401 {
            return true;
        }
        if !response.is_success() {
            return false;
        }
        serde_json::from_str::<Envelope<serde::de::IgnoredAny>>(&response.body)
            .map(|env| {
                !env.success
                    && env
                        .errors
                        .iter()
                        .any(|err| TOKEN_REJECTED_CODES.contains(&err.code.as_str()))
            })
            .unwrap_or(false)
    }
}

fn authorization(token: &str) -> (String, String) {
    ("authorization".to_string(), format!("Bearer {token}"))
}

fn authorized_get(token: &str, path: String) -> HttpRequest {
    HttpRequest {
        method: HttpMethod::Get,
        path,
        headers: vec![authorization(token)],
        body: None,
    }
}

fn join<S: AsRef<str>>(items: &[S]) -> String {
    items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",")
}

fn encode_query<T: Serialize + ?Sized>(params: &T) -> Result<String> {
    serde_urlencoded::to_string(params).map_err(|e| MarketoError::Serialization(e.to_string()))
}

/// Map non-success status codes to the appropriate `MarketoError` variant.
fn check_status(response: &HttpResponse, id: Option<LeadId>) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    match (response.status, id) {
        (401, _) => Err(MarketoError::Auth {
            message: format!("access token rejected: {}", response.body),
        }),
        (404, Some(id)) => Err(MarketoError::NotFound { id }),
        (status, _) => Err(MarketoError::Api {
            status,
            code: String::new(),
            message: response.body.clone(),
        }),
    }
}

fn parse_envelope<T: DeserializeOwned>(
    response: &HttpResponse,
    id: Option<LeadId>,
    operation: Operation,
) -> Result<Envelope<T>> {
    check_status(response, id)?;
    let envelope: Envelope<T> = serde_json::from_str(&response.body)?;
    if envelope.success {
        return Ok(envelope);
    }
    debug!(request_id = ?envelope.request_id, errors = envelope.errors.len(), "Marketo reported failure");
    Err(envelope_error(&envelope.errors, response.status, id, operation))
}

fn envelope_error(
    errors: &[ApiErrorDetail],
    status: u16,
    id: Option<LeadId>,
    operation: Operation,
) -> MarketoError {
    let Some(err) = errors.first() else {
        return MarketoError::Api {
            status,
            code: String::new(),
            message: "request failed without error details".to_string(),
        };
    };
    let code = err.code.as_str();
    match id {
        _ if TOKEN_REJECTED_CODES.contains(&code) => MarketoError::Auth {
            message: format!("{code}: {}", err.message),
        },
        Some(id) if code == LEAD_NOT_FOUND_CODE => MarketoError::NotFound { id },
        _ if operation == Operation::Update && VALIDATION_CODES.contains(&code) => {
            MarketoError::Validation {
                code: err.code.clone(),
                message: err.message.clone(),
            }
        }
        _ => MarketoError::Api {
            status,
            code: err.code.clone(),
            message: err.message.clone(),
        },
    }
}
