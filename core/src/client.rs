//! Authenticated session against one Marketo instance.
//!
//! # Design
//! `Client` pairs the stateless `MarketoApi` with a `Transport` and the
//! access token. Every call blocks until its HTTP exchange completes.
//!
//! Token lifecycle:
//! - Lazy acquisition: construction never touches the network; the first call
//!   that finds no usable token performs the client-credentials exchange.
//! - Expiry-aware: a token within the safety buffer of its lifetime is treated
//!   as missing and replaced before the request goes out.
//! - One-shot retry: if Marketo rejects the token anyway (HTTP 401 or codes
//!   601/602), the token is dropped, re-acquired once, and the request is
//!   resent once. A second rejection surfaces as `MarketoError::Auth`.
//!
//! The token lives in a `RefCell`: a `Client` is shared by reference between
//! any number of `Lead`s on one thread. It is not `Sync`;
//! callers sharing one across threads must wrap it themselves.

use std::cell::RefCell;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::MarketoApi;
use crate::auth::{AccessToken, TokenState};
use crate::changes::LeadChanges;
use crate::config::MarketoConfig;
use crate::error::{MarketoError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport, UreqTransport};
use crate::types::{ChangePage, LeadFields, LeadId, SyncStatus};

/// Blocking Marketo client. Generic over the transport so tests can replay
/// fixtures; production code uses the default `UreqTransport`.
pub struct Client<T: Transport = UreqTransport> {
    api: MarketoApi,
    client_id: String,
    client_secret: String,
    transport: T,
    token: RefCell<TokenState>,
}

impl Client<UreqTransport> {
    /// Creates a client with default settings. Performs no network call.
    pub fn new(identity_endpoint: &str, client_id: &str, client_secret: &str, api_endpoint: &str) -> Self {
        let config = MarketoConfig::new(identity_endpoint, client_id, client_secret, api_endpoint);
        Self::with_transport(&config, UreqTransport::new())
    }

    pub fn from_config(config: &MarketoConfig) -> Self {
        Self::with_transport(config, UreqTransport::new())
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(config: &MarketoConfig, transport: T) -> Self {
        let api = MarketoApi::new(&config.identity_endpoint, &config.api_endpoint)
            .with_api_version(&config.api_version)
            .with_page_size(config.page_size);
        Self {
            api,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            transport,
            token: RefCell::new(TokenState::new(Duration::from_secs(
                config.token_expiry_buffer_secs,
            ))),
        }
    }

    pub fn api(&self) -> &MarketoApi {
        &self.api
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Exchanges the client credentials for a fresh access token, replacing
    /// any cached one.
    ///
    /// # Errors
    /// `MarketoError::Auth` if the credentials are rejected or the identity
    /// endpoint cannot be reached.
    pub fn authenticate(&self) -> Result<()> {
        self.acquire_token().map(|_| ())
    }

    /// Returns `true` if a non-expired token is cached.
    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().current().is_some()
    }

    fn acquire_token(&self) -> Result<String> {
        let request = self.api.build_token_request(&self.client_id, &self.client_secret)?;
        debug!(path = request.redacted_path(), "requesting access token");
        let response = self
            .transport
            .execute(&request)
            .map_err(|err| MarketoError::Auth {
                message: format!("identity endpoint unreachable: {err}"),
            })?;
        let token = AccessToken::from(self.api.parse_token(response)?);
        info!(expires_in = ?token.expires_in(), "access token acquired");

        let value = token.value().to_string();
        self.token.borrow_mut().store(token);
        Ok(value)
    }

    fn bearer_token(&self) -> Result<String> {
        let cached = self.token.borrow().current().map(str::to_owned);
        match cached {
            Some(token) => Ok(token),
            None => self.acquire_token(),
        }
    }

    /// Sends an authenticated request built by `build`, retrying exactly once
    /// with a fresh token if the first token is rejected.
    fn send<F>(&self, build: F) -> Result<HttpResponse>
    where
        F: Fn(&MarketoApi, &str) -> Result<HttpRequest>,
    {
        let token = self.bearer_token()?;
        let response = self.execute(&build(&self.api, &token)?)?;
        if !self.api.token_rejected(&response) {
            return Ok(response);
        }

        warn!("access token rejected, re-authenticating once");
        self.token.borrow_mut().invalidate();
        let token = self.acquire_token()?;
        let response = self.execute(&build(&self.api, &token)?)?;
        if self.api.token_rejected(&response) {
            self.token.borrow_mut().invalidate();
            return Err(MarketoError::Auth {
                message: "access token rejected after re-authentication".to_string(),
            });
        }
        Ok(response)
    }

    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        debug!(method = %request.method, path = request.redacted_path(), "calling Marketo");
        let response = self.transport.execute(request)?;
        debug!(status = response.status, "Marketo responded");
        Ok(response)
    }

    /// Fetches every field Marketo returns by default for lead `id`.
    ///
    /// # Errors
    /// `MarketoError::NotFound` if the id is unknown; `Api` for other failures.
    pub fn get_lead(&self, id: LeadId) -> Result<LeadFields> {
        const ALL_FIELDS: [&str; 0] = [];
        let response = self.send(|api, token| api.build_get_lead(token, id, &ALL_FIELDS))?;
        self.api.parse_get_lead(id, response)
    }

    /// Fetches lead `id` restricted to `fields`.
    ///
    /// # Errors
    /// Same as [`Client::get_lead`].
    pub fn get_lead_fields<S: AsRef<str>>(&self, id: LeadId, fields: &[S]) -> Result<LeadFields> {
        let response = self.send(|api, token| api.build_get_lead(token, id, fields))?;
        self.api.parse_get_lead(id, response)
    }

    /// Bulk lookup by id. Unknown ids are simply absent from the result.
    ///
    /// # Errors
    /// `Api` as reported by Marketo.
    pub fn get_leads<S: AsRef<str>>(&self, ids: &[LeadId], fields: &[S]) -> Result<Vec<LeadFields>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.send(|api, token| api.build_get_leads(token, ids, fields))?;
        self.api.parse_get_leads(response)
    }

    /// Writes `fields` to lead `id` without creating it if missing.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `Validation` for rejected values, `Api`
    /// for any other failure.
    pub fn update_lead(&self, id: LeadId, fields: &LeadFields) -> Result<SyncStatus> {
        let response = self.send(|api, token| api.build_update_lead(token, id, fields))?;
        let status = self.api.parse_update_lead(id, response)?;
        debug!(lead_id = id, fields = fields.len(), "lead updated");
        Ok(status)
    }

    /// Obtains the activity cursor positioned at `since`.
    ///
    /// # Errors
    /// `Api` if Marketo rejects the date or the call fails.
    pub fn paging_token(&self, since: &str) -> Result<String> {
        let response = self.send(|api, token| api.build_paging_token(token, since))?;
        self.api.parse_paging_token(response)
    }

    /// Fetches one page of lead changes at `page_token`.
    ///
    /// # Errors
    /// `Api` as reported by Marketo.
    pub fn lead_changes_page<S: AsRef<str>>(&self, page_token: &str, fields: &[S]) -> Result<ChangePage> {
        let response = self.send(|api, token| api.build_lead_changes(token, page_token, fields))?;
        self.api.parse_lead_changes(response)
    }

    /// Streams every change to `fields` recorded since `since` (e.g.
    /// `"2015-08-04"`). Nothing is requested until the first item is pulled.
    pub fn get_lead_changes<S: AsRef<str>>(&self, since: &str, fields: &[S]) -> LeadChanges<'_, T> {
        let fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        LeadChanges::new(self, since, fields)
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("api", &self.api)
            .field("client_id", &self.client_id)
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays canned responses in order and records every request.
    #[derive(Default)]
    struct Scripted {
        responses: RefCell<VecDeque<Result<HttpResponse>>>,
        requests: RefCell<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn push(&self, status: u16, body: serde_json::Value) {
            self.responses.borrow_mut().push_back(Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }));
        }

        fn push_err(&self, message: &str) {
            self.responses.borrow_mut().push_back(Err(MarketoError::Transport {
                message: message.to_string(),
            }));
        }

        fn paths(&self) -> Vec<String> {
            self.requests
                .borrow()
                .iter()
                .map(|r| r.redacted_path().to_string())
                .collect()
        }
    }

    impl Transport for Scripted {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected request to {}", request.path))
        }
    }

    fn client() -> Client<Scripted> {
        let config = MarketoConfig::new("http://mkto/identity", "cid", "secret", "http://mkto/rest");
        Client::with_transport(&config, Scripted::default())
    }

    fn token(value: &str) -> serde_json::Value {
        json!({"access_token": value, "token_type": "bearer", "expires_in": 3599, "scope": "apis"})
    }

    #[test]
    fn construction_is_lazy() {
        let client = client();
        assert!(!client.is_authenticated());
        assert!(client.transport().requests.borrow().is_empty());
    }

    #[test]
    fn config_page_size_reaches_requests() {
        let mut config = MarketoConfig::new("http://mkto/identity", "cid", "secret", "http://mkto/rest");
        config.page_size = 50;
        let client = Client::with_transport(&config, Scripted::default());
        assert_eq!(client.api().page_size(), 50);

        client.transport().push(200, token("t1"));
        client
            .transport()
            .push(200, json!({"success": true, "moreResult": false, "result": []}));
        client.lead_changes_page("P1", &["email"]).unwrap();

        let requests = client.transport().requests.borrow();
        assert!(requests[1].path.ends_with("batchSize=50"));
    }

    #[test]
    fn first_call_authenticates_then_reuses_token() {
        let client = client();
        client.transport().push(200, token("t1"));
        client.transport().push(200, json!({"success": true, "result": [{"id": 1}]}));
        client.transport().push(200, json!({"success": true, "result": [{"id": 2}]}));

        client.get_lead(1).unwrap();
        client.get_lead(2).unwrap();

        assert_eq!(
            client.transport().paths(),
            vec![
                "http://mkto/identity/oauth/token",
                "http://mkto/rest/v1/lead/1.json",
                "http://mkto/rest/v1/lead/2.json",
            ]
        );
        let requests = client.transport().requests.borrow();
        assert_eq!(requests[2].header("authorization"), Some("Bearer t1"));
    }

    #[test]
    fn rejected_credentials_surface_as_auth() {
        let client = client();
        client.transport().push(
            401,
            json!({"error": "unauthorized", "error_description": "Bad client credentials"}),
        );
        let err = client.authenticate().unwrap_err();
        assert!(err.is_auth());
        assert!(!client.is_authenticated());
    }

    #[test]
    fn unreachable_identity_is_auth() {
        let client = client();
        client.transport().push_err("connection refused");
        assert!(client.authenticate().unwrap_err().is_auth());
    }

    #[test]
    fn expired_token_code_triggers_single_reauth() {
        let client = client();
        client.transport().push(200, token("stale"));
        client.transport().push(
            200,
            json!({"success": false, "errors": [{"code": "602", "message": "Access token expired"}]}),
        );
        client.transport().push(200, token("fresh"));
        client.transport().push(200, json!({"success": true, "result": [{"id": 5, "email": "a@b.c"}]}));

        let lead = client.get_lead(5).unwrap();
        assert_eq!(lead["email"], "a@b.c");

        let requests = client.transport().requests.borrow();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].header("authorization"), Some("Bearer fresh"));
    }

    #[test]
    fn reissued_short_lived_token_is_reused() {
        let client = client();
        client
            .transport()
            .push(200, json!({"access_token": "t1", "token_type": "bearer", "expires_in": 45}));
        client.transport().push(200, json!({"success": true, "result": [{"id": 1}]}));
        client.transport().push(200, json!({"success": true, "result": [{"id": 2}]}));

        client.get_lead(1).unwrap();
        client.get_lead(2).unwrap();

        let paths = client.transport().paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths.iter().filter(|p| p.ends_with("/oauth/token")).count(), 1);
    }

    #[test]
    fn second_rejection_is_auth_error() {
        let client = client();
        client.transport().push(200, token("t1"));
        client.transport().push(401, json!({}));
        client.transport().push(200, token("t2"));
        client.transport().push(401, json!({}));

        let err = client.get_lead(5).unwrap_err();
        assert!(err.is_auth());
        assert_eq!(client.transport().requests.borrow().len(), 4);
        assert!(!client.is_authenticated());
    }

    #[test]
    fn not_found_is_not_retried() {
        let client = client();
        client.transport().push(200, token("t1"));
        client.transport().push(200, json!({"success": true, "result": []}));

        let err = client.get_lead(404).unwrap_err();
        assert!(matches!(err, MarketoError::NotFound { id: 404 }));
        assert_eq!(client.transport().requests.borrow().len(), 2);
    }

    #[test]
    fn transport_failure_is_not_retried() {
        let client = client();
        client.transport().push(200, token("t1"));
        client.transport().push_err("connection reset");

        let err = client.get_lead(1).unwrap_err();
        assert!(matches!(err, MarketoError::Transport { .. }));
        assert_eq!(client.transport().requests.borrow().len(), 2);
    }

    #[test]
    fn update_lead_posts_dirty_fields() {
        let client = client();
        client.transport().push(200, token("t1"));
        client
            .transport()
            .push(200, json!({"success": true, "result": [{"id": 9, "status": "updated"}]}));

        let mut fields = LeadFields::new();
        fields.insert("leadScore".to_string(), json!(50));
        let status = client.update_lead(9, &fields).unwrap();
        assert_eq!(status.id, Some(9));

        let requests = client.transport().requests.borrow();
        assert_eq!(requests[1].method, HttpMethod::Post);
        let body: serde_json::Value = serde_json::from_str(requests[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["input"], json!([{"id": 9, "leadScore": 50}]));
    }

    #[test]
    fn get_leads_with_no_ids_skips_network() {
        let client = client();
        let leads = client.get_leads(&[], &["email"]).unwrap();
        assert!(leads.is_empty());
        assert!(client.transport().requests.borrow().is_empty());
    }

    #[test]
    fn debug_hides_credentials() {
        let rendered = format!("{:?}", client());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("authenticated: false"));
    }
}
