//! In-memory imitation of the Marketo identity and REST endpoints.
//!
//! Covers the calls the client library makes: client-credentials token
//! exchange, single and bulk lead lookup, `updateOnly` lead sync, paging
//! tokens, and lead-change polling. Every REST reply uses Marketo's envelope
//! (`requestId`, `success`, `errors`, `result`, ...). Updates append a
//! "Change Data Value" activity, so a save is visible to change polling.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const CLIENT_ID: &str = "mock-client-id";
pub const CLIENT_SECRET: &str = "mock-client-secret";

/// Activity type Marketo uses for field value changes.
const CHANGE_DATA_VALUE: u32 = 13;
const MAX_BATCH_SIZE: usize = 300;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub name: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// One stored lead-change activity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    pub id: u64,
    pub lead_id: u64,
    pub activity_date: String,
    pub activity_type_id: u32,
    pub fields: Vec<FieldChange>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLeads {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub lookup_field: Option<String>,
    pub input: Vec<Map<String, Value>>,
}

#[derive(Debug)]
pub struct MockMarketo {
    pub client_id: String,
    pub client_secret: String,
    pub token_ttl: u64,
    pub leads: BTreeMap<u64, Map<String, Value>>,
    pub changes: Vec<ChangeRow>,
    tokens: HashSet<String>,
    expired: HashSet<String>,
    page_tokens: HashMap<String, usize>,
    hits: HashMap<&'static str, usize>,
}

impl MockMarketo {
    pub fn empty() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            client_secret: CLIENT_SECRET.to_string(),
            token_ttl: 3599,
            leads: BTreeMap::new(),
            changes: Vec::new(),
            tokens: HashSet::new(),
            expired: HashSet::new(),
            page_tokens: HashMap::new(),
            hits: HashMap::new(),
        }
    }

    /// Three leads and five change activities. Polling `leadScore,email`
    /// since `2015-08-04` yields activities 2, 3 and 5, in that order.
    pub fn seeded() -> Self {
        let mut mock = Self::empty();
        for lead in [
            json!({"id": 6, "email": "jane.doe@example.com", "firstName": "Jane", "lastName": "Doe", "company": "Acme", "leadScore": 25}),
            json!({"id": 7, "email": "j.roe@globex.com", "firstName": "John", "lastName": "Roe", "company": "Globex", "leadScore": 42}),
            json!({"id": 8, "email": "ann.lee@initech.com", "firstName": "Ann", "lastName": "Lee", "company": "Initech", "leadScore": 5}),
        ] {
            if let Value::Object(fields) = lead {
                let id = fields.get("id").and_then(Value::as_u64).unwrap_or_default();
                mock.leads.insert(id, fields);
            }
        }

        let seed = [
            (6, "2015-08-03T08:00:00Z", "leadScore", json!(0), json!(10)),
            (6, "2015-08-04T09:15:00Z", "leadScore", json!(10), json!(25)),
            (7, "2015-08-04T10:30:00Z", "email", json!("john.roe@example.com"), json!("j.roe@globex.com")),
            (8, "2015-08-04T11:45:00Z", "company", json!("Initrode"), json!("Initech")),
            (7, "2015-08-05T07:00:00Z", "leadScore", json!(30), json!(42)),
        ];
        for (lead_id, date, name, old_value, new_value) in seed {
            mock.record_change(
                lead_id,
                date.to_string(),
                vec![FieldChange {
                    name: name.to_string(),
                    old_value,
                    new_value,
                }],
            );
        }
        mock
    }

    /// Number of requests served by the named route (`token`, `get_lead`,
    /// `get_leads`, `sync_leads`, `paging_token`, `lead_changes`).
    pub fn hits(&self, route: &str) -> usize {
        self.hits.get(route).copied().unwrap_or(0)
    }

    /// Marks every issued token as expired, as Marketo does after an hour.
    pub fn expire_tokens(&mut self) {
        self.expired.extend(self.tokens.drain());
    }

    /// Tokens handed out so far, live or expired.
    pub fn issued_tokens(&self) -> usize {
        self.tokens.len() + self.expired.len()
    }

    fn hit(&mut self, route: &'static str) {
        *self.hits.entry(route).or_insert(0) += 1;
    }

    fn record_change(&mut self, lead_id: u64, activity_date: String, fields: Vec<FieldChange>) {
        let id = self.changes.len() as u64 + 1;
        self.changes.push(ChangeRow {
            id,
            lead_id,
            activity_date,
            activity_type_id: CHANGE_DATA_VALUE,
            fields,
        });
    }

    fn issue_page_token(&mut self, offset: usize) -> String {
        let token = Uuid::new_v4().simple().to_string().to_uppercase();
        self.page_tokens.insert(token.clone(), offset);
        token
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Json<Value>> {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            None => Err(failure("600", "Access token not specified")),
            Some(t) if self.tokens.contains(t) => Ok(()),
            Some(t) if self.expired.contains(t) => Err(failure("602", "Access token expired")),
            Some(_) => Err(failure("601", "Access token invalid")),
        }
    }
}

pub type Db = Arc<RwLock<MockMarketo>>;

pub fn app() -> Router {
    app_with_state(Arc::new(RwLock::new(MockMarketo::seeded())))
}

pub fn app_with_state(db: Db) -> Router {
    Router::new()
        .route("/identity/oauth/token", get(issue_token))
        .route("/rest/v1/lead/{file}", get(get_lead))
        .route("/rest/v1/leads.json", get(get_leads).post(sync_leads))
        .route("/rest/v1/activities/pagingtoken.json", get(paging_token))
        .route("/rest/v1/activities/leadchanges.json", get(lead_changes))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, Arc::new(RwLock::new(MockMarketo::seeded()))).await
}

pub async fn run_with_state(listener: TcpListener, db: Db) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(db)).await
}

fn envelope(result: Vec<Value>, extra: &[(&str, Value)]) -> Json<Value> {
    let mut body = json!({
        "requestId": request_id(),
        "success": true,
        "result": result,
    });
    if let Value::Object(map) = &mut body {
        for (key, value) in extra {
            map.insert((*key).to_string(), value.clone());
        }
    }
    Json(body)
}

fn failure(code: &str, message: &str) -> Json<Value> {
    Json(json!({
        "requestId": request_id(),
        "success": false,
        "errors": [{"code": code, "message": message}],
    }))
}

fn request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}#{}", &id[..4], &id[4..15])
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn project(lead: &Map<String, Value>, fields: &[String]) -> Value {
    if fields.is_empty() {
        return Value::Object(lead.clone());
    }
    let mut out = Map::new();
    if let Some(id) = lead.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    for name in fields {
        out.insert(name.clone(), lead.get(name).cloned().unwrap_or(Value::Null));
    }
    Value::Object(out)
}

async fn issue_token(
    State(db): State<Db>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut mock = db.write().await;
    mock.hit("token");

    let granted = params.get("grant_type").map(String::as_str) == Some("client_credentials")
        && params.get("client_id") == Some(&mock.client_id)
        && params.get("client_secret") == Some(&mock.client_secret);
    if !granted {
        tracing::warn!("rejected token request with bad client credentials");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized", "error_description": "Bad client credentials"})),
        ));
    }

    let token = format!("{}:ab", Uuid::new_v4());
    mock.tokens.insert(token.clone());
    tracing::debug!(ttl = mock.token_ttl, "issued access token");
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": mock.token_ttl,
        "scope": "apis@mock.example.com",
    })))
}

async fn get_lead(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(file): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let mut mock = db.write().await;
    mock.hit("get_lead");
    if let Err(denied) = mock.authorize(&headers) {
        return Ok(denied);
    }

    let id: u64 = file
        .strip_suffix(".json")
        .and_then(|id| id.parse().ok())
        .ok_or(StatusCode::NOT_FOUND)?;
    let fields = split_list(params.get("fields"));
    let result = mock
        .leads
        .get(&id)
        .map(|lead| vec![project(lead, &fields)])
        .unwrap_or_default();
    Ok(envelope(result, &[]))
}

async fn get_leads(
    State(db): State<Db>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut mock = db.write().await;
    mock.hit("get_leads");
    if let Err(denied) = mock.authorize(&headers) {
        return denied;
    }

    if params.get("filterType").map(String::as_str) != Some("id") {
        return failure("1003", "Invalid filterType");
    }
    let fields = split_list(params.get("fields"));
    let result = split_list(params.get("filterValues"))
        .iter()
        .filter_map(|id| id.parse::<u64>().ok())
        .filter_map(|id| mock.leads.get(&id))
        .map(|lead| project(lead, &fields))
        .collect();
    envelope(result, &[])
}

async fn sync_leads(
    State(db): State<Db>,
    headers: HeaderMap,
    Json(input): Json<SyncLeads>,
) -> Json<Value> {
    let mut mock = db.write().await;
    mock.hit("sync_leads");
    if let Err(denied) = mock.authorize(&headers) {
        return denied;
    }

    if input.action.as_deref().unwrap_or("createOrUpdate") != "updateOnly"
        || input.lookup_field.as_deref().unwrap_or("email") != "id"
    {
        return failure("1003", "Only updateOnly by id is supported");
    }

    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let mut result = Vec::with_capacity(input.input.len());
    for record in input.input {
        let Some(id) = record.get("id").and_then(Value::as_u64) else {
            result.push(skipped("1003", "Field 'id' is required"));
            continue;
        };
        if let Some(score) = record.get("leadScore") {
            if !score.is_i64() && !score.is_null() {
                result.push(skipped("1003", "Value for field 'leadScore' is invalid"));
                continue;
            }
        }
        let Some(lead) = mock.leads.get_mut(&id) else {
            result.push(skipped("1004", "Lead not found"));
            continue;
        };

        let mut changed = Vec::new();
        for (name, new_value) in record.into_iter().filter(|(name, _)| name != "id") {
            let old_value = lead.insert(name.clone(), new_value.clone()).unwrap_or(Value::Null);
            if old_value != new_value {
                changed.push(FieldChange {
                    name,
                    old_value,
                    new_value,
                });
            }
        }
        if !changed.is_empty() {
            mock.record_change(id, now.clone(), changed);
        }
        result.push(json!({"id": id, "status": "updated"}));
    }
    envelope(result, &[])
}

fn skipped(code: &str, message: &str) -> Value {
    json!({"status": "skipped", "reasons": [{"code": code, "message": message}]})
}

async fn paging_token(
    State(db): State<Db>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut mock = db.write().await;
    mock.hit("paging_token");
    if let Err(denied) = mock.authorize(&headers) {
        return denied;
    }

    let Some(since) = params.get("sinceDatetime").filter(|s| !s.is_empty()) else {
        return failure("1003", "sinceDatetime cannot be blank");
    };
    // ISO-8601 strings order lexicographically.
    let offset = mock
        .changes
        .iter()
        .position(|row| row.activity_date.as_str() >= since.as_str())
        .unwrap_or(mock.changes.len());
    let token = mock.issue_page_token(offset);
    Json(json!({
        "requestId": request_id(),
        "success": true,
        "nextPageToken": token,
    }))
}

async fn lead_changes(
    State(db): State<Db>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut mock = db.write().await;
    mock.hit("lead_changes");
    if let Err(denied) = mock.authorize(&headers) {
        return denied;
    }

    let Some(start) = params
        .get("nextPageToken")
        .and_then(|t| mock.page_tokens.get(t))
        .copied()
    else {
        return failure("1003", "Invalid nextPageToken");
    };
    let fields = split_list(params.get("fields"));
    if fields.is_empty() {
        return failure("1003", "fields cannot be blank");
    }
    let batch_size = params
        .get("batchSize")
        .and_then(|b| b.parse::<usize>().ok())
        .unwrap_or(MAX_BATCH_SIZE)
        .clamp(1, MAX_BATCH_SIZE);

    let mut result = Vec::new();
    let mut cursor = start;
    while cursor < mock.changes.len() && result.len() < batch_size {
        let row = &mock.changes[cursor];
        cursor += 1;
        let watched: Vec<Value> = row
            .fields
            .iter()
            .filter(|f| fields.contains(&f.name))
            .enumerate()
            .map(|(i, f)| {
                json!({"id": i + 1, "name": f.name, "oldValue": f.old_value, "newValue": f.new_value})
            })
            .collect();
        if watched.is_empty() {
            continue;
        }
        result.push(json!({
            "id": row.id,
            "leadId": row.lead_id,
            "activityDate": row.activity_date,
            "activityTypeId": row.activity_type_id,
            "fields": watched,
            "attributes": [],
        }));
    }

    let more_result = mock.changes[cursor..]
        .iter()
        .any(|row| row.fields.iter().any(|f| fields.contains(&f.name)));
    let next = mock.issue_page_token(cursor);
    envelope(
        result,
        &[
            ("nextPageToken", Value::from(next)),
            ("moreResult", Value::from(more_result)),
        ],
    )
}
