//! Blocking client for the Marketo REST API.
//!
//! # Overview
//! Fetch and update lead records and poll for field-level changes without
//! handling OAuth tokens, pagination, or JSON envelopes by hand.
//!
//! # Design
//! - `MarketoApi` builds `HttpRequest` values and parses `HttpResponse`
//!   values without touching the network, keeping wire shaping testable.
//! - `Client` executes requests over a `Transport` (ureq by default), owns
//!   the access token, and re-authenticates once when Marketo rejects it.
//! - `Lead` is a lazily loaded proxy for one record: reads load it once,
//!   writes stay local until `save()`.
//! - `LeadChanges` pages through `activities/leadchanges.json` on demand.
//!
//! ```no_run
//! use marketo_core::{Client, Lead};
//!
//! # fn main() -> marketo_core::Result<()> {
//! let client = Client::new(
//!     "https://123-abc-456.mktorest.com/identity",
//!     "client-id",
//!     "client-secret",
//!     "https://123-abc-456.mktorest.com/rest",
//! );
//!
//! let mut lead = Lead::new(&client, 318581);
//! let score: Option<i64> = lead.get_as("leadScore")?;
//! lead.set("leadScore", score.unwrap_or(0) + 10);
//! lead.save()?;
//!
//! for change in client.get_lead_changes("2015-08-04", &["leadScore", "email"]) {
//!     let change = change?;
//!     println!("lead {} changed at {}", change.lead_id, change.activity_date);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod changes;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod lead;
pub mod types;

pub use api::MarketoApi;
pub use changes::LeadChanges;
pub use client::Client;
pub use config::{ConfigError, MarketoConfig};
pub use error::{MarketoError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport, UreqTransport};
pub use lead::Lead;
pub use types::{ChangePage, FieldChange, LeadChange, LeadFields, LeadId, SyncStatus, TokenResponse};
