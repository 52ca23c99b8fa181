//! End-to-end tests against the live mock server.
//!
//! # Design
//! Starts the mock Marketo on a random port, then drives `Client` and `Lead`
//! over real HTTP through the default ureq transport. The server's per-route
//! hit counters show exactly which calls the library made.

use std::sync::Arc;

use marketo_core::{Client, Lead, MarketoConfig, MarketoError};
use mock_server::{Db, MockMarketo, CLIENT_ID, CLIENT_SECRET};
use serde_json::json;
use tokio::sync::RwLock;

/// Start the mock server on a random port and return its base URL together
/// with a handle on its state.
fn start_server() -> (String, Db) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    let db: Db = Arc::new(RwLock::new(MockMarketo::seeded()));
    let server_db = db.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_state(listener, server_db).await
        })
        .unwrap();
    });

    (format!("http://{addr}"), db)
}

fn config(base: &str) -> MarketoConfig {
    MarketoConfig::new(
        &format!("{base}/identity"),
        CLIENT_ID,
        CLIENT_SECRET,
        &format!("{base}/rest"),
    )
}

fn hits(db: &Db, route: &str) -> usize {
    db.blocking_read().hits(route)
}

#[test]
fn lead_reads_fetch_once() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    let mut lead = Lead::new(&client, 6);
    assert_eq!(hits(&db, "token"), 0, "construction must not touch the network");
    assert_eq!(hits(&db, "get_lead"), 0);

    assert_eq!(lead.get_as::<String>("email").unwrap().as_deref(), Some("jane.doe@example.com"));
    assert_eq!(lead.get_as::<i64>("leadScore").unwrap(), Some(25));
    assert_eq!(lead.get_as::<String>("company").unwrap().as_deref(), Some("Acme"));
    assert_eq!(lead.get("noSuchField").unwrap(), None);

    assert_eq!(hits(&db, "token"), 1);
    assert_eq!(hits(&db, "get_lead"), 1);
}

#[test]
fn unknown_lead_fails_on_first_access() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    let mut lead = Lead::new(&client, 999);
    assert_eq!(hits(&db, "get_lead"), 0);

    let err = lead.get("email").unwrap_err();
    assert!(matches!(err, MarketoError::NotFound { id: 999 }));
}

#[test]
fn save_writes_only_dirty_fields() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    let mut lead = Lead::new(&client, 7);
    lead.set("leadScore", 77);
    assert_eq!(hits(&db, "sync_leads"), 0, "set must not touch the network");

    lead.save().unwrap();
    assert!(!lead.is_dirty());
    assert_eq!(hits(&db, "sync_leads"), 1);

    // The saved value is served locally.
    assert_eq!(lead.get_as::<i64>("leadScore").unwrap(), Some(77));
    assert_eq!(hits(&db, "get_lead"), 0);

    let mock = db.blocking_read();
    assert_eq!(mock.leads[&7]["leadScore"], 77);
    assert_eq!(mock.leads[&7]["email"], "j.roe@globex.com");
}

#[test]
fn rejected_save_keeps_dirty_fields_for_retry() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    let mut lead = Lead::new(&client, 6);
    lead.set("leadScore", "lots");

    let err = lead.save().unwrap_err();
    assert!(matches!(err, MarketoError::Validation { ref code, .. } if code == "1003"));
    assert_eq!(lead.dirty_fields().collect::<Vec<_>>(), vec!["leadScore"]);

    lead.set("leadScore", 30);
    lead.save().unwrap();
    assert_eq!(hits(&db, "sync_leads"), 2);
    assert_eq!(db.blocking_read().leads[&6]["leadScore"], 30);
}

#[test]
fn lead_changes_since_date() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    let changes: Vec<_> = client
        .get_lead_changes("2015-08-04", &["leadScore", "email"])
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(changes.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 3, 5]);
    assert_eq!(changes.iter().map(|c| c.lead_id).collect::<Vec<_>>(), vec![6, 7, 7]);
    assert_eq!(changes[1].fields[0].name, "email");
    assert_eq!(changes[1].fields[0].new_value, json!("j.roe@globex.com"));
    assert_eq!(hits(&db, "paging_token"), 1);
    assert_eq!(hits(&db, "lead_changes"), 1);
}

#[test]
fn lead_changes_follow_pages() {
    let (base, db) = start_server();
    let mut config = config(&base);
    config.page_size = 2;
    let client = Client::from_config(&config);

    let mut stream = client.get_lead_changes("2015-08-04", &["leadScore", "email"]);
    let ids: Vec<u64> = stream.by_ref().map(|c| c.unwrap().id).collect();

    assert_eq!(ids, vec![2, 3, 5]);
    assert_eq!(stream.pages_fetched(), 2);
    assert_eq!(hits(&db, "lead_changes"), 2);
}

#[test]
fn saved_values_show_up_in_change_stream() {
    let (base, _db) = start_server();
    let client = Client::from_config(&config(&base));

    let mut lead = Lead::new(&client, 8);
    lead.set("email", "ann@initech.example");
    lead.save().unwrap();

    let last = client
        .get_lead_changes("2015-08-06", &["email"])
        .last()
        .unwrap()
        .unwrap();
    assert_eq!(last.lead_id, 8);
    assert_eq!(last.new_values()["email"], "ann@initech.example");
}

#[test]
fn expired_token_is_renewed_once() {
    let (base, db) = start_server();
    let client = Client::from_config(&config(&base));

    client.authenticate().unwrap();
    db.blocking_write().expire_tokens();

    let lead = client.get_lead(6).unwrap();
    assert_eq!(lead["firstName"], "Jane");
    assert_eq!(hits(&db, "token"), 2);
    assert_eq!(hits(&db, "get_lead"), 2);
    assert_eq!(db.blocking_read().issued_tokens(), 2);
}

#[test]
fn bad_credentials_are_auth_errors() {
    let (base, db) = start_server();
    let client = Client::new(
        &format!("{base}/identity"),
        CLIENT_ID,
        "wrong-secret",
        &format!("{base}/rest"),
    );

    assert!(client.authenticate().unwrap_err().is_auth());
    let mut lead = Lead::new(&client, 6);
    assert!(lead.get("email").unwrap_err().is_auth());
    assert_eq!(hits(&db, "get_lead"), 0);
    assert_eq!(db.blocking_read().issued_tokens(), 0);
}

#[test]
fn bulk_lookup_skips_unknown_ids() {
    let (base, _db) = start_server();
    let client = Client::from_config(&config(&base));

    let leads = client.get_leads(&[6, 999, 8], &["company"]).unwrap();
    assert_eq!(leads.len(), 2);
    assert_eq!(leads[0]["company"], "Acme");
    assert_eq!(leads[1]["company"], "Initech");
}

#[test]
fn unreachable_server_is_reported() {
    // Bind then drop to obtain a port nothing listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let base = format!("http://{addr}");
    let client = Client::from_config(&config(&base));

    let err = client.authenticate().unwrap_err();
    assert!(err.is_auth(), "identity failures are auth errors, got {err:?}");
}
