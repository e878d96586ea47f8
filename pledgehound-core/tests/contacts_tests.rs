// Tests for the contact extraction stage against a real database

use futures::future::BoxFuture;
use pledgehound_core::contacts::{
    Account, AccountStatus, AccountStore, BlockedDomainStore, ContactRunOptions, ContactStore,
    CreatorRow, ExtractionConfig, ExtractionProvider, ScrapedContact, run_contacts,
};
use pledgehound_core::data::Database;
use pledgehound_core::error::{ContactError, ProviderError, StoreError, StoreResult};
use pledgehound_core::model::Project;
use pledgehound_core::sync::{BulkUpsert, Entity, UpsertOutcome, sync_all};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

/// Answers by host: good.com has an email, reddit.com is unsupported,
/// anything else has nothing.
struct HostProvider;

impl ExtractionProvider for HostProvider {
    fn map_site<'a>(
        &'a self,
        _api_key: &'a str,
        _url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ProviderError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn scrape_contact<'a>(
        &'a self,
        _api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<ScrapedContact, ProviderError>> {
        Box::pin(async move {
            if url.contains("good.com") {
                Ok(ScrapedContact {
                    email: Some("Hello@Good.com".to_string()),
                    ..Default::default()
                })
            } else if url.contains("reddit.com") {
                Err(ProviderError::WebsiteNotSupported(
                    "This website is no longer supported".to_string(),
                ))
            } else {
                Ok(ScrapedContact::default())
            }
        })
    }
}

struct BrokeProvider;

impl ExtractionProvider for BrokeProvider {
    fn map_site<'a>(
        &'a self,
        _api_key: &'a str,
        _url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ProviderError>> {
        Box::pin(async { Err(ProviderError::PaymentRequired) })
    }

    fn scrape_contact<'a>(
        &'a self,
        _api_key: &'a str,
        _url: &'a str,
    ) -> BoxFuture<'a, Result<ScrapedContact, ProviderError>> {
        Box::pin(async { Err(ProviderError::PaymentRequired) })
    }
}

/// Pays for good.com only; every other site finds the account out of credit.
struct MeteredProvider;

impl ExtractionProvider for MeteredProvider {
    fn map_site<'a>(
        &'a self,
        _api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ProviderError>> {
        Box::pin(async move {
            if url.contains("good.com") {
                Ok(Vec::new())
            } else {
                Err(ProviderError::PaymentRequired)
            }
        })
    }

    fn scrape_contact<'a>(
        &'a self,
        _api_key: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<ScrapedContact, ProviderError>> {
        Box::pin(async move {
            if url.contains("good.com") {
                Ok(ScrapedContact {
                    email: Some("hello@good.com".to_string()),
                    ..Default::default()
                })
            } else {
                Err(ProviderError::PaymentRequired)
            }
        })
    }
}

/// A database whose pipeline state cannot be written.
struct StuckStateStore(Database);

impl BulkUpsert for StuckStateStore {
    fn upsert(&self, entity: Entity, rows: &[Value]) -> StoreResult<UpsertOutcome> {
        BulkUpsert::upsert(&self.0, entity, rows)
    }
}

impl AccountStore for StuckStateStore {
    fn load_accounts(&self) -> StoreResult<Vec<Account>> {
        AccountStore::load_accounts(&self.0)
    }

    fn mark_account_exhausted(&self, api_key: &str, exhausted_at: &str) -> StoreResult<()> {
        AccountStore::mark_account_exhausted(&self.0, api_key, exhausted_at)
    }
}

impl BlockedDomainStore for StuckStateStore {
    fn load_blocked_domains(&self) -> StoreResult<HashSet<String>> {
        BlockedDomainStore::load_blocked_domains(&self.0)
    }

    fn insert_blocked_domain(&self, domain: &str, reason: &str) -> StoreResult<()> {
        BlockedDomainStore::insert_blocked_domain(&self.0, domain, reason)
    }
}

impl ContactStore for StuckStateStore {
    fn contact_candidates(&self) -> StoreResult<Vec<CreatorRow>> {
        ContactStore::contact_candidates(&self.0)
    }

    fn last_contact_check(&self) -> StoreResult<Option<String>> {
        ContactStore::last_contact_check(&self.0)
    }

    fn record_contact_check(&self, _timestamp: &str) -> StoreResult<()> {
        Err(StoreError::MissingKey("pipeline_state"))
    }
}

fn project(id: u64, creator_id: u64, site: &str) -> Project {
    Project::new(id, Some(&format!("p-{}", id))).with_field(
        "creator",
        json!({
            "id": creator_id,
            "name": format!("Creator {}", creator_id),
            "websites": [{"url": site, "domain": site.trim_start_matches("https://")}]
        }),
    )
}

fn seeded_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    sync_all(
        &db,
        &[
            project(1, 11, "https://good.com"),
            project(2, 12, "https://reddit.com"),
            project(3, 13, "https://quiet.com"),
        ],
        1000,
    );
    db.add_account(Some("a@x.com"), "key-a").unwrap();
    (temp_dir, Arc::new(db))
}

fn options(dry_run: bool) -> ContactRunOptions {
    ContactRunOptions {
        workers: 2,
        batch_size: 2,
        dry_run,
        extraction: ExtractionConfig::immediate(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_contacts_persists_outcomes() {
    let (_temp_dir, db) = seeded_db();

    let stats = run_contacts(Arc::clone(&db), Arc::new(HostProvider), &options(false))
        .await
        .unwrap();

    assert_eq!(stats.selected, 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.persisted, 3);

    let good = db.get_row(Entity::Outreach, 11).unwrap().unwrap();
    assert_eq!(good["email"], "hello@good.com");
    assert_eq!(good["contact_status"], "completed");
    assert_eq!(good["contact_attempts"], 1);
    assert_eq!(good["outreach_status"], "not_contacted");
    assert!(good["site_hash"].is_string());

    let blocked = db.get_row(Entity::Outreach, 12).unwrap().unwrap();
    assert_eq!(blocked["contact_status"], "blocked");
    assert!(db.load_blocked_domains().unwrap().contains("reddit.com"));

    let quiet = db.get_row(Entity::Outreach, 13).unwrap().unwrap();
    assert_eq!(quiet["contact_status"], "not_found");
    assert_eq!(quiet["has_contact_form"], false);

    assert!(db.last_contact_check().unwrap().is_some());
}

#[tokio::test]
async fn test_second_run_selects_nobody() {
    let (_temp_dir, db) = seeded_db();

    run_contacts(Arc::clone(&db), Arc::new(HostProvider), &options(false))
        .await
        .unwrap();
    let stats = run_contacts(Arc::clone(&db), Arc::new(HostProvider), &options(false))
        .await
        .unwrap();

    assert_eq!(stats.selected, 0);
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let (_temp_dir, db) = seeded_db();

    let stats = run_contacts(Arc::clone(&db), Arc::new(HostProvider), &options(true))
        .await
        .unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.persisted, 0);

    let good = db.get_row(Entity::Outreach, 11).unwrap().unwrap();
    assert!(good.get("contact_status").is_none());
    assert!(db.load_blocked_domains().unwrap().is_empty());
    assert_eq!(db.last_contact_check().unwrap(), None);
}

#[tokio::test]
async fn test_limit_caps_selection() {
    let (_temp_dir, db) = seeded_db();

    let run_options = ContactRunOptions {
        limit: Some(1),
        ..options(false)
    };
    let stats = run_contacts(Arc::clone(&db), Arc::new(HostProvider), &run_options)
        .await
        .unwrap();

    assert_eq!(stats.selected, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_exhausted_accounts_abort_the_stage() {
    let (_temp_dir, db) = seeded_db();

    let run_options = ContactRunOptions {
        workers: 1,
        ..options(false)
    };
    let result = run_contacts(Arc::clone(&db), Arc::new(BrokeProvider), &run_options).await;

    assert!(matches!(result, Err(ContactError::AllAccountsExhausted)));
    let accounts = db.load_accounts().unwrap();
    assert_eq!(accounts[0].status, AccountStatus::Exhausted);
    assert!(accounts[0].exhausted_at.is_some());
    assert_eq!(db.last_contact_check().unwrap(), None);
}

#[tokio::test]
async fn test_no_accounts_is_exhaustion() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
    sync_all(db.as_ref(), &[project(1, 11, "https://good.com")], 1000);

    let result = run_contacts(Arc::clone(&db), Arc::new(HostProvider), &options(false)).await;
    assert!(matches!(result, Err(ContactError::AllAccountsExhausted)));
}

#[tokio::test]
async fn test_exhaustion_still_saves_finished_creators() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&temp_dir.path().join("test.db")).unwrap());
    sync_all(
        db.as_ref(),
        &[project(1, 11, "https://good.com"), project(2, 12, "https://paywall.com")],
        1000,
    );
    db.add_account(Some("a@x.com"), "key-a").unwrap();

    let run_options = ContactRunOptions {
        workers: 1,
        batch_size: 20,
        ..options(false)
    };
    let result = run_contacts(Arc::clone(&db), Arc::new(MeteredProvider), &run_options).await;

    assert!(matches!(result, Err(ContactError::AllAccountsExhausted)));

    let good = db.get_row(Entity::Outreach, 11).unwrap().unwrap();
    assert_eq!(good["contact_status"], "completed");
    assert_eq!(good["email"], "hello@good.com");

    let paywalled = db.get_row(Entity::Outreach, 12).unwrap().unwrap();
    assert!(paywalled.get("contact_status").is_none());

    assert_eq!(db.last_contact_check().unwrap(), None);
}

#[tokio::test]
async fn test_pipeline_state_failure_does_not_fail_the_stage() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    sync_all(&db, &[project(1, 11, "https://good.com")], 1000);
    db.add_account(None, "key-a").unwrap();
    let store = Arc::new(StuckStateStore(db));

    let stats = run_contacts(Arc::clone(&store), Arc::new(HostProvider), &options(false))
        .await
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.persisted, 1);
    let saved = store.0.get_row(Entity::Outreach, 11).unwrap().unwrap();
    assert_eq!(saved["contact_status"], "completed");
    assert_eq!(store.0.last_contact_check().unwrap(), None);
}
