// Tests for database functionality

use pledgehound_core::contacts::{AccountStatus, AccountStore, BlockedDomainStore, ContactStore};
use pledgehound_core::data::Database;
use pledgehound_core::model::Project;
use pledgehound_core::sync::{BulkUpsert, Entity, sync_all};
use serde_json::json;
use tempfile::TempDir;

fn create_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).unwrap();
    (temp_dir, db)
}

fn project(id: u64, creator_id: u64, name: &str) -> Project {
    Project::new(id, Some(&format!("project-{}", id)))
        .with_field("name", json!(format!("Project {}", id)))
        .with_field("created_at", json!(1_700_000_000))
        .with_field(
            "creator",
            json!({
                "id": creator_id,
                "name": name,
                "slug": format!("creator-{}", creator_id),
                "websites": [{"url": "https://www.studio.com/", "domain": "www.studio.com"}]
            }),
        )
}

// ============================================================================
// Database Creation Tests
// ============================================================================

#[test]
fn test_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("test.db");

    let db = Database::new(&db_path);
    assert!(db.is_ok());
    assert!(db_path.exists());
}

#[test]
fn test_database_exists() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    assert!(!Database::exists(&db_path));

    let _db = Database::new(&db_path).unwrap();
    assert!(Database::exists(&db_path));
}

#[test]
fn test_database_drop() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let _db = Database::new(&db_path).unwrap();
    assert!(Database::exists(&db_path));

    Database::drop(&db_path).unwrap();
    assert!(!Database::exists(&db_path));
}

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    {
        let db = Database::new(&db_path).unwrap();
        db.upsert_rows(Entity::Creators, &[json!({"id": 1, "name": "A"})])
            .unwrap();
    }

    let db = Database::new(&db_path).unwrap();
    assert_eq!(db.count(Entity::Creators).unwrap(), 1);
}

// ============================================================================
// Upsert Tests
// ============================================================================

#[test]
fn test_upsert_insert_update_unchanged() {
    let (_temp_dir, db) = create_test_db();

    let first = db
        .upsert(
            Entity::Creators,
            &[json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B"})],
        )
        .unwrap();
    assert_eq!(first.inserted_count, 2);
    assert_eq!(first.updated_count, 0);
    assert_eq!(first.total_count, 2);

    let second = db
        .upsert(
            Entity::Creators,
            &[json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B2"})],
        )
        .unwrap();
    assert_eq!(second.inserted_count, 0);
    assert_eq!(second.updated_count, 1);
    assert_eq!(second.total_count, 2);

    let stored = db.get_row(Entity::Creators, 2).unwrap().unwrap();
    assert_eq!(stored["name"], "B2");
}

#[test]
fn test_upsert_timestamps_do_not_count_as_changes() {
    let (_temp_dir, db) = create_test_db();

    db.upsert(Entity::Projects, &[json!({"id": 5, "name": "P", "updated_at": "2025-01-01"})])
        .unwrap();
    let outcome = db
        .upsert(Entity::Projects, &[json!({"id": 5, "name": "P", "updated_at": "2025-02-01"})])
        .unwrap();

    assert_eq!(outcome.updated_count, 0);
    assert_eq!(outcome.inserted_count, 0);
}

#[test]
fn test_upsert_reports_rows_without_key() {
    let (_temp_dir, db) = create_test_db();

    let outcome = db
        .upsert(
            Entity::Projects,
            &[json!({"name": "no id"}), json!("not an object"), json!({"id": 3})],
        )
        .unwrap();

    assert_eq!(outcome.inserted_count, 1);
    assert_eq!(outcome.total_count, 1);
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(db.count(Entity::Projects).unwrap(), 1);
}

#[test]
fn test_outreach_merge_keeps_workflow_fields() {
    let (_temp_dir, db) = create_test_db();

    db.upsert(
        Entity::Outreach,
        &[json!({"creator_id": 9, "outreach_status": "not_contacted", "tags": [], "has_instagram": false})],
    )
    .unwrap();

    let contact = db
        .upsert(
            Entity::Outreach,
            &[json!({"creator_id": 9, "email": "hi@studio.com", "contact_status": "completed"})],
        )
        .unwrap();
    assert_eq!(contact.updated_count, 1);

    // A later sync must not reset the workflow or wipe the contact result.
    db.upsert(
        Entity::Outreach,
        &[json!({"creator_id": 9, "outreach_status": "not_contacted", "tags": [], "has_instagram": true})],
    )
    .unwrap();

    let stored = db.get_row(Entity::Outreach, 9).unwrap().unwrap();
    assert_eq!(stored["email"], "hi@studio.com");
    assert_eq!(stored["contact_status"], "completed");
    assert_eq!(stored["has_instagram"], true);
    assert_eq!(stored["outreach_status"], "not_contacted");
}

#[test]
fn test_outreach_insert_only_fields_survive_updates() {
    let (_temp_dir, db) = create_test_db();

    db.upsert(
        Entity::Outreach,
        &[json!({"creator_id": 4, "outreach_status": "replied", "notes": "call back"})],
    )
    .unwrap();
    let outcome = db
        .upsert(
            Entity::Outreach,
            &[json!({"creator_id": 4, "outreach_status": "not_contacted", "notes": null})],
        )
        .unwrap();

    assert_eq!(outcome.updated_count, 0);
    let stored = db.get_row(Entity::Outreach, 4).unwrap().unwrap();
    assert_eq!(stored["outreach_status"], "replied");
    assert_eq!(stored["notes"], "call back");
}

#[test]
fn test_existing_project_ids() {
    let (_temp_dir, db) = create_test_db();

    db.upsert(Entity::Projects, &[json!({"id": 1}), json!({"id": 3})])
        .unwrap();

    let known = db.existing_project_ids(&[1, 2, 3, 4]).unwrap();
    assert_eq!(known.len(), 2);
    assert!(known.contains(&1));
    assert!(known.contains(&3));
    assert!(db.existing_project_ids(&[]).unwrap().is_empty());
}

#[test]
fn test_sync_all_against_database() {
    let (_temp_dir, db) = create_test_db();
    let projects = vec![
        project(100, 1, "Studio One"),
        project(101, 1, "Studio One"),
        project(102, 2, "Studio Two"),
    ];

    let report = sync_all(&db, &projects, 2);
    assert_eq!(report.creators.inserted, 2);
    assert_eq!(report.projects.inserted, 3);
    assert_eq!(report.outreach.inserted, 2);
    assert_eq!(report.total_errors(), 0);

    let again = sync_all(&db, &projects, 2);
    assert_eq!(again.creators.unchanged, 2);
    assert_eq!(again.projects.unchanged, 3);
    assert_eq!(again.outreach.unchanged, 2);
}

// ============================================================================
// Contact Stage Tests
// ============================================================================

#[test]
fn test_creator_rows_join_outreach() {
    let (_temp_dir, db) = create_test_db();
    sync_all(&db, &[project(100, 1, "Studio One"), project(102, 2, "Studio Two")], 1000);
    db.upsert(
        Entity::Outreach,
        &[json!({"creator_id": 2, "contact_status": "completed", "contact_attempts": 1})],
    )
    .unwrap();

    let rows = db.contact_candidates().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].name.as_deref(), Some("Studio One"));
    assert_eq!(rows[0].slug.as_deref(), Some("creator-1"));
    assert_eq!(rows[0].websites.len(), 1);
    assert!(rows[0].created_at.is_some());
    assert!(rows[0].outreach_updated_at.is_some());

    let outreach = rows[1].outreach.as_ref().unwrap();
    assert_eq!(outreach["contact_status"], "completed");
}

#[test]
fn test_pipeline_state() {
    let (_temp_dir, db) = create_test_db();

    assert_eq!(db.last_contact_check().unwrap(), None);
    db.record_contact_check("2025-06-01T00:00:00+00:00").unwrap();
    db.record_contact_check("2025-07-01T00:00:00+00:00").unwrap();
    assert_eq!(
        db.last_contact_check().unwrap().as_deref(),
        Some("2025-07-01T00:00:00+00:00")
    );
}

// ============================================================================
// Account Tests
// ============================================================================

#[test]
fn test_accounts_roundtrip() {
    let (_temp_dir, db) = create_test_db();

    let first = db.add_account(Some("a@x.com"), "key-a").unwrap();
    let second = db.add_account(None, "key-b").unwrap();
    assert_ne!(first, second);

    // Re-adding a known key refreshes it in place.
    assert_eq!(db.add_account(Some("new@x.com"), "key-a").unwrap(), first);

    let accounts = db.load_accounts().unwrap();
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].email.as_deref(), Some("new@x.com"));
    assert!(accounts.iter().all(|a| a.status == AccountStatus::Active));
}

#[test]
fn test_mark_account_exhausted_and_reset() {
    let (_temp_dir, db) = create_test_db();
    db.add_account(None, "key-a").unwrap();
    db.add_account(None, "key-b").unwrap();

    db.mark_account_exhausted("key-a", "2025-06-01T00:00:00+00:00")
        .unwrap();

    let accounts = db.load_accounts().unwrap();
    assert_eq!(accounts[0].status, AccountStatus::Exhausted);
    assert_eq!(
        accounts[0].exhausted_at.as_deref(),
        Some("2025-06-01T00:00:00+00:00")
    );
    assert_eq!(accounts[1].status, AccountStatus::Active);

    assert_eq!(db.reset_accounts().unwrap(), 1);
    assert!(db.load_accounts().unwrap().iter().all(|a| a.is_active()));
}

// ============================================================================
// Blocked Domain Tests
// ============================================================================

#[test]
fn test_blocked_domains() {
    let (_temp_dir, db) = create_test_db();

    db.insert_blocked_domain("Reddit.com", "not supported").unwrap();
    db.insert_blocked_domain("reddit.com", "still not supported")
        .unwrap();
    db.insert_blocked_domain("linktr.ee", "not supported").unwrap();

    let domains = db.load_blocked_domains().unwrap();
    assert_eq!(domains.len(), 2);
    assert!(domains.contains("reddit.com"));

    let listed = db.list_blocked_domains().unwrap();
    assert_eq!(listed[0].0, "linktr.ee");
    assert_eq!(listed[1].1.as_deref(), Some("still not supported"));
}
