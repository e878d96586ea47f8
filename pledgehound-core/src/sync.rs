//! Turns collected projects into creator, project and outreach rows and
//! pushes them through a [`BulkUpsert`] store in chunks.

use crate::error::StoreResult;
use crate::model::{Project, Website};
use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{error, info};

pub const SYNC_CHUNK_SIZE: usize = 1000;
const MAX_ERROR_DETAILS: usize = 10;

pub struct SocialNetwork {
    pub name: &'static str,
    pub domains: &'static [&'static str],
}

pub const SOCIAL_NETWORKS: &[SocialNetwork] = &[
    SocialNetwork { name: "instagram", domains: &["instagram.com"] },
    SocialNetwork { name: "facebook", domains: &["facebook.com"] },
    SocialNetwork { name: "twitter", domains: &["twitter.com", "x.com"] },
    SocialNetwork { name: "youtube", domains: &["youtube.com"] },
    SocialNetwork { name: "tiktok", domains: &["tiktok.com"] },
    SocialNetwork { name: "linkedin", domains: &["linkedin.com"] },
    SocialNetwork { name: "patreon", domains: &["patreon.com"] },
    SocialNetwork { name: "discord", domains: &["discord.gg", "discord.com"] },
    SocialNetwork { name: "twitch", domains: &["twitch.tv"] },
    SocialNetwork { name: "bluesky", domains: &["bsky.app"] },
];

/// Every social domain, flattened.
pub fn social_domains() -> Vec<&'static str> {
    SOCIAL_NETWORKS
        .iter()
        .flat_map(|network| network.domains.iter().copied())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Creators,
    Projects,
    Outreach,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Creators => "creators",
            Entity::Projects => "projects",
            Entity::Outreach => "creator_outreach",
        }
    }

    /// Field that identifies a row of this entity.
    pub fn key_field(&self) -> &'static str {
        match self {
            Entity::Creators | Entity::Projects => "id",
            Entity::Outreach => "creator_id",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertOutcome {
    pub inserted_count: usize,
    pub updated_count: usize,
    pub total_count: usize,
    pub errors: Vec<Value>,
}

/// A store that can insert-or-update a batch of JSON rows of one entity.
pub trait BulkUpsert {
    fn upsert(&self, entity: Entity, rows: &[Value]) -> StoreResult<UpsertOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub error_details: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub creators: SyncStats,
    pub projects: SyncStats,
    pub outreach: SyncStats,
}

impl SyncReport {
    pub fn total_errors(&self) -> usize {
        self.creators.errors + self.projects.errors + self.outreach.errors
    }
}

fn get_or(object: &Map<String, Value>, key: &str, default: Value) -> Value {
    object.get(key).cloned().unwrap_or(default)
}

fn get(object: &Map<String, Value>, key: &str) -> Value {
    get_or(object, key, Value::Null)
}

/// Unix seconds to an RFC 3339 UTC string. Zero, missing or non-numeric
/// values become null.
pub fn unix_to_datetime(value: Option<&Value>) -> Value {
    value
        .and_then(Value::as_i64)
        .filter(|&seconds| seconds != 0)
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .map(|dt| Value::String(dt.to_rfc3339()))
        .unwrap_or(Value::Null)
}

pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_lowercase();
    match domain.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => domain,
    }
}

/// Social network name for a website's domain, if it is one.
pub fn categorize_website(domain: &str) -> Option<&'static str> {
    let normalized = normalize_domain(domain);
    SOCIAL_NETWORKS
        .iter()
        .find(|network| {
            network
                .domains
                .iter()
                .any(|d| normalized == *d || normalized.ends_with(&format!(".{}", d)))
        })
        .map(|network| network.name)
}

/// `has_<network>` flags plus `has_other_website`.
pub fn social_flags(websites: &[Website]) -> Map<String, Value> {
    let mut flags: Map<String, Value> = SOCIAL_NETWORKS
        .iter()
        .map(|network| (format!("has_{}", network.name), Value::Bool(false)))
        .collect();
    flags.insert("has_other_website".to_string(), Value::Bool(false));

    for website in websites {
        if website.url.trim().is_empty() {
            continue;
        }
        let key = match categorize_website(&website.domain) {
            Some(network) => format!("has_{}", network),
            None => "has_other_website".to_string(),
        };
        flags.insert(key, Value::Bool(true));
    }
    flags
}

/// sha256 over the key-sorted row, ignoring timestamps and the hash itself.
pub fn compute_data_hash(row: &Map<String, Value>) -> String {
    let clean: Map<String, Value> = row
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "created_at" | "updated_at" | "data_hash"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let serialized = serde_json::to_string(&clean).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

fn with_hash(mut row: Map<String, Value>) -> Value {
    let hash = compute_data_hash(&row);
    row.insert("data_hash".to_string(), Value::String(hash));
    Value::Object(row)
}

/// One row per creator id; the first project seen wins.
pub fn prepare_creators_data(projects: &[Project]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for project in projects {
        let (Some(creator), Some(creator_id)) = (project.creator(), project.creator_id()) else {
            continue;
        };
        if creator_id == 0 || !seen.insert(creator_id) {
            continue;
        }

        let mut row = Map::new();
        row.insert("id".into(), json!(creator_id));
        row.insert("slug".into(), get(creator, "slug"));
        row.insert("name".into(), get_or(creator, "name", json!("")));
        row.insert("is_registered".into(), get(creator, "is_registered"));
        row.insert("is_email_verified".into(), get(creator, "is_email_verified"));
        row.insert("chosen_currency".into(), get(creator, "chosen_currency"));
        row.insert("is_superbacker".into(), get(creator, "is_superbacker"));
        row.insert(
            "has_admin_message_badge".into(),
            get_or(creator, "has_admin_message_badge", json!(false)),
        );
        row.insert("ppo_has_action".into(), get_or(creator, "ppo_has_action", json!(false)));
        row.insert(
            "backing_action_count".into(),
            get_or(creator, "backing_action_count", json!(0)),
        );
        row.insert("avatar".into(), get(creator, "avatar"));
        row.insert("urls".into(), get(creator, "urls"));
        row.insert("websites".into(), get_or(creator, "websites", json!([])));
        rows.push(with_hash(row));
    }
    rows
}

/// One row per project that has a creator.
pub fn prepare_projects_data(projects: &[Project]) -> Vec<Value> {
    let mut rows = Vec::new();

    for project in projects {
        let Some(creator_id) = project.creator_id().filter(|&id| id != 0) else {
            continue;
        };
        let fields = &project.fields;
        let country_displayable = fields
            .get("location")
            .and_then(|location| location.get("expanded_country"))
            .cloned()
            .unwrap_or(json!(""));

        let mut row = Map::new();
        row.insert("id".into(), json!(project.id));
        row.insert("creator_id".into(), json!(creator_id));
        row.insert("name".into(), get_or(fields, "name", json!("")));
        row.insert("blurb".into(), get_or(fields, "blurb", json!("")));
        row.insert("slug".into(), json!(project.slug.clone().unwrap_or_default()));
        row.insert("state".into(), get_or(fields, "state", json!("")));
        row.insert("country".into(), get_or(fields, "country", json!("")));
        row.insert("country_displayable_name".into(), country_displayable);
        row.insert("currency".into(), get_or(fields, "currency", json!("")));
        row.insert(
            "currency_trailing_code".into(),
            get_or(fields, "currency_trailing_code", json!(false)),
        );
        for key in [
            "currency_symbol",
            "static_usd_rate",
            "usd_pledged",
            "converted_pledged_amount",
            "fx_rate",
            "usd_exchange_rate",
            "current_currency",
            "usd_type",
            "photo",
            "category",
            "location",
            "profile",
            "urls",
        ] {
            row.insert(key.into(), get(fields, key));
        }
        for key in ["goal", "pledged", "percent_funded", "backers_count"] {
            row.insert(key.into(), get_or(fields, key, json!(0)));
        }
        row.insert("state_changed_at".into(), unix_to_datetime(fields.get("state_changed_at")));
        row.insert("created_at_ks".into(), unix_to_datetime(fields.get("created_at")));
        row.insert("launched_at".into(), unix_to_datetime(fields.get("launched_at")));
        row.insert("deadline".into(), unix_to_datetime(fields.get("deadline")));
        for key in [
            "staff_pick",
            "spotlight",
            "disable_communication",
            "is_in_post_campaign_pledging_phase",
            "is_launched",
            "prelaunch_activated",
            "is_liked",
            "is_disliked",
        ] {
            row.insert(key.into(), get_or(fields, key, json!(false)));
        }
        row.insert("is_starrable".into(), get_or(fields, "is_starrable", json!(true)));
        rows.push(with_hash(row));
    }
    rows
}

/// One outreach row per creator with social presence flags.
pub fn prepare_outreach_data(projects: &[Project]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for project in projects {
        let Some(creator_id) = project.creator_id().filter(|&id| id != 0) else {
            continue;
        };
        if !seen.insert(creator_id) {
            continue;
        }

        let mut row = Map::new();
        row.insert("creator_id".into(), json!(creator_id));
        row.extend(social_flags(&project.websites()));
        row.insert("outreach_status".into(), json!("not_contacted"));
        row.insert("first_contacted_at".into(), Value::Null);
        row.insert("last_contacted_at".into(), Value::Null);
        row.insert("response_received_at".into(), Value::Null);
        row.insert("notes".into(), Value::Null);
        row.insert("tags".into(), json!([]));
        rows.push(Value::Object(row));
    }
    rows
}

/// Upsert `rows` `chunk_size` at a time. A failing chunk is recorded and
/// the rest still go through.
pub fn sync_in_chunks<S: BulkUpsert + ?Sized>(
    store: &S,
    entity: Entity,
    rows: &[Value],
    chunk_size: usize,
) -> SyncStats {
    let mut stats = SyncStats::default();
    if rows.is_empty() {
        return stats;
    }

    let chunk_size = chunk_size.max(1);
    let total_chunks = rows.len().div_ceil(chunk_size);
    info!("Syncing {} {} in {} chunk(s)", rows.len(), entity.as_str(), total_chunks);

    for (index, chunk) in rows.chunks(chunk_size).enumerate() {
        let chunk_number = index + 1;
        match store.upsert(entity, chunk) {
            Ok(outcome) => {
                stats.inserted += outcome.inserted_count;
                stats.updated += outcome.updated_count;
                stats.unchanged += outcome
                    .total_count
                    .saturating_sub(outcome.inserted_count + outcome.updated_count);
                stats.errors += outcome.errors.len();
                stats.error_details.extend(outcome.errors);
                info!(
                    "  {} chunk {}/{}: {} inserted, {} updated",
                    entity.as_str(),
                    chunk_number,
                    total_chunks,
                    outcome.inserted_count,
                    outcome.updated_count
                );
            }
            Err(e) => {
                error!(
                    "  {} chunk {}/{} failed: {}",
                    entity.as_str(),
                    chunk_number,
                    total_chunks,
                    e
                );
                stats.errors += chunk.len();
                stats
                    .error_details
                    .push(json!({"chunk": chunk_number, "error": e.to_string()}));
            }
        }
    }

    stats.error_details.truncate(MAX_ERROR_DETAILS);
    stats
}

/// Creators, then projects, then outreach.
pub fn sync_all<S: BulkUpsert + ?Sized>(
    store: &S,
    projects: &[Project],
    chunk_size: usize,
) -> SyncReport {
    let creators = prepare_creators_data(projects);
    let project_rows = prepare_projects_data(projects);
    let outreach = prepare_outreach_data(projects);

    let report = SyncReport {
        creators: sync_in_chunks(store, Entity::Creators, &creators, chunk_size),
        projects: sync_in_chunks(store, Entity::Projects, &project_rows, chunk_size),
        outreach: sync_in_chunks(store, Entity::Outreach, &outreach, chunk_size),
    };

    info!(
        "Sync finished: creators +{}/~{}, projects +{}/~{}, outreach +{}/~{}, {} errors",
        report.creators.inserted,
        report.creators.updated,
        report.projects.inserted,
        report.projects.updated,
        report.outreach.inserted,
        report.outreach.updated,
        report.total_errors()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::cell::RefCell;

    fn project(id: u64, creator: Value) -> Project {
        Project::new(id, Some(&format!("p{}", id))).with_field("creator", creator)
    }

    #[test]
    fn test_unix_to_datetime() {
        assert_eq!(unix_to_datetime(Some(&json!(0))), Value::Null);
        assert_eq!(unix_to_datetime(None), Value::Null);
        assert_eq!(unix_to_datetime(Some(&json!("x"))), Value::Null);
        assert_eq!(
            unix_to_datetime(Some(&json!(1_700_000_000))),
            json!("2023-11-14T22:13:20+00:00")
        );
    }

    #[test]
    fn test_categorize_website() {
        assert_eq!(categorize_website("www.Instagram.com"), Some("instagram"));
        assert_eq!(categorize_website("x.com"), Some("twitter"));
        assert_eq!(categorize_website("m.facebook.com"), Some("facebook"));
        assert_eq!(categorize_website("notfacebook.com"), None);
        assert_eq!(categorize_website("bsky.app"), Some("bluesky"));
    }

    #[test]
    fn test_social_flags() {
        let websites = vec![
            Website { url: "https://x.com/a".into(), domain: "x.com".into() },
            Website { url: "https://shop.example".into(), domain: "shop.example".into() },
            Website { url: " ".into(), domain: "youtube.com".into() },
        ];
        let flags = social_flags(&websites);
        assert_eq!(flags["has_twitter"], json!(true));
        assert_eq!(flags["has_other_website"], json!(true));
        assert_eq!(flags["has_youtube"], json!(false));
        assert_eq!(flags.len(), 11);
    }

    #[test]
    fn test_data_hash_ignores_timestamps() {
        let mut row = Map::new();
        row.insert("id".into(), json!(1));
        let base = compute_data_hash(&row);
        row.insert("updated_at".into(), json!("2024-01-01"));
        row.insert("data_hash".into(), json!("abc"));
        assert_eq!(compute_data_hash(&row), base);
        row.insert("name".into(), json!("changed"));
        assert_ne!(compute_data_hash(&row), base);
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn test_prepare_creators_dedupes_first_wins() {
        let projects = vec![
            project(1, json!({"id": 9, "name": "First"})),
            project(2, json!({"id": 9, "name": "Second"})),
            project(3, json!({"name": "No id"})),
        ];
        let rows = prepare_creators_data(&projects);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "First");
        assert_eq!(rows[0]["websites"], json!([]));
        assert_eq!(rows[0]["backing_action_count"], json!(0));
        assert!(rows[0]["data_hash"].is_string());
    }

    #[test]
    fn test_prepare_projects_converts_timestamps() {
        let projects = vec![
            project(1, json!({"id": 9}))
                .with_field("created_at", json!(1_700_000_000))
                .with_field("deadline", json!(0))
                .with_field("location", json!({"expanded_country": "Canada"})),
            Project::new(2, None),
        ];
        let rows = prepare_projects_data(&projects);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["creator_id"], json!(9));
        assert_eq!(rows[0]["created_at_ks"], json!("2023-11-14T22:13:20+00:00"));
        assert_eq!(rows[0]["deadline"], Value::Null);
        assert_eq!(rows[0]["country_displayable_name"], "Canada");
        assert_eq!(rows[0]["is_starrable"], json!(true));
    }

    #[test]
    fn test_prepare_outreach_rows() {
        let projects = vec![project(
            1,
            json!({"id": 9, "websites": [{"url": "https://instagram.com/a", "domain": "instagram.com"}]}),
        )];
        let rows = prepare_outreach_data(&projects);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["creator_id"], json!(9));
        assert_eq!(rows[0]["has_instagram"], json!(true));
        assert_eq!(rows[0]["outreach_status"], "not_contacted");
    }

    struct FlakyStore {
        calls: RefCell<usize>,
    }

    impl BulkUpsert for FlakyStore {
        fn upsert(&self, _entity: Entity, rows: &[Value]) -> StoreResult<UpsertOutcome> {
            *self.calls.borrow_mut() += 1;
            if *self.calls.borrow() == 2 {
                return Err(StoreError::MissingKey("id"));
            }
            Ok(UpsertOutcome {
                inserted_count: 1,
                updated_count: 1,
                total_count: rows.len(),
                errors: Vec::new(),
            })
        }
    }

    #[test]
    fn test_sync_in_chunks_continues_past_failed_chunk() {
        let store = FlakyStore { calls: RefCell::new(0) };
        let rows: Vec<Value> = (0..7).map(|i| json!({"id": i})).collect();

        let stats = sync_in_chunks(&store, Entity::Creators, &rows, 3);

        assert_eq!(*store.calls.borrow(), 3);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.error_details[0]["chunk"], json!(2));
    }
}
