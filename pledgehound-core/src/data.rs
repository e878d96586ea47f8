use crate::contacts::accounts::{Account, AccountStatus, AccountStore};
use crate::contacts::blocker::BlockedDomainStore;
use crate::contacts::runner::ContactStore;
use crate::contacts::selector::CreatorRow;
use crate::error::{StoreError, StoreResult};
use crate::model::websites_from_value;
use crate::sync::{BulkUpsert, Entity, UpsertOutcome, compute_data_hash};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outreach fields only written when the row is first created, so a
/// re-sync never resets the outreach workflow.
const OUTREACH_INSERT_ONLY: &[&str] = &[
    "outreach_status",
    "first_contacted_at",
    "last_contacted_at",
    "response_received_at",
    "notes",
    "tags",
];

pub struct Database {
    conn: Mutex<Connection>,
}

fn current_timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn table_for(entity: Entity) -> &'static str {
    entity.as_str()
}

impl Database {
    pub fn drop(path: &Path) -> std::io::Result<()> {
        fs::remove_file(path)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            "
CREATE TABLE IF NOT EXISTS creators (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,          -- JSON object
    data_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,          -- JSON object, includes creator_id
    data_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS creator_outreach (
    creator_id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,          -- JSON object, merged on upsert
    data_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_creators_updated ON creators(updated_at);
CREATE INDEX IF NOT EXISTS idx_outreach_updated ON creator_outreach(updated_at);

CREATE TABLE IF NOT EXISTS extraction_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT,
    api_key TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'exhausted')),
    exhausted_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blocked_domains (
    domain TEXT PRIMARY KEY,
    reason TEXT,
    source TEXT NOT NULL DEFAULT 'firecrawl',
    blocked_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_state (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    last_contact_check_at TEXT
);
            ",
        )?;
        Ok(())
    }

    // ---- listing records ---------------------------------------------------

    pub fn count(&self, entity: Entity) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(entity));
        let count: i64 = self.conn().query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Stored JSON for one row, if present.
    pub fn get_row(&self, entity: Entity, key: u64) -> StoreResult<Option<Map<String, Value>>> {
        let sql = format!(
            "SELECT data FROM {} WHERE {} = ?1",
            table_for(entity),
            entity.key_field()
        );
        let data: Option<String> = self
            .conn()
            .query_row(&sql, params![key as i64], |row| row.get(0))
            .optional()?;
        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Which of `ids` already exist in `projects`.
    pub fn existing_project_ids(&self, ids: &[u64]) -> StoreResult<HashSet<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM projects WHERE id = ?1")?;
        let mut found = HashSet::new();
        for &id in ids {
            if stmt.exists(params![id as i64])? {
                found.insert(id);
            }
        }
        Ok(found)
    }

    fn upsert_hashed(
        tx: &Transaction<'_>,
        entity: Entity,
        key: u64,
        row: &Map<String, Value>,
        now: &str,
        outcome: &mut UpsertOutcome,
    ) -> StoreResult<()> {
        let table = table_for(entity);
        let key_column = entity.key_field();
        let hash = row
            .get("data_hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| compute_data_hash(row));

        let existing: Option<String> = tx
            .query_row(
                &format!("SELECT data_hash FROM {} WHERE {} = ?1", table, key_column),
                params![key as i64],
                |r| r.get(0),
            )
            .optional()?;

        let data = serde_json::to_string(row)?;
        match existing {
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} ({}, data, data_hash, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                        table, key_column
                    ),
                    params![key as i64, data, hash, now],
                )?;
                outcome.inserted_count += 1;
            }
            Some(stored) if stored != hash => {
                tx.execute(
                    &format!(
                        "UPDATE {} SET data = ?2, data_hash = ?3, updated_at = ?4 WHERE {} = ?1",
                        table, key_column
                    ),
                    params![key as i64, data, hash, now],
                )?;
                outcome.updated_count += 1;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn upsert_merged(
        tx: &Transaction<'_>,
        key: u64,
        row: &Map<String, Value>,
        now: &str,
        outcome: &mut UpsertOutcome,
    ) -> StoreResult<()> {
        let existing: Option<String> = tx
            .query_row(
                "SELECT data FROM creator_outreach WHERE creator_id = ?1",
                params![key as i64],
                |r| r.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO creator_outreach (creator_id, data, data_hash, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![key as i64, serde_json::to_string(row)?, compute_data_hash(row), now],
                )?;
                outcome.inserted_count += 1;
            }
            Some(raw) => {
                let stored: Map<String, Value> = serde_json::from_str(&raw)?;
                let mut merged = stored.clone();
                for (field, value) in row {
                    if OUTREACH_INSERT_ONLY.contains(&field.as_str())
                        && merged.contains_key(field)
                    {
                        continue;
                    }
                    merged.insert(field.clone(), value.clone());
                }
                if merged != stored {
                    tx.execute(
                        "UPDATE creator_outreach SET data = ?2, data_hash = ?3, updated_at = ?4 WHERE creator_id = ?1",
                        params![
                            key as i64,
                            serde_json::to_string(&merged)?,
                            compute_data_hash(&merged),
                            now
                        ],
                    )?;
                    outcome.updated_count += 1;
                }
            }
        }
        Ok(())
    }

    pub fn upsert_rows(&self, entity: Entity, rows: &[Value]) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = current_timestamp();
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            let Some(object) = row.as_object() else {
                outcome.errors.push(json!({"error": "row is not an object"}));
                continue;
            };
            let Some(key) = object.get(entity.key_field()).and_then(Value::as_u64) else {
                outcome.errors.push(json!({
                    "error": StoreError::MissingKey(entity.key_field()).to_string(),
                    "row": row,
                }));
                continue;
            };

            match entity {
                Entity::Outreach => Self::upsert_merged(&tx, key, object, &now, &mut outcome)?,
                _ => Self::upsert_hashed(&tx, entity, key, object, &now, &mut outcome)?,
            }
            outcome.total_count += 1;
        }

        tx.commit()?;
        Ok(outcome)
    }

    // ---- contact stage -----------------------------------------------------

    /// Every creator with its outreach row, oldest id first.
    pub fn creator_rows(&self) -> StoreResult<Vec<CreatorRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.data, c.created_at, c.updated_at, o.data, o.updated_at
             FROM creators c
             LEFT JOIN creator_outreach o ON o.creator_id = c.id
             ORDER BY c.id",
        )?;

        let raw_rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for (id, data, created_at, updated_at, outreach, outreach_updated_at) in raw_rows {
            let creator: Value = serde_json::from_str(&data)?;
            let outreach = match outreach {
                Some(raw) => Some(serde_json::from_str::<Map<String, Value>>(&raw)?),
                None => None,
            };
            rows.push(CreatorRow {
                id: id as u64,
                name: creator.get("name").and_then(Value::as_str).map(str::to_string),
                slug: creator.get("slug").and_then(Value::as_str).map(str::to_string),
                websites: creator.get("websites").map(websites_from_value).unwrap_or_default(),
                created_at,
                updated_at,
                outreach,
                outreach_updated_at,
            });
        }
        Ok(rows)
    }

    pub fn last_contact_check_at(&self) -> StoreResult<Option<String>> {
        let value: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT last_contact_check_at FROM pipeline_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_last_contact_check_at(&self, timestamp: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO pipeline_state (id, last_contact_check_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_contact_check_at = excluded.last_contact_check_at",
            params![timestamp],
        )?;
        Ok(())
    }

    // ---- extraction accounts -----------------------------------------------

    /// Add an account, or refresh its email if the key is already known.
    pub fn add_account(&self, email: Option<&str>, api_key: &str) -> StoreResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO extraction_accounts (email, api_key, status, created_at)
             VALUES (?1, ?2, 'active', ?3)
             ON CONFLICT(api_key) DO UPDATE SET email = excluded.email",
            params![email, api_key, current_timestamp()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM extraction_accounts WHERE api_key = ?1",
            params![api_key],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn reset_accounts(&self) -> StoreResult<usize> {
        let changed = self.conn().execute(
            "UPDATE extraction_accounts SET status = 'active', exhausted_at = NULL WHERE status = 'exhausted'",
            [],
        )?;
        Ok(changed)
    }

    pub fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, email, api_key, status, exhausted_at FROM extraction_accounts ORDER BY id",
        )?;
        let accounts = stmt
            .query_map([], |row| {
                Ok(Account {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    api_key: row.get(2)?,
                    status: AccountStatus::parse(row.get::<_, Option<String>>(3)?.as_deref()),
                    exhausted_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    // ---- blocked domains ---------------------------------------------------

    pub fn list_blocked_domains(&self) -> StoreResult<Vec<(String, Option<String>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT domain, reason FROM blocked_domains ORDER BY domain")?;
        let domains = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(domains)
    }
}

impl BulkUpsert for Database {
    fn upsert(&self, entity: Entity, rows: &[Value]) -> StoreResult<UpsertOutcome> {
        self.upsert_rows(entity, rows)
    }
}

impl AccountStore for Database {
    fn load_accounts(&self) -> StoreResult<Vec<Account>> {
        self.list_accounts()
    }

    fn mark_account_exhausted(&self, api_key: &str, exhausted_at: &str) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE extraction_accounts SET status = 'exhausted', exhausted_at = ?2 WHERE api_key = ?1",
            params![api_key, exhausted_at],
        )?;
        Ok(())
    }
}

impl BlockedDomainStore for Database {
    fn load_blocked_domains(&self) -> StoreResult<HashSet<String>> {
        Ok(self
            .list_blocked_domains()?
            .into_iter()
            .map(|(domain, _)| domain)
            .collect())
    }

    fn insert_blocked_domain(&self, domain: &str, reason: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO blocked_domains (domain, reason, source, blocked_at) VALUES (?1, ?2, 'firecrawl', ?3)
             ON CONFLICT(domain) DO UPDATE SET reason = excluded.reason",
            params![domain.to_lowercase(), reason, current_timestamp()],
        )?;
        Ok(())
    }
}

impl ContactStore for Database {
    fn contact_candidates(&self) -> StoreResult<Vec<CreatorRow>> {
        self.creator_rows()
    }

    fn last_contact_check(&self) -> StoreResult<Option<String>> {
        self.last_contact_check_at()
    }

    fn record_contact_check(&self, timestamp: &str) -> StoreResult<()> {
        self.set_last_contact_check_at(timestamp)
    }
}
