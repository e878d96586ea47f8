use crate::contacts::accounts::{AccountPool, AccountStore};
use crate::contacts::blocker::{BlockedDomainStore, DomainBlocker};
use crate::contacts::extractor::{ContactExtractor, ContactStatus, CreatorOutcome, ExtractionConfig};
use crate::contacts::provider::ExtractionProvider;
use crate::contacts::selector::{ContactTarget, CreatorRow, select_targets};
use crate::error::{ContactError, ContactResult, StoreResult};
use crate::sync::{BulkUpsert, Entity};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

pub const DEFAULT_CONTACT_WORKERS: usize = 100;
pub const DEFAULT_CONTACT_BATCH_SIZE: usize = 20;

/// Everything the contact stage reads from and writes to.
pub trait ContactStore: BulkUpsert + AccountStore + BlockedDomainStore {
    fn contact_candidates(&self) -> StoreResult<Vec<CreatorRow>>;
    fn last_contact_check(&self) -> StoreResult<Option<String>>;
    fn record_contact_check(&self, timestamp: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct ContactRunOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub limit: Option<usize>,
    pub dry_run: bool,
    pub extraction: ExtractionConfig,
    pub blocked_domains_cache: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for ContactRunOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_CONTACT_WORKERS,
            batch_size: DEFAULT_CONTACT_BATCH_SIZE,
            limit: None,
            dry_run: false,
            extraction: ExtractionConfig::default(),
            blocked_domains_cache: None,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContactRunStats {
    pub selected: usize,
    pub processed: usize,
    pub completed: usize,
    pub not_found: usize,
    pub blocked: usize,
    pub errors: usize,
    pub persisted: usize,
    pub persist_failures: usize,
    pub blocked_domains: usize,
}

impl ContactRunStats {
    fn record(&mut self, status: ContactStatus) {
        self.processed += 1;
        match status {
            ContactStatus::Completed => self.completed += 1,
            ContactStatus::NotFound => self.not_found += 1,
            ContactStatus::Blocked => self.blocked += 1,
            ContactStatus::Error => self.errors += 1,
        }
    }
}

/// The outreach row written for one extraction result.
pub fn outreach_payload(
    target: &ContactTarget,
    outcome: &CreatorOutcome,
    checked_at: &str,
) -> Value {
    json!({
        "creator_id": target.id,
        "email": outcome.email,
        "email_source_url": outcome.email_source_url,
        "has_contact_form": outcome.has_contact_form,
        "contact_form_url": outcome.contact_form_url,
        "contact_status": outcome.status.as_str(),
        "contact_error": outcome.error,
        "contact_attempts": target.contact_attempts + 1,
        "last_contact_check_at": checked_at,
        "site_hash": outcome.site_hash,
    })
}

fn flush<S: ContactStore + ?Sized>(
    store: &S,
    pending: &mut Vec<Value>,
    dry_run: bool,
    stats: &mut ContactRunStats,
) {
    if pending.is_empty() {
        return;
    }
    if dry_run {
        info!("Dry run: skipping write of {} outreach rows", pending.len());
        pending.clear();
        return;
    }
    match store.upsert(Entity::Outreach, pending) {
        Ok(outcome) => {
            stats.persisted += outcome.total_count;
            stats.persist_failures += outcome.errors.len();
            info!(
                "Saved {} outreach rows ({} inserted, {} updated)",
                outcome.total_count, outcome.inserted_count, outcome.updated_count
            );
        }
        Err(e) => {
            error!("Failed to save {} outreach rows: {}", pending.len(), e);
            stats.persist_failures += pending.len();
        }
    }
    pending.clear();
}

/// Select creators that need contact details, extract them with a pool of
/// workers and write the results back in batches.
///
/// Running out of extraction accounts stops the stage once the results
/// already gathered are saved.
pub async fn run_contacts<S>(
    store: Arc<S>,
    provider: Arc<dyn ExtractionProvider>,
    options: &ContactRunOptions,
) -> ContactResult<ContactRunStats>
where
    S: ContactStore + 'static,
{
    let mut stats = ContactRunStats::default();

    let rows = store.contact_candidates()?;
    let last_check = store.last_contact_check()?;
    let targets = select_targets(rows, last_check.as_deref(), options.limit);
    stats.selected = targets.len();
    info!(
        "{} creators need contact extraction (last check: {})",
        targets.len(),
        last_check.as_deref().unwrap_or("never")
    );
    if targets.is_empty() {
        return Ok(stats);
    }

    let account_store: Arc<dyn AccountStore> = store.clone();
    let pool = Arc::new(AccountPool::new(account_store));
    let domain_store: Arc<dyn BlockedDomainStore> = store.clone();
    let mut blocker = DomainBlocker::new(Some(domain_store), options.dry_run);
    if let Some(path) = &options.blocked_domains_cache {
        blocker = blocker.with_cache_path(path.clone());
    }
    let blocker = Arc::new(blocker);
    info!("Loaded {} blocked domains", blocker.load());

    let workers = options.workers.clamp(1, targets.len());
    let mut extractors = Vec::with_capacity(workers);
    for _ in 0..workers {
        let accounts = pool.manager()?;
        if !accounts.has_active_accounts() {
            return Err(ContactError::AllAccountsExhausted);
        }
        extractors.push(Arc::new(Mutex::new(ContactExtractor::new(
            Arc::clone(&provider),
            accounts,
            Arc::clone(&blocker),
            options.extraction.clone(),
        ))));
    }
    info!("Starting contact extraction with {} workers", workers);

    let progress = if options.show_progress {
        let pb = ProgressBar::new(targets.len() as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        Some(pb)
    } else {
        None
    };

    let mut tasks = JoinSet::new();
    let mut in_flight: HashMap<Id, ContactTarget> = HashMap::with_capacity(targets.len());
    for (index, target) in targets.into_iter().enumerate() {
        let extractor = Arc::clone(&extractors[index % workers]);
        let task_target = target.clone();
        let handle = tasks.spawn(async move {
            let mut extractor = extractor.lock().await;
            extractor.extract_for_creator(&task_target).await
        });
        in_flight.insert(handle.id(), target);
    }

    let batch_size = options.batch_size.max(1);
    let mut pending: Vec<Value> = Vec::with_capacity(batch_size);
    let mut exhausted = false;

    while let Some(joined) = tasks.join_next_with_id().await {
        let (task_id, result) = match joined {
            Ok((task_id, result)) => (task_id, Ok(result)),
            Err(join_error) if join_error.is_cancelled() => continue,
            Err(join_error) => (join_error.id(), Err(join_error.to_string())),
        };
        let Some(target) = in_flight.remove(&task_id) else {
            continue;
        };

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(ContactError::AllAccountsExhausted)) => {
                if !exhausted {
                    error!("All extraction accounts exhausted, stopping contact extraction");
                    exhausted = true;
                    tasks.abort_all();
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!("Contact extraction failed for creator {}: {}", target.id, e);
                CreatorOutcome::failed(
                    ContactStatus::Error,
                    &e.to_string(),
                    target.computed_site_hash.clone(),
                )
            }
            Err(panic) => {
                warn!("Contact worker for creator {} crashed: {}", target.id, panic);
                CreatorOutcome::failed(
                    ContactStatus::Error,
                    &panic,
                    target.computed_site_hash.clone(),
                )
            }
        };

        stats.record(outcome.status);
        if let Some(pb) = &progress {
            pb.inc(1);
            pb.set_message(format!("{} {}", target.name, outcome.status.as_str()));
        }

        pending.push(outreach_payload(&target, &outcome, &Utc::now().to_rfc3339()));
        if pending.len() >= batch_size {
            flush(store.as_ref(), &mut pending, options.dry_run, &mut stats);
        }
    }
    flush(store.as_ref(), &mut pending, options.dry_run, &mut stats);

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    stats.blocked_domains = blocker.blocked_count();

    if exhausted {
        return Err(ContactError::AllAccountsExhausted);
    }

    if options.dry_run {
        info!("Dry run: pipeline state not updated");
    } else if let Err(e) = store.record_contact_check(&Utc::now().to_rfc3339()) {
        warn!("Failed to update pipeline state: {}", e);
    }

    info!(
        "Contact extraction finished: {} processed, {} completed, {} not found, {} blocked, {} errors",
        stats.processed, stats.completed, stats.not_found, stats.blocked, stats.errors
    );
    Ok(stats)
}
