use crate::model::{ListingPage, Project};
use indicatif::{ProgressBar, ProgressStyle};
use pledgehound_scanner::bootstrap::DEFAULT_BOOTSTRAP_DEADLINE;
use pledgehound_scanner::error::Result as ScanResult;
use pledgehound_scanner::executor::read_json;
use pledgehound_scanner::{Executor, RetryPolicy, Session, bootstrap_listing};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PER_PAGE: usize = 48;
const LISTING_SEED: &str = "2934888";

/// Returns the ids in a page that are already known to the caller.
pub type KnownCheck = Arc<dyn Fn(&[Project]) -> HashSet<u64> + Send + Sync>;

/// Called after every page with (page number, records kept so far)
pub type PageProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for configuring a collection run
#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub max_pages: Option<usize>,
    pub page_policy: RetryPolicy,
    pub bootstrap_policy: RetryPolicy,
    pub bootstrap_deadline: Duration,
    pub show_progress: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            max_pages: None,
            page_policy: RetryPolicy::new(10, 3),
            bootstrap_policy: RetryPolicy::bootstrap(),
            bootstrap_deadline: DEFAULT_BOOTSTRAP_DEADLINE,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The listing reported no more pages.
    Exhausted,
    MaxPages,
    EarlyStopOnKnown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Exhausted => "exhausted",
            ExitReason::MaxPages => "max_pages",
            ExitReason::EarlyStopOnKnown => "early_stop_on_known",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub projects: Vec<Project>,
    pub pages_fetched: usize,
    pub exit_reason: ExitReason,
}

/// Query string for one listing page.
pub fn listing_params(page: usize) -> Vec<(&'static str, String)> {
    vec![
        ("google_chrome_workaround", String::new()),
        ("per_page", PER_PAGE.to_string()),
        ("state", "upcoming".to_string()),
        ("woe_id", "0".to_string()),
        ("sort", "newest".to_string()),
        ("seed", LISTING_SEED.to_string()),
        ("format", "json".to_string()),
        ("page", page.to_string()),
    ]
}

/// True when a new record sits after a known one, which means the listing
/// is not strictly newest-first.
pub fn ordering_violated(projects: &[Project], known: &HashSet<u64>) -> bool {
    let mut seen_known = false;
    for project in projects {
        if known.contains(&project.id) {
            seen_known = true;
        } else if seen_known {
            return true;
        }
    }
    false
}

/// Walks the listing pages of a bootstrapped session.
pub struct Collector {
    options: CollectOptions,
    known_check: Option<KnownCheck>,
    progress_callback: Option<PageProgressCallback>,
}

impl Collector {
    pub fn new(options: CollectOptions) -> Self {
        Self {
            options,
            known_check: None,
            progress_callback: None,
        }
    }

    pub fn with_known_check(mut self, check: KnownCheck) -> Self {
        self.known_check = Some(check);
        self
    }

    pub fn with_progress_callback(mut self, callback: PageProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Bootstrap the session, then fetch pages until the listing runs out,
    /// `max_pages` is hit or a page contains known records.
    ///
    /// Any page that exhausts its retries fails the whole collection.
    pub async fn collect(&self, session: &mut Session) -> ScanResult<Collection> {
        let bootstrap_executor = Executor::new(self.options.bootstrap_policy.clone());
        bootstrap_listing(session, &bootstrap_executor, self.options.bootstrap_deadline).await?;

        let progress_bar = if self.options.show_progress {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message("Fetching listing pages...");
            Some(pb)
        } else {
            None
        };

        let executor = Executor::new(self.options.page_policy.clone());
        let url = session.site().listing_api_url();
        let mut projects = Vec::new();
        let mut pages_fetched = 0;
        let mut page = 1;

        let exit_reason = loop {
            if self.options.max_pages.is_some_and(|max_pages| page > max_pages) {
                info!("Reached page limit ({})", pages_fetched);
                break ExitReason::MaxPages;
            }

            let params = listing_params(page);
            let operation = format!("listing page {}", page);
            let listing: ListingPage = executor
                .run(&operation, session, |client| {
                    let request = client.get(&url).query(&params);
                    async move { read_json(request.send().await?).await }
                })
                .await?;
            pages_fetched += 1;

            let count = listing.projects.len();
            debug!("Page {}: {} projects, has_more={}", page, count, listing.has_more);

            if let Some(check) = &self.known_check {
                let known = check(&listing.projects);
                if !known.is_empty() {
                    if ordering_violated(&listing.projects, &known) {
                        warn!(
                            "Page {} has new projects after known ones; listing may not be newest-first",
                            page
                        );
                    }
                    let fresh: Vec<Project> = listing
                        .projects
                        .into_iter()
                        .filter(|project| !known.contains(&project.id))
                        .collect();
                    info!(
                        "Page {}: {} already known, keeping {} new, stopping",
                        page,
                        known.len(),
                        fresh.len()
                    );
                    projects.extend(fresh);
                    self.report_progress(progress_bar.as_ref(), page, projects.len());
                    break ExitReason::EarlyStopOnKnown;
                }
            }

            projects.extend(listing.projects);
            self.report_progress(progress_bar.as_ref(), page, projects.len());

            if !listing.has_more {
                info!("Listing exhausted after page {}", page);
                break ExitReason::Exhausted;
            }
            page += 1;
        };

        if let Some(pb) = progress_bar {
            pb.finish_and_clear();
        }

        info!(
            "Collected {} projects from {} pages ({})",
            projects.len(),
            pages_fetched,
            exit_reason.as_str()
        );

        Ok(Collection {
            projects,
            pages_fetched,
            exit_reason,
        })
    }

    fn report_progress(&self, progress_bar: Option<&ProgressBar>, page: usize, total: usize) {
        if let Some(pb) = progress_bar {
            pb.set_message(format!("Page {} fetched, {} projects so far", page, total));
        }
        if let Some(callback) = &self.progress_callback {
            callback(page, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[u64]) -> Vec<Project> {
        ids.iter().map(|id| Project::new(*id, None)).collect()
    }

    #[test]
    fn test_listing_params_page() {
        let params = listing_params(3);
        assert!(params.contains(&("page", "3".to_string())));
        assert!(params.contains(&("per_page", "48".to_string())));
        assert!(params.contains(&("google_chrome_workaround", String::new())));
        assert_eq!(params.len(), 8);
    }

    #[test]
    fn test_ordering_violation_detection() {
        let known: HashSet<u64> = [2, 3].into_iter().collect();
        assert!(!ordering_violated(&ids(&[1, 2, 3]), &known));
        assert!(ordering_violated(&ids(&[2, 1, 3]), &known));
        assert!(!ordering_violated(&ids(&[2, 3]), &known));
    }

    #[test]
    fn test_exit_reason_names() {
        assert_eq!(ExitReason::EarlyStopOnKnown.as_str(), "early_stop_on_known");
        assert_eq!(ExitReason::MaxPages.as_str(), "max_pages");
    }
}
