use crate::contacts::accounts::{AccountManager, AccountStats};
use crate::contacts::blocker::{DEFAULT_BLOCK_REASON, DomainBlocker};
use crate::contacts::provider::{ExtractionProvider, ScrapedContact};
use crate::contacts::selector::{ContactTarget, compute_site_hash};
use crate::contacts::validator::ContactValidator;
use crate::error::{ContactError, ContactResult, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const FALLBACK_PATHS: &[&str] = &[
    "/contact",
    "/pages/contact",
    "/contact-us",
    "/about",
    "/pages/about",
    "/",
];
const MAX_FALLBACK_URLS: usize = 4;
const CONTACT_PAGE_MARKERS: &[&str] = &["/contact", "/about", "/faq"];

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub max_retries: u32,
    pub request_delay: Duration,
    /// Multiplied by the retry number after a rate limit.
    pub rate_limit_backoff: Duration,
    pub page_delay: Duration,
    pub site_delay: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_delay: Duration::from_millis(500),
            rate_limit_backoff: Duration::from_secs(5),
            page_delay: Duration::from_secs(1),
            site_delay: Duration::ZERO,
        }
    }
}

impl ExtractionConfig {
    /// No waiting anywhere.
    pub fn immediate() -> Self {
        Self {
            request_delay: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            page_delay: Duration::ZERO,
            site_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Completed,
    NotFound,
    Blocked,
    Error,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Completed => "completed",
            ContactStatus::NotFound => "not_found",
            ContactStatus::Blocked => "blocked",
            ContactStatus::Error => "error",
        }
    }

    /// completed > blocked > error > not_found
    pub fn priority(&self) -> u8 {
        match self {
            ContactStatus::Completed => 3,
            ContactStatus::Blocked => 2,
            ContactStatus::Error => 1,
            ContactStatus::NotFound => 0,
        }
    }
}

/// Best contact details found on one site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteOutcome {
    pub email: Option<String>,
    pub email_source: Option<String>,
    pub has_contact_form: bool,
    pub contact_form_url: Option<String>,
    pub status: ContactStatus,
}

impl SiteOutcome {
    fn empty(status: ContactStatus) -> Self {
        Self {
            email: None,
            email_source: None,
            has_contact_form: false,
            contact_form_url: None,
            status,
        }
    }
}

/// Best contact details across all of a creator's sites.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatorOutcome {
    pub email: Option<String>,
    pub email_source_url: Option<String>,
    pub has_contact_form: bool,
    pub contact_form_url: Option<String>,
    pub status: ContactStatus,
    pub error: Option<String>,
    pub site_hash: Option<String>,
}

impl CreatorOutcome {
    pub fn failed(status: ContactStatus, error: &str, site_hash: Option<String>) -> Self {
        Self {
            email: None,
            email_source_url: None,
            has_contact_form: false,
            contact_form_url: None,
            status,
            error: Some(error.to_string()),
            site_hash,
        }
    }
}

enum PageResult {
    Scraped(ScrapedContact),
    Blocked,
    Failed,
}

/// Pages to try when the provider's map finds nothing: the site's own
/// path, then common contact paths, at most four.
pub fn generate_contact_urls(base_url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(base_url) else {
        return Vec::new();
    };
    let mut urls: Vec<String> = Vec::new();
    if parsed.path() != "/" && !parsed.path().is_empty() {
        urls.push(base_url.trim_end_matches('/').to_string());
    }
    for path in FALLBACK_PATHS {
        if let Ok(joined) = parsed.join(path) {
            let joined = joined.to_string();
            if !urls.contains(&joined) {
                urls.push(joined);
            }
        }
    }
    urls.truncate(MAX_FALLBACK_URLS);
    urls
}

/// Lowercased, trimmed, and must contain `@`.
fn clean_email(email: Option<String>) -> Option<String> {
    email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty() && e.contains('@'))
}

fn is_contact_page(url: &str) -> bool {
    let lower = url.to_lowercase();
    CONTACT_PAGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// One worker's extraction pipeline: map a site, scrape the likely pages,
/// keep the best email and form.
pub struct ContactExtractor {
    provider: Arc<dyn ExtractionProvider>,
    accounts: AccountManager,
    blocker: Arc<DomainBlocker>,
    config: ExtractionConfig,
}

impl ContactExtractor {
    pub fn new(
        provider: Arc<dyn ExtractionProvider>,
        accounts: AccountManager,
        blocker: Arc<DomainBlocker>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            provider,
            accounts,
            blocker,
            config,
        }
    }

    pub fn account_stats(&self) -> AccountStats {
        self.accounts.stats()
    }

    fn rotate_account(&mut self, api_key: &str) -> ContactResult<()> {
        warn!("Extraction account out of credits, switching account");
        self.accounts.mark_exhausted(api_key);
        if !self.accounts.has_active_accounts() {
            error!("All extraction accounts exhausted");
            return Err(ContactError::AllAccountsExhausted);
        }
        Ok(())
    }

    async fn candidate_urls(&mut self, url: &str) -> ContactResult<Vec<String>> {
        loop {
            let api_key = self.accounts.current_api_key()?;
            match self.provider.map_site(&api_key, url).await {
                Ok(links) if !links.is_empty() => {
                    info!("Map found {} pages on {}", links.len(), url);
                    return Ok(links);
                }
                Ok(_) => {
                    info!("Map found nothing on {}, using fallback pages", url);
                    return Ok(generate_contact_urls(url));
                }
                Err(ProviderError::PaymentRequired) => self.rotate_account(&api_key)?,
                Err(e) => {
                    warn!("Map failed for {}: {}, using fallback pages", url, e);
                    return Ok(generate_contact_urls(url));
                }
            }
        }
    }

    async fn scrape_page(&mut self, url: &str) -> ContactResult<PageResult> {
        let mut retries = 0;
        loop {
            if self.blocker.is_blocked(url) {
                return Ok(PageResult::Blocked);
            }
            let api_key = self.accounts.current_api_key()?;

            match self.provider.scrape_contact(&api_key, url).await {
                Ok(contact) => return Ok(PageResult::Scraped(contact)),
                Err(ProviderError::PaymentRequired) => self.rotate_account(&api_key)?,
                Err(ProviderError::WebsiteNotSupported(message)) => {
                    warn!("Website not supported: {} ({})", url, message);
                    self.blocker.block_domain(url, DEFAULT_BLOCK_REASON);
                    return Ok(PageResult::Blocked);
                }
                Err(e) if retries < self.config.max_retries => {
                    let wait = if e == ProviderError::RateLimited {
                        self.config.rate_limit_backoff * (retries + 1)
                    } else {
                        self.config.request_delay
                    };
                    retries += 1;
                    warn!(
                        "Scrape of {} failed ({}), retry {}/{} in {:?}",
                        url, e, retries, self.config.max_retries, wait
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to scrape {} after {} retries: {}",
                        url, self.config.max_retries, e
                    );
                    return Ok(PageResult::Failed);
                }
            }
        }
    }

    /// Search one site for contact details.
    ///
    /// Only `AllAccountsExhausted` is returned as an error; everything else
    /// ends up in the outcome's status.
    pub async fn extract_contact_info(&mut self, url: &str) -> ContactResult<SiteOutcome> {
        if self.blocker.is_blocked(url) {
            info!("Skipping blocked domain: {}", url);
            return Ok(SiteOutcome::empty(ContactStatus::Blocked));
        }

        let pages = self.candidate_urls(url).await?;
        let mut best = SiteOutcome::empty(ContactStatus::NotFound);
        let mut scraped_any = false;
        let mut blocked_any = false;

        for (index, page) in pages.iter().enumerate() {
            debug!("Trying page {}/{}: {}", index + 1, pages.len(), page);

            match self.scrape_page(page).await? {
                PageResult::Scraped(contact) => {
                    scraped_any = true;
                    if let Some(email) = clean_email(contact.email) {
                        if best.email.is_none() || is_contact_page(page) {
                            if best.email.as_ref().is_some_and(|current| *current != email) {
                                info!("Replacing email with one from contact page {}", page);
                            }
                            best.email = Some(email);
                            best.email_source = Some(page.clone());
                        }
                    }
                    if contact.has_contact_form == Some(true) && !best.has_contact_form {
                        best.has_contact_form = true;
                        best.contact_form_url =
                            contact.contact_form_url.filter(|u| !u.trim().is_empty());
                    }
                }
                PageResult::Blocked => blocked_any = true,
                PageResult::Failed => {}
            }

            if best.email.is_some() && best.has_contact_form {
                debug!("Found both email and form on {}", url);
                break;
            }
            if index + 1 < pages.len() && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        best.status = if best.email.is_some() || best.has_contact_form {
            ContactStatus::Completed
        } else if scraped_any || pages.is_empty() {
            ContactStatus::NotFound
        } else if blocked_any {
            ContactStatus::Blocked
        } else {
            ContactStatus::Error
        };
        Ok(best)
    }

    /// Try each of the creator's valid sites, keeping the best result.
    pub async fn extract_for_creator(
        &mut self,
        target: &ContactTarget,
    ) -> ContactResult<CreatorOutcome> {
        let sites: Vec<String> = target
            .websites
            .iter()
            .filter_map(|website| ContactValidator::normalize_url(&website.url))
            .filter(|url| ContactValidator::is_valid_url(url))
            .collect();

        if sites.is_empty() {
            return Ok(CreatorOutcome::failed(ContactStatus::NotFound, "no_valid_site", None));
        }

        let mut outcome = CreatorOutcome {
            email: None,
            email_source_url: None,
            has_contact_form: false,
            contact_form_url: None,
            status: ContactStatus::NotFound,
            error: None,
            site_hash: None,
        };

        for (index, site) in sites.iter().enumerate() {
            if index > 0 && !self.config.site_delay.is_zero() {
                tokio::time::sleep(self.config.site_delay).await;
            }
            let mut found = self.extract_contact_info(site).await?;

            if found
                .email
                .as_deref()
                .is_some_and(|email| !ContactValidator::is_valid_email(email))
            {
                found.email = None;
                found.email_source = None;
            }
            if found
                .contact_form_url
                .as_deref()
                .is_some_and(|url| !ContactValidator::is_valid_url(url))
            {
                found.contact_form_url = None;
                found.has_contact_form = false;
            }

            if outcome.email.is_none() && found.email.is_some() {
                outcome.email = found.email;
                outcome.email_source_url = found.email_source;
            }
            if found.has_contact_form && !outcome.has_contact_form {
                outcome.has_contact_form = true;
                outcome.contact_form_url = found.contact_form_url;
            }

            outcome.site_hash = compute_site_hash(site);
            if found.status.priority() > outcome.status.priority() {
                outcome.status = found.status;
            }

            if outcome.email.is_some() && outcome.has_contact_form {
                break;
            }
        }

        Ok(outcome)
    }
}
