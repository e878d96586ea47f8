//! Creator contact extraction: target selection, account rotation, the
//! domain blocker and the worker pool that drives the provider.

pub mod accounts;
pub mod blocker;
pub mod extractor;
pub mod provider;
pub mod runner;
pub mod selector;
pub mod validator;

pub use accounts::{Account, AccountManager, AccountPool, AccountStats, AccountStatus, AccountStore};
pub use blocker::{BlockedDomainStore, DomainBlocker};
pub use extractor::{ContactExtractor, ContactStatus, CreatorOutcome, ExtractionConfig};
pub use provider::{
    DEFAULT_FIRECRAWL_API_URL, ExtractionProvider, FirecrawlProvider, ScrapedContact,
};
pub use runner::{ContactRunOptions, ContactRunStats, ContactStore, run_contacts};
pub use selector::{ContactTarget, CreatorRow, select_targets};
pub use validator::ContactValidator;
