pub mod bootstrap;
pub mod error;
pub mod executor;
pub mod identity;
pub mod session;

pub use bootstrap::{bootstrap_graph, bootstrap_listing, extract_csrf_token};
pub use error::{AttemptError, ScanError};
pub use executor::{Executor, RetryPolicy};
pub use identity::{Identity, ProxyKind, classify, current_egress_ip, rotate_proxy_session};
pub use session::{BrowserProfile, Session, SessionConfig, SiteConfig};
