use crate::error::{ContactError, ContactResult, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Exhausted,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Exhausted => "exhausted",
        }
    }

    /// Anything that isn't "exhausted" counts as active.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(status) if status.eq_ignore_ascii_case("exhausted") => AccountStatus::Exhausted,
            _ => AccountStatus::Active,
        }
    }
}

/// Credentials for the content-extraction provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub email: Option<String>,
    pub api_key: String,
    pub status: AccountStatus,
    pub exhausted_at: Option<String>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

pub trait AccountStore: Send + Sync {
    fn load_accounts(&self) -> StoreResult<Vec<Account>>;
    fn mark_account_exhausted(&self, api_key: &str, exhausted_at: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub total: usize,
    pub active: usize,
    pub exhausted: usize,
    pub current_account_id: Option<i64>,
}

fn set_status(accounts: &mut [Account], api_key: &str, exhausted_at: &str) {
    for account in accounts.iter_mut().filter(|a| a.api_key == api_key) {
        account.status = AccountStatus::Exhausted;
        account.exhausted_at = Some(exhausted_at.to_string());
    }
}

/// Account cache shared by every worker of a run. Loaded from the store on
/// first use.
pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    accounts: Mutex<Option<Vec<Account>>>,
}

impl AccountPool {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            accounts: Mutex::new(None),
        }
    }

    /// Current cache contents, loading it if needed.
    pub fn snapshot(&self) -> StoreResult<Vec<Account>> {
        let mut cached = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.is_none() {
            let accounts: Vec<Account> = self
                .store
                .load_accounts()?
                .into_iter()
                .filter(|account| !account.api_key.trim().is_empty())
                .collect();
            debug!(
                "Loaded {} extraction accounts ({} active)",
                accounts.len(),
                accounts.iter().filter(|a| a.is_active()).count()
            );
            *cached = Some(accounts);
        }
        Ok(cached.clone().unwrap_or_default())
    }

    /// Persist the exhaustion (best effort) and update the cache.
    fn mark_exhausted(&self, api_key: &str, exhausted_at: &str) {
        if let Err(e) = self.store.mark_account_exhausted(api_key, exhausted_at) {
            warn!("Failed to persist exhausted account: {}", e);
        }
        let mut cached = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(accounts) = cached.as_mut() {
            set_status(accounts, api_key, exhausted_at);
        }
    }

    pub fn manager(self: &Arc<Self>) -> StoreResult<AccountManager> {
        Ok(AccountManager {
            pool: Arc::clone(self),
            accounts: self.snapshot()?,
            current: None,
        })
    }
}

/// One worker's view of the pool. Rotates to the next active account
/// when the current one runs out of credit.
pub struct AccountManager {
    pool: Arc<AccountPool>,
    accounts: Vec<Account>,
    current: Option<usize>,
}

impl AccountManager {
    pub fn get_active(&mut self) -> Option<&Account> {
        if let Some(index) = self.current {
            if self.accounts[index].is_active() {
                return Some(&self.accounts[index]);
            }
        }

        match self.accounts.iter().position(Account::is_active) {
            Some(index) => {
                let account = &self.accounts[index];
                debug!("Using account id={} email={:?}", account.id, account.email);
                self.current = Some(index);
                Some(account)
            }
            None => {
                error!("No active extraction accounts available");
                self.current = None;
                None
            }
        }
    }

    pub fn current_api_key(&mut self) -> ContactResult<String> {
        self.get_active()
            .map(|account| account.api_key.clone())
            .ok_or(ContactError::AllAccountsExhausted)
    }

    pub fn mark_exhausted(&mut self, api_key: &str) {
        let now = Utc::now().to_rfc3339();
        self.pool.mark_exhausted(api_key, &now);
        set_status(&mut self.accounts, api_key, &now);

        let exhausted_id = self.accounts.iter().find(|a| a.api_key == api_key).map(|a| a.id);
        warn!("Account marked as exhausted (id={:?})", exhausted_id);

        if self
            .current
            .is_some_and(|index| self.accounts[index].api_key == api_key)
        {
            self.current = None;
        }
        info!(
            "Remaining active accounts: {}",
            self.accounts.iter().filter(|a| a.is_active()).count()
        );
    }

    pub fn has_active_accounts(&self) -> bool {
        self.accounts.iter().any(Account::is_active)
    }

    pub fn stats(&self) -> AccountStats {
        let active = self.accounts.iter().filter(|a| a.is_active()).count();
        AccountStats {
            total: self.accounts.len(),
            active,
            exhausted: self.accounts.len() - active,
            current_account_id: self.current.map(|index| self.accounts[index].id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemoryStore {
        accounts: Vec<Account>,
        loads: AtomicUsize,
        exhausted: Mutex<Vec<String>>,
        fail_writes: bool,
    }

    impl AccountStore for MemoryStore {
        fn load_accounts(&self) -> StoreResult<Vec<Account>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.accounts.clone())
        }

        fn mark_account_exhausted(&self, api_key: &str, _exhausted_at: &str) -> StoreResult<()> {
            if self.fail_writes {
                return Err(StoreError::MissingKey("api_key"));
            }
            self.exhausted.lock().unwrap().push(api_key.to_string());
            Ok(())
        }
    }

    fn account(id: i64, key: &str) -> Account {
        Account {
            id,
            email: Some(format!("user{}@example.com", id)),
            api_key: key.to_string(),
            status: AccountStatus::Active,
            exhausted_at: None,
        }
    }

    fn store_with(accounts: Vec<Account>) -> Arc<MemoryStore> {
        Arc::new(MemoryStore {
            accounts,
            ..Default::default()
        })
    }

    #[test]
    fn test_status_parse_defaults_to_active() {
        assert_eq!(AccountStatus::parse(None), AccountStatus::Active);
        assert_eq!(AccountStatus::parse(Some("weird")), AccountStatus::Active);
        assert_eq!(AccountStatus::parse(Some("exhausted")), AccountStatus::Exhausted);
    }

    #[test]
    fn test_blank_keys_are_dropped_and_pool_loads_once() {
        let store = store_with(vec![account(1, "k1"), account(2, "  ")]);
        let pool = Arc::new(AccountPool::new(store.clone()));

        let first = pool.manager().unwrap();
        let second = pool.manager().unwrap();

        assert_eq!(first.stats().total, 1);
        assert_eq!(second.stats().total, 1);
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhausting_both_accounts() {
        let store = store_with(vec![account(1, "k1"), account(2, "k2")]);
        let pool = Arc::new(AccountPool::new(store.clone()));
        let mut manager = pool.manager().unwrap();

        assert_eq!(manager.current_api_key().unwrap(), "k1");
        manager.mark_exhausted("k1");
        assert_eq!(manager.current_api_key().unwrap(), "k2");
        manager.mark_exhausted("k2");

        assert!(matches!(
            manager.current_api_key(),
            Err(ContactError::AllAccountsExhausted)
        ));
        assert!(!manager.has_active_accounts());
        assert_eq!(*store.exhausted.lock().unwrap(), vec!["k1", "k2"]);
    }

    #[test]
    fn test_exhaustion_reaches_shared_cache() {
        let store = store_with(vec![account(1, "k1"), account(2, "k2")]);
        let pool = Arc::new(AccountPool::new(store));
        let mut first = pool.manager().unwrap();
        first.mark_exhausted("k1");

        let mut later = pool.manager().unwrap();
        assert_eq!(later.current_api_key().unwrap(), "k2");
        assert_eq!(later.stats().exhausted, 1);
    }

    #[test]
    fn test_persist_failure_still_updates_cache() {
        let store = Arc::new(MemoryStore {
            accounts: vec![account(1, "k1")],
            fail_writes: true,
            ..Default::default()
        });
        let pool = Arc::new(AccountPool::new(store));
        let mut manager = pool.manager().unwrap();

        manager.mark_exhausted("k1");
        assert!(manager.current_api_key().is_err());
    }

    #[test]
    fn test_stats_track_current_account() {
        let store = store_with(vec![account(7, "k7"), account(8, "k8")]);
        let pool = Arc::new(AccountPool::new(store));
        let mut manager = pool.manager().unwrap();

        assert_eq!(manager.stats().current_account_id, None);
        manager.get_active();
        assert_eq!(
            manager.stats(),
            AccountStats {
                total: 2,
                active: 2,
                exhausted: 0,
                current_account_id: Some(7),
            }
        );
    }
}
