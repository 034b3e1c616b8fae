use crate::error::ApiResult;
use crate::store::{KeyValueStore, SELECTED_ACCOUNT_KEY};
use crate::types::{now_millis, Account, Team};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub trait AccountSource: Send + Sync {
    fn list_accounts(&self) -> impl Future<Output = ApiResult<Vec<Account>>> + Send;

    fn list_teams(&self) -> impl Future<Output = ApiResult<Vec<Team>>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            initial_delay: Duration::from_millis(1200),
            multiplier: 2,
        }
    }
}

impl ConsistencyPolicy {
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.attempts.max(1))
            .map(|attempt| {
                if attempt == 0 {
                    Duration::ZERO
                } else {
                    self.initial_delay
                        .saturating_mul(self.multiplier.max(1).saturating_pow(attempt - 1))
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub accounts: Vec<Account>,
    pub teams: Vec<Team>,
    pub selected: Option<String>,
    pub refreshed_at: Option<i64>,
}

impl AccountSnapshot {
    pub fn selected_account(&self) -> Option<&Account> {
        let selected = self.selected.as_deref()?;
        self.accounts.iter().find(|a| a.id == selected)
    }
}

/// Keeps the last known account list and re-reads it from the backend.
///
/// Failures never propagate: the previous list stays in place.
pub struct AccountRefresher<S> {
    source: Arc<S>,
    snapshot: Arc<RwLock<AccountSnapshot>>,
    durable: Option<Arc<dyn KeyValueStore>>,
    policy: ConsistencyPolicy,
}

impl<S: AccountSource> AccountRefresher<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            snapshot: Arc::new(RwLock::new(AccountSnapshot::default())),
            durable: None,
            policy: ConsistencyPolicy::default(),
        }
    }

    pub fn with_store(mut self, durable: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_policy(mut self, policy: ConsistencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn snapshot(&self) -> AccountSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn refresh(&self) -> AccountSnapshot {
        let (accounts, teams) = tokio::join!(self.source.list_accounts(), self.source.list_teams());

        let mut snapshot = self.snapshot.write().await;
        match accounts {
            Ok(accounts) => {
                snapshot.accounts = accounts;
                snapshot.refreshed_at = Some(now_millis());
            }
            Err(e) => warn!("Account refresh failed, keeping previous list: {e}"),
        }
        match teams {
            Ok(teams) => snapshot.teams = teams,
            Err(e) => warn!("Team refresh failed, keeping previous list: {e}"),
        }
        self.reconcile_selected(&mut snapshot);
        debug!(accounts = snapshot.accounts.len(), teams = snapshot.teams.len(), "Accounts refreshed");
        snapshot.clone()
    }

    pub async fn refresh_after_write<F>(&self, mut on_refresh: F) -> AccountSnapshot
    where
        F: FnMut(&AccountSnapshot) + Send,
    {
        let mut latest = AccountSnapshot::default();
        for delay in self.policy.delays() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            latest = self.refresh().await;
            on_refresh(&latest);
        }
        latest
    }

    pub async fn select(&self, account_id: &str) -> Option<Account> {
        let mut snapshot = self.snapshot.write().await;
        let account = snapshot.accounts.iter().find(|a| a.id == account_id).cloned()?;
        snapshot.selected = Some(account.id.clone());
        self.persist_selected(snapshot.selected.as_deref());
        Some(account)
    }

    pub async fn forget(&self, account_id: &str) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.accounts.retain(|a| a.id != account_id);
        self.reconcile_selected(&mut snapshot);
    }

    fn reconcile_selected(&self, snapshot: &mut AccountSnapshot) {
        if snapshot.selected.is_none() {
            snapshot.selected = self.load_selected();
        }
        let still_present = snapshot
            .selected
            .as_deref()
            .is_some_and(|id| snapshot.accounts.iter().any(|a| a.id == id));
        if !still_present {
            let fallback = snapshot.accounts.first().map(|a| a.id.clone());
            if fallback != snapshot.selected {
                snapshot.selected = fallback;
                self.persist_selected(snapshot.selected.as_deref());
            }
        }
    }

    fn load_selected(&self) -> Option<String> {
        let durable = self.durable.as_ref()?;
        match durable.get(SELECTED_ACCOUNT_KEY) {
            Ok(selected) => selected.filter(|s| !s.is_empty()),
            Err(e) => {
                debug!("Could not read selected account: {e}");
                None
            }
        }
    }

    fn persist_selected(&self, selected: Option<&str>) {
        let Some(durable) = &self.durable else {
            return;
        };
        let outcome = match selected {
            Some(id) => durable.set(SELECTED_ACCOUNT_KEY, id),
            None => durable.delete(SELECTED_ACCOUNT_KEY),
        };
        if let Err(e) = outcome {
            debug!("Could not persist selected account: {e}");
        }
    }
}
