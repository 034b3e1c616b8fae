use crate::error::{ApiError, ApiResult};
use crate::types::{Account, AccountChoice, PendingSelection, SelectionRequest};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub trait SelectionBackend: Send + Sync {
    fn submit_selection(
        &self,
        request: &SelectionRequest,
    ) -> impl Future<Output = ApiResult<Option<Account>>> + Send;
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("a selection is already being submitted")]
    Busy,

    #[error("organization {0} is not one of the offered pages")]
    UnknownOrganization(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct AccountTypeSelector<B> {
    backend: Arc<B>,
    pending: PendingSelection,
    in_flight: AtomicBool,
}

impl<B: SelectionBackend> AccountTypeSelector<B> {
    pub fn new(backend: Arc<B>, pending: PendingSelection) -> Self {
        Self {
            backend,
            pending,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn pending(&self) -> &PendingSelection {
        &self.pending
    }

    pub fn options(&self) -> Vec<AccountChoice> {
        let mut seen = Vec::new();
        let mut options = vec![AccountChoice::Personal];
        for org in &self.pending.organizations {
            let id = org.id.trim();
            if id.is_empty() || seen.contains(&id) {
                continue;
            }
            seen.push(id);
            options.push(AccountChoice::Organization(org.clone()));
        }
        options
    }

    pub fn is_disabled(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn submit(&self, choice: &AccountChoice) -> Result<Option<Account>, SelectorError> {
        if let AccountChoice::Organization(org) = choice {
            if self.pending.organization(&org.id).is_none() {
                return Err(SelectorError::UnknownOrganization(org.id.clone()));
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SelectorError::Busy);
        }
        let _guard = InFlight(&self.in_flight);

        let request = choice.to_request(self.pending.selection_id.clone());
        match self.backend.submit_selection(&request).await {
            Ok(account) => {
                info!(account_type = request.account_type.as_str(), "Account type selection accepted");
                Ok(account)
            }
            Err(e) => {
                warn!("Account type selection rejected: {e}");
                Err(e.into())
            }
        }
    }
}
