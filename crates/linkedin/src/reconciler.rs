//! Account-selection state machine.
//!
//! [`reduce`] is pure: it never touches storage, timers or the network. It
//! returns the next state plus a list of [`Effect`]s for the caller to run,
//! and every outcome of those effects comes back in as another [`Event`].

use crate::types::{
    Account, AccountChoice, OAuthResult, Organization, PendingSelection, SelectionRequest,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectionState {
    #[default]
    Idle,
    AwaitingResult,
    SelectionPending(PendingSelection),
    SelectionResolving {
        pending: PendingSelection,
        choice: AccountChoice,
    },
    Resolved(Resolution),
}

impl SelectionState {
    pub fn pending(&self) -> Option<&PendingSelection> {
        match self {
            SelectionState::SelectionPending(pending)
            | SelectionState::SelectionResolving { pending, .. } => Some(pending),
            _ => None,
        }
    }

    pub fn is_prompting(&self) -> bool {
        matches!(
            self,
            SelectionState::SelectionPending(_) | SelectionState::SelectionResolving { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Connected { name: Option<String> },
    AutoResolved { organization: Organization },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected { name: Option<String> },
    Failed { message: String },
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::Connected { name: Some(name) } => format!("Connected to {name}"),
            Notice::Connected { name: None } => "LinkedIn account connected".to_string(),
            Notice::Failed { message } => message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Mounted { pending: Option<PendingSelection> },
    AttemptStarted,
    ResultDelivered(OAuthResult),
    AccountsRefreshed(Vec<Account>),
    ChoiceMade(AccountChoice),
    SubmissionAccepted { account: Option<Account> },
    SubmissionRejected { expired: bool, message: String },
    Tick { now: i64 },
    Dismissed,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    PersistPending(PendingSelection),
    ClearPending,
    RefreshAccounts,
    Submit {
        choice: AccountChoice,
        request: SelectionRequest,
    },
    Notify(Notice),
    ShowConnected { organization: Organization },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciler {
    pub state: SelectionState,
    pub accounts: Vec<Account>,
    settled: Option<String>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        let (next, effects) = reduce(std::mem::take(self), event);
        *self = next;
        effects
    }

    fn offer(
        &mut self,
        state: SelectionState,
        pending: PendingSelection,
        effects: &mut Vec<Effect>,
    ) -> SelectionState {
        let unchanged = match &state {
            SelectionState::SelectionResolving { .. } => true,
            SelectionState::SelectionPending(current) => current.same_prompt(&pending),
            _ => false,
        };
        if unchanged {
            return state;
        }

        if self.settled.as_deref() == Some(pending.key().as_str()) {
            debug!(selection_id = ?pending.selection_id, "Prompt already settled, dropping echo");
            effects.push(Effect::ClearPending);
            return match state {
                SelectionState::Resolved(_) => state,
                _ => SelectionState::Idle,
            };
        }

        if let Some(organization) = pending.matching_organization(&self.accounts).cloned() {
            return self.auto_resolve(&pending, organization, effects);
        }

        info!(
            selection_id = ?pending.selection_id,
            organizations = pending.organizations.len(),
            "Prompting for LinkedIn account type"
        );
        effects.push(Effect::PersistPending(pending.clone()));
        SelectionState::SelectionPending(pending)
    }

    fn auto_resolve(
        &mut self,
        pending: &PendingSelection,
        organization: Organization,
        effects: &mut Vec<Effect>,
    ) -> SelectionState {
        info!(organization_id = %organization.id, "Selection already satisfied by an existing account");
        self.settled = Some(pending.key());
        effects.push(Effect::ClearPending);
        effects.push(Effect::ShowConnected {
            organization: organization.clone(),
        });
        SelectionState::Resolved(Resolution::AutoResolved { organization })
    }

    fn deliver(
        &mut self,
        state: SelectionState,
        result: OAuthResult,
        effects: &mut Vec<Effect>,
    ) -> SelectionState {
        if matches!(state, SelectionState::SelectionResolving { .. }) {
            debug!("Ignoring authorization result while a selection is being submitted");
            return state;
        }

        if !result.is_success() {
            let message = result.error_text();
            effects.push(Effect::Notify(Notice::Failed {
                message: message.clone(),
            }));
            return match state {
                SelectionState::SelectionPending(_) => state,
                _ => SelectionState::Resolved(Resolution::Failed { message }),
            };
        }

        if let Some(pending) = result.to_pending() {
            return self.offer(state, pending, effects);
        }

        effects.push(Effect::RefreshAccounts);
        effects.push(Effect::Notify(Notice::Connected { name: None }));
        match state {
            SelectionState::SelectionPending(_) => state,
            _ => SelectionState::Resolved(Resolution::Connected { name: None }),
        }
    }

    fn succeed(
        &mut self,
        pending: &PendingSelection,
        choice: &AccountChoice,
        account: Option<&Account>,
        effects: &mut Vec<Effect>,
    ) -> SelectionState {
        let name = match choice {
            AccountChoice::Organization(org) => org.display_name(),
            AccountChoice::Personal => account
                .map(Account::display_name)
                .unwrap_or_else(|| "your personal profile".to_string()),
        };
        info!(account_type = choice.account_type().as_str(), %name, "LinkedIn account type selected");
        self.settled = Some(pending.key());
        effects.push(Effect::ClearPending);
        effects.push(Effect::RefreshAccounts);
        effects.push(Effect::Notify(Notice::Connected {
            name: Some(name.clone()),
        }));
        SelectionState::Resolved(Resolution::Connected { name: Some(name) })
    }
}

pub fn reduce(mut reconciler: Reconciler, event: Event) -> (Reconciler, Vec<Effect>) {
    let mut effects = Vec::new();
    let state = std::mem::take(&mut reconciler.state);

    let next = match (state, event) {
        (SelectionState::Idle | SelectionState::Resolved(_), Event::Mounted { pending: None }) => {
            SelectionState::AwaitingResult
        }
        (state, Event::Mounted { pending: None }) => state,
        (SelectionState::SelectionResolving { pending, choice }, Event::AttemptStarted) => {
            SelectionState::SelectionResolving { pending, choice }
        }
        (_, Event::AttemptStarted) => {
            reconciler.settled = None;
            SelectionState::AwaitingResult
        }
        (state, Event::Mounted { pending: Some(pending) }) => {
            reconciler.offer(state, pending, &mut effects)
        }
        (state, Event::ResultDelivered(result)) => reconciler.deliver(state, result, &mut effects),
        (state, Event::AccountsRefreshed(accounts)) => {
            reconciler.accounts = accounts;
            match state {
                SelectionState::SelectionPending(pending) => {
                    match pending.matching_organization(&reconciler.accounts).cloned() {
                        Some(organization) => {
                            reconciler.auto_resolve(&pending, organization, &mut effects)
                        }
                        None => SelectionState::SelectionPending(pending),
                    }
                }
                state => state,
            }
        }
        (SelectionState::SelectionPending(pending), Event::ChoiceMade(choice)) => {
            let valid = match &choice {
                AccountChoice::Personal => true,
                AccountChoice::Organization(org) => pending.organization(&org.id).is_some(),
            };
            if valid {
                let request = choice.to_request(pending.selection_id.clone());
                effects.push(Effect::Submit {
                    choice: choice.clone(),
                    request,
                });
                SelectionState::SelectionResolving { pending, choice }
            } else {
                debug!("Ignoring choice outside the offered organizations");
                SelectionState::SelectionPending(pending)
            }
        }
        (SelectionState::SelectionResolving { pending, choice }, Event::SubmissionAccepted { account }) => {
            reconciler.succeed(&pending, &choice, account.as_ref(), &mut effects)
        }
        (
            SelectionState::SelectionResolving { pending, choice },
            Event::SubmissionRejected { expired, message },
        ) => {
            let already_connected = choice
                .organization_id()
                .is_some_and(|id| reconciler.accounts.iter().any(|a| a.matches_organization(id)));
            if expired && already_connected {
                info!("Selection session expired but the account exists; treating as connected");
                reconciler.succeed(&pending, &choice, None, &mut effects)
            } else {
                effects.push(Effect::Notify(Notice::Failed { message }));
                SelectionState::SelectionPending(pending)
            }
        }
        (SelectionState::SelectionPending(pending), Event::Tick { now }) if pending.is_expired(now) => {
            debug!(selection_id = ?pending.selection_id, "Pending selection expired");
            effects.push(Effect::ClearPending);
            SelectionState::Idle
        }
        (SelectionState::SelectionPending(_), Event::Dismissed) => SelectionState::Idle,
        (SelectionState::Resolved(_), Event::Acknowledged) => SelectionState::Idle,
        (state, _) => state,
    };

    reconciler.state = next;
    (reconciler, effects)
}
