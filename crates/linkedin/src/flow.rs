use crate::channel::{OriginPolicy, ResultChannel, WindowMessage};
use crate::error::ApiError;
use crate::pending::PendingSelectionCache;
use crate::reconciler::{Effect, Event, Notice, Reconciler, SelectionState};
use crate::refresher::{AccountRefresher, AccountSource, ConsistencyPolicy};
use crate::selector::{AccountTypeSelector, SelectionBackend, SelectorError};
use crate::store::{KeyValueStore, StorageEvent, OAUTH_RESULT_KEY};
use crate::types::{now_millis, AccountChoice, Organization};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowNotice {
    Prompt { options: Vec<AccountChoice> },
    PromptClosed,
    Notify(Notice),
    Connected { organization: Organization },
}

fn rejection_message(error: &SelectorError) -> String {
    match error {
        SelectorError::Api(ApiError::Api(message) | ApiError::Validation(message)) => message.clone(),
        SelectorError::Api(e) => e.user_message().to_string(),
        other => other.to_string(),
    }
}

pub struct ConnectFlow<B> {
    reconciler: Reconciler,
    channel: ResultChannel,
    cache: PendingSelectionCache,
    durable: Arc<dyn KeyValueStore>,
    backend: Arc<B>,
    refresher: Arc<AccountRefresher<B>>,
    selector: Option<Arc<AccountTypeSelector<B>>>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    notice_tx: mpsc::UnboundedSender<FlowNotice>,
    mounted: bool,
}

impl<B> ConnectFlow<B>
where
    B: AccountSource + SelectionBackend + 'static,
{
    pub fn new(
        backend: Arc<B>,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        policy: OriginPolicy,
        notice_tx: mpsc::UnboundedSender<FlowNotice>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let refresher = AccountRefresher::new(backend.clone()).with_store(durable.clone());
        Self {
            reconciler: Reconciler::new(),
            channel: ResultChannel::new(durable.clone(), policy),
            cache: PendingSelectionCache::new(session),
            durable,
            backend,
            refresher: Arc::new(refresher),
            selector: None,
            event_tx,
            event_rx,
            notice_tx,
            mounted: false,
        }
    }

    pub fn with_consistency(mut self, policy: ConsistencyPolicy) -> Self {
        self.refresher = Arc::new(
            AccountRefresher::new(self.backend.clone())
                .with_store(self.durable.clone())
                .with_policy(policy),
        );
        self
    }

    pub fn state(&self) -> &SelectionState {
        &self.reconciler.state
    }

    pub fn selector(&self) -> Option<&AccountTypeSelector<B>> {
        self.selector.as_deref()
    }

    pub fn mount(&mut self, query: Option<&str>) {
        self.mounted = true;
        let now = now_millis();
        let pending = self.cache.read(now);
        self.dispatch(Event::Mounted { pending });
        for delivery in self.channel.startup(query, now) {
            self.dispatch(Event::ResultDelivered(delivery.result));
        }
        self.spawn_refresh();
    }

    pub fn unmount(&mut self) {
        self.mounted = false;
        self.selector = None;
    }

    pub fn begin_attempt(&mut self) {
        self.channel.begin_attempt();
        self.dispatch(Event::AttemptStarted);
    }

    pub fn on_message(&mut self, message: &WindowMessage) {
        if let Some(result) = self.channel.accept_message(message, now_millis()) {
            self.dispatch(Event::ResultDelivered(result));
        }
    }

    pub fn on_storage_event(&mut self, event: &StorageEvent) {
        if event.key != OAUTH_RESULT_KEY {
            return;
        }
        if let Some(result) = self.channel.accept_storage_event(event, now_millis()) {
            self.dispatch(Event::ResultDelivered(result));
        }
    }

    pub fn on_focus(&mut self) {
        let now = now_millis();
        self.dispatch(Event::Tick { now });
        if let Some(pending) = self.cache.read(now) {
            self.dispatch(Event::Mounted {
                pending: Some(pending),
            });
        }
    }

    pub fn tick(&mut self, now: i64) {
        self.dispatch(Event::Tick { now });
    }

    pub fn choose(&mut self, choice: AccountChoice) {
        self.dispatch(Event::ChoiceMade(choice));
    }

    pub fn dismiss(&mut self) {
        self.dispatch(Event::Dismissed);
    }

    pub fn acknowledge(&mut self) {
        self.dispatch(Event::Acknowledged);
    }

    pub fn process_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            if self.apply_async(event) {
                applied += 1;
            }
        }
        applied
    }

    pub async fn next_event(&mut self) -> bool {
        match self.event_rx.recv().await {
            Some(event) => {
                self.apply_async(event);
                true
            }
            None => false,
        }
    }

    fn apply_async(&mut self, event: Event) -> bool {
        if !self.mounted {
            debug!(?event, "Dropping async result for an unmounted flow");
            return false;
        }
        self.dispatch(event);
        true
    }

    fn dispatch(&mut self, event: Event) {
        let effects = self.reconciler.apply(event);
        for effect in effects {
            self.run(effect);
        }
        self.sync_selector();
    }

    fn run(&mut self, effect: Effect) {
        match effect {
            Effect::PersistPending(pending) => {
                if let Err(e) = self.cache.write(&pending, now_millis()) {
                    debug!("Pending selection not persisted: {e}");
                }
            }
            Effect::ClearPending => self.cache.clear(),
            Effect::RefreshAccounts => self.spawn_refresh_after_write(),
            Effect::Submit { choice, .. } => self.spawn_submit(choice),
            Effect::Notify(notice) => {
                if let Notice::Failed { message } = &notice {
                    warn!("{message}");
                }
                self.notify(FlowNotice::Notify(notice));
            }
            Effect::ShowConnected { organization } => {
                self.notify(FlowNotice::Connected { organization });
            }
        }
    }

    fn sync_selector(&mut self) {
        let wanted = self.reconciler.state.pending().cloned();
        let current = self.selector.as_ref().map(|s| s.pending().clone());
        match (wanted, current) {
            (Some(wanted), Some(current)) if wanted.same_prompt(&current) => {}
            (Some(wanted), _) => {
                let selector = AccountTypeSelector::new(self.backend.clone(), wanted);
                let options = selector.options();
                self.selector = Some(Arc::new(selector));
                self.notify(FlowNotice::Prompt { options });
            }
            (None, Some(_)) => {
                self.selector = None;
                self.notify(FlowNotice::PromptClosed);
            }
            (None, None) => {}
        }
    }

    fn notify(&self, notice: FlowNotice) {
        let _ = self.notice_tx.send(notice);
    }

    fn spawn_refresh(&self) {
        let refresher = self.refresher.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let snapshot = refresher.refresh().await;
            let _ = tx.send(Event::AccountsRefreshed(snapshot.accounts));
        });
    }

    fn spawn_refresh_after_write(&self) {
        let refresher = self.refresher.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            refresher
                .refresh_after_write(|snapshot| {
                    let _ = tx.send(Event::AccountsRefreshed(snapshot.accounts.clone()));
                })
                .await;
        });
    }

    fn spawn_submit(&self, choice: AccountChoice) {
        let Some(selector) = self.selector.clone() else {
            let _ = self.event_tx.send(Event::SubmissionRejected {
                expired: false,
                message: "The selection prompt is no longer open".to_string(),
            });
            return;
        };
        let refresher = self.refresher.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let event = match selector.submit(&choice).await {
                Ok(account) => Event::SubmissionAccepted { account },
                Err(e) => {
                    let expired = matches!(&e, SelectorError::Api(api) if api.is_selection_expired());
                    if expired {
                        // The account may have been created before the session lapsed.
                        let snapshot = refresher.refresh().await;
                        let _ = tx.send(Event::AccountsRefreshed(snapshot.accounts));
                    }
                    Event::SubmissionRejected {
                        expired,
                        message: rejection_message(&e),
                    }
                }
            };
            let _ = tx.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AuthMessage;
    use crate::error::ApiResult;
    use crate::refresher::tests::account;
    use crate::store::{write_json, MemoryStore, PENDING_SELECTION_KEY};
    use crate::types::{Account, OAuthResult, PendingSelection, SelectionRequest, Team};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const APP: &str = "https://app.example.com";

    #[derive(Default)]
    struct FakeBackend {
        accounts: Mutex<Vec<Account>>,
        list_calls: AtomicU32,
        submit_calls: AtomicU32,
        expire_selection: AtomicBool,
    }

    impl AccountSource for FakeBackend {
        async fn list_accounts(&self) -> ApiResult<Vec<Account>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.accounts.lock().map(|a| a.clone()).unwrap_or_default())
        }

        async fn list_teams(&self) -> ApiResult<Vec<Team>> {
            Ok(Vec::new())
        }
    }

    impl SelectionBackend for FakeBackend {
        async fn submit_selection(&self, request: &SelectionRequest) -> ApiResult<Option<Account>> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            if self.expire_selection.load(Ordering::SeqCst) {
                return Err(ApiError::SelectionExpired("Selection session expired".to_string()));
            }
            let created = account("new", request.organization_id.as_deref());
            if let Ok(mut accounts) = self.accounts.lock() {
                accounts.push(created.clone());
            }
            Ok(Some(created))
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        durable: Arc<MemoryStore>,
        session: Arc<MemoryStore>,
        flow: ConnectFlow<FakeBackend>,
        notices: mpsc::UnboundedReceiver<FlowNotice>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let backend = Arc::new(backend);
        let durable = MemoryStore::shared();
        let session = MemoryStore::shared();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let flow = ConnectFlow::new(
            backend.clone(),
            durable.clone(),
            session.clone(),
            OriginPolicy::for_app(APP, None),
            notice_tx,
        );
        Harness {
            backend,
            durable,
            session,
            flow,
            notices,
        }
    }

    async fn settle(flow: &mut ConnectFlow<FakeBackend>) {
        while let Ok(true) = tokio::time::timeout(Duration::from_secs(5), flow.next_event()).await {}
    }

    fn drain(notices: &mut mpsc::UnboundedReceiver<FlowNotice>) -> Vec<FlowNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            out.push(notice);
        }
        out
    }

    fn acme() -> Organization {
        Organization {
            id: "1".to_string(),
            name: "Acme".to_string(),
            vanity_name: None,
            logo: None,
        }
    }

    fn acme_message() -> WindowMessage {
        let result = OAuthResult::selection(Some("abc".to_string()), vec![acme()], 0);
        WindowMessage {
            origin: APP.to_string(),
            data: serde_json::to_value(AuthMessage::from(&result)).expect("encode"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn organization_pick_end_to_end() {
        let mut h = harness(FakeBackend::default());
        h.flow.mount(None);
        settle(&mut h.flow).await;
        assert_eq!(h.flow.state(), &SelectionState::AwaitingResult);

        h.flow.on_message(&acme_message());
        h.flow.on_message(&acme_message());
        let notices = drain(&mut h.notices);
        let prompts: Vec<_> = notices
            .iter()
            .filter_map(|n| match n {
                FlowNotice::Prompt { options } => Some(options.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0], vec![AccountChoice::Personal, AccountChoice::Organization(acme())]);
        assert!(h.session.get(PENDING_SELECTION_KEY).expect("get").is_some());

        let calls_before = h.backend.list_calls.load(Ordering::SeqCst);
        h.flow.choose(AccountChoice::Organization(acme()));
        settle(&mut h.flow).await;

        assert_eq!(h.backend.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.list_calls.load(Ordering::SeqCst) - calls_before, 2);
        assert_eq!(h.session.get(PENDING_SELECTION_KEY).expect("get"), None);
        let notices = drain(&mut h.notices);
        assert!(notices.contains(&FlowNotice::Notify(Notice::Connected {
            name: Some("Acme".to_string())
        })));
        assert!(notices.contains(&FlowNotice::PromptClosed));
        assert!(!notices.iter().any(|n| matches!(n, FlowNotice::Connected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unambiguous_success_refreshes_twice_and_notifies_once() {
        let mut h = harness(FakeBackend::default());
        h.flow.mount(None);
        settle(&mut h.flow).await;
        let calls_before = h.backend.list_calls.load(Ordering::SeqCst);

        write_json(h.durable.as_ref(), OAUTH_RESULT_KEY, &OAuthResult::success(now_millis()))
            .expect("persist");
        let event = StorageEvent {
            key: OAUTH_RESULT_KEY.to_string(),
            new_value: h.durable.get(OAUTH_RESULT_KEY).expect("get"),
        };
        h.flow.on_storage_event(&event);
        h.flow.on_storage_event(&event);

        let started = tokio::time::Instant::now();
        settle(&mut h.flow).await;
        assert!(started.elapsed() >= Duration::from_millis(1200));
        assert_eq!(h.backend.list_calls.load(Ordering::SeqCst) - calls_before, 2);

        let connected: Vec<_> = drain(&mut h.notices)
            .into_iter()
            .filter(|n| matches!(n, FlowNotice::Notify(Notice::Connected { .. })))
            .collect();
        assert_eq!(connected.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_re_offers_prompt_and_existing_account_closes_it() {
        let backend = FakeBackend::default();
        backend
            .accounts
            .lock()
            .expect("accounts")
            .push(account("a1", Some("1")));
        let mut h = harness(backend);
        write_json(
            h.session.as_ref(),
            PENDING_SELECTION_KEY,
            &PendingSelection {
                organizations: vec![acme()],
                selection_id: Some("abc".to_string()),
                timestamp: now_millis(),
            },
        )
        .expect("seed");

        h.flow.mount(None);
        assert!(h.flow.state().is_prompting());
        settle(&mut h.flow).await;

        let notices = drain(&mut h.notices);
        let auto_closed = notices
            .iter()
            .filter(|n| matches!(n, FlowNotice::Connected { .. }))
            .count();
        assert_eq!(auto_closed, 1);
        assert_eq!(h.session.get(PENDING_SELECTION_KEY).expect("get"), None);
        assert!(h.flow.selector().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_selection_with_existing_account_is_connected() {
        let backend = FakeBackend::default();
        backend.expire_selection.store(true, Ordering::SeqCst);
        let mut h = harness(backend);
        h.flow.mount(None);
        settle(&mut h.flow).await;
        h.flow.on_message(&acme_message());

        // The account appears server-side after the prompt opened.
        h.backend
            .accounts
            .lock()
            .expect("accounts")
            .push(account("a1", Some("1")));
        h.flow.choose(AccountChoice::Organization(acme()));
        settle(&mut h.flow).await;

        assert!(!h.flow.state().is_prompting());
        let notices = drain(&mut h.notices);
        assert!(notices.contains(&FlowNotice::Notify(Notice::Connected {
            name: Some("Acme".to_string())
        })));
        assert!(!notices
            .iter()
            .any(|n| matches!(n, FlowNotice::Notify(Notice::Failed { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn results_after_unmount_are_dropped() {
        let mut h = harness(FakeBackend::default());
        h.flow.mount(None);
        h.flow.unmount();
        settle(&mut h.flow).await;
        assert_eq!(h.flow.state(), &SelectionState::AwaitingResult);
        assert_eq!(h.flow.process_events(), 0);
    }

    #[tokio::test]
    async fn callback_in_same_tab_reads_query() {
        let mut h = harness(FakeBackend::default());
        let organizations =
            url::form_urlencoded::byte_serialize(br#"[{"id":"1","name":"Acme"}]"#).collect::<String>();
        let query = format!("status=success&select_account=true&selectionId=abc&organizations={organizations}");
        h.flow.mount(Some(&query));
        assert!(matches!(h.flow.state(), SelectionState::SelectionPending(p) if p.selection_id.as_deref() == Some("abc")));
        assert_eq!(h.flow.selector().map(|s| s.options().len()), Some(2));
    }

    #[tokio::test]
    async fn foreign_messages_never_prompt() {
        let mut h = harness(FakeBackend::default());
        h.flow.mount(None);
        let mut message = acme_message();
        message.origin = "https://evil.example.com".to_string();
        h.flow.on_message(&message);
        assert_eq!(h.flow.state(), &SelectionState::AwaitingResult);
        assert!(h.flow.selector().is_none());
    }
}
