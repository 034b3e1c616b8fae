use crate::config::Config;
use crate::profile::{KeyWatcher, Profile};
use crate::session::{self, StopWhen};
use color_eyre::eyre::{eyre, Report, Result};
use li_connect_linkedin::api::LinkedInApi;
use li_connect_linkedin::channel::{query_from_url, CallbackPublisher, OriginPolicy};
use li_connect_linkedin::flow::{ConnectFlow, FlowNotice};
use li_connect_linkedin::pending::PendingSelectionCache;
use li_connect_linkedin::reconciler::SelectionState;
use li_connect_linkedin::refresher::{AccountRefresher, AccountSnapshot};
use li_connect_linkedin::store::{KeyValueStore, OAUTH_RESULT_KEY};
use li_connect_linkedin::{now_millis, ApiError, OAuthResult};
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct Context {
    pub config: Config,
    pub profile: Profile,
    pub api: Arc<LinkedInApi>,
}

impl Context {
    pub fn new(config: Config, profile: Profile) -> Self {
        let mut api = LinkedInApi::with_timeouts(
            config.backend.base_url.clone(),
            config.backend.connect_timeout(),
            config.backend.timeout(),
        );
        if let Some(token) = config.backend.token.clone() {
            api = api.with_token(token);
        }
        Self {
            config,
            profile,
            api: Arc::new(api),
        }
    }

    fn durable(&self) -> Arc<dyn KeyValueStore> {
        self.profile.durable.clone()
    }

    fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::for_app(
            &self.config.app.origin,
            self.config.backend.api_origin().as_deref(),
        )
    }

    fn refresher(&self) -> AccountRefresher<LinkedInApi> {
        AccountRefresher::new(self.api.clone())
            .with_store(self.durable())
            .with_policy(self.config.refresh.policy())
    }

    fn open_flow(&self) -> (ConnectFlow<LinkedInApi>, mpsc::UnboundedReceiver<FlowNotice>) {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let flow = ConnectFlow::new(
            self.api.clone(),
            self.durable(),
            self.profile.session.clone(),
            self.origin_policy(),
            notice_tx,
        )
        .with_consistency(self.config.refresh.policy());
        (flow, notices)
    }

    fn watcher(&self) -> KeyWatcher {
        KeyWatcher::new(self.durable(), OAUTH_RESULT_KEY)
    }
}

fn api_failure(action: &str, e: ApiError) -> Report {
    debug!("{action} failed: {e:?}");
    eyre!("{action} failed: {}", e.user_message())
}

fn print_accounts(snapshot: &AccountSnapshot) {
    if snapshot.accounts.is_empty() {
        println!("No connected accounts");
        return;
    }
    let selected = snapshot.selected_account().map(|a| a.id.as_str());
    for account in &snapshot.accounts {
        let marker = if Some(account.id.as_str()) == selected { "*" } else { " " };
        println!(
            "{marker} {:<24} {:<12} {}",
            account.id,
            account.account_type.as_str(),
            account.display_name()
        );
    }
}

pub async fn connect(ctx: &Context, redirect: bool) -> Result<()> {
    let launch = ctx
        .api
        .initiate_connect()
        .await
        .map_err(|e| api_failure("Starting LinkedIn authorization", e))?;
    info!("LinkedIn authorization started");

    println!("Open this URL to authorize LinkedIn:");
    println!("  {}", launch.auth_url);

    let popup = ctx.config.app.popup && !redirect;
    if !popup {
        println!(
            "After LinkedIn redirects to {}, run `li-connect callback <url>` in this tab, then `li-connect resume`.",
            ctx.config.callback_url()
        );
        return Ok(());
    }

    println!("Waiting for the authorization window to finish (q to stop)...");
    let (mut flow, mut notices) = ctx.open_flow();
    flow.mount(None);
    flow.begin_attempt();
    let watcher = ctx.watcher();
    let mut input = session::spawn_line_reader(BufReader::new(std::io::stdin()));
    session::run(&mut flow, &mut notices, &mut input, watcher, StopWhen::Resolved).await;
    Ok(())
}

pub fn callback(ctx: &Context, url: &str) -> Result<OAuthResult> {
    let query = query_from_url(url).unwrap_or_else(|| url.trim_start_matches('?').to_string());
    let publisher = CallbackPublisher::new(
        ctx.durable(),
        PendingSelectionCache::new(ctx.profile.session.clone()),
        ctx.config.app.origin.clone(),
    );
    let result = publisher
        .publish(&query, now_millis())
        .ok_or_else(|| eyre!("Not a LinkedIn authorization callback: {url}"))?;
    // Tabs in other processes only see the durable entry; the message is for an in-process opener.
    if let Some(message) = publisher.opener_message(&result) {
        debug!(origin = %message.origin, payload = %message.data, "Opener message");
    }

    if result.requires_selection() {
        println!(
            "LinkedIn authorized; {} page(s) can be chosen",
            result.organizations.len()
        );
    } else if result.is_success() {
        println!("LinkedIn authorized");
    } else {
        println!("LinkedIn authorization failed: {}", result.error_text());
    }
    Ok(result)
}

pub async fn resume(ctx: &Context, query: Option<&str>, watch: bool) -> Result<()> {
    let query = query.map(|q| query_from_url(q).unwrap_or_else(|| q.trim_start_matches('?').to_string()));
    let (mut flow, mut notices) = ctx.open_flow();
    flow.mount(query.as_deref());
    let watcher = ctx.watcher();

    // The first refresh may close a prompt whose account already exists.
    let _ = tokio::time::timeout(ctx.config.backend.timeout(), flow.next_event()).await;

    if !watch && flow.state() == &SelectionState::AwaitingResult {
        println!("No account selection is pending");
    }
    let stop = if watch {
        StopWhen::Never
    } else {
        StopWhen::PromptClosed
    };
    let mut input = session::spawn_line_reader(BufReader::new(std::io::stdin()));
    session::run(&mut flow, &mut notices, &mut input, watcher, stop).await;
    Ok(())
}

pub async fn accounts(ctx: &Context) -> Result<()> {
    let refresher = ctx.refresher();
    let snapshot = refresher.refresh().await;
    if snapshot.refreshed_at.is_none() {
        return Err(eyre!("Could not load accounts from {}", ctx.config.backend.base_url));
    }
    print_accounts(&snapshot);
    Ok(())
}

pub async fn select(ctx: &Context, account_id: &str) -> Result<()> {
    let refresher = ctx.refresher();
    refresher.refresh().await;
    let account = refresher
        .select(account_id)
        .await
        .ok_or_else(|| eyre!("No connected account with id {account_id}"))?;
    println!("Selected {}", account.display_name());
    Ok(())
}

pub async fn disconnect(ctx: &Context, account_id: &str) -> Result<()> {
    ctx.api
        .disconnect(account_id)
        .await
        .map_err(|e| api_failure("Disconnecting LinkedIn", e))?;
    info!(account_id, "LinkedIn account disconnected");

    let refresher = ctx.refresher();
    refresher.refresh().await;
    refresher.forget(account_id).await;
    print_accounts(&refresher.snapshot().await);
    Ok(())
}
