use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use directories::ProjectDirs;
use li_connect::commands::{self, Context};
use li_connect::config::Config;
use li_connect::profile::Profile;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "li-connect", version, about = "Connect LinkedIn accounts and finish page selection")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "LI_CONNECT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the simulated browser profile
    #[arg(long, global = true, env = "LI_CONNECT_PROFILE_DIR")]
    profile_dir: Option<PathBuf>,

    /// Tab whose session storage is used
    #[arg(long, global = true, default_value = "main")]
    tab: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start LinkedIn authorization
    Connect {
        /// Navigate this tab instead of opening a popup
        #[arg(long)]
        redirect: bool,
    },
    /// Handle the provider redirect, as the callback page would
    Callback {
        /// Full callback URL or its query string
        url: String,
    },
    /// Reopen the tab and finish any pending selection
    Resume {
        /// Query string this tab was loaded with
        #[arg(long)]
        query: Option<String>,
        /// Keep listening for results from other tabs
        #[arg(long)]
        watch: bool,
    },
    /// List connected accounts
    Accounts,
    /// Make an account the current one
    Select { account_id: String },
    /// Disconnect an account
    Disconnect { account_id: String },
}

fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("com", "li-connect", "li-connect") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config/default.toml")
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(get_config_path);
    let config = Config::load_or_default(&config_path).apply_env();
    let profile_dir = match cli.profile_dir {
        Some(dir) => dir,
        None => Profile::default_dir().map_err(|e| eyre!("{e}"))?,
    };
    let ctx = Context::new(config, Profile::open(&profile_dir, &cli.tab));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Connect { redirect } => commands::connect(&ctx, redirect).await,
            Command::Callback { url } => commands::callback(&ctx, &url).map(|_| ()),
            Command::Resume { query, watch } => commands::resume(&ctx, query.as_deref(), watch).await,
            Command::Accounts => commands::accounts(&ctx).await,
            Command::Select { account_id } => commands::select(&ctx, &account_id).await,
            Command::Disconnect { account_id } => commands::disconnect(&ctx, &account_id).await,
        }
    })
}
