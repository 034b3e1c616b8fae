use li_connect_linkedin::refresher::ConsistencyPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub app: AppConfig,
    pub refresh: RefreshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_origin: Option<String>,
    pub token: Option<String>,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub origin: String,
    pub callback_path: String,
    pub popup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub followup_delay_ms: u64,
    pub attempts: u32,
    pub multiplier: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            api_origin: None,
            token: None,
            connect_timeout_secs: 5,
            timeout_secs: 20,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            callback_path: "/accounts/linkedin/callback".to_string(),
            popup: true,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            followup_delay_ms: 1200,
            attempts: 2,
            multiplier: 2,
        }
    }
}

impl RefreshConfig {
    pub fn policy(&self) -> ConsistencyPolicy {
        ConsistencyPolicy {
            attempts: self.attempts,
            initial_delay: Duration::from_millis(self.followup_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

impl BackendConfig {
    pub fn api_origin(&self) -> Option<String> {
        self.api_origin.clone().or_else(|| {
            url::Url::parse(&self.base_url)
                .ok()
                .map(|u| u.origin().ascii_serialization())
                .filter(|o| o != "null")
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Using default config: {e}");
                Self::default()
            }
        }
    }

    pub fn apply_env(mut self) -> Self {
        if let Ok(base_url) = std::env::var("LI_CONNECT_BASE_URL") {
            if !base_url.is_empty() {
                self.backend.base_url = base_url;
            }
        }
        if let Ok(token) = std::env::var("LI_CONNECT_TOKEN") {
            if !token.is_empty() {
                self.backend.token = Some(token);
            }
        }
        self
    }

    pub fn callback_url(&self) -> String {
        format!(
            "{}{}",
            self.app.origin.trim_end_matches('/'),
            self.app.callback_path
        )
    }
}
