use crate::error::{map_error_text, ApiError, ApiResult};
use crate::refresher::AccountSource;
use crate::selector::SelectionBackend;
use crate::types::{Account, SelectionRequest, Team};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_PATH: &str = "/api/linkedin/connect";
const DISCONNECT_PATH: &str = "/api/linkedin/disconnect";
const SELECT_ACCOUNT_TYPE_PATH: &str = "/api/linkedin/select-account-type";
const ACCOUNTS_PATH: &str = "/api/accounts";
const TEAMS_PATH: &str = "/api/teams";

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_rate_limit() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: ApiResult<&str> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(ApiError::RateLimited { retry_after: 1 })
                } else {
                    Ok("accounts")
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some("accounts"));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fails_after_max_attempts() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: ApiResult<&str> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Timeout("slow".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_selection_expiry() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: ApiResult<&str> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::SelectionExpired("gone".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calculate_backoff_is_capped() {
        let delay = calculate_backoff(20);
        assert!(delay.as_millis() <= MAX_BACKOFF_MS as u128);
    }

    #[test]
    fn test_error_from_body_prefers_error_field() {
        let body = json!({"error": "Selection session expired", "message": "ignored"});
        let err = error_from_body(StatusCode::BAD_REQUEST, &body);
        assert!(err.is_selection_expired());

        let err = error_from_body(StatusCode::UNAUTHORIZED, &json!({}));
        assert!(matches!(err, ApiError::Auth(_)));

        let err = error_from_body(StatusCode::GONE, &json!({"message": "too late"}));
        assert!(err.is_selection_expired());
    }

    #[test]
    fn test_list_extraction_accepts_bare_and_wrapped_arrays() {
        let wrapped = json!({"accounts": [{"id": 1, "name": "Me"}, {"bogus": true}]});
        let accounts: Vec<Account> = extract_list(wrapped, "accounts");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "1");

        let bare = json!([{"id": "t1", "name": "Marketing"}]);
        let teams: Vec<Team> = extract_list(bare, "teams");
        assert_eq!(teams[0].name, "Marketing");
    }

    #[test]
    fn test_debug_output_redacts_token() {
        let api = LinkedInApi::new("https://api.example.com").with_token("secret-token".to_string());
        let printed = format!("{api:?}");
        assert!(!printed.contains("secret-token"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectLaunch {
    #[serde(alias = "url")]
    pub auth_url: String,
}

#[derive(Clone)]
pub struct LinkedInApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl fmt::Debug for LinkedInApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedInApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn calculate_backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..250);
    let exponential = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(exponential.saturating_add(jitter).min(MAX_BACKOFF_MS))
}

async fn with_retry<T, F, Fut>(mut operation: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= MAX_RETRIES || !e.is_retryable() {
                    return Err(e);
                }
                let delay = match &e {
                    ApiError::RateLimited { retry_after } => {
                        Duration::from_secs(*retry_after).min(Duration::from_millis(MAX_BACKOFF_MS))
                    }
                    _ => calculate_backoff(attempts),
                };
                debug!(attempt = attempts, ?delay, "Retrying after error: {e}");
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
        }
    }
}

fn error_from_body(status: StatusCode, body: &Value) -> ApiError {
    let text = body
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(text),
        StatusCode::GONE => ApiError::SelectionExpired(text),
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after: 60 },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ApiError::Timeout(text),
        _ => map_error_text(&text),
    }
}

fn extract_list<T: DeserializeOwned>(body: Value, field: &str) -> Vec<T> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

impl LinkedInApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, Duration::from_secs(5), Duration::from_secs(20))
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .user_agent("li-connect/0.1")
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_body(response: Response) -> ApiResult<Value> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(ApiError::RateLimited { retry_after });
        }

        let text = response.text().await?;
        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(error_from_body(status, &body));
        }
        Ok(body)
    }

    pub async fn initiate_connect(&self) -> ApiResult<ConnectLaunch> {
        let response = self
            .request(self.client.post(self.url(CONNECT_PATH)))
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        serde_json::from_value(body)
            .map_err(|e| ApiError::Api(format!("Malformed connect response: {e}")))
    }

    pub async fn disconnect(&self, account_id: &str) -> ApiResult<()> {
        let response = self
            .request(self.client.post(self.url(DISCONNECT_PATH)))
            .json(&json!({ "accountId": account_id }))
            .send()
            .await?;
        Self::read_body(response).await?;
        info!(account_id, "Disconnected LinkedIn account");
        Ok(())
    }

    pub async fn submit_selection(&self, request: &SelectionRequest) -> ApiResult<Option<Account>> {
        let response = self
            .request(self.client.post(self.url(SELECT_ACCOUNT_TYPE_PATH)))
            .json(request)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        Ok(body
            .get("account")
            .cloned()
            .and_then(|account| serde_json::from_value(account).ok()))
    }

    pub async fn list_accounts(&self) -> ApiResult<Vec<Account>> {
        let api = self;
        with_retry(move || async move {
            let response = api
                .request(api.client.get(api.url(ACCOUNTS_PATH)))
                .send()
                .await?;
            let body = Self::read_body(response).await?;
            Ok(extract_list(body, "accounts"))
        })
        .await
    }

    pub async fn list_teams(&self) -> ApiResult<Vec<Team>> {
        let api = self;
        with_retry(move || async move {
            let response = api
                .request(api.client.get(api.url(TEAMS_PATH)))
                .send()
                .await?;
            let body = Self::read_body(response).await?;
            Ok(extract_list(body, "teams"))
        })
        .await
    }
}

impl AccountSource for LinkedInApi {
    fn list_accounts(&self) -> impl Future<Output = ApiResult<Vec<Account>>> + Send {
        LinkedInApi::list_accounts(self)
    }

    fn list_teams(&self) -> impl Future<Output = ApiResult<Vec<Team>>> + Send {
        LinkedInApi::list_teams(self)
    }
}

impl SelectionBackend for LinkedInApi {
    fn submit_selection(
        &self,
        request: &SelectionRequest,
    ) -> impl Future<Output = ApiResult<Option<Account>>> + Send {
        LinkedInApi::submit_selection(self, request)
    }
}
