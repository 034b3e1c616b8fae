use crate::pending::PendingSelectionCache;
use crate::store::{read_json, write_json, KeyValueStore, StorageEvent, OAUTH_RESULT_KEY};
use crate::types::{null_as_default, opt_string_or_number, OAuthResult, OAuthStatus, Organization};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthMessage {
    #[serde(rename = "linkedin_auth_success", rename_all = "camelCase")]
    Success {
        #[serde(default, deserialize_with = "null_as_default")]
        select_account: bool,
        #[serde(
            default,
            deserialize_with = "opt_string_or_number",
            skip_serializing_if = "Option::is_none"
        )]
        selection_id: Option<String>,
        #[serde(
            default,
            deserialize_with = "null_as_default",
            skip_serializing_if = "Vec::is_empty"
        )]
        organizations: Vec<Organization>,
    },
    #[serde(rename = "linkedin_auth_error", rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl AuthMessage {
    pub fn into_result(self, timestamp: i64) -> OAuthResult {
        match self {
            AuthMessage::Success {
                select_account,
                selection_id,
                organizations,
            } => OAuthResult {
                select_account,
                selection_id,
                organizations,
                ..OAuthResult::success(timestamp)
            },
            AuthMessage::Error { reason, message } => OAuthResult::error(reason, message, timestamp),
        }
    }
}

impl From<&OAuthResult> for AuthMessage {
    fn from(result: &OAuthResult) -> Self {
        match result.status {
            OAuthStatus::Success => AuthMessage::Success {
                select_account: result.select_account,
                selection_id: result.selection_id.clone(),
                organizations: result.organizations.clone(),
            },
            OAuthStatus::Error => AuthMessage::Error {
                reason: result.reason.clone(),
                message: result.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: Value,
}

fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim()).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = origins
            .into_iter()
            .filter_map(|o| normalize_origin(o.as_ref()))
            .collect();
        allowed.sort();
        allowed.dedup();
        Self { allowed }
    }

    pub fn for_app(app_origin: &str, api_origin: Option<&str>) -> Self {
        Self::new(std::iter::once(app_origin).chain(api_origin))
    }

    pub fn allows(&self, origin: &str) -> bool {
        normalize_origin(origin).is_some_and(|o| self.allowed.contains(&o))
    }
}

pub fn parse_callback_query(query: &str, timestamp: i64) -> Option<OAuthResult> {
    let query = query.trim_start_matches('?');
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let non_empty = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

    match params.get("status").map(String::as_str) {
        Some("success") => {
            let organizations = params
                .get("organizations")
                .and_then(|raw| match serde_json::from_str::<Vec<Organization>>(raw) {
                    Ok(orgs) => Some(orgs),
                    Err(e) => {
                        debug!("Ignoring malformed organizations parameter: {e}");
                        None
                    }
                })
                .unwrap_or_default();
            Some(OAuthResult {
                select_account: params.get("select_account").map(String::as_str) == Some("true"),
                selection_id: non_empty("selectionId"),
                organizations,
                ..OAuthResult::success(timestamp)
            })
        }
        Some("error") => Some(OAuthResult::error(
            non_empty("reason"),
            non_empty("message"),
            timestamp,
        )),
        _ => None,
    }
}

pub fn query_from_url(url: &str) -> Option<String> {
    Url::parse(url).ok()?.query().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Transport {
    Message,
    Storage,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub transport: Transport,
    pub result: OAuthResult,
}

/// Folds the three delivery paths into one stream of results.
///
/// A logical outcome is delivered at most once per attempt whichever
/// transports carry it; the durable entry is deleted as soon as it is read.
pub struct ResultChannel {
    durable: Arc<dyn KeyValueStore>,
    policy: OriginPolicy,
    delivered: HashMap<String, i64>,
    query_consumed: bool,
}

impl ResultChannel {
    pub fn new(durable: Arc<dyn KeyValueStore>, policy: OriginPolicy) -> Self {
        Self {
            durable,
            policy,
            delivered: HashMap::new(),
            query_consumed: false,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.delivered.clear();
    }

    pub fn accept_message(&mut self, message: &WindowMessage, now: i64) -> Option<OAuthResult> {
        if !self.policy.allows(&message.origin) {
            debug!(origin = %message.origin, "Ignoring message from foreign origin");
            return None;
        }
        let payload: AuthMessage = match serde_json::from_value(message.data.clone()) {
            Ok(payload) => payload,
            Err(_) => return None,
        };
        self.admit(Transport::Message, payload.into_result(now), now)
    }

    pub fn accept_storage_event(&mut self, event: &StorageEvent, now: i64) -> Option<OAuthResult> {
        if event.key != OAUTH_RESULT_KEY {
            return None;
        }
        let raw = event.new_value.as_deref()?;
        let result = match serde_json::from_str::<OAuthResult>(raw) {
            Ok(result) => result,
            Err(e) => {
                debug!("Ignoring malformed stored result: {e}");
                return None;
            }
        };
        self.remove_persisted();
        if result.is_expired(now) {
            debug!("Ignoring expired stored result");
            return None;
        }
        self.admit(Transport::Storage, result, now)
    }

    pub fn take_query(&mut self, query: &str, now: i64) -> Option<OAuthResult> {
        if self.query_consumed {
            return None;
        }
        let result = parse_callback_query(query, now)?;
        self.query_consumed = true;
        self.admit(Transport::Query, result, now)
    }

    pub fn drain_persisted(&mut self, now: i64) -> Option<OAuthResult> {
        let stored: Option<OAuthResult> = match read_json(self.durable.as_ref(), OAUTH_RESULT_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                debug!("Discarding unreadable stored result: {e}");
                self.remove_persisted();
                return None;
            }
        };
        let result = stored?;
        self.remove_persisted();
        if result.is_expired(now) {
            debug!("Discarding expired stored result");
            return None;
        }
        self.admit(Transport::Storage, result, now)
    }

    pub fn startup(&mut self, query: Option<&str>, now: i64) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if let Some(result) = self.drain_persisted(now) {
            deliveries.push(Delivery {
                transport: Transport::Storage,
                result,
            });
        }
        if let Some(result) = query.and_then(|q| self.take_query(q, now)) {
            deliveries.push(Delivery {
                transport: Transport::Query,
                result,
            });
        }
        deliveries.sort_by_key(|d| d.transport);
        deliveries
    }

    fn remove_persisted(&self) {
        if let Err(e) = self.durable.delete(OAUTH_RESULT_KEY) {
            debug!("Failed to remove stored result: {e}");
        }
    }

    fn admit(&mut self, transport: Transport, result: OAuthResult, now: i64) -> Option<OAuthResult> {
        self.delivered
            .retain(|_, at| !crate::types::is_expired(*at, now));
        let key = result.delivery_key();
        if self.delivered.contains_key(&key) {
            debug!(?transport, "Duplicate authorization result ignored");
            return None;
        }
        self.delivered.insert(key, now);
        info!(?transport, status = ?result.status, select_account = result.select_account, "Authorization result received");
        Some(result)
    }
}

pub struct CallbackPublisher {
    durable: Arc<dyn KeyValueStore>,
    pending: PendingSelectionCache,
    origin: String,
}

impl CallbackPublisher {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        pending: PendingSelectionCache,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            durable,
            pending,
            origin: origin.into(),
        }
    }

    pub fn publish(&self, query: &str, now: i64) -> Option<OAuthResult> {
        let result = parse_callback_query(query, now)?;

        if let Err(e) = write_json(self.durable.as_ref(), OAUTH_RESULT_KEY, &result) {
            debug!("Could not persist authorization result: {e}");
        }
        if let Some(pending) = result.to_pending() {
            if let Err(e) = self.pending.write(&pending, now) {
                debug!("Could not persist pending selection: {e}");
            }
        }
        Some(result)
    }

    pub fn opener_message(&self, result: &OAuthResult) -> Option<WindowMessage> {
        match serde_json::to_value(AuthMessage::from(result)) {
            Ok(data) => Some(WindowMessage {
                origin: self.origin.clone(),
                data,
            }),
            Err(e) => {
                debug!("Could not encode opener message: {e}");
                None
            }
        }
    }
}
