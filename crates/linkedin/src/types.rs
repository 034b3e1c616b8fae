use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const RESULT_TTL: Duration = Duration::from_secs(15 * 60);

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// An entry stamped at `timestamp` is stale once it is strictly older than [`RESULT_TTL`].
pub fn is_expired(timestamp: i64, now: i64) -> bool {
    now.saturating_sub(timestamp) > RESULT_TTL.as_millis() as i64
}

fn id_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(id_from_value(Value::deserialize(deserializer)?).unwrap_or_default())
}

pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(id_from_value(Value::deserialize(deserializer)?).filter(|s| !s.is_empty()))
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vanity_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

impl Organization {
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            self.name.clone()
        } else if let Some(vanity) = self.vanity_name.as_deref().filter(|v| !v.is_empty()) {
            vanity.to_string()
        } else {
            format!("Organization {}", self.id)
        }
    }
}

pub fn organization_ids(organizations: &[Organization]) -> Vec<String> {
    let mut ids: Vec<String> = organizations
        .iter()
        .map(|o| o.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

pub fn has_same_organization_choices(a: &[Organization], b: &[Organization]) -> bool {
    organization_ids(a) == organization_ids(b)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthResult {
    pub status: OAuthStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub select_account: bool,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub selection_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub timestamp: i64,
}

impl OAuthResult {
    pub fn success(timestamp: i64) -> Self {
        Self {
            status: OAuthStatus::Success,
            reason: None,
            message: None,
            select_account: false,
            selection_id: None,
            organizations: Vec::new(),
            timestamp,
        }
    }

    pub fn selection(
        selection_id: Option<String>,
        organizations: Vec<Organization>,
        timestamp: i64,
    ) -> Self {
        Self {
            select_account: true,
            selection_id,
            organizations,
            ..Self::success(timestamp)
        }
    }

    pub fn error(reason: Option<String>, message: Option<String>, timestamp: i64) -> Self {
        Self {
            status: OAuthStatus::Error,
            reason,
            message,
            ..Self::success(timestamp)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OAuthStatus::Success
    }

    pub fn requires_selection(&self) -> bool {
        self.is_success() && self.select_account && !organization_ids(&self.organizations).is_empty()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self.timestamp, now)
    }

    pub fn to_pending(&self) -> Option<PendingSelection> {
        if !self.requires_selection() {
            return None;
        }
        Some(PendingSelection {
            organizations: self.organizations.clone(),
            selection_id: self.selection_id.clone(),
            timestamp: self.timestamp,
        })
    }

    pub fn error_text(&self) -> String {
        match (self.message.as_deref(), self.reason.as_deref()) {
            (Some(message), _) if !message.is_empty() => message.to_string(),
            (_, Some(reason)) if !reason.is_empty() => {
                format!("LinkedIn connection failed ({reason})")
            }
            _ => "LinkedIn connection failed".to_string(),
        }
    }

    pub fn delivery_key(&self) -> String {
        format!(
            "{:?}|{}|{}|{}|{}",
            self.status,
            self.select_account,
            self.selection_id.as_deref().unwrap_or(""),
            organization_ids(&self.organizations).join(","),
            self.reason.as_deref().unwrap_or(""),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSelection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub organizations: Vec<Organization>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub selection_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl PendingSelection {
    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self.timestamp, now)
    }

    pub fn same_prompt(&self, other: &PendingSelection) -> bool {
        self.selection_id == other.selection_id
            && has_same_organization_choices(&self.organizations, &other.organizations)
    }

    pub fn key(&self) -> String {
        format!(
            "{}|{}",
            self.selection_id.as_deref().unwrap_or(""),
            organization_ids(&self.organizations).join(",")
        )
    }

    pub fn organization(&self, id: &str) -> Option<&Organization> {
        self.organizations.iter().find(|o| o.id.trim() == id.trim())
    }

    pub fn matching_organization<'a>(&'a self, accounts: &[Account]) -> Option<&'a Organization> {
        self.organizations
            .iter()
            .filter(|o| !o.id.trim().is_empty())
            .find(|o| accounts.iter().any(|a| a.matches_organization(&o.id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    #[default]
    Personal,
    Organization,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Personal => "personal",
            AccountType::Organization => "organization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub account_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(rename = "isTeamAccount", default)]
    pub is_team_account: bool,
}

impl Account {
    pub fn matches_organization(&self, organization_id: &str) -> bool {
        let organization_id = organization_id.trim();
        if organization_id.is_empty() {
            return false;
        }
        if self.organization_id.as_deref().map(str::trim) == Some(organization_id) {
            return true;
        }
        self.account_id
            .as_deref()
            .and_then(|id| id.strip_prefix("org:"))
            .is_some_and(|id| id.trim() == organization_id)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountChoice {
    Personal,
    Organization(Organization),
}

impl AccountChoice {
    pub fn account_type(&self) -> AccountType {
        match self {
            AccountChoice::Personal => AccountType::Personal,
            AccountChoice::Organization(_) => AccountType::Organization,
        }
    }

    pub fn label(&self) -> String {
        match self {
            AccountChoice::Personal => "Personal profile".to_string(),
            AccountChoice::Organization(org) => org.display_name(),
        }
    }

    pub fn organization_id(&self) -> Option<&str> {
        match self {
            AccountChoice::Personal => None,
            AccountChoice::Organization(org) => Some(org.id.as_str()),
        }
    }

    pub fn to_request(&self, selection_id: Option<String>) -> SelectionRequest {
        let (organization_id, organization_name, organization_vanity_name) = match self {
            AccountChoice::Personal => (None, None, None),
            AccountChoice::Organization(org) => (
                Some(org.id.clone()),
                Some(org.name.clone()).filter(|n| !n.is_empty()),
                org.vanity_name.clone(),
            ),
        };
        SelectionRequest {
            account_type: self.account_type(),
            selection_id,
            organization_id,
            organization_name,
            organization_vanity_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub account_type: AccountType,
    pub selection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_vanity_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(id: &str) -> Organization {
        Organization {
            id: id.to_string(),
            name: format!("Org {id}"),
            vanity_name: None,
            logo: None,
        }
    }

    #[test]
    fn organization_choices_ignore_order_and_duplicates() {
        let a = vec![org("2"), org("1"), org("1")];
        let b = vec![org("1"), org("2")];
        assert!(has_same_organization_choices(&a, &b));
        assert!(has_same_organization_choices(&[org(""), org("3")], &[org("3")]));
    }

    #[test]
    fn partial_overlap_is_not_equal() {
        let a = vec![org("1"), org("2")];
        let b = vec![org("2"), org("3")];
        assert!(!has_same_organization_choices(&a, &b));
    }

    #[test]
    fn padded_ids_compare_equal_to_bare_ids() {
        assert!(has_same_organization_choices(&[org(" 42 ")], &[org("42")]));
        assert_eq!(organization_ids(&[org(" 7"), org("7 "), org("  ")]), vec!["7".to_string()]);
    }

    #[test]
    fn numeric_ids_are_coerced_to_strings() {
        let orgs: Vec<Organization> =
            serde_json::from_str(r#"[{"id": 42, "name": "Acme"}, {"id": "7", "name": "Beta"}]"#)
                .expect("parse organizations");
        assert_eq!(orgs[0].id, "42");
        assert!(has_same_organization_choices(&orgs, &[org("7"), org("42")]));
    }

    #[test]
    fn expiry_boundary() {
        let now = 10_000_000_000;
        let minute = 60_000;
        assert!(is_expired(now - 16 * minute, now));
        assert!(!is_expired(now - 14 * minute, now));
    }

    #[test]
    fn account_matches_organization_id_or_prefixed_account_id() {
        let by_org: Account = serde_json::from_str(r#"{"id": 1, "organization_id": 42}"#)
            .expect("parse account");
        let by_prefix: Account =
            serde_json::from_str(r#"{"id": "2", "account_id": "org:42", "account_type": "organization"}"#)
                .expect("parse account");
        assert!(by_org.matches_organization("42"));
        assert!(by_prefix.matches_organization("42"));
        assert!(!by_prefix.matches_organization("4"));
        assert!(!by_org.matches_organization(""));
    }

    #[test]
    fn selection_request_omits_organization_fields_for_personal() {
        let request = AccountChoice::Personal.to_request(Some("abc".to_string()));
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["accountType"], "personal");
        assert_eq!(json["selectionId"], "abc");
        assert!(json.get("organizationId").is_none());

        let request = AccountChoice::Organization(org("42")).to_request(None);
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["accountType"], "organization");
        assert_eq!(json["organizationId"], "42");
        assert_eq!(json["organizationName"], "Org 42");
    }

    #[test]
    fn selection_without_organizations_does_not_require_a_prompt() {
        let result = OAuthResult::selection(Some("abc".to_string()), vec![org("")], 0);
        assert!(!result.requires_selection());
        assert!(result.to_pending().is_none());
    }
}
