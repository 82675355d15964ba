//! Session record data structures and schema migration

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;

/// Schema version written by this build.
pub const CURRENT_RECORD_VERSION: u32 = 2;

/// The authenticated operator. Only `id` and `name` are interpreted; any other
/// fields returned by the server are carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: None,
            extra: Map::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "user id must be a string or number, got {other}"
        ))),
    }
}

/// The persisted session. A record only exists with both a user and a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user: User,
    pub token: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
    #[serde(default)]
    pub interface_access: BTreeMap<String, bool>,
    pub login_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub last_extension: Option<i64>,
    pub version: u32,
}

impl SessionRecord {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Ordering key for cross-context conflict resolution: most recent
    /// activity (or extension) wins, then the higher schema version.
    pub(crate) fn freshness(&self) -> (i64, u32) {
        let touched = self
            .last_activity
            .max(self.last_extension.unwrap_or(i64::MIN));
        (touched, self.version)
    }
}

/// Unvalidated session payload, as returned by the login endpoint or handed to
/// [`crate::TokenStorage::save`]. Accepts both `interfaceAccess` and the
/// server's `interface_access`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
    #[serde(default, alias = "interface_access")]
    pub interface_access: BTreeMap<String, bool>,
    #[serde(default, alias = "login_at")]
    pub login_at: Option<i64>,
    #[serde(default, alias = "last_activity")]
    pub last_activity: Option<i64>,
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<i64>,
    #[serde(default, alias = "last_extension")]
    pub last_extension: Option<i64>,
}

impl SessionData {
    pub fn new(user: User, token: impl Into<String>) -> Self {
        Self {
            user: Some(user),
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Parse a loosely-typed payload. Shape errors become `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected malformed session payload");
                None
            }
        }
    }

    /// Build a validated record, filling missing timestamps from `now_ms`.
    pub(crate) fn into_record(
        self,
        now_ms: i64,
        default_lifetime_ms: i64,
    ) -> Result<SessionRecord, ValidationError> {
        let user = self.user.ok_or(ValidationError::MissingUser)?;
        let token = self.token.ok_or(ValidationError::MissingToken)?;
        validate_token(&token)?;

        let login_at = self.login_at.unwrap_or(now_ms);
        let expires_at = self.expires_at.unwrap_or(login_at + default_lifetime_ms);
        if expires_at <= login_at {
            return Err(ValidationError::InvalidExpiry {
                login_at,
                expires_at,
            });
        }

        Ok(SessionRecord {
            user,
            token,
            permissions: self.permissions,
            limits: self.limits,
            interface_access: self.interface_access,
            login_at,
            last_activity: self.last_activity.unwrap_or(login_at),
            expires_at,
            last_extension: self.last_extension,
            version: CURRENT_RECORD_VERSION,
        })
    }
}

impl From<SessionRecord> for SessionData {
    fn from(record: SessionRecord) -> Self {
        Self {
            user: Some(record.user),
            token: Some(record.token),
            permissions: record.permissions,
            limits: record.limits,
            interface_access: record.interface_access,
            login_at: Some(record.login_at),
            last_activity: Some(record.last_activity),
            expires_at: Some(record.expires_at),
            last_extension: record.last_extension,
        }
    }
}

/// Partial update applied by shallow merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    pub user: Option<User>,
    pub token: Option<String>,
    pub permissions: Option<BTreeSet<String>>,
    pub limits: Option<BTreeMap<String, f64>>,
    #[serde(alias = "interface_access")]
    pub interface_access: Option<BTreeMap<String, bool>>,
}

impl SessionPatch {
    pub(crate) fn apply(self, record: &mut SessionRecord) -> Result<(), ValidationError> {
        if let Some(token) = &self.token {
            validate_token(token)?;
        }

        if let Some(user) = self.user {
            record.user = user;
        }
        if let Some(token) = self.token {
            record.token = token;
        }
        if let Some(permissions) = self.permissions {
            record.permissions = permissions;
        }
        if let Some(limits) = self.limits {
            record.limits = limits;
        }
        if let Some(interface_access) = self.interface_access {
            record.interface_access = interface_access;
        }
        Ok(())
    }
}

/// Tokens have the form `"<id>|<secret>"`: an alphanumeric id, one `|`, and a
/// non-empty secret without whitespace.
pub fn validate_token(token: &str) -> Result<(), ValidationError> {
    let Some((id, secret)) = token.split_once('|') else {
        return Err(ValidationError::MalformedToken);
    };

    let id_ok = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric());
    let secret_ok = !secret.is_empty() && !secret.chars().any(char::is_whitespace);

    if id_ok && secret_ok {
        Ok(())
    } else {
        Err(ValidationError::MalformedToken)
    }
}

/// Decode a durable payload. Returns the record and whether it was migrated
/// from an older schema. Anything unparseable is `None`.
pub(crate) fn decode_record(raw: &str) -> Option<(SessionRecord, bool)> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unparseable session record");
            return None;
        }
    };

    let (value, migrated) = migrate_record(value)?;

    match serde_json::from_value::<SessionRecord>(value) {
        Ok(record) => {
            if validate_token(&record.token).is_err() || record.expires_at <= record.login_at {
                tracing::warn!("Discarding session record that violates invariants");
                return None;
            }
            Some((record, migrated))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Discarding session record with invalid shape");
            None
        }
    }
}

fn record_version(value: &Value) -> u64 {
    value.get("version").and_then(Value::as_u64).unwrap_or(1)
}

/// Bring a raw record up to [`CURRENT_RECORD_VERSION`], one step at a time.
fn migrate_record(mut value: Value) -> Option<(Value, bool)> {
    let current_version = record_version(&value);
    let object = value.as_object_mut()?;

    if current_version >= u64::from(CURRENT_RECORD_VERSION) {
        return Some((value, false));
    }

    if current_version < 2 {
        migrate_v2(object);
    }

    object.insert("version".to_string(), Value::from(CURRENT_RECORD_VERSION));
    tracing::info!(
        from = current_version,
        to = CURRENT_RECORD_VERSION,
        "Migrated session record"
    );
    Some((value, true))
}

/// v1 stored `interface_access` in snake_case, had no permission, limit or
/// extension fields, and did not track activity separately from login.
fn migrate_v2(object: &mut Map<String, Value>) {
    if let Some(access) = object.remove("interface_access") {
        object.entry("interfaceAccess").or_insert(access);
    }

    object
        .entry("permissions")
        .or_insert_with(|| Value::Array(Vec::new()));
    object
        .entry("limits")
        .or_insert_with(|| Value::Object(Map::new()));
    object
        .entry("interfaceAccess")
        .or_insert_with(|| Value::Object(Map::new()));
    object.entry("lastExtension").or_insert(Value::Null);

    if !object.contains_key("lastActivity") {
        if let Some(login_at) = object.get("loginAt").cloned() {
            object.insert("lastActivity".to_string(), login_at);
        }
    }
}
