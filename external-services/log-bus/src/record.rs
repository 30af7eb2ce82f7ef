// Log record types and their wire format
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

pub const AUDIT_TOPIC_NAME: &str = "audit_logs";
pub const ACTIVITY_TOPIC_NAME: &str = "activity_logs";

/// `null` decodes like a missing key: to the field's zero value.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A record kind that travels over its own queue.
///
/// The topic is both the queue name and the routing key on the default
/// exchange. Publishing replaces the record's timestamp with the time of the
/// publish call.
pub trait LogRecord: Serialize + DeserializeOwned + Send + 'static {
    /// Queue name and routing key.
    const TOPIC: &'static str;
    /// Consumer tag used when the caller does not name one.
    const DEFAULT_CONSUMER: &'static str;
    /// Short label for logs and error messages.
    const KIND: &'static str;

    fn stamp(&mut self, at: DateTime<Utc>);

    fn timestamp(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditLog {
    #[serde(deserialize_with = "null_as_default")]
    pub module: String,
    #[serde(deserialize_with = "null_as_default")]
    pub action_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub search_key: String,
    /// Serialized snapshot before the action; opaque to this crate.
    #[serde(deserialize_with = "null_as_default")]
    pub before: String,
    /// Serialized snapshot after the action; opaque to this crate.
    #[serde(deserialize_with = "null_as_default")]
    pub after: String,
    #[serde(deserialize_with = "null_as_default")]
    pub action_by: String,
    #[serde(rename = "timestamp", deserialize_with = "null_as_default")]
    pub action_time: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(
        module: impl Into<String>,
        action_type: impl Into<String>,
        search_key: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            action_type: action_type.into(),
            search_key: search_key.into(),
            ..Default::default()
        }
    }

    pub fn with_snapshots(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.before = before.into();
        self.after = after.into();
        self
    }

    pub fn with_action_by(mut self, action_by: impl Into<String>) -> Self {
        self.action_by = action_by.into();
        self
    }
}

impl LogRecord for AuditLog {
    const TOPIC: &'static str = AUDIT_TOPIC_NAME;
    const DEFAULT_CONSUMER: &'static str = "default_audit_consumer";
    const KIND: &'static str = "audit";

    fn stamp(&mut self, at: DateTime<Utc>) {
        self.action_time = at;
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.action_time
    }
}

/// User activity entry. The optional fields are left out of the payload when
/// empty and decode back to empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityLog {
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(deserialize_with = "null_as_default")]
    pub activity: String,
    #[serde(deserialize_with = "null_as_default")]
    pub module: String,
    #[serde(deserialize_with = "null_as_default")]
    pub activity_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty", deserialize_with = "null_as_default")]
    pub ip_address: String,
    #[serde(skip_serializing_if = "String::is_empty", deserialize_with = "null_as_default")]
    pub device_info: String,
    #[serde(skip_serializing_if = "String::is_empty", deserialize_with = "null_as_default")]
    pub location: String,
    #[serde(skip_serializing_if = "String::is_empty", deserialize_with = "null_as_default")]
    pub remarks: String,
}

impl ActivityLog {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        activity: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            activity: activity.into(),
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self
    }

    pub fn with_device_info(mut self, device_info: impl Into<String>) -> Self {
        self.device_info = device_info.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = remarks.into();
        self
    }
}

impl LogRecord for ActivityLog {
    const TOPIC: &'static str = ACTIVITY_TOPIC_NAME;
    const DEFAULT_CONSUMER: &'static str = "default_activity_consumer";
    const KIND: &'static str = "activity";

    fn stamp(&mut self, at: DateTime<Utc>) {
        self.activity_time = at;
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.activity_time
    }
}
