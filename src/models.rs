//! Data Models for Todo Sync
//!
//! Todo items as stored locally and exchanged with the remote API, plus the
//! queued mutation records that carry offline edits to the remote side.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for client-generated identifiers that have not been reconciled yet
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A todo item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Unique identifier (client-generated until the remote assigns one)
    pub id: String,

    pub title: String,

    pub completed: bool,

    /// Creation timestamp (ISO-8601 on the wire)
    pub created_at: DateTime<Utc>,

    /// Last update timestamp, never earlier than `created_at`
    pub updated_at: DateTime<Utc>,
}

/// Body of a create request; the remote assigns id and timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub title: String,
    pub completed: bool,
}

/// Category listed by the remote API (read-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

impl Item {
    /// Create a new item with a client-generated id
    pub fn new_local(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, ulid::Ulid::new()),
            title: title.into(),
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the id is still a client-generated one
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// Bump `updated_at`, keeping it at or after `created_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }

    /// Copy with `completed` flipped
    pub fn toggled(&self) -> Self {
        let mut item = self.clone();
        item.completed = !item.completed;
        item.touch();
        item
    }

    pub fn as_new(&self) -> NewItem {
        NewItem {
            title: self.title.clone(),
            completed: self.completed,
        }
    }
}

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a mutation carries: the full item, or only its id for deletes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationPayload {
    Item(Item),
    Id { id: String },
}

impl MutationPayload {
    pub fn id(&self) -> &str {
        match self {
            MutationPayload::Item(item) => &item.id,
            MutationPayload::Id { id } => id,
        }
    }

    fn set_id(&mut self, new_id: &str) {
        match self {
            MutationPayload::Item(item) => item.id = new_id.to_string(),
            MutationPayload::Id { id } => *id = new_id.to_string(),
        }
    }
}

impl From<Item> for MutationPayload {
    fn from(item: Item) -> Self {
        MutationPayload::Item(item)
    }
}

/// A queued, not-yet-confirmed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Queue-local identifier (ULID, so lexical order follows creation order)
    pub id: String,

    pub kind: MutationKind,

    pub payload: MutationPayload,

    pub enqueued_at: DateTime<Utc>,

    /// Client-generated item id, only for creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,

    /// Failed remote attempts so far
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Earliest time the next attempt may run (backoff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
    /// Build a record, rejecting kind/payload combinations that make no sense
    pub fn new(
        kind: MutationKind,
        payload: MutationPayload,
        local_id: Option<String>,
    ) -> Result<Self> {
        if kind != MutationKind::Delete && matches!(payload, MutationPayload::Id { .. }) {
            return Err(SyncError::InvalidMutation(format!(
                "{} of {} needs the full item",
                kind,
                payload.id()
            )));
        }
        if local_id.is_some() && kind != MutationKind::Create {
            return Err(SyncError::InvalidMutation(format!(
                "local id is only valid for creates, got {}",
                kind
            )));
        }
        Ok(Self::build(kind, payload, local_id))
    }

    pub fn create(item: Item) -> Self {
        let local_id = Some(item.id.clone());
        Self::build(MutationKind::Create, item.into(), local_id)
    }

    pub fn update(item: Item) -> Self {
        Self::build(MutationKind::Update, item.into(), None)
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self::build(MutationKind::Delete, MutationPayload::Id { id: id.into() }, None)
    }

    fn build(kind: MutationKind, payload: MutationPayload, local_id: Option<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            kind,
            payload,
            enqueued_at: Utc::now(),
            local_id,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Id of the item this mutation targets
    pub fn item_id(&self) -> &str {
        self.payload.id()
    }

    pub fn item(&self) -> Option<&Item> {
        match &self.payload {
            MutationPayload::Item(item) => Some(item),
            MutationPayload::Id { .. } => None,
        }
    }

    /// Whether backoff allows an attempt at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Point the record at a reconciled id; returns whether anything changed
    pub fn retarget(&mut self, old_id: &str, new_id: &str) -> bool {
        if self.payload.id() != old_id {
            return false;
        }
        self.payload.set_id(new_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_item_creation() {
        let item = Item::new_local("Buy milk");
        assert!(item.is_local());
        assert!(!item.completed);
        assert_eq!(item.created_at, item.updated_at);
    }

    #[test]
    fn test_toggle_keeps_timestamps_ordered() {
        let mut item = Item::new_local("Walk dog");
        // created in the future relative to the toggle clock
        item.created_at = Utc::now() + chrono::Duration::hours(1);
        item.updated_at = item.created_at;

        let toggled = item.toggled();
        assert!(toggled.completed);
        assert!(toggled.updated_at >= toggled.created_at);
    }

    #[test]
    fn test_item_wire_format() {
        let json = r#"{"id":"S1","title":"Buy milk","completed":false,
            "createdAt":"2024-05-01T10:00:00Z","updatedAt":"2024-05-01T10:00:00Z"}"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, "S1");
        assert!(!item.is_local());

        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["createdAt"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_record_validation() {
        let bad = MutationRecord::new(
            MutationKind::Update,
            MutationPayload::Id { id: "1".into() },
            None,
        );
        assert!(matches!(bad, Err(SyncError::InvalidMutation(_))));

        let bad_local = MutationRecord::new(
            MutationKind::Delete,
            MutationPayload::Id { id: "1".into() },
            Some("local-1".into()),
        );
        assert!(bad_local.is_err());
    }

    #[test]
    fn test_record_retarget() {
        let mut record = MutationRecord::delete("local-1");
        assert!(!record.retarget("local-2", "srv-9"));
        assert!(record.retarget("local-1", "srv-9"));
        assert_eq!(record.item_id(), "srv-9");
    }

    #[test]
    fn test_payload_round_trips_untagged() {
        let record = MutationRecord::delete("7");
        let json = serde_json::to_string(&record).unwrap();
        let back: MutationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, MutationPayload::Id { id: "7".into() });

        let create = MutationRecord::create(Item::new_local("x"));
        let json = serde_json::to_string(&create).unwrap();
        let back: MutationRecord = serde_json::from_str(&json).unwrap();
        assert!(back.item().is_some());
        assert_eq!(back.local_id, create.local_id);
    }
}
