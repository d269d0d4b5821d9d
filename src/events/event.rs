use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{EventId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    Heartbeat,
    NewEmail,
    EmailDeleted,
    AliasCreated,
    AliasDeleted,
    DomainVerified,
    DomainDeleted,
    ConnectionLimit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Heartbeat => "heartbeat",
            EventType::NewEmail => "new_email",
            EventType::EmailDeleted => "email_deleted",
            EventType::AliasCreated => "alias_created",
            EventType::AliasDeleted => "alias_deleted",
            EventType::DomainVerified => "domain_verified",
            EventType::DomainDeleted => "domain_deleted",
            EventType::ConnectionLimit => "connection_limit",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: UserId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, event_type: EventType, user_id: UserId, payload: Value) -> Self {
        Self {
            id,
            event_type,
            user_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}
