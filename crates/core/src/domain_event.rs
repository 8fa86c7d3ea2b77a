//! Domain events and the identifiers that scope them.
//!
//! A `DomainEvent` is immutable once stored. Its `metadata.revision` is the
//! 1-based position inside its aggregate's stream; the store rejects duplicates
//! and gaps at append time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::id::{AggregateId, DomainEventId};

/// Bounded context an aggregate lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextIdentifier {
    pub name: String,
}

impl ContextIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Identifies one aggregate instance: its type name plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateIdentifier {
    pub name: String,
    pub id: AggregateId,
}

impl AggregateIdentifier {
    pub fn new(name: impl Into<String>, id: AggregateId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("aggregate identifier name must not be empty"));
        }
        Ok(())
    }
}

/// Opaque identity of whoever caused an event. Passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub user: InitiatorUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorUser {
    pub id: String,
    #[serde(default)]
    pub claims: JsonValue,
}

impl Initiator {
    pub fn user(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            user: InitiatorUser {
                claims: serde_json::json!({ "sub": id }),
                id,
            },
        }
    }

    /// Initiator used for events raised by the runtime itself.
    pub fn system() -> Self {
        Self::user("system")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventMetadata {
    pub causation_id: Uuid,
    pub correlation_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub revision: u64,
    pub initiator: Initiator,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub context_identifier: ContextIdentifier,
    pub aggregate_identifier: AggregateIdentifier,
    pub name: String,
    pub id: DomainEventId,
    #[serde(default)]
    pub data: JsonValue,
    pub metadata: DomainEventMetadata,
}

impl DomainEvent {
    /// Build a new event at `revision`.
    ///
    /// Causation and correlation default to the event's own id, the timestamp
    /// to now, and the initiator to `Initiator::system()`.
    pub fn new(
        context_identifier: ContextIdentifier,
        aggregate_identifier: AggregateIdentifier,
        name: impl Into<String>,
        data: JsonValue,
        revision: u64,
    ) -> Self {
        let id = DomainEventId::new();
        Self {
            context_identifier,
            aggregate_identifier,
            name: name.into(),
            id,
            data,
            metadata: DomainEventMetadata {
                causation_id: *id.as_uuid(),
                correlation_id: *id.as_uuid(),
                timestamp: Utc::now().timestamp_millis(),
                revision,
                initiator: Initiator::system(),
                tags: Vec::new(),
            },
        }
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.metadata.causation_id = causation_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.metadata.timestamp = timestamp;
        self
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.metadata.initiator = initiator;
        self
    }

    pub fn revision(&self) -> u64 {
        self.metadata.revision
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_identifier.id
    }

    /// `context.aggregate.event`, the name flows subscribe to.
    pub fn full_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.context_identifier.name, self.aggregate_identifier.name, self.name
        )
    }

    /// Structural checks that do not need the store.
    pub fn validate(&self) -> CoreResult<()> {
        if self.context_identifier.name.trim().is_empty() {
            return Err(CoreError::validation("context identifier name must not be empty"));
        }
        self.aggregate_identifier.validate()?;
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("domain event name must not be empty"));
        }
        if self.metadata.revision < 1 {
            return Err(CoreError::validation(format!(
                "revision must be at least 1 (event {})",
                self.id
            )));
        }
        if self.metadata.timestamp < 0 {
            return Err(CoreError::validation("timestamp must not be negative"));
        }
        Ok(())
    }
}
