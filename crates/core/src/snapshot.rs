//! Aggregate snapshots: materialized state at a revision.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain_event::AggregateIdentifier;
use crate::error::{CoreError, CoreResult};

/// Aggregate state at `revision`, so readers can skip replaying `1..=revision`.
///
/// Several snapshots may exist per aggregate; readers get the one with the
/// greatest revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate_identifier: AggregateIdentifier,
    pub revision: u64,
    pub state: JsonValue,
}

impl Snapshot {
    pub fn new(aggregate_identifier: AggregateIdentifier, revision: u64, state: JsonValue) -> Self {
        Self {
            aggregate_identifier,
            revision,
            state,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.aggregate_identifier.validate()?;
        if self.revision < 1 {
            return Err(CoreError::validation("snapshot revision must be at least 1"));
        }
        Ok(())
    }
}
