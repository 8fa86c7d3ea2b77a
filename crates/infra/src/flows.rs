//! Flow routing: which discriminators own which domain events.
//!
//! A flow subscribes to events by `context.aggregate.event` patterns, where
//! any segment may be `*`. The flow's name is the discriminator its events are
//! queued under, so all events of one flow are processed in order.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use aeon_core::DomainEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("invalid flow name: {0}")]
    InvalidName(String),

    #[error("invalid event pattern '{0}': expected 'context.aggregate.event'")]
    InvalidPattern(String),

    #[error("invalid flow configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Exact(String),
}

impl Segment {
    fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(expected) => expected == value,
        }
    }
}

/// One `context.aggregate.event` subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPattern {
    context: Segment,
    aggregate: Segment,
    event: Segment,
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Result<Self, FlowError> {
        let segments: Vec<&str> = pattern.split('.').collect();
        let [context, aggregate, event] = segments.as_slice() else {
            return Err(FlowError::InvalidPattern(pattern.to_string()));
        };

        let segment = |raw: &str| -> Result<Segment, FlowError> {
            match raw.trim() {
                "" => Err(FlowError::InvalidPattern(pattern.to_string())),
                "*" => Ok(Segment::Any),
                exact => Ok(Segment::Exact(exact.to_string())),
            }
        };

        Ok(Self {
            context: segment(*context)?,
            aggregate: segment(*aggregate)?,
            event: segment(*event)?,
        })
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        self.context.matches(&event.context_identifier.name)
            && self.aggregate.matches(&event.aggregate_identifier.name)
            && self.event.matches(&event.name)
    }
}

/// Registered flows, keyed by name (the discriminator).
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Vec<EventPattern>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow. Re-registering a name replaces its patterns.
    pub fn with_flow<I, P>(mut self, name: impl Into<String>, patterns: I) -> Result<Self, FlowError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FlowError::InvalidName(name));
        }
        let patterns = patterns
            .into_iter()
            .map(|p| EventPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.flows.insert(name, patterns);
        Ok(self)
    }

    /// Parse `{"flowName": ["context.aggregate.event", ...], ...}`.
    pub fn from_json(raw: &str) -> Result<Self, FlowError> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct FlowsDocument(BTreeMap<String, Vec<String>>);

        let FlowsDocument(document) = serde_json::from_str(raw)
            .map_err(|e| FlowError::InvalidConfiguration(e.to_string()))?;

        document
            .into_iter()
            .try_fold(Self::new(), |registry, (name, patterns)| {
                registry.with_flow(name, patterns)
            })
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flow names, in name order.
    pub fn discriminators(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    /// Every flow that subscribes to `event`.
    pub fn discriminators_for(&self, event: &DomainEvent) -> Vec<&str> {
        self.flows
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| p.matches(event)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn routes_to(&self, event: &DomainEvent, discriminator: &str) -> bool {
        self.flows
            .get(discriminator)
            .is_some_and(|patterns| patterns.iter().any(|p| p.matches(event)))
    }
}
