//! `aeon-core`: value types shared by the stores, the dispatcher and the API.
//!
//! This crate contains **pure** data types (no I/O, no async).

pub mod domain_event;
pub mod error;
pub mod id;
pub mod lease;
pub mod snapshot;

pub use domain_event::{
    AggregateIdentifier, ContextIdentifier, DomainEvent, DomainEventMetadata, Initiator,
    InitiatorUser,
};
pub use error::{CoreError, CoreResult, ErrorCode, ErrorKind};
pub use id::{AggregateId, DomainEventId};
pub use lease::{LeaseToken, LockLease, LockMetadata};
pub use snapshot::Snapshot;
