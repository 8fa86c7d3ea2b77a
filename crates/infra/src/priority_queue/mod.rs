//! Lease-based priority queue partitioned by discriminator.
//!
//! Consumers lease the head of a lane, then acknowledge it (done), defer it
//! (retry later), or let the lease expire. Leases are serialized per
//! discriminator, so items sharing a discriminator are processed one at a
//! time and in order.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryPriorityQueueStore;
pub use postgres::PostgresPriorityQueueStore;
pub use r#trait::{LeasedItem, PriorityQueueStore, QueueError, QueueItem};
