//! Infrastructure layer: stores, queue, dispatcher and background loops.

pub mod config;
pub mod dispatcher;
pub mod domain_event_store;
pub mod flows;
pub mod priority_queue;
pub mod progress;
pub mod recovery;
pub mod replay;
pub mod streaming;

mod integration_tests;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig, LeasedDomainEvent};
pub use flows::{EventPattern, FlowError, FlowRegistry};
pub use recovery::{RecoveryError, RecoveryHandle, RecoveryLoop, RecoveryReport};
pub use replay::{ReplayCoordinator, ReplayError, ReplayReport, ReplayWindow};
pub use streaming::{Frame, with_heartbeats};
