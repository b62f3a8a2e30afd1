pub mod bus;
pub mod config;
pub mod error;
pub mod graph;
pub mod jobs;
pub mod logging;
pub mod messages;
pub mod runtime;
pub mod stages;
pub mod triggers;

pub use bus::{LocalBus, MessageBus};
pub use config::Config;
pub use error::{Error, Result};
pub use graph::GraphDatabase;
pub use jobs::{JobBackend, JobSpec};
pub use messages::Message;
pub use runtime::{IngestRecord, Pipeline, RunStats};
pub use triggers::{Trigger, TriggerRegistry};
