pub mod backend;
pub mod id;
pub mod task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::schema::{BackendConfig, BackendKind};
use crate::error::Result;

pub use backend::{CommandBackend, DryRunBackend};
pub use id::{input_hash, job_id};
pub use task::{InputRole, Resources, TaskRegistry, TaskTemplate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub job_id: String,
    pub task: String,
    pub sample: String,
    pub image: String,
    pub command: String,
    pub input_hash: String,
    pub input_ids: Vec<String>,
    pub inputs: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub resources: Resources,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the backend's own id for the submitted job.
    async fn submit(&self, spec: &JobSpec) -> Result<String>;

    async fn kill(&self, backend_id: &str) -> Result<()>;
}

pub fn create_job_backend(config: &BackendConfig) -> Arc<dyn JobBackend> {
    match config.kind {
        BackendKind::DryRun => Arc::new(DryRunBackend::new()),
        BackendKind::Command => Arc::new(CommandBackend::new(config.clone())),
    }
}
