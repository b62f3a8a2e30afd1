use std::sync::Arc;

use crate::config::schema::{StorageBackendKind, StorageConfig};
use crate::error::Result;
use crate::graph::memory::InMemoryGraph;
use crate::graph::sqlite::SqliteGraph;
use crate::graph::GraphDatabase;

pub fn create_graph_database(config: &StorageConfig) -> Result<Arc<dyn GraphDatabase>> {
    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(InMemoryGraph::new())),
        StorageBackendKind::Sqlite => Ok(Arc::new(SqliteGraph::new(config)?)),
    }
}
