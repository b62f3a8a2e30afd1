pub(crate) mod exec;
pub mod factory;
pub mod labels;
pub mod memory;
pub mod model;
pub mod sqlite;
pub mod statement;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::statement::{QueryResults, ResultMode, Statement};

pub use factory::create_graph_database;
pub use labels::LabelSet;
pub use memory::InMemoryGraph;
pub use model::{Entity, Node, Properties, Relationship};
pub use sqlite::SqliteGraph;
pub use statement::{NodePattern, QuerySummary, RequestKey};

/// A property-graph store. Each call executes one statement atomically:
/// either every write it performs is visible afterwards or none is.
#[async_trait]
pub trait GraphDatabase: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, statement: &Statement, mode: ResultMode) -> Result<QueryResults>;
}
