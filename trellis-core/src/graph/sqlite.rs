use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tokio::sync::OnceCell;
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::schema::StorageConfig;
use crate::error::{Error, Result};
use crate::graph::exec::{apply, Edge, GraphTx};
use crate::graph::labels::LabelSet;
use crate::graph::model::{Node, Properties};
use crate::graph::statement::{NodePattern, QueryResults, ResultMode, Statement};
use crate::graph::GraphDatabase;

const SCHEMA_V1: [&str; 9] = [
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL PRIMARY KEY)",
    "INSERT OR IGNORE INTO schema_version(version) VALUES (0)",
    "CREATE TABLE IF NOT EXISTS nodes (id TEXT PRIMARY KEY, labels_json TEXT NOT NULL, properties_json TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS node_labels (node_id TEXT NOT NULL, label TEXT NOT NULL, PRIMARY KEY(node_id, label), FOREIGN KEY(node_id) REFERENCES nodes(id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS relationships (id TEXT PRIMARY KEY, rel_type TEXT NOT NULL, start_id TEXT NOT NULL, end_id TEXT NOT NULL, properties_json TEXT NOT NULL)",
    "CREATE INDEX IF NOT EXISTS idx_node_labels_label ON node_labels(label)",
    "CREATE INDEX IF NOT EXISTS idx_relationships_start ON relationships(start_id, rel_type)",
    "CREATE INDEX IF NOT EXISTS idx_relationships_end ON relationships(end_id, rel_type)",
    "UPDATE schema_version SET version = 1",
];

/// Statements run inside `BEGIN IMMEDIATE`, so concurrent guarded requests
/// for one key serialize.
#[derive(Debug, Clone)]
pub struct SqliteGraph {
    pool: sqlx::SqlitePool,
    initialized: std::sync::Arc<OnceCell<()>>,
}

impl SqliteGraph {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.connection_string)
            .map_err(|err| {
                Error::Storage(format!(
                    "invalid SQLite connection string '{}': {err}",
                    config.connection_string
                ))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.sqlite.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1) as u32)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            initialized: std::sync::Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                for statement in SCHEMA_V1 {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(Error::from)
            .map(|_| ())
    }
}

#[async_trait]
impl GraphDatabase for SqliteGraph {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, statement: &Statement, mode: ResultMode) -> Result<QueryResults> {
        self.ensure_initialized().await?;

        let conn = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut tx = SqliteTx { conn };
        let outcome = apply(&mut tx, statement, Utc::now().timestamp_millis()).await;

        // Dropping an open transaction, including on cancellation, rolls it back.
        match outcome {
            Ok(results) => {
                tx.conn.commit().await?;
                Ok(match mode {
                    ResultMode::Data => results,
                    ResultMode::Stats => results.stats_only(),
                })
            }
            Err(err) => {
                if let Err(rollback_err) = tx.conn.rollback().await {
                    tracing::warn!(error = %rollback_err, "failed to roll back graph statement");
                }
                Err(err)
            }
        }
    }
}

struct SqliteTx {
    conn: Transaction<'static, Sqlite>,
}

impl SqliteTx {
    fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
        serde_json::from_str(raw)
            .map_err(|err| Error::Storage(format!("invalid {what} json '{raw}': {err}")))
    }

    fn node_from_row(row: &SqliteRow) -> Result<Node> {
        let labels: LabelSet = Self::parse_json(&row.get::<String, _>("labels_json"), "labels")?;
        let properties: Properties =
            Self::parse_json(&row.get::<String, _>("properties_json"), "properties")?;
        Ok(Node::new(row.get::<String, _>("id"), labels, properties))
    }

    fn edge_from_row(row: &SqliteRow) -> Result<Edge> {
        Ok(Edge {
            id: row.get::<String, _>("id"),
            rel_type: row.get::<String, _>("rel_type"),
            start_id: row.get::<String, _>("start_id"),
            end_id: row.get::<String, _>("end_id"),
            properties: Self::parse_json(&row.get::<String, _>("properties_json"), "properties")?,
        })
    }

    async fn write_labels(&mut self, node: &Node) -> Result<()> {
        sqlx::query("DELETE FROM node_labels WHERE node_id = ?")
            .bind(&node.id)
            .execute(&mut *self.conn)
            .await?;
        for label in node.labels.iter() {
            sqlx::query("INSERT INTO node_labels(node_id, label) VALUES(?, ?)")
                .bind(&node.id)
                .bind(label)
                .execute(&mut *self.conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GraphTx for SqliteTx {
    async fn find_nodes(&mut self, pattern: &NodePattern) -> Result<Vec<Node>> {
        let rows = if !pattern.ids.is_empty() {
            let mut rows = Vec::with_capacity(pattern.ids.len());
            for id in &pattern.ids {
                let row = sqlx::query(
                    "SELECT id, labels_json, properties_json FROM nodes WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&mut *self.conn)
                .await?;
                rows.extend(row);
            }
            rows
        } else if let Some(label) = pattern.labels.first() {
            sqlx::query(
                "SELECT n.id, n.labels_json, n.properties_json FROM nodes n JOIN node_labels l ON l.node_id = n.id WHERE l.label = ? ORDER BY n.rowid ASC",
            )
            .bind(label)
            .fetch_all(&mut *self.conn)
            .await?
        } else {
            sqlx::query("SELECT id, labels_json, properties_json FROM nodes ORDER BY rowid ASC")
                .fetch_all(&mut *self.conn)
                .await?
        };

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let node = Self::node_from_row(&row)?;
            if pattern.matches(&node) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn insert_node(&mut self, labels: &LabelSet, properties: Properties) -> Result<Node> {
        let node = Node::new(Uuid::new_v4().to_string(), labels.clone(), properties);
        sqlx::query("INSERT INTO nodes(id, labels_json, properties_json) VALUES(?, ?, ?)")
            .bind(&node.id)
            .bind(serde_json::to_string(&node.labels)?)
            .bind(serde_json::to_string(&node.properties)?)
            .execute(&mut *self.conn)
            .await?;
        self.write_labels(&node).await?;
        Ok(node)
    }

    async fn update_node(&mut self, node: &Node) -> Result<()> {
        sqlx::query("UPDATE nodes SET labels_json = ?, properties_json = ? WHERE id = ?")
            .bind(serde_json::to_string(&node.labels)?)
            .bind(serde_json::to_string(&node.properties)?)
            .bind(&node.id)
            .execute(&mut *self.conn)
            .await?;
        self.write_labels(node).await
    }

    async fn find_edges(
        &mut self,
        start_id: Option<&str>,
        rel_type: Option<&str>,
        end_id: Option<&str>,
    ) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            "SELECT id, rel_type, start_id, end_id, properties_json FROM relationships WHERE (?1 IS NULL OR start_id = ?1) AND (?2 IS NULL OR rel_type = ?2) AND (?3 IS NULL OR end_id = ?3) ORDER BY rowid ASC",
        )
        .bind(start_id)
        .bind(rel_type)
        .bind(end_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(Self::edge_from_row).collect()
    }

    async fn insert_edge(
        &mut self,
        rel_type: &str,
        start_id: &str,
        end_id: &str,
        properties: Properties,
    ) -> Result<Edge> {
        let edge = Edge {
            id: Uuid::new_v4().to_string(),
            rel_type: rel_type.to_owned(),
            start_id: start_id.to_owned(),
            end_id: end_id.to_owned(),
            properties,
        };
        sqlx::query(
            "INSERT INTO relationships(id, rel_type, start_id, end_id, properties_json) VALUES(?, ?, ?, ?, ?)",
        )
        .bind(&edge.id)
        .bind(&edge.rel_type)
        .bind(&edge.start_id)
        .bind(&edge.end_id)
        .bind(serde_json::to_string(&edge.properties)?)
        .execute(&mut *self.conn)
        .await?;
        Ok(edge)
    }

    async fn delete_edge(&mut self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM relationships WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}
