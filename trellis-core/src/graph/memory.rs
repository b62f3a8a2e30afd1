use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::exec::{apply, Edge, GraphTx};
use crate::graph::labels::LabelSet;
use crate::graph::model::{Node, Properties, Relationship};
use crate::graph::statement::{NodePattern, QueryResults, ResultMode, Statement};
use crate::graph::GraphDatabase;

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

#[async_trait]
impl GraphTx for GraphState {
    async fn find_nodes(&mut self, pattern: &NodePattern) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .iter()
            .filter(|node| pattern.matches(node))
            .cloned()
            .collect())
    }

    async fn insert_node(&mut self, labels: &LabelSet, properties: Properties) -> Result<Node> {
        let node = Node::new(Uuid::new_v4().to_string(), labels.clone(), properties);
        self.nodes.push(node.clone());
        Ok(node)
    }

    async fn update_node(&mut self, node: &Node) -> Result<()> {
        if let Some(existing) = self.nodes.iter_mut().find(|existing| existing.id == node.id) {
            *existing = node.clone();
        }
        Ok(())
    }

    async fn find_edges(
        &mut self,
        start_id: Option<&str>,
        rel_type: Option<&str>,
        end_id: Option<&str>,
    ) -> Result<Vec<Edge>> {
        Ok(self
            .edges
            .iter()
            .filter(|edge| start_id.map_or(true, |id| edge.start_id == id))
            .filter(|edge| rel_type.map_or(true, |kind| edge.rel_type == kind))
            .filter(|edge| end_id.map_or(true, |id| edge.end_id == id))
            .cloned()
            .collect())
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
        self.edges.push(edge.clone());
        Ok(edge)
    }

    async fn delete_edge(&mut self, id: &str) -> Result<()> {
        self.edges.retain(|edge| edge.id != id);
        Ok(())
    }
}

/// Statements run on a copy under one lock; rows keep insertion order.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    state: Mutex<GraphState>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn nodes(&self, pattern: &NodePattern) -> Vec<Node> {
        let state = self.state.lock().await;
        state
            .nodes
            .iter()
            .filter(|node| pattern.matches(node))
            .cloned()
            .collect()
    }

    pub async fn relationships(&self, rel_type: &str) -> Vec<Relationship> {
        let state = self.state.lock().await;
        state
            .edges
            .iter()
            .filter(|edge| edge.rel_type == rel_type)
            .filter_map(|edge| {
                let start = state.nodes.iter().find(|node| node.id == edge.start_id)?;
                let end = state.nodes.iter().find(|node| node.id == edge.end_id)?;
                Some(Relationship {
                    id: edge.id.clone(),
                    rel_type: edge.rel_type.clone(),
                    start: start.clone(),
                    end: end.clone(),
                    properties: edge.properties.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl GraphDatabase for InMemoryGraph {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, statement: &Statement, mode: ResultMode) -> Result<QueryResults> {
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let results = apply(&mut working, statement, Utc::now().timestamp_millis()).await?;
        *state = working;

        Ok(match mode {
            ResultMode::Data => results,
            ResultMode::Stats => results.stats_only(),
        })
    }
}
