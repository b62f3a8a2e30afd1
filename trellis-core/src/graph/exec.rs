use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::Result;
use crate::graph::labels::LabelSet;
use crate::graph::model::{compare_order, Node, Properties, Relationship};
use crate::graph::statement::{NodePattern, QueryResults, QuerySummary, Statement};

pub(crate) const NODE_CREATED_PROPERTY: &str = "nodeCreated";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Edge {
    pub id: String,
    pub rel_type: String,
    pub start_id: String,
    pub end_id: String,
    pub properties: Properties,
}

impl Edge {
    fn into_relationship(self, start: Node, end: Node) -> Relationship {
        Relationship {
            id: self.id,
            rel_type: self.rel_type,
            start,
            end,
            properties: self.properties,
        }
    }
}

/// Primitive reads and writes of one open transaction.
#[async_trait]
pub(crate) trait GraphTx: Send {
    async fn find_nodes(&mut self, pattern: &NodePattern) -> Result<Vec<Node>>;
    async fn insert_node(&mut self, labels: &LabelSet, properties: Properties) -> Result<Node>;
    async fn update_node(&mut self, node: &Node) -> Result<()>;
    async fn find_edges(
        &mut self,
        start_id: Option<&str>,
        rel_type: Option<&str>,
        end_id: Option<&str>,
    ) -> Result<Vec<Edge>>;
    async fn insert_edge(
        &mut self,
        rel_type: &str,
        start_id: &str,
        end_id: &str,
        properties: Properties,
    ) -> Result<Edge>;
    async fn delete_edge(&mut self, id: &str) -> Result<()>;
}

pub(crate) async fn apply<T: GraphTx + ?Sized>(
    tx: &mut T,
    statement: &Statement,
    now_ms: i64,
) -> Result<QueryResults> {
    let mut results = QueryResults::default();

    match statement {
        Statement::CreateNode { labels, properties } => {
            let node = create_node(tx, labels, properties.clone(), now_ms, &mut results.summary).await?;
            results.nodes.push(node);
        }
        Statement::MergeNode {
            labels,
            key,
            properties,
        } => {
            let pattern = NodePattern {
                labels: labels.clone(),
                properties: key.clone(),
                ..NodePattern::default()
            };
            let existing = tx.find_nodes(&pattern).await?;
            if existing.is_empty() {
                let mut merged = key.clone();
                for (name, value) in properties {
                    merged.insert(name.clone(), value.clone());
                }
                let node = create_node(tx, labels, merged, now_ms, &mut results.summary).await?;
                results.nodes.push(node);
            } else {
                for mut node in existing {
                    if set_changes(&mut node, properties, &LabelSet::new(), &LabelSet::new(), &mut results.summary) {
                        tx.update_node(&node).await?;
                    }
                    results.nodes.push(node);
                }
            }
        }
        Statement::MatchNodes { pattern } => {
            results.nodes = tx.find_nodes(pattern).await?;
        }
        Statement::UpdateNodes {
            pattern,
            set,
            add_labels,
            remove_labels,
        } => {
            for mut node in tx.find_nodes(pattern).await? {
                if set_changes(&mut node, set, add_labels, remove_labels, &mut results.summary) {
                    tx.update_node(&node).await?;
                }
                results.nodes.push(node);
            }
        }
        Statement::Relate {
            from,
            to,
            rel_type,
            properties,
            merge,
        } => {
            let starts = tx.find_nodes(from).await?;
            let ends = tx.find_nodes(to).await?;
            for start in &starts {
                for end in &ends {
                    if start.id == end.id {
                        continue;
                    }
                    let rel = relate(tx, start, end, rel_type, properties, *merge, &mut results.summary).await?;
                    results.relationships.push(rel);
                }
            }
        }
        Statement::MatchRelationships { from, rel_type, to } => {
            let starts = tx.find_nodes(from).await?;
            let ends: HashMap<String, Node> = tx
                .find_nodes(to)
                .await?
                .into_iter()
                .map(|node| (node.id.clone(), node))
                .collect();
            for start in starts {
                let edges = tx.find_edges(Some(&start.id), rel_type.as_deref(), None).await?;
                for edge in edges {
                    if let Some(end) = ends.get(&edge.end_id) {
                        results
                            .relationships
                            .push(edge.into_relationship(start.clone(), end.clone()));
                    }
                }
            }
        }
        Statement::GuardedRequest {
            request,
            inputs,
            rel_type,
        } => {
            if !tx.find_nodes(&request.pattern()).await?.is_empty() {
                return Ok(results);
            }
            let input_nodes = tx.find_nodes(inputs).await?;
            if input_nodes.is_empty() {
                return Ok(results);
            }
            let semaphore = create_node(
                tx,
                &request.pattern().labels,
                request.properties(),
                now_ms,
                &mut results.summary,
            )
            .await?;
            for input in &input_nodes {
                let edge = tx
                    .insert_edge(rel_type, &input.id, &semaphore.id, Properties::new())
                    .await?;
                results.summary.relationships_created += 1;
                results
                    .relationships
                    .push(edge.into_relationship(input.clone(), semaphore.clone()));
            }
            results.nodes = input_nodes;
        }
        Statement::RelateToPredecessor {
            target,
            candidates,
            order_property,
            rel_type,
        } => {
            let pool = tx.find_nodes(candidates).await?;
            for node in tx.find_nodes(target).await? {
                let Some(order) = node.property(order_property).cloned() else {
                    continue;
                };
                let Some(previous) = latest_before(&pool, &node.id, order_property, &order) else {
                    continue;
                };
                let rel = relate(tx, &previous, &node, rel_type, &Properties::new(), true, &mut results.summary).await?;
                results.relationships.push(rel);
            }
        }
        Statement::RelateToEarliest {
            owner,
            target,
            candidates,
            order_property,
            rel_type,
        } => {
            let pool = tx.find_nodes(candidates).await?;
            let owners = tx.find_nodes(owner).await?;
            for node in tx.find_nodes(target).await? {
                let Some(order) = node.property(order_property) else {
                    continue;
                };
                let has_earlier = pool.iter().any(|candidate| {
                    candidate.id != node.id
                        && candidate
                            .property(order_property)
                            .and_then(|other| compare_order(other, order))
                            == Some(Ordering::Less)
                });
                if has_earlier {
                    continue;
                }
                for owner_node in &owners {
                    if owner_node.id == node.id {
                        continue;
                    }
                    let rel = relate(tx, owner_node, &node, rel_type, &Properties::new(), true, &mut results.summary).await?;
                    results.relationships.push(rel);
                }
            }
        }
        Statement::RepointLatest {
            owner,
            target,
            rel_type,
            order_property,
        } => {
            let targets = tx.find_nodes(target).await?;
            for owner_node in tx.find_nodes(owner).await? {
                for node in &targets {
                    let current = tx.find_edges(Some(&owner_node.id), Some(rel_type), None).await?;
                    if let Some(order_property) = order_property {
                        if is_behind(tx, &current, node, order_property).await? {
                            continue;
                        }
                    }
                    for edge in current {
                        tx.delete_edge(&edge.id).await?;
                        results.summary.relationships_deleted += 1;
                    }
                    let edge = tx
                        .insert_edge(rel_type, &owner_node.id, &node.id, Properties::new())
                        .await?;
                    results.summary.relationships_created += 1;
                    results
                        .relationships
                        .push(edge.into_relationship(owner_node.clone(), node.clone()));
                }
            }
        }
    }

    Ok(results)
}

async fn create_node<T: GraphTx + ?Sized>(
    tx: &mut T,
    labels: &LabelSet,
    mut properties: Properties,
    now_ms: i64,
    summary: &mut QuerySummary,
) -> Result<Node> {
    properties
        .entry(NODE_CREATED_PROPERTY.to_owned())
        .or_insert_with(|| Value::from(now_ms));
    summary.nodes_created += 1;
    summary.labels_added += labels.len() as u64;
    summary.properties_set += properties.len() as u64;
    tx.insert_node(labels, properties).await
}

async fn relate<T: GraphTx + ?Sized>(
    tx: &mut T,
    start: &Node,
    end: &Node,
    rel_type: &str,
    properties: &Properties,
    merge: bool,
    summary: &mut QuerySummary,
) -> Result<Relationship> {
    if merge {
        let existing = tx
            .find_edges(Some(&start.id), Some(rel_type), Some(&end.id))
            .await?;
        if let Some(edge) = existing.into_iter().next() {
            return Ok(edge.into_relationship(start.clone(), end.clone()));
        }
    }

    let edge = tx
        .insert_edge(rel_type, &start.id, &end.id, properties.clone())
        .await?;
    summary.relationships_created += 1;
    summary.properties_set += properties.len() as u64;
    Ok(edge.into_relationship(start.clone(), end.clone()))
}

fn set_changes(
    node: &mut Node,
    set: &Properties,
    add_labels: &LabelSet,
    remove_labels: &LabelSet,
    summary: &mut QuerySummary,
) -> bool {
    let mut changed = false;
    for (key, value) in set {
        if node.properties.get(key) != Some(value) {
            node.properties.insert(key.clone(), value.clone());
            summary.properties_set += 1;
            changed = true;
        }
    }
    for label in add_labels.iter() {
        if node.labels.insert(label) {
            summary.labels_added += 1;
            changed = true;
        }
    }
    for label in remove_labels.iter() {
        if node.labels.remove(label) {
            summary.labels_removed += 1;
            changed = true;
        }
    }
    changed
}

async fn is_behind<T: GraphTx + ?Sized>(
    tx: &mut T,
    current: &[Edge],
    node: &Node,
    order_property: &str,
) -> Result<bool> {
    let Some(order) = node.property(order_property) else {
        return Ok(false);
    };
    for edge in current {
        for pointee in tx.find_nodes(&NodePattern::by_id(edge.end_id.clone())).await? {
            let ahead = pointee
                .property(order_property)
                .and_then(|other| compare_order(other, order))
                == Some(Ordering::Greater);
            if ahead {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn latest_before(pool: &[Node], node_id: &str, order_property: &str, order: &Value) -> Option<Node> {
    let mut best: Option<(&Node, &Value)> = None;
    for candidate in pool {
        if candidate.id == node_id {
            continue;
        }
        let Some(candidate_order) = candidate.property(order_property) else {
            continue;
        };
        if compare_order(candidate_order, order) != Some(Ordering::Less) {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, best_order)) => {
                compare_order(candidate_order, best_order) == Some(Ordering::Greater)
            }
        };
        if better {
            best = Some((candidate, candidate_order));
        }
    }
    best.map(|(node, _)| node.clone())
}
