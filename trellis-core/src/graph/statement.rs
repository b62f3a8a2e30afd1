use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::labels::LabelSet;
use crate::graph::model::{Entity, Node, Properties, Relationship};

pub const JOB_REQUEST_LABEL: &str = "JobRequest";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePattern {
    pub labels: LabelSet,
    pub banned_labels: LabelSet,
    pub properties: Properties,
    /// Property inequality constraints; a missing property is "not equal".
    pub excluded: Properties,
    pub ids: Vec<String>,
}

impl NodePattern {
    pub fn labelled(labels: &[&str]) -> Self {
        Self {
            labels: LabelSet::of(labels),
            ..Self::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Self::default()
        }
    }

    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_owned(), value.into());
        self
    }

    pub fn excluding(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.excluded.insert(key.to_owned(), value.into());
        self
    }

    pub fn without_label(mut self, label: &str) -> Self {
        self.banned_labels.insert(label);
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &node.id) {
            return false;
        }
        if !self.labels.is_subset_of(&node.labels) {
            return false;
        }
        if !self.banned_labels.is_disjoint(&node.labels) {
            return false;
        }
        let equal = self
            .properties
            .iter()
            .all(|(key, expected)| node.property(key) == Some(expected));
        if !equal {
            return false;
        }
        self.excluded
            .iter()
            .all(|(key, excluded)| node.property(key) != Some(excluded))
    }
}

/// Key of the launch semaphore: one `JobRequest` per (sample, task, extra...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestKey {
    pub sample: String,
    pub task: String,
    #[serde(default)]
    pub extra: Properties,
}

impl RequestKey {
    pub fn new(sample: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            sample: sample.into(),
            task: task.into(),
            extra: Properties::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }

    pub fn pattern(&self) -> NodePattern {
        let mut pattern = NodePattern::labelled(&[JOB_REQUEST_LABEL])
            .with_property("sample", self.sample.clone())
            .with_property("name", self.task.clone());
        for (key, value) in &self.extra {
            pattern.properties.insert(key.clone(), value.clone());
        }
        pattern
    }

    pub fn properties(&self) -> Properties {
        self.pattern().properties
    }
}

/// A graph operation. Every statement is executed atomically by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    CreateNode {
        labels: LabelSet,
        #[serde(default)]
        properties: Properties,
    },
    MergeNode {
        labels: LabelSet,
        key: Properties,
        #[serde(default)]
        properties: Properties,
    },
    MatchNodes {
        pattern: NodePattern,
    },
    UpdateNodes {
        pattern: NodePattern,
        #[serde(default)]
        set: Properties,
        #[serde(default)]
        add_labels: LabelSet,
        #[serde(default)]
        remove_labels: LabelSet,
    },
    Relate {
        from: NodePattern,
        to: NodePattern,
        rel_type: String,
        #[serde(default)]
        properties: Properties,
        #[serde(default)]
        merge: bool,
    },
    MatchRelationships {
        from: NodePattern,
        rel_type: Option<String>,
        to: NodePattern,
    },
    /// Idempotency guard: if no `JobRequest` exists for `request`, create it,
    /// link every input to it with `rel_type` and return the inputs along
    /// with the new links. Otherwise return nothing and write nothing.
    GuardedRequest {
        request: RequestKey,
        inputs: NodePattern,
        rel_type: String,
    },
    /// Link each target from the candidate with the latest `order_property`
    /// strictly earlier than the target's.
    RelateToPredecessor {
        target: NodePattern,
        candidates: NodePattern,
        order_property: String,
        rel_type: String,
    },
    RelateToEarliest {
        owner: NodePattern,
        target: NodePattern,
        candidates: NodePattern,
        order_property: String,
        rel_type: String,
    },
    /// Replace every `owner -[rel_type]->` edge with one pointing at `target`.
    /// With `order_property`, the pointer only moves forward: a target
    /// ordered before the current pointee leaves the edge in place.
    RepointLatest {
        owner: NodePattern,
        target: NodePattern,
        rel_type: String,
        #[serde(default)]
        order_property: Option<String>,
    },
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::CreateNode { .. } => "create_node",
            Statement::MergeNode { .. } => "merge_node",
            Statement::MatchNodes { .. } => "match_nodes",
            Statement::UpdateNodes { .. } => "update_nodes",
            Statement::Relate { .. } => "relate",
            Statement::MatchRelationships { .. } => "match_relationships",
            Statement::GuardedRequest { .. } => "guarded_request",
            Statement::RelateToPredecessor { .. } => "relate_to_predecessor",
            Statement::RelateToEarliest { .. } => "relate_to_earliest",
            Statement::RepointLatest { .. } => "repoint_latest",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Statement::MatchNodes { .. } | Statement::MatchRelationships { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    #[default]
    Data,
    Stats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuerySummary {
    pub nodes_created: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub labels_removed: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
}

impl QuerySummary {
    pub fn contains_updates(&self) -> bool {
        self.nodes_created
            + self.properties_set
            + self.labels_added
            + self.labels_removed
            + self.relationships_created
            + self.relationships_deleted
            > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryResults {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub summary: QuerySummary,
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.nodes.len() + self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.nodes
            .iter()
            .cloned()
            .map(Entity::Node)
            .chain(self.relationships.iter().cloned().map(Entity::Relationship))
            .collect()
    }

    pub fn split(&self) -> Vec<QueryResults> {
        self.entities()
            .into_iter()
            .map(|entity| {
                let mut part = QueryResults {
                    summary: self.summary.clone(),
                    ..QueryResults::default()
                };
                match entity {
                    Entity::Node(node) => part.nodes.push(node),
                    Entity::Relationship(rel) => part.relationships.push(rel),
                }
                part
            })
            .collect()
    }

    pub fn stats_only(self) -> QueryResults {
        QueryResults {
            summary: self.summary,
            ..QueryResults::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fastq(id: &str, mate: i64) -> Node {
        let properties = json!({"sample": "S1", "readGroup": 0, "matePair": mate});
        Node::new(
            id,
            LabelSet::of(&["Blob", "Fastq"]),
            properties.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn pattern_checks_labels_properties_and_exclusions() {
        let pattern = NodePattern::labelled(&["Fastq"])
            .with_property("sample", "S1")
            .excluding("matePair", 1);
        assert!(!pattern.matches(&fastq("a", 1)));
        assert!(pattern.matches(&fastq("b", 2)));
        assert!(!pattern.clone().without_label("Blob").matches(&fastq("b", 2)));
        assert!(!NodePattern::by_id("zzz").matches(&fastq("b", 2)));
    }

    #[test]
    fn split_yields_one_result_per_row() {
        let results = QueryResults {
            nodes: vec![fastq("a", 1), fastq("b", 2), fastq("c", 1)],
            ..QueryResults::default()
        };
        let parts = results.split();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|part| part.len() == 1));
        assert_eq!(parts[1].nodes[0].id, "b");
    }

    #[test]
    fn statement_round_trips_with_op_tag() {
        let statement = Statement::GuardedRequest {
            request: RequestKey::new("S1", "fastq-to-ubam").with("readGroup", 0),
            inputs: NodePattern::by_ids(["a", "b"]),
            rel_type: "WAS_USED_BY".to_owned(),
        };
        let value = serde_json::to_value(&statement).expect("serialize");
        assert_eq!(value["op"], "guarded_request");
        let back: Statement = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, statement);
        assert!(back.is_write());
    }

    #[test]
    fn request_key_pattern_includes_extras() {
        let key = RequestKey::new("S1", "align").with("readGroup", 2);
        let pattern = key.pattern();
        assert!(pattern.labels.contains(JOB_REQUEST_LABEL));
        assert_eq!(pattern.properties.get("name"), Some(&json!("align")));
        assert_eq!(pattern.properties.get("readGroup"), Some(&json!(2)));
    }
}
