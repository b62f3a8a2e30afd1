use serde_json::Value;

use crate::config::{topics, Config};
use crate::error::Result;
use crate::graph::labels::LabelSet;
use crate::graph::model::{Node, Properties};
use crate::graph::statement::{NodePattern, Statement};
use crate::messages::{KillCommand, Message, MessageBody, Method, QueryRequest, Resource};
use crate::triggers::composer::{compose_query, QueryOptions};
use crate::triggers::conditions::{Condition, ConditionSet};
use crate::triggers::{Outgoing, Trigger, TriggerEvent};

pub const JOB_LABEL: &str = "Job";
pub const DUPLICATE_LABEL: &str = "Duplicate";
pub const RUNNING: &str = "RUNNING";

pub const DEDUP_SENDER: &str = "kill-duplicates";

const DEDUP_KEYS: [&str; 3] = ["sample", "name", "inputHash"];

pub struct DuplicateJobTrigger {
    conditions: ConditionSet,
}

impl DuplicateJobTrigger {
    pub const NAME: &'static str = "find-duplicate-jobs";

    pub fn new() -> Self {
        let mut conditions = ConditionSet::new()
            .with(Condition::node_labels(&[JOB_LABEL]))
            .with(Condition::banned_labels(&[DUPLICATE_LABEL]))
            .with(Condition::property_equals("status", RUNNING));
        for key in DEDUP_KEYS {
            conditions.push(Condition::has_property(key));
        }
        Self { conditions }
    }
}

impl Default for DuplicateJobTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for DuplicateJobTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Find running jobs sharing sample, task and input hash"
    }

    fn check(&self, event: &TriggerEvent<'_>) -> bool {
        self.conditions.matches(event)
    }

    fn compose(&self, event: &TriggerEvent<'_>) -> Result<Vec<Outgoing>> {
        let mut pattern = NodePattern::labelled(&[JOB_LABEL])
            .without_label(DUPLICATE_LABEL)
            .with_property("status", RUNNING);
        if let Some(node) = event.node() {
            for key in DEDUP_KEYS {
                if let Some(value) = node.property(key) {
                    pattern.properties.insert(key.to_owned(), value.clone());
                }
            }
        }

        let options = QueryOptions::new(Self::NAME, LabelSet::of(&["Match", "Job", "Running"]))
            .method(Method::View)
            .publish_to(topics::DEDUP);
        Ok(vec![compose_query(
            event,
            Self::NAME,
            Statement::MatchNodes { pattern },
            options,
        )?])
    }
}

/// Which job keeps running and which are duplicates of it. The survivor is
/// the first row returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupPlan {
    pub survivor: Node,
    pub duplicates: Vec<Node>,
}

impl DedupPlan {
    pub fn from_jobs(jobs: &[Node]) -> Option<Self> {
        let (survivor, rest) = jobs.split_first()?;
        if rest.is_empty() {
            return None;
        }
        Some(Self {
            survivor: survivor.clone(),
            duplicates: rest.to_vec(),
        })
    }

    /// For every duplicate: a kill command and a query marking it
    /// `Duplicate` so completion checks skip it from now on.
    pub fn compose(&self, parent: &Message, config: &Config) -> Result<Vec<Outgoing>> {
        let kill_topic = config.topic(topics::KILL)?;
        let db_topic = config.topic(topics::DB_QUERY)?;
        let result_topic = config.topic(topics::TRIGGERS)?;
        let survivor_id = job_id(&self.survivor);

        let mut outgoing = Vec::with_capacity(self.duplicates.len() * 2);
        for duplicate in &self.duplicates {
            let duplicate_id = job_id(duplicate);
            let kill = Message::derive(
                parent,
                DEDUP_SENDER,
                Resource::Command,
                Method::Delete,
                LabelSet::of(&["Kill", "Job", DUPLICATE_LABEL]),
                MessageBody::Kill(KillCommand {
                    job_id: duplicate_id.clone(),
                    backend_id: duplicate.str_property("backendId").map(str::to_owned),
                    reason: format!("duplicate of {survivor_id}"),
                }),
            )
            .with_publish_to(kill_topic);
            outgoing.push(Outgoing::now(kill_topic, kill));

            let mut set = Properties::new();
            set.insert("duplicate".to_owned(), Value::Bool(true));
            set.insert("duplicateOf".to_owned(), Value::String(survivor_id.clone()));
            let request = QueryRequest::new(
                "mark-job-duplicate",
                Statement::UpdateNodes {
                    pattern: NodePattern::by_id(duplicate.id.clone()),
                    set,
                    add_labels: LabelSet::of(&[DUPLICATE_LABEL]),
                    remove_labels: LabelSet::new(),
                },
            )
            .publish_to(result_topic);
            let mark = Message::derive(
                parent,
                DEDUP_SENDER,
                Resource::Query,
                Method::Update,
                LabelSet::of(&["Update", "Job", DUPLICATE_LABEL]),
                MessageBody::Query(request),
            )
            .with_publish_to(db_topic);
            outgoing.push(Outgoing::now(db_topic, mark));

            tracing::info!(
                job_id = %duplicate_id,
                survivor = %survivor_id,
                "marking duplicate job for termination"
            );
        }
        Ok(outgoing)
    }
}

fn job_id(node: &Node) -> String {
    node.str_property("jobId").unwrap_or(&node.id).to_owned()
}
