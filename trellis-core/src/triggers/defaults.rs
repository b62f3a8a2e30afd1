//! Built-in genome pipeline rules: pair FASTQ mates, launch uBAM
//! conversion per read group, link jobs to their inputs, requests and
//! outputs, de-duplicate running jobs and keep Cromwell lineage.

use std::sync::Arc;

use crate::error::Result;
use crate::graph::labels::LabelSet;
use crate::graph::model::ValueKind;
use crate::triggers::conditions::Condition;
use crate::triggers::dedup::{DuplicateJobTrigger, DUPLICATE_LABEL, JOB_LABEL};
use crate::triggers::launch::{LaunchRule, LaunchTrigger};
use crate::triggers::lineage::{
    FirstStepTrigger, LatestAttemptTrigger, PreviousAttemptTrigger, PreviousStepTrigger,
    STEP_LABEL, WORKFLOW_LABEL,
};
use crate::triggers::registry::TriggerRegistry;
use crate::triggers::requeue::{RequeueRule, RequeueTrigger};
use crate::triggers::rules::{RuleAction, RuleDefinition, RuleTrigger};
use crate::triggers::template::{PatternTemplate, ValueTemplate};

pub const HAS_MATE_PAIR: &str = "HAS_MATE_PAIR";
pub const INPUT_TO: &str = "INPUT_TO";
pub const TRIGGERED: &str = "TRIGGERED";
pub const OUTPUT: &str = "OUTPUT";
pub const FASTQ_TO_UBAM: &str = "fastq-to-ubam";

fn mate(number: i64) -> PatternTemplate {
    PatternTemplate::labelled(&["Fastq"])
        .with("sample", ValueTemplate::from("sample"))
        .with("readGroup", ValueTemplate::from("readGroup"))
        .with("matePair", ValueTemplate::literal(number))
}

pub fn builtin_rules() -> Vec<RuleDefinition> {
    let relate_mates = RuleDefinition {
        description: "Relate mate 1 of a read group to mate 2".to_owned(),
        header_labels: LabelSet::of(&["Create", "Blob"]),
        node_labels: LabelSet::of(&["Fastq"]),
        required_properties: vec!["sample".to_owned(), "matePair".to_owned()],
        conditions: vec![Condition::property_type("readGroup", ValueKind::Integer)],
        query_labels: LabelSet::of(&["Relate", "Fastq", "MatePair"]),
        result_split: true,
        ..RuleDefinition::new(
            "relate-fastq-mate-pair",
            RuleAction::Relate {
                from: mate(1),
                to: mate(2),
                rel_type: HAS_MATE_PAIR.to_owned(),
                properties: Default::default(),
                merge: true,
            },
        )
    };

    let relate_inputs = RuleDefinition {
        description: "Relate a new job to each of its inputs".to_owned(),
        header_labels: LabelSet::of(&["Create", JOB_LABEL]),
        node_labels: LabelSet::of(&[JOB_LABEL]),
        required_properties: vec!["inputIds".to_owned()],
        query_labels: LabelSet::of(&["Relate", JOB_LABEL, "Input"]),
        result_split: true,
        ..RuleDefinition::new(
            "relate-job-to-inputs",
            RuleAction::Relate {
                from: PatternTemplate::ids_from("inputIds"),
                to: PatternTemplate::this(),
                rel_type: INPUT_TO.to_owned(),
                properties: Default::default(),
                merge: true,
            },
        )
    };

    let relate_request = RuleDefinition {
        description: "Relate the launch request to the job it produced".to_owned(),
        header_labels: LabelSet::of(&["Create", JOB_LABEL]),
        node_labels: LabelSet::of(&[JOB_LABEL]),
        required_properties: vec!["jobRequestId".to_owned()],
        query_labels: LabelSet::of(&["Relate", JOB_LABEL, "JobRequest"]),
        ..RuleDefinition::new(
            "relate-job-request-to-job",
            RuleAction::Relate {
                from: PatternTemplate {
                    labels: LabelSet::of(&["JobRequest"]),
                    ..PatternTemplate::ids_from("jobRequestId")
                },
                to: PatternTemplate::this(),
                rel_type: TRIGGERED.to_owned(),
                properties: Default::default(),
                merge: true,
            },
        )
    };

    let relate_output = RuleDefinition {
        description: "Relate an output blob to the job that wrote it".to_owned(),
        header_labels: LabelSet::of(&["Create", "Blob"]),
        node_labels: LabelSet::of(&["Blob"]),
        required_properties: vec!["jobId".to_owned()],
        query_labels: LabelSet::of(&["Relate", JOB_LABEL, "Output"]),
        ..RuleDefinition::new(
            "relate-job-to-output",
            RuleAction::Relate {
                from: PatternTemplate::labelled(&[JOB_LABEL])
                    .with("jobId", ValueTemplate::from("jobId"))
                    .without_label(DUPLICATE_LABEL),
                to: PatternTemplate::this(),
                rel_type: OUTPUT.to_owned(),
                properties: Default::default(),
                merge: true,
            },
        )
    };

    let mark_complete = RuleDefinition {
        description: "Mark a successful, non-duplicate job complete".to_owned(),
        header_labels: LabelSet::of(&["Update", JOB_LABEL]),
        node_labels: LabelSet::of(&[JOB_LABEL]),
        banned_labels: LabelSet::of(&[DUPLICATE_LABEL, "Complete"]),
        property_equals: [("status".to_owned(), "SUCCESS".into())].into_iter().collect(),
        query_labels: LabelSet::of(&["Update", JOB_LABEL, "Complete"]),
        ..RuleDefinition::new(
            "mark-job-complete",
            RuleAction::Update {
                target: PatternTemplate::this(),
                set: [("complete".to_owned(), ValueTemplate::literal(true))]
                    .into_iter()
                    .collect(),
                add_labels: LabelSet::of(&["Complete"]),
                remove_labels: LabelSet::new(),
            },
        )
    };

    vec![relate_mates, relate_inputs, relate_request, relate_output, mark_complete]
}

pub fn builtin_launch_rules() -> Vec<LaunchRule> {
    vec![LaunchRule {
        description: "Convert each FASTQ mate pair to an unaligned BAM".to_owned(),
        header_labels: LabelSet::of(&["Relate", "MatePair"]),
        node_labels: LabelSet::of(&["Fastq"]),
        end_labels: LabelSet::of(&["Fastq"]),
        key_properties: vec!["readGroup".to_owned()],
        ..LaunchRule::on_relationship("launch-fastq-to-ubam", FASTQ_TO_UBAM, HAS_MATE_PAIR)
    }]
}

/// Queries whose empty result means the graph has not caught up yet.
pub fn builtin_requeue_rules() -> Vec<RequeueRule> {
    vec![
        RequeueRule::new("requeue-relate-job-inputs", &["Relate", JOB_LABEL, "Input"]),
        RequeueRule::new("requeue-relate-job-request", &["Relate", JOB_LABEL, "JobRequest"]),
        RequeueRule::new("requeue-relate-job-output", &["Relate", JOB_LABEL, "Output"]),
        RequeueRule::new("requeue-update-job-status", &["Update", JOB_LABEL, "Status"]),
        first_step_requeue(),
    ]
}

// Steps can be stored before their workflow. A step that is not the
// earliest also comes back empty and spends its budget.
fn first_step_requeue() -> RequeueRule {
    let mut rule = RequeueRule::new(
        "requeue-relate-workflow-first-step",
        &["Relate", WORKFLOW_LABEL, STEP_LABEL],
    );
    rule.query_name = Some(FirstStepTrigger::NAME.to_owned());
    rule
}

pub fn register_builtins(registry: &mut TriggerRegistry) -> Result<()> {
    for rule in builtin_rules() {
        registry.register(Arc::new(RuleTrigger::new(rule)))?;
    }
    for rule in builtin_launch_rules() {
        registry.register(Arc::new(LaunchTrigger::new(rule)))?;
    }
    for rule in builtin_requeue_rules() {
        registry.register(Arc::new(RequeueTrigger::new(rule)))?;
    }
    registry.register(Arc::new(DuplicateJobTrigger::new()))?;
    registry.register(Arc::new(FirstStepTrigger::new()))?;
    registry.register(Arc::new(PreviousStepTrigger::new()))?;
    registry.register(Arc::new(PreviousAttemptTrigger::new()))?;
    registry.register(Arc::new(LatestAttemptTrigger::new()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::statement::{NodePattern, QueryResults, Statement};
    use crate::messages::{Message, MessageBody, Method, QueryRequest, QueryResultBody, Resource};

    #[test]
    fn builtins_register_without_name_clashes() {
        let mut registry = TriggerRegistry::new();
        register_builtins(&mut registry).expect("register");
        let names = registry.names();
        assert!(names.contains(&"relate-fastq-mate-pair".to_owned()));
        assert!(names.contains(&"launch-fastq-to-ubam".to_owned()));
        assert!(names.contains(&"find-duplicate-jobs".to_owned()));
        assert_eq!(names.len(), 5 + 1 + 5 + 1 + 4);
    }

    #[test]
    fn empty_first_step_link_is_requeued() {
        let config = Config::default();
        let registry = TriggerRegistry::with_defaults(&config).expect("registry");
        let request = QueryRequest::new(
            FirstStepTrigger::NAME,
            Statement::MatchNodes {
                pattern: NodePattern::default(),
            },
        );
        let empty = Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(&["Relate", WORKFLOW_LABEL, STEP_LABEL, "Database", "Result"]),
            MessageBody::QueryResult(QueryResultBody {
                request,
                results: QueryResults::default(),
            }),
        );

        let evaluation = registry.evaluate(&empty, &config);
        assert!(evaluation.matched.contains(&"requeue-relate-workflow-first-step".to_owned()));
        let retry = evaluation
            .outgoing
            .iter()
            .find(|outgoing| outgoing.delay.is_some())
            .expect("requeued query");
        assert_eq!(retry.topic, "db-query");
        assert_eq!(retry.message.header.retry_count, Some(1));
    }

    #[test]
    fn builtin_rules_survive_serialization() {
        for rule in builtin_rules() {
            let text = serde_json::to_string(&rule).expect("serialize");
            let back: RuleDefinition = serde_json::from_str(&text).expect("parse back");
            assert_eq!(back, rule);
        }
    }
}
