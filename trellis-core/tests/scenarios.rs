use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use trellis_core::bus::{LocalBus, MessageBus};
use trellis_core::config::Config;
use trellis_core::graph::statement::{NodePattern, QueryResults, ResultMode, Statement};
use trellis_core::graph::{GraphDatabase, InMemoryGraph, LabelSet, Node, Properties};
use trellis_core::jobs::DryRunBackend;
use trellis_core::messages::{Message, MessageBody, Method, QueryRequest, QueryResultBody, Resource};
use trellis_core::stages::{QueryStage, Stage};
use trellis_core::triggers::TriggerRegistry;
use trellis_core::{IngestRecord, Pipeline};

fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap_or_default()
}

fn fastq(mate: i64) -> IngestRecord {
    IngestRecord::new(
        &["Blob", "Fastq"],
        props(json!({
            "sample": "NA12878",
            "readGroup": 0,
            "matePair": mate,
            "path": format!("gs://reads/NA12878_0_R{mate}.fastq.gz"),
        })),
    )
}

fn pipeline(graph: Arc<InMemoryGraph>, backend: Arc<DryRunBackend>) -> Pipeline {
    Pipeline::new(Config::default(), graph, backend).expect("pipeline")
}

fn labelled(labels: &[&str]) -> NodePattern {
    NodePattern::labelled(labels)
}

#[tokio::test]
async fn mate_pair_launches_one_job_linked_to_both_inputs() {
    let graph = Arc::new(InMemoryGraph::new());
    let backend = Arc::new(DryRunBackend::new());
    let mut pipeline = pipeline(graph.clone(), backend.clone());

    pipeline.ingest(&fastq(1)).await.expect("ingest mate 1");
    pipeline.ingest(&fastq(2)).await.expect("ingest mate 2");
    let stats = pipeline.run_until_idle().await;
    assert_eq!(stats.failed, 0);

    assert_eq!(graph.relationships("HAS_MATE_PAIR").await.len(), 1);
    assert_eq!(graph.nodes(&labelled(&["JobRequest"])).await.len(), 1);
    assert_eq!(graph.relationships("WAS_USED_BY").await.len(), 2);

    let submitted = backend.submitted().await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].task, "fastq-to-ubam");
    assert_eq!(submitted[0].inputs["FASTQ_1"], "gs://reads/NA12878_0_R1.fastq.gz");
    assert_eq!(submitted[0].inputs["FASTQ_2"], "gs://reads/NA12878_0_R2.fastq.gz");

    let jobs = graph.nodes(&labelled(&["Job"])).await;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.property("status"), Some(&json!("SUBMITTED")));
    assert_eq!(job.property("jobId"), Some(&json!(submitted[0].job_id)));

    let inputs = graph.relationships("INPUT_TO").await;
    assert_eq!(inputs.len(), 2);
    assert!(inputs.iter().all(|rel| rel.end.id == job.id));
    let triggered = graph.relationships("TRIGGERED").await;
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].start.labels, LabelSet::of(&["JobRequest"]));
}

#[tokio::test]
async fn repeated_launch_events_create_one_request() {
    let graph = Arc::new(InMemoryGraph::new());
    let backend = Arc::new(DryRunBackend::new());
    let mut pipeline = pipeline(graph.clone(), backend.clone());

    pipeline.ingest(&fastq(1)).await.expect("ingest");
    pipeline.ingest(&fastq(2)).await.expect("ingest");
    pipeline.run_until_idle().await;

    // Redeliver the mate pair result three more times.
    let pair = graph.relationships("HAS_MATE_PAIR").await;
    for _ in 0..3 {
        let message = Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(&["Relate", "Fastq", "MatePair", "Database", "Result"]),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("relate-fastq-mate-pair", Statement::MatchNodes { pattern: NodePattern::default() }),
                results: QueryResults {
                    relationships: pair.clone(),
                    ..QueryResults::default()
                },
            }),
        );
        pipeline.bus().publish("db-triggers", message).await.expect("publish");
    }
    pipeline.run_until_idle().await;

    assert_eq!(graph.nodes(&labelled(&["JobRequest"])).await.len(), 1);
    assert_eq!(backend.submitted().await.len(), 1);
    assert_eq!(graph.nodes(&labelled(&["Job"])).await.len(), 1);
}

async fn run_for(pipeline: &mut Pipeline, millis: u64) {
    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_millis(millis)).await;
        stopper.cancel();
    });
    pipeline.run(shutdown).await;
    pipeline.run_until_idle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_creates_one_request() {
    let graph = Arc::new(InMemoryGraph::new());
    let backend = Arc::new(DryRunBackend::new());
    let mut pipeline = pipeline(graph.clone(), backend.clone());

    pipeline.ingest(&fastq(1)).await.expect("ingest");
    pipeline.ingest(&fastq(2)).await.expect("ingest");
    run_for(&mut pipeline, 50).await;

    let pair = graph.relationships("HAS_MATE_PAIR").await;
    for _ in 0..8 {
        let message = Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(&["Relate", "Fastq", "MatePair", "Database", "Result"]),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("relate-fastq-mate-pair", Statement::MatchNodes { pattern: NodePattern::default() }),
                results: QueryResults {
                    relationships: pair.clone(),
                    ..QueryResults::default()
                },
            }),
        );
        pipeline.bus().publish("db-triggers", message).await.expect("publish");
    }
    run_for(&mut pipeline, 50).await;

    assert_eq!(graph.nodes(&labelled(&["JobRequest"])).await.len(), 1);
    assert_eq!(backend.submitted().await.len(), 1);
    assert_eq!(graph.nodes(&labelled(&["Job"])).await.len(), 1);
}

#[tokio::test]
async fn running_duplicates_are_killed_and_marked() {
    let graph = Arc::new(InMemoryGraph::new());
    let backend = Arc::new(DryRunBackend::new());
    let mut pipeline = pipeline(graph.clone(), backend.clone());

    let mut jobs = Vec::new();
    for n in 0..4 {
        let created = graph
            .execute(
                &Statement::CreateNode {
                    labels: LabelSet::of(&["Job"]),
                    properties: props(json!({
                        "jobId": format!("job-{n}"),
                        "backendId": format!("op-{n}"),
                        "sample": "NA12878",
                        "name": "fastq-to-ubam",
                        "inputHash": "0f1e2d3c",
                        "status": "RUNNING",
                    })),
                },
                ResultMode::Data,
            )
            .await
            .expect("create job");
        jobs.extend(created.nodes);
    }

    let status_update = Message::root(
        "job-monitor",
        Resource::QueryResult,
        Method::Update,
        LabelSet::of(&["Update", "Job", "Status", "Database", "Result"]),
        MessageBody::QueryResult(QueryResultBody {
            request: QueryRequest::new("update-job-status", Statement::MatchNodes { pattern: NodePattern::default() }),
            results: QueryResults {
                nodes: vec![jobs[3].clone()],
                ..QueryResults::default()
            },
        }),
    );
    pipeline.bus().publish("db-triggers", status_update).await.expect("publish");
    let stats = pipeline.run_until_idle().await;
    assert_eq!(stats.failed, 0);

    let mut killed = backend.killed().await;
    killed.sort();
    assert_eq!(killed, vec!["op-1".to_owned(), "op-2".to_owned(), "op-3".to_owned()]);

    let duplicates = graph.nodes(&labelled(&["Job", "Duplicate"])).await;
    assert_eq!(duplicates.len(), 3);
    assert!(duplicates
        .iter()
        .all(|job| job.property("duplicateOf") == Some(&json!("job-0"))));
    let survivors = graph.nodes(&labelled(&["Job"]).without_label("Duplicate")).await;
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].property("jobId"), Some(&json!("job-0")));
}

/// Counts executed statements.
struct CountingGraph {
    inner: InMemoryGraph,
    executed: AtomicUsize,
}

#[async_trait]
impl GraphDatabase for CountingGraph {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, statement: &Statement, mode: ResultMode) -> trellis_core::Result<QueryResults> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(statement, mode).await
    }
}

#[tokio::test(start_paused = true)]
async fn empty_result_is_requeued_three_times_then_abandoned() {
    let graph = Arc::new(CountingGraph {
        inner: InMemoryGraph::new(),
        executed: AtomicUsize::new(0),
    });
    let mut pipeline = Pipeline::new(Config::default(), graph.clone(), Arc::new(DryRunBackend::new()))
        .expect("pipeline");

    let request = QueryRequest::new(
        "relate-job-to-inputs",
        Statement::Relate {
            from: NodePattern::by_ids(["blob-not-yet-visible"]),
            to: NodePattern::by_id("job-1"),
            rel_type: "INPUT_TO".to_owned(),
            properties: Properties::new(),
            merge: true,
        },
    )
    .split(true)
    .publish_to("db-triggers");
    let query = Message::root(
        "db-triggers",
        Resource::Query,
        Method::Post,
        LabelSet::of(&["Relate", "Job", "Input"]),
        MessageBody::Query(request),
    );
    pipeline.bus().publish("db-query", query).await.expect("publish");

    let started = tokio::time::Instant::now();
    let stats = pipeline.run_until_idle().await;
    assert_eq!(stats.failed, 0);
    assert_eq!(graph.executed.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= tokio::time::Duration::from_millis(6_000));
    assert!(started.elapsed() < tokio::time::Duration::from_millis(8_000));
}

#[tokio::test]
async fn provenance_is_kept_across_stages() {
    let config = Arc::new(Config::default());
    let graph = Arc::new(InMemoryGraph::new());
    let (bus, mut receiver) = LocalBus::new();
    let stage = QueryStage::new(graph, Arc::new(bus), config.clone());
    let registry = TriggerRegistry::with_defaults(&config).expect("registry");

    let root = fastq(1).to_message(&config).expect("root");
    stage.handle(root.clone()).await.expect("create");
    let result = receiver.try_recv().expect("result").message;
    assert_eq!(result.header.seed_id, root.event_id);
    assert_eq!(result.header.previous_event_id.as_deref(), Some(root.event_id.as_str()));

    let evaluation = registry.evaluate(&result, &config);
    assert!(!evaluation.outgoing.is_empty());
    for outgoing in &evaluation.outgoing {
        let header = &outgoing.message.header;
        assert_eq!(header.seed_id, root.event_id);
        assert_eq!(header.previous_event_id.as_deref(), Some(result.event_id.as_str()));
        assert!(header.trigger.is_some());
        assert_eq!(header.publish_to.as_deref(), Some(outgoing.topic.as_str()));
    }
}

#[test]
fn one_result_fans_out_to_every_matching_trigger() {
    let config = Config::default();
    let registry = TriggerRegistry::with_defaults(&config).expect("registry");
    let job = Node::new(
        "job-node",
        LabelSet::of(&["Job"]),
        props(json!({
            "jobId": "240102-030405000-0f1e2d3c",
            "inputIds": ["f1", "f2"],
            "jobRequestId": "req-1",
            "status": "SUBMITTED",
        })),
    );
    let message = Message::root(
        "db-query",
        Resource::QueryResult,
        Method::Post,
        LabelSet::of(&["Create", "Job", "Database", "Result"]),
        MessageBody::QueryResult(QueryResultBody {
            request: QueryRequest::new("create-job", Statement::MatchNodes { pattern: NodePattern::default() }),
            results: QueryResults {
                nodes: vec![job],
                ..QueryResults::default()
            },
        }),
    );

    let evaluation = registry.evaluate(&message, &config);
    let mut fired: Vec<_> = evaluation
        .outgoing
        .iter()
        .filter_map(|outgoing| outgoing.message.header.trigger.clone())
        .collect();
    fired.sort();
    assert_eq!(
        fired,
        vec!["relate-job-request-to-job".to_owned(), "relate-job-to-inputs".to_owned()]
    );
}

#[test]
fn malformed_entities_never_match_or_fail() {
    let config = Config::default();
    let registry = TriggerRegistry::with_defaults(&config).expect("registry");
    let bare = Node::new("bare", LabelSet::new(), Properties::new());
    let odd = Node::new(
        "odd",
        LabelSet::of(&["Fastq", "Job", "CromwellStep", "CromwellAttempt"]),
        props(json!({"sample": null, "readGroup": "zero", "status": 7})),
    );

    for labels in [vec!["Create", "Blob"], vec!["Update", "Job"], vec![]] {
        let message = Message::root(
            "db-query",
            Resource::QueryResult,
            Method::Post,
            LabelSet::of(&labels),
            MessageBody::QueryResult(QueryResultBody {
                request: QueryRequest::new("find-malformed", Statement::MatchNodes { pattern: NodePattern::default() }),
                results: QueryResults {
                    nodes: vec![bare.clone(), odd.clone()],
                    ..QueryResults::default()
                },
            }),
        );
        let evaluation = registry.evaluate(&message, &config);
        assert!(evaluation.failed.is_empty(), "{labels:?}: {:?}", evaluation.failed);
    }
}
