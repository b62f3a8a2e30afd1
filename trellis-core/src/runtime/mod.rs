pub mod ingest;

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, LocalBus, MessageBus};
use crate::config::{load, topics, validate_config, Config};
use crate::error::Result;
use crate::graph::{create_graph_database, GraphDatabase};
use crate::jobs::{create_job_backend, JobBackend, TaskRegistry};
use crate::stages::{DedupStage, KillStage, LauncherStage, QueryStage, Stage, TriggerStage};
use crate::triggers::{Dispatcher, TriggerRegistry};

pub use ingest::{load_records, IngestRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub struct Pipeline {
    config: Arc<Config>,
    graph: Arc<dyn GraphDatabase>,
    backend: Arc<dyn JobBackend>,
    triggers: Arc<TriggerRegistry>,
    tasks: Arc<TaskRegistry>,
    bus: LocalBus,
    receiver: UnboundedReceiver<Delivery>,
    routes: HashMap<String, Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn from_config(config: Config) -> Result<Self> {
        validate_config(&config)?;
        let graph = create_graph_database(&config.storage)?;
        let backend = create_job_backend(&config.backend);
        Self::new(config, graph, backend)
    }

    pub fn from_config_path(path: &Path) -> Result<Self> {
        Self::from_config(load(Some(path))?)
    }

    pub fn new(
        config: Config,
        graph: Arc<dyn GraphDatabase>,
        backend: Arc<dyn JobBackend>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let triggers = Arc::new(TriggerRegistry::with_defaults(&config)?);
        let tasks = Arc::new(TaskRegistry::with_defaults(&config)?);
        let (bus, receiver) = LocalBus::new();
        let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());

        let stages: [(&str, Arc<dyn Stage>); 5] = [
            (
                topics::DB_QUERY,
                Arc::new(QueryStage::new(graph.clone(), shared.clone(), config.clone())),
            ),
            (
                topics::TRIGGERS,
                Arc::new(TriggerStage::new(Dispatcher::new(
                    triggers.clone(),
                    shared.clone(),
                    config.clone(),
                ))),
            ),
            (
                topics::LAUNCHER,
                Arc::new(LauncherStage::new(
                    tasks.clone(),
                    backend.clone(),
                    shared.clone(),
                    config.clone(),
                )),
            ),
            (
                topics::DEDUP,
                Arc::new(DedupStage::new(shared.clone(), config.clone())),
            ),
            (topics::KILL, Arc::new(KillStage::new(backend.clone()))),
        ];
        let mut routes = HashMap::new();
        for (key, stage) in stages {
            routes.insert(config.topic(key)?.to_owned(), stage);
        }

        tracing::info!(
            environment = %config.environment,
            store = graph.name(),
            backend = backend.name(),
            triggers = triggers.len(),
            tasks = tasks.len(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            graph,
            backend,
            triggers,
            tasks,
            bus,
            receiver,
            routes,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &Arc<dyn GraphDatabase> {
        &self.graph
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub async fn ingest(&self, record: &IngestRecord) -> Result<String> {
        let message = record.to_message(&self.config)?;
        let event_id = message.event_id.clone();
        let topic = self.config.topic(topics::DB_QUERY)?;
        self.bus.publish(topic, message).await?;
        Ok(event_id)
    }

    /// Delivers messages one at a time until the bus is empty. Requeue
    /// delays are waited out inside delivery, so an empty bus is a fixed
    /// point.
    pub async fn run_until_idle(&mut self) -> RunStats {
        let mut stats = RunStats::default();
        while let Ok(delivery) = self.receiver.try_recv() {
            let stage = self.routes.get(&delivery.topic).cloned();
            deliver(stage, delivery, &mut stats).await;
        }
        stats
    }

    /// Delivers messages concurrently until `shutdown` is cancelled, then
    /// finishes whatever is in flight.
    pub async fn run(&mut self, shutdown: CancellationToken) -> RunStats {
        let mut stats = RunStats::default();
        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => stats.merge(outcome),
                delivery = self.receiver.recv() => {
                    let Some(delivery) = delivery else { break };
                    let stage = self.routes.get(&delivery.topic).cloned();
                    in_flight.push(async move {
                        let mut outcome = RunStats::default();
                        deliver(stage, delivery, &mut outcome).await;
                        outcome
                    });
                }
            }
        }

        while let Some(outcome) = in_flight.next().await {
            stats.merge(outcome);
        }
        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "pipeline stopped"
        );
        stats
    }
}

impl RunStats {
    fn merge(&mut self, other: RunStats) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.dropped += other.dropped;
    }
}

async fn deliver(stage: Option<Arc<dyn Stage>>, delivery: Delivery, stats: &mut RunStats) {
    let Some(stage) = stage else {
        tracing::debug!(topic = %delivery.topic, "no consumer for topic; message dropped");
        stats.dropped += 1;
        return;
    };

    let event_id = delivery.message.event_id.clone();
    let seed_id = delivery.message.header.seed_id.clone();
    match stage.handle(delivery.message).await {
        Ok(()) => stats.delivered += 1,
        Err(err) => {
            tracing::error!(
                stage = stage.name(),
                topic = %delivery.topic,
                event_id = %event_id,
                seed_id = %seed_id,
                error = %err,
                "stage failed to handle message"
            );
            stats.failed += 1;
        }
    }
}
