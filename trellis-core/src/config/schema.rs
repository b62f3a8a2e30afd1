use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::jobs::task::TaskTemplate;
use crate::triggers::launch::LaunchRule;
use crate::triggers::requeue::RequeueRule;
use crate::triggers::rules::RuleDefinition;

pub const MAX_RETRIES: u32 = 3;

/// Named topic keys. Rules and stages refer to topics by key; the key is
/// resolved to a concrete topic name through [`Config::topic`].
pub mod topics {
    pub const DB_QUERY: &str = "db_query";
    pub const TRIGGERS: &str = "triggers";
    pub const LAUNCHER: &str = "launcher";
    pub const DEDUP: &str = "dedup";
    pub const KILL: &str = "kill";

    pub const ALL: [&str; 5] = [DB_QUERY, TRIGGERS, LAUNCHER, DEDUP, KILL];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: String,
    pub topics: BTreeMap<String, String>,
    pub features: BTreeMap<String, Value>,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    pub builtin_rules: bool,
    pub rules: Vec<RuleDefinition>,
    pub launches: Vec<LaunchRule>,
    pub requeue: Vec<RequeueRule>,
    pub tasks: Vec<TaskTemplate>,
    pub task_files: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let topics = [
            (topics::DB_QUERY, "db-query"),
            (topics::TRIGGERS, "db-triggers"),
            (topics::LAUNCHER, "job-launcher"),
            (topics::DEDUP, "kill-duplicates"),
            (topics::KILL, "kill-job"),
        ]
        .into_iter()
        .map(|(key, topic)| (key.to_owned(), topic.to_owned()))
        .collect();

        Self {
            environment: "local".to_owned(),
            topics,
            features: BTreeMap::new(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            builtin_rules: true,
            rules: Vec::new(),
            launches: Vec::new(),
            requeue: Vec::new(),
            tasks: Vec::new(),
            task_files: Vec::new(),
        }
    }
}

impl Config {
    pub fn topic(&self, key: &str) -> Result<&str> {
        self.topics
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::Config(format!("no topic configured for key '{key}'")))
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features
            .get(name)
            .map(crate::graph::model::is_truthy)
            .unwrap_or(false)
    }

    /// Flat read-only view used by config predicates and templates:
    /// `environment`, `retry.max_retries`, `retry.delay_ms`, `topics.<key>`,
    /// `features.<name>`.
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            "environment" => return Some(Value::String(self.environment.clone())),
            "retry.max_retries" => return Some(Value::from(self.retry.max_retries)),
            "retry.delay_ms" => return Some(Value::from(self.retry.delay_ms)),
            _ => {}
        }

        if let Some(topic) = key.strip_prefix("topics.") {
            return self.topics.get(topic).cloned().map(Value::String);
        }
        if let Some(feature) = key.strip_prefix("features.") {
            return self.features.get(feature).cloned();
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub connection_string: String,
    pub pool_size: usize,
    pub sqlite: SqliteStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Memory,
            connection_string: "sqlite://trellis-graph.db".to_owned(),
            pool_size: 4,
            sqlite: SqliteStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    pub busy_timeout_ms: u64,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub program: String,
    pub submit_args: Vec<String>,
    pub kill_program: String,
    pub kill_args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::DryRun,
            program: "dsub".to_owned(),
            submit_args: Vec::new(),
            kill_program: "ddel".to_owned(),
            kill_args: Vec::new(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    DryRun,
    Command,
}
