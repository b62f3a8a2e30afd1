use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::labels::LabelSet;
use crate::graph::model::{Node, Properties};
use crate::jobs::id::{input_hash, job_id};
use crate::jobs::JobSpec;
use crate::triggers::defaults::FASTQ_TO_UBAM;
use crate::triggers::template::{value_to_text, Scope, ValueTemplate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRole {
    pub name: String,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub properties: Properties,
}

impl InputRole {
    pub fn new(name: &str, labels: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            labels: LabelSet::of(labels),
            properties: Properties::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_owned(), value.into());
        self
    }

    fn accepts(&self, node: &Node) -> bool {
        self.labels.is_subset_of(&node.labels)
            && self
                .properties
                .iter()
                .all(|(key, value)| node.property(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpus: u32,
    pub memory_gb: f64,
    pub disk_gb: u32,
    pub preemptible: bool,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_gb: 3.75,
            disk_gb: 100,
            preemptible: true,
        }
    }
}

/// Names visible to the value templates: `<role>.<property>`, `<role>.id`,
/// `sample`, `jobId`, `task`, `inputHash`, `now` (RFC 3339) and `config.<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub inputs: Vec<InputRole>,
    #[serde(default)]
    pub input_paths: BTreeMap<String, ValueTemplate>,
    #[serde(default)]
    pub env: BTreeMap<String, ValueTemplate>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueTemplate>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

struct BindingScope<'a> {
    values: BTreeMap<String, Value>,
    config: &'a Config,
}

impl Scope for BindingScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(key) = path.strip_prefix("config.") {
            return self.config.value(key);
        }
        self.values.lookup(path)
    }
}

fn render_all(
    templates: &BTreeMap<String, ValueTemplate>,
    scope: &dyn Scope,
) -> Result<BTreeMap<String, String>> {
    templates
        .iter()
        .map(|(key, template)| Ok((key.clone(), value_to_text(&template.resolve(scope)?))))
        .collect()
}

impl TaskTemplate {
    fn assign<'n>(&self, inputs: &'n [Node]) -> Result<Vec<(&InputRole, &'n Node)>> {
        let mut used = vec![false; inputs.len()];
        let mut bound = Vec::with_capacity(self.inputs.len());
        for role in &self.inputs {
            let slot = inputs
                .iter()
                .enumerate()
                .position(|(index, node)| !used[index] && role.accepts(node))
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "task '{}' has no input for role '{}'",
                        self.name, role.name
                    ))
                })?;
            used[slot] = true;
            bound.push((role, &inputs[slot]));
        }
        Ok(bound)
    }

    pub fn bind(
        &self,
        inputs: &[Node],
        sample: &str,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Result<JobSpec> {
        if inputs.is_empty() {
            return Err(Error::Validation(format!(
                "task '{}' cannot be bound without inputs",
                self.name
            )));
        }

        let input_ids: Vec<String> = inputs.iter().map(|node| node.id.clone()).collect();
        let hash = input_hash(&input_ids)?;
        let id = job_id(now, &hash);

        let mut values = BTreeMap::new();
        values.insert("sample".to_owned(), Value::String(sample.to_owned()));
        values.insert("jobId".to_owned(), Value::String(id.clone()));
        values.insert("task".to_owned(), Value::String(self.name.clone()));
        values.insert("inputHash".to_owned(), Value::String(hash.clone()));
        values.insert("now".to_owned(), Value::String(now.to_rfc3339()));
        for (role, node) in self.assign(inputs)? {
            values.insert(format!("{}.id", role.name), Value::String(node.id.clone()));
            for (key, value) in &node.properties {
                values.insert(format!("{}.{key}", role.name), value.clone());
            }
        }
        let scope = BindingScope { values, config };

        Ok(JobSpec {
            job_id: id,
            task: self.name.clone(),
            sample: sample.to_owned(),
            image: self.image.clone(),
            command: self.command.clone(),
            input_hash: hash,
            input_ids,
            inputs: render_all(&self.input_paths, &scope)?,
            env: render_all(&self.env, &scope)?,
            outputs: render_all(&self.outputs, &scope)?,
            resources: self.resources.clone(),
            labels: self.labels.clone(),
        })
    }
}

pub fn fastq_to_ubam() -> TaskTemplate {
    let format = |text: &str| ValueTemplate::format(text);
    TaskTemplate {
        name: FASTQ_TO_UBAM.to_owned(),
        description: "Convert a pair of FASTQ files to an unaligned BAM".to_owned(),
        image: "broadinstitute/gatk:4.1.0.0".to_owned(),
        command: "/gatk/gatk --java-options \"-Xmx3g\" FastqToSam \
                  --FASTQ ${FASTQ_1} --FASTQ2 ${FASTQ_2} --OUTPUT ${UBAM} \
                  --SAMPLE_NAME ${SAMPLE} --READ_GROUP_NAME ${READ_GROUP} \
                  --PLATFORM ${PLATFORM}"
            .to_owned(),
        inputs: vec![
            InputRole::new("fastq1", &["Fastq"]).with("matePair", 1),
            InputRole::new("fastq2", &["Fastq"]).with("matePair", 2),
        ],
        input_paths: [
            ("FASTQ_1".to_owned(), format("{fastq1.path}")),
            ("FASTQ_2".to_owned(), format("{fastq2.path}")),
        ]
        .into_iter()
        .collect(),
        env: [
            ("SAMPLE".to_owned(), format("{sample}")),
            ("READ_GROUP".to_owned(), format("{fastq1.readGroup}")),
            ("PLATFORM".to_owned(), ValueTemplate::literal("ILLUMINA")),
        ]
        .into_iter()
        .collect(),
        outputs: [(
            "UBAM".to_owned(),
            format("{config.environment}/{sample}/{task}/{jobId}/{sample}_{fastq1.readGroup}.ubam"),
        )]
        .into_iter()
        .collect(),
        resources: Resources::default(),
        labels: [("task".to_owned(), FASTQ_TO_UBAM.to_owned())]
            .into_iter()
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskTemplate>,
}

/// Task templates by name. Later definitions replace earlier ones, so the
/// configuration can override a built-in task.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskTemplate>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(fastq_to_ubam());
        for task in &config.tasks {
            registry.register(task.clone());
        }
        for path in &config.task_files {
            registry.load_file(Path::new(path))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, task: TaskTemplate) {
        if self.tasks.contains_key(&task.name) {
            tracing::debug!(task = %task.name, "task definition replaced");
        }
        self.tasks.insert(task.name.clone(), task);
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read task file '{}': {err}", path.display()))
        })?;
        let file = parse_task_file(path, &raw)?;
        let count = file.tasks.len();
        for task in file.tasks {
            self.register(task);
        }
        tracing::info!(path = %path.display(), tasks = count, "loaded task file");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Result<&TaskTemplate> {
        self.tasks
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("task '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn parse_task_file(path: &Path, raw: &str) -> Result<TaskFile> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default();

    if matches!(ext, "yaml" | "yml") {
        serde_yaml::from_str(raw).map_err(|err| {
            Error::Config(format!("failed parsing task yaml '{}': {err}", path.display()))
        })
    } else {
        toml::from_str(raw).map_err(|err| {
            Error::Config(format!("failed parsing task toml '{}': {err}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fastq(id: &str, mate: i64) -> Node {
        let properties = json!({
            "sample": "S1",
            "readGroup": 0,
            "matePair": mate,
            "path": format!("gs://bucket/S1_R{mate}.fastq.gz"),
        });
        Node::new(
            id,
            LabelSet::of(&["Blob", "Fastq"]),
            properties.as_object().cloned().unwrap_or_default(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .single()
            .expect("timestamp")
    }

    #[test]
    fn binds_roles_regardless_of_input_order() {
        let config = Config::default();
        let task = fastq_to_ubam();
        let spec = task
            .bind(&[fastq("b", 2), fastq("a", 1)], "S1", &config, now())
            .expect("bind");

        assert_eq!(spec.inputs["FASTQ_1"], "gs://bucket/S1_R1.fastq.gz");
        assert_eq!(spec.inputs["FASTQ_2"], "gs://bucket/S1_R2.fastq.gz");
        assert_eq!(spec.env["READ_GROUP"], "0");
        assert_eq!(spec.env["PLATFORM"], "ILLUMINA");
        assert_eq!(spec.input_ids, vec!["b".to_owned(), "a".to_owned()]);
        assert!(spec.job_id.starts_with("240102-030405000-"));
        assert!(spec.job_id.ends_with(&spec.input_hash[..8]));
        assert_eq!(
            spec.outputs["UBAM"],
            format!("local/S1/fastq-to-ubam/{}/S1_0.ubam", spec.job_id)
        );
    }

    #[test]
    fn missing_role_is_an_error() {
        let config = Config::default();
        let err = fastq_to_ubam()
            .bind(&[fastq("a", 1)], "S1", &config, now())
            .expect_err("second mate missing");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn unknown_placeholder_fails_binding() {
        let config = Config::default();
        let mut task = fastq_to_ubam();
        task.env
            .insert("BAD".to_owned(), ValueTemplate::format("{fastq1.missing}"));
        let err = task
            .bind(&[fastq("a", 1), fastq("b", 2)], "S1", &config, now())
            .expect_err("unknown placeholder");
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn binding_exposes_the_submission_time() {
        let config = Config::default();
        let mut task = fastq_to_ubam();
        task.env
            .insert("SUBMITTED".to_owned(), ValueTemplate::format("{sample}@{now}"));
        let spec = task
            .bind(&[fastq("a", 1), fastq("b", 2)], "S1", &config, now())
            .expect("bind");
        assert_eq!(spec.env["SUBMITTED"], "S1@2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn yaml_task_file_registers_and_overrides() {
        let yaml = r#"
tasks:
  - name: fastqc
    image: biocontainers/fastqc:v0.11.9
    command: fastqc ${FASTQ}
    inputs:
      - name: fastq
        labels: [Fastq]
    input_paths:
      FASTQ:
        format: "{fastq.path}"
  - name: fastq-to-ubam
    image: custom/gatk:latest
    command: gatk FastqToSam
"#;
        let file = parse_task_file(Path::new("tasks.yaml"), yaml).expect("parse");
        let mut registry = TaskRegistry::with_defaults(&Config::default()).expect("registry");
        for task in file.tasks {
            registry.register(task);
        }

        assert_eq!(registry.names(), vec!["fastq-to-ubam".to_owned(), "fastqc".to_owned()]);
        assert_eq!(registry.get(FASTQ_TO_UBAM).expect("task").image, "custom/gatk:latest");
        assert!(matches!(registry.get("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn toml_task_file_parses() {
        let toml = r#"
[[tasks]]
name = "flagstat"
image = "biocontainers/samtools"
command = "samtools flagstat ${BAM}"

[tasks.resources]
cpus = 2
"#;
        let file = parse_task_file(Path::new("tasks.toml"), toml).expect("parse");
        assert_eq!(file.tasks.len(), 1);
        assert_eq!(file.tasks[0].resources.cpus, 2);
        assert!(file.tasks[0].resources.preemptible);
    }
}
