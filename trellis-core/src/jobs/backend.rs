use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::config::schema::BackendConfig;
use crate::error::{Error, Result};
use crate::jobs::{JobBackend, JobSpec};
use crate::triggers::template::render_format;

#[derive(Default)]
pub struct DryRunBackend {
    submitted: Mutex<Vec<JobSpec>>,
    killed: Mutex<Vec<String>>,
    fail_submissions: bool,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_submissions: true,
            ..Self::default()
        }
    }

    pub async fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().await.clone()
    }

    pub async fn killed(&self) -> Vec<String> {
        self.killed.lock().await.clone()
    }
}

#[async_trait]
impl JobBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<String> {
        if self.fail_submissions {
            return Err(Error::Backend(format!(
                "dry run rejected job '{}'",
                spec.job_id
            )));
        }
        tracing::info!(job_id = %spec.job_id, task = %spec.task, "dry run: job accepted");
        self.submitted.lock().await.push(spec.clone());
        Ok(format!("dry-run-{}", spec.job_id))
    }

    async fn kill(&self, backend_id: &str) -> Result<()> {
        tracing::info!(backend_id, "dry run: job killed");
        self.killed.lock().await.push(backend_id.to_owned());
        Ok(())
    }
}

/// Drives a batch CLI (`dsub`/`ddel` by default). The submit command's
/// last non-empty stdout line is taken as the backend job id.
pub struct CommandBackend {
    config: BackendConfig,
}

impl CommandBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn submit_args(&self, spec: &JobSpec) -> Result<Vec<String>> {
        let scope: BTreeMap<String, Value> = [
            ("jobId", &spec.job_id),
            ("task", &spec.task),
            ("sample", &spec.sample),
            ("image", &spec.image),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), Value::String(value.clone())))
        .collect();

        let mut args = self
            .config
            .submit_args
            .iter()
            .map(|arg| render_format(arg, &scope))
            .collect::<Result<Vec<_>>>()?;

        args.extend(["--name".to_owned(), spec.job_id.clone()]);
        args.extend(["--image".to_owned(), spec.image.clone()]);
        args.extend(["--command".to_owned(), spec.command.clone()]);
        for (flag, values) in [
            ("--input", &spec.inputs),
            ("--output", &spec.outputs),
            ("--env", &spec.env),
            ("--label", &spec.labels),
        ] {
            for (key, value) in values {
                args.extend([flag.to_owned(), format!("{key}={value}")]);
            }
        }
        args.extend(["--min-cores".to_owned(), spec.resources.cpus.to_string()]);
        args.extend(["--min-ram".to_owned(), spec.resources.memory_gb.to_string()]);
        args.extend(["--disk-size".to_owned(), spec.resources.disk_gb.to_string()]);
        if spec.resources.preemptible {
            args.push("--preemptible".to_owned());
        }
        Ok(args)
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let timeout_seconds = self.config.timeout_seconds;
        let mut command = Command::new(program);
        command.args(args);
        command.kill_on_drop(true);

        let output = timeout(Duration::from_secs(timeout_seconds), command.output())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{program} timed out after {timeout_seconds} seconds"
                ))
            })?
            .map_err(|err| Error::Backend(format!("failed to execute {program}: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backend(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl JobBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn submit(&self, spec: &JobSpec) -> Result<String> {
        let args = self.submit_args(spec)?;
        let stdout = self.run(&self.config.program, &args).await?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::Backend(format!(
                    "{} returned no job id for '{}'",
                    self.config.program, spec.job_id
                ))
            })
    }

    async fn kill(&self, backend_id: &str) -> Result<()> {
        let mut args = self.config.kill_args.clone();
        args.extend(["--jobs".to_owned(), backend_id.to_owned()]);
        self.run(&self.config.kill_program, &args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Resources;

    fn spec() -> JobSpec {
        JobSpec {
            job_id: "240102-030405000-abcdef01".to_owned(),
            task: "fastq-to-ubam".to_owned(),
            sample: "S1".to_owned(),
            image: "gatk".to_owned(),
            command: "gatk FastqToSam".to_owned(),
            input_hash: "abcdef01".to_owned(),
            input_ids: vec!["a".to_owned(), "b".to_owned()],
            inputs: [("FASTQ_1".to_owned(), "gs://a".to_owned())].into_iter().collect(),
            env: [("SAMPLE".to_owned(), "S1".to_owned())].into_iter().collect(),
            outputs: BTreeMap::new(),
            resources: Resources::default(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn dry_run_records_submissions_and_kills() {
        let backend = DryRunBackend::new();
        let id = backend.submit(&spec()).await.expect("submit");
        assert_eq!(id, "dry-run-240102-030405000-abcdef01");
        backend.kill(&id).await.expect("kill");
        assert_eq!(backend.submitted().await.len(), 1);
        assert_eq!(backend.killed().await, vec![id]);
    }

    #[tokio::test]
    async fn failing_dry_run_rejects() {
        let backend = DryRunBackend::failing();
        assert!(matches!(backend.submit(&spec()).await, Err(Error::Backend(_))));
        assert!(backend.submitted().await.is_empty());
    }

    #[test]
    fn submit_args_render_placeholders_and_flags() {
        let backend = CommandBackend::new(BackendConfig {
            submit_args: vec!["--provider".to_owned(), "google-v2".to_owned(), "--logging".to_owned(), "gs://logs/{sample}/{jobId}".to_owned()],
            ..BackendConfig::default()
        });
        let args = backend.submit_args(&spec()).expect("args");
        assert_eq!(args[3], "gs://logs/S1/240102-030405000-abcdef01");
        assert!(args.windows(2).any(|pair| pair[0] == "--input" && pair[1] == "FASTQ_1=gs://a"));
        assert!(args.windows(2).any(|pair| pair[0] == "--env" && pair[1] == "SAMPLE=S1"));
        assert_eq!(args.last().map(String::as_str), Some("--preemptible"));
    }

    #[test]
    fn unknown_placeholder_in_submit_args_fails() {
        let backend = CommandBackend::new(BackendConfig {
            submit_args: vec!["{zone}".to_owned()],
            ..BackendConfig::default()
        });
        assert!(matches!(backend.submit_args(&spec()), Err(Error::Template(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_backend_reads_last_stdout_line() {
        let backend = CommandBackend::new(BackendConfig {
            program: "echo".to_owned(),
            ..BackendConfig::default()
        });
        let id = backend.submit(&spec()).await.expect("submit");
        assert!(id.starts_with("--name 240102-030405000-abcdef01"));
    }
}
