use crate::{
    cache::{CacheError, SharedCache},
    config::{Cluster, JobConfig},
    executors::ExecutorError,
    ingest::{IngestorError, Ingestors},
    kubectl::{last_resource_name, Kubectl},
};
use std::{error::Error, fmt, fs, path::PathBuf, thread};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a single job command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    CacheHit,
    Submitted,
    Waiting,
    Completed,
    Logged,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CacheHit | Self::Logged | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::CacheHit => "cached",
            Self::Submitted => "submitted",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Logged => "logged",
            Self::Failed => "failed",
        };

        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub command: String,
    pub state: JobState,
    pub result: Option<String>,
    /// rendered error chain of a failed job
    pub error: Option<String>,
}

/// Errors that only cost the current job command
#[derive(Debug, Error)]
pub enum JobError {
    #[error("No pod found for job {0}")]
    NoPod(String),
    #[error("Failed to fetch the logs of pod {pod}: {output}")]
    Logs { pod: String, output: String },
    #[error("kubectl failed")]
    Executor(#[from] ExecutorError),
    #[error("Failed to extract a result from the job log")]
    Ingest(#[from] IngestorError),
    #[error("Failed to cache the result")]
    Cache(#[from] CacheError),
}

/// `error: cause: cause` for the console and the log
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    chain
}

/// batch/v1 Job running one job command
#[derive(Debug, Clone)]
pub struct Manifest<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub runtime_class: Option<&'a str>,
    pub command: &'a str,
}

impl Manifest<'_> {
    pub fn render(&self) -> String {
        let runtime_class = self
            .runtime_class
            .map(|class| format!("      runtimeClassName: {class}\n"))
            .unwrap_or_default();
        // the command sits in single quotes in the shell script, which itself is
        // a double quoted YAML scalar
        let command = self
            .command
            .replace('\'', r"'\''")
            .replace('\\', "\\\\")
            .replace('"', "\\\"");

        format!(
            r#"apiVersion: batch/v1
kind: Job
metadata:
  name: {name}
spec:
  template:
    metadata:
      labels:
        app: {name}
    spec:
{runtime_class}      containers:
      - name: {name}
        image: {image}
        command: [
          "sh",
          "-c",
          "nproc; cmd='{command}'; echo $cmd; $cmd"
          ]
      restartPolicy: "Never"
  backoffLimit: 0
"#,
            name = self.name,
            image = self.image,
        )
    }
}

/// Runs the job commands of one cluster, strictly one after another since every
/// command reuses the same Job name.
pub struct JobRunner<'a> {
    cluster: &'a Cluster,
    config: &'a JobConfig,
    kubectl: Kubectl,
    ingestor: Ingestors,
    cache: SharedCache,
    manifest_path: PathBuf,
    last_pod: Option<String>,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        cluster: &'a Cluster,
        config: &'a JobConfig,
        kubectl: Kubectl,
        ingestor: Ingestors,
        cache: SharedCache,
        manifest_path: PathBuf,
    ) -> Self {
        Self {
            cluster,
            config,
            kubectl,
            ingestor,
            cache,
            manifest_path,
            last_pod: None,
        }
    }

    fn transition(&self, state: &mut JobState, next: JobState) {
        debug_assert!(!state.is_terminal(), "{state} is terminal");
        debug!(cluster = %self.cluster.name, from = %state, to = %next, "Job state change");
        *state = next;
    }

    /// Run one job command, only fatal errors are returned, per job failures
    /// end in `JobState::Failed`.
    #[instrument(skip(self), fields(cluster = %self.cluster.name), level = "info")]
    pub fn run(&mut self, command: &str) -> Result<JobOutcome, ExecutorError> {
        let mut state = JobState::Pending;

        if let Some(result) = self.cache.lookup(command) {
            self.transition(&mut state, JobState::CacheHit);

            return Ok(JobOutcome {
                command: command.to_string(),
                state,
                result: Some(result),
                error: None,
            });
        }

        let manifest = Manifest {
            name: &self.config.name,
            image: &self.config.image,
            runtime_class: self.cluster.runtime_class.as_deref(),
            command,
        };
        fs::write(&self.manifest_path, manifest.render()).map_err(|source| {
            ExecutorError::Write {
                path: self.manifest_path.clone(),
                source,
            }
        })?;

        match self.kubectl.delete_job(&self.config.name) {
            Ok(output) if !output.success() => {
                debug!(output = %output.combined(), "Failed to delete stale job")
            }
            Err(error) => warn!(error = %error, "Failed to delete stale job"),
            Ok(_) => {}
        }

        self.kubectl.apply(&self.manifest_path)?;
        self.transition(&mut state, JobState::Submitted);

        let collected = self.collect(command, &mut state);

        // cleanup runs no matter how collecting went
        match self.kubectl.delete_manifest(&self.manifest_path) {
            Ok(output) if !output.success() => {
                warn!(output = %output.combined(), "Failed to delete job")
            }
            Err(error) => warn!(error = %error, "Failed to delete job"),
            Ok(_) => {}
        }

        match collected {
            Ok(result) => Ok(JobOutcome {
                command: command.to_string(),
                state,
                result: Some(result),
                error: None,
            }),
            Err(error) => {
                let chain = error_chain(&error);
                error!(error = ?error, "Job failed: {chain}");
                self.transition(&mut state, JobState::Failed);

                Ok(JobOutcome {
                    command: command.to_string(),
                    state,
                    result: None,
                    error: Some(chain),
                })
            }
        }
    }

    fn collect(&mut self, command: &str, state: &mut JobState) -> Result<String, JobError> {
        self.transition(state, JobState::Waiting);

        match self
            .kubectl
            .wait_complete(&self.config.name, self.config.wait_duration())
        {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                output = %output.combined(),
                "Job did not complete, fetching logs anyway"
            ),
            Err(error) => warn!(error = %error, "Waiting for the job failed, fetching logs anyway"),
        }
        self.transition(state, JobState::Completed);

        let pod = self.find_pod()?;
        let logs = self.kubectl.logs(&pod)?;
        if !logs.success() {
            return Err(JobError::Logs {
                pod,
                output: logs.combined(),
            });
        }

        let result = self.ingestor.ingest(&logs.stdout)?;
        self.cache.store(command, result.clone())?;
        self.transition(state, JobState::Logged);
        info!("Stored result of {command}");

        Ok(result)
    }

    /// newest pod of the job, retried a bounded number of times since the pod may
    /// not be listed right after the job was created
    fn find_pod(&mut self) -> Result<String, JobError> {
        let attempts = self.config.pod_list_attempts.max(1);
        let selector = format!("app={}", self.config.name);

        for attempt in 1..=attempts {
            match self.kubectl.get_pods(Some(&selector)) {
                Ok(output) if output.success() => match last_resource_name(&output.stdout) {
                    Some(pod) => {
                        debug!(pod = %pod, attempt = attempt, "Found job pod");
                        self.last_pod = Some(pod.clone());

                        return Ok(pod);
                    }
                    None => debug!(attempt = attempt, "No pod listed yet"),
                },
                Ok(output) => {
                    warn!(attempt = attempt, output = %output.combined(), "Listing pods failed")
                }
                Err(error) => warn!(attempt = attempt, error = %error, "Listing pods failed"),
            }

            if attempt < attempts {
                thread::sleep(self.config.pod_list_pause());
            }
        }

        match self.last_pod {
            Some(ref pod) => {
                warn!(pod = %pod, "Giving up on listing pods, reusing the previous pod");

                Ok(pod.clone())
            }
            None => Err(JobError::NoPod(self.config.name.clone())),
        }
    }
}
