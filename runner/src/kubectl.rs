use crate::{
    executors::{CommandRunner, ExecutorError, Invocation},
    ingest::RunOutput,
};
use std::{path::Path, sync::Arc, time::Duration};

/// `kubectl` bound to one cluster context
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    context: String,
    timeout: Duration,
}

impl Kubectl {
    pub fn new<S: Into<String>>(
        runner: Arc<dyn CommandRunner>,
        context: S,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            context: context.into(),
            timeout,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    fn invocation(&self) -> Invocation {
        Invocation::new("kubectl")
            .arg(format!("--context={}", self.context))
            .timeout(Some(self.timeout))
    }

    fn run(&self, invocation: Invocation) -> Result<RunOutput, ExecutorError> {
        self.runner.run(&invocation)
    }

    /// apply a manifest, any failure is fatal since it would recur for every job
    pub fn apply(&self, manifest: &Path) -> Result<RunOutput, ExecutorError> {
        let invocation = self.invocation().args([
            String::from("apply"),
            String::from("--overwrite=true"),
            String::from("-f"),
            manifest.to_string_lossy().into_owned(),
        ]);

        self.run(invocation.clone())?.ensure_success(&invocation)
    }

    pub fn delete_manifest(&self, manifest: &Path) -> Result<RunOutput, ExecutorError> {
        self.run(self.invocation().args([
            String::from("delete"),
            String::from("--ignore-not-found=true"),
            String::from("-f"),
            manifest.to_string_lossy().into_owned(),
        ]))
    }

    pub fn delete_job(&self, job: &str) -> Result<RunOutput, ExecutorError> {
        self.run(
            self.invocation()
                .args(["delete", "job", job, "--ignore-not-found=true"]),
        )
    }

    /// block until the job reports completion, kubectl gets `wait` and we add
    /// the regular command timeout on top
    pub fn wait_complete(&self, job: &str, wait: Duration) -> Result<RunOutput, ExecutorError> {
        self.run(
            self.invocation()
                .args([
                    String::from("wait"),
                    String::from("--for=condition=complete"),
                    format!("jobs.batch/{job}"),
                    format!("--timeout={}s", wait.as_secs()),
                ])
                .timeout(Some(wait + self.timeout)),
        )
    }

    /// pods matching `selector`, oldest first
    pub fn get_pods(&self, selector: Option<&str>) -> Result<RunOutput, ExecutorError> {
        let invocation = self
            .invocation()
            .args(["get", "pods", "--sort-by=.metadata.creationTimestamp"]);

        self.run(match selector {
            Some(selector) => invocation.arg(format!("--selector={selector}")),
            None => invocation,
        })
    }

    pub fn logs(&self, pod: &str) -> Result<RunOutput, ExecutorError> {
        self.run(self.invocation().args(["logs", pod]))
    }

    /// list the nodes, failing to do so is fatal
    pub fn get_nodes(&self) -> Result<RunOutput, ExecutorError> {
        let invocation = self.invocation().args(["get", "nodes"]);

        self.run(invocation.clone())?.ensure_success(&invocation)
    }

    /// run `command` in the host root filesystem of `node` through a privileged debug pod
    pub fn debug_node(
        &self,
        node: &str,
        image: &str,
        command: &str,
        args: &[String],
        interactive: bool,
    ) -> Result<RunOutput, ExecutorError> {
        let invocation = self
            .invocation()
            .args([
                String::from("debug"),
                format!("node/{node}"),
                format!("--image={image}"),
                String::from(if interactive { "-it" } else { "--attach=true" }),
                String::from("--"),
                String::from("chroot"),
                String::from("/host"),
                command.to_string(),
            ])
            .args(args.iter().cloned())
            .interactive(interactive);

        // interactive sessions last as long as the user wants
        if interactive {
            self.run(invocation.timeout(None))
        } else {
            self.run(invocation)
        }
    }

    pub fn delete_pod(&self, pod: &str) -> Result<RunOutput, ExecutorError> {
        self.run(
            self.invocation()
                .args(["delete", "pod", pod, "--ignore-not-found=true"]),
        )
    }
}

/// names in the first column of a kubectl table, without the header
pub fn resource_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| *name != "NAME")
        .map(String::from)
        .collect()
}

/// name of the last listed resource, i.e. the newest one for a listing sorted by creation
pub fn last_resource_name(listing: &str) -> Option<String> {
    resource_names(listing).pop()
}
