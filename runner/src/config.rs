use crate::{
    ingest::Ingestors,
    sweep::{default_options, BenchOption},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

const KATA_CONFIG_DIR: &str = "/opt/kata/share/defaults/kata-containers";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Config failed the preflight checks")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    // prefix every job command starts with
    #[serde(default = "default_base")]
    pub base: String,
    // every cluster gets its own run directory below this one
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub ingest: Ingestors,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
    #[serde(default = "default_options")]
    pub options: Vec<BenchOption>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct AzureConfig {
    pub subscription: Option<String>,
    pub resource_group: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct JobConfig {
    /// name of the Kubernetes Job, reused for every job command
    pub name: String,
    pub image: String,
    /// scratch file the rendered manifest is written to, relative to the run directory
    pub manifest: PathBuf,
    /// seconds to wait for the job to complete
    pub wait_timeout: u64,
    /// seconds any other kubectl call may take
    pub command_timeout: u64,
    pub pod_list_attempts: u32,
    /// milliseconds between two pod listings
    pub pod_list_delay: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// image of the ephemeral debug pod
    pub image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub vm_size: Option<String>,
    #[serde(default)]
    pub runtime_class: Option<String>,
    // Kata configuration file on the node, derived from the runtime class if absent
    #[serde(default)]
    pub kata_config: Option<PathBuf>,
}

/// Immutable description of one benchmark target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub vm_size: Option<String>,
    pub runtime_class: Option<String>,
    pub kata_config: Option<PathBuf>,
}

impl Cluster {
    pub fn new<S: Into<String>>(name: S, runtime_class: Option<String>) -> Self {
        Self {
            name: name.into(),
            vm_size: None,
            runtime_class,
            kata_config: None,
        }
    }

    fn from_config(name: &str, config: &ClusterConfig) -> Self {
        Self {
            name: name.to_string(),
            vm_size: config.vm_size.clone(),
            runtime_class: config.runtime_class.clone(),
            kata_config: config.kata_config.clone(),
        }
    }

    pub fn is_kata(&self) -> bool {
        self.runtime_class
            .as_deref()
            .map_or(false, |class| class.starts_with("kata"))
    }

    /// Kata configuration file holding `virtio_fs_cache`, `None` for runc clusters
    pub fn kata_config_path(&self) -> Option<PathBuf> {
        if !self.is_kata() {
            return None;
        }

        if let Some(ref path) = self.kata_config {
            return Some(path.clone());
        }

        let file_name = match self
            .runtime_class
            .as_deref()
            .and_then(|class| class.strip_prefix("kata-"))
        {
            Some(flavor) => format!("configuration-{flavor}.toml"),
            None => String::from("configuration.toml"),
        };

        Some(Path::new(KATA_CONFIG_DIR).join(file_name))
    }

    /// one line summary, stored as `description.txt` next to the results
    pub fn description(&self) -> String {
        format!(
            "{} {}",
            self.vm_size.as_deref().unwrap_or("unknown-vm-size"),
            self.runtime_class.as_deref().unwrap_or("runc")
        )
    }
}

impl AzureConfig {
    /// subscription and resource group, if both are known
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.subscription, &self.resource_group) {
            (Some(subscription), Some(resource_group)) => {
                Some((subscription.as_str(), resource_group.as_str()))
            }
            _ => None,
        }
    }
}

impl JobConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }

    pub fn command_duration(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn pod_list_pause(&self) -> Duration {
        Duration::from_millis(self.pod_list_delay)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: String::from("fio-test"),
            image: String::from("mocha81/fio-3.16"),
            manifest: PathBuf::from("job.yaml"),
            wait_timeout: 400,
            command_timeout: 120,
            pod_list_attempts: 5,
            pod_list_delay: 2000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            image: String::from("docker.io/library/alpine"),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            data_dir: default_data_dir(),
            azure: AzureConfig::default(),
            job: JobConfig::default(),
            node: NodeConfig::default(),
            ingest: Ingestors::default(),
            clusters: BTreeMap::new(),
            options: default_options(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// load `path`, falling back to the built-in defaults if it doesn't exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigErrors> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config at {}, using defaults", path.to_string_lossy());

            Ok(Self::default())
        }
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters
            .iter()
            .map(|(name, config)| Cluster::from_config(name, config))
            .collect()
    }

    pub fn cluster(&self, name: &str) -> Option<Cluster> {
        self.clusters
            .get(name)
            .map(|config| Cluster::from_config(name, config))
    }

    /// run directory of a cluster
    pub fn run_dir(&self, cluster: &str) -> PathBuf {
        self.data_dir.join(cluster)
    }

    /// Validate the config, logging every problem instead of stopping at the first one.
    /// Returns whether errors were found.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        self.job.name = self.job.name.trim().to_string();
        if self.job.name.is_empty()
            || !self
                .job
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            error!(
                "job.name '{}' must be a non-empty lowercase DNS label",
                self.job.name
            );
            contains_error = true;
        }

        if self.job.wait_timeout == 0 || self.job.command_timeout == 0 {
            error!("job.wait_timeout and job.command_timeout cannot be 0");
            contains_error = true;
        }

        if self.job.pod_list_attempts == 0 {
            error!("job.pod_list_attempts must allow at least one attempt");
            contains_error = true;
        }

        if self.base.trim().is_empty() {
            error!("base must name the benchmark command, e.g. `fio`");
            contains_error = true;
        }

        for option in self.options.iter() {
            if option.name.is_empty()
                || option
                    .name
                    .chars()
                    .any(|c| c.is_whitespace() || c == '=')
            {
                error!(
                    "Option '{}' must be a non-empty name without whitespace or '='",
                    option.name
                );
                contains_error = true;
            }
        }

        for name in self.options.iter().map(|option| &option.name).duplicates() {
            error!("Option {name} is declared more than once");
            contains_error = true;
        }

        for (name, cluster) in self.clusters.iter() {
            if cluster.kata_config.is_some()
                && !Cluster::from_config(name, cluster).is_kata()
            {
                warn!("clusters.{name}.kata_config is ignored without a kata runtime_class");
            }
        }

        if self.azure.credentials().is_none()
            && (self.azure.subscription.is_some() || self.azure.resource_group.is_some())
        {
            warn!("azure needs both subscription and resource_group, credentials will not be fetched");
        }

        contains_error
    }
}

fn default_base() -> String {
    String::from("fio")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
