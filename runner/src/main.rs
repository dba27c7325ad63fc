mod azure;
mod benchmark;
mod cache;
mod config;
mod executors;
mod ingest;
mod job;
mod kubectl;
mod node;
mod query;
mod sink;
mod sweep;

use benchmark::{run_clusters, Benchmark, SweepReport};
use clap::{Parser, Subcommand, ValueEnum};
use config::{BenchConfig, Cluster, ConfigErrors};
use executors::{CommandRunner, ExecutorError, LocalRunner};
use itertools::Itertools;
use kubectl::Kubectl;
use query::{Query, QueryError};
use sink::Console;
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{atomic::AtomicBool, Arc},
};
use sweep::{parse_assignment, Overrides};
use thiserror::Error;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run fio benchmarks as Kubernetes jobs on AKS clusters"
)]
struct Cli {
    /// YAML config, the built-in defaults are used if it doesn't exist
    #[arg(long, default_value = "aksbench.yaml", global = true)]
    config: PathBuf,
    #[arg(long, short = 's', global = true)]
    subscription: Option<String>,
    #[arg(long, short = 'g', global = true)]
    resource_group: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct SweepArgs {
    /// ignore cached results and measure every job again
    #[arg(long, short = 'u')]
    update_cache: bool,
    /// replace the candidates of an option, e.g. --set bs="4k 8k"
    #[arg(long = "set", value_name = "NAME=VALUES", value_parser = parse_assignment)]
    set: Vec<(String, String)>,
}

impl SweepArgs {
    fn overrides(&self) -> Overrides {
        self.set.iter().cloned().collect()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sweep all configured clusters in parallel
    Run {
        #[command(flatten)]
        sweep: SweepArgs,
    },
    /// Sweep a single cluster
    Bench {
        #[arg(long, short = 'c')]
        cluster: String,
        #[arg(long, short = 'r')]
        runtime_class: Option<String>,
        /// run directory, defaults to <data_dir>/<cluster>
        #[arg(long)]
        dir: Option<PathBuf>,
        /// only print cached results
        #[arg(long)]
        silent: bool,
        #[command(flatten)]
        sweep: SweepArgs,
    },
    /// Print the job commands of the sweep without running them
    Jobs {
        #[arg(long = "set", value_name = "NAME=VALUES", value_parser = parse_assignment)]
        set: Vec<(String, String)>,
    },
    /// Run a command in the root filesystem of a cluster node
    NodeExec {
        #[arg(long, short = 'c')]
        cluster: String,
        /// defaults to the first node of the cluster
        #[arg(long, short = 'n')]
        node: Option<String>,
        #[arg(long, short = 'i')]
        interactive: bool,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Toggle the virtio-fs cache on every Kata cluster
    KataCache {
        #[arg(value_enum)]
        toggle: Toggle,
    },
    /// Search the cached results of all run directories
    Query {
        /// defaults to the configured data_dir
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long = "filter", value_name = "NAME=VALUE", value_parser = parse_assignment)]
        filters: Vec<(String, String)>,
        #[arg(long = "with", value_name = "OPTION")]
        with: Vec<String>,
        #[arg(long = "without", value_name = "OPTION")]
        without: Vec<String>,
        /// show parsed IOPS and bandwidth
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Toggle {
    Enable,
    Disable,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("Failed to write the report")]
    Output(#[from] io::Error),
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Executor(error) => error.exit_code(),
            _ => 1,
        }
    }
}

fn summary(report: &SweepReport) -> String {
    format!(
        "{}: {} jobs, {} cached, {} executed, {} failed{}",
        report.cluster,
        report.total,
        report.cache_hits,
        report.executed,
        report.failed,
        if report.aborted { " (aborted)" } else { "" }
    )
}

fn execute(cli: Cli, console: &Arc<Console>) -> Result<i32, AppError> {
    let mut config = BenchConfig::load_or_default(&cli.config)?;

    if cli.subscription.is_some() {
        config.azure.subscription = cli.subscription;
    }
    if cli.resource_group.is_some() {
        config.azure.resource_group = cli.resource_group;
    }
    if config.preflight_checks() {
        return Err(ConfigErrors::Invalid.into());
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner);

    match cli.command {
        Commands::Run { sweep } => {
            let benchmarks = config
                .clusters()
                .into_iter()
                .map(|cluster| {
                    let run_dir = config.run_dir(&cluster.name);

                    Benchmark::new(
                        &config,
                        cluster,
                        run_dir,
                        sweep.update_cache,
                        runner.clone(),
                        console.clone(),
                    )
                })
                .collect_vec();

            for report in run_clusters(&benchmarks, &sweep.overrides())? {
                console.line(&summary(&report));
            }

            Ok(0)
        }
        Commands::Bench {
            cluster,
            runtime_class,
            dir,
            silent,
            sweep,
        } => {
            let mut target = config
                .cluster(&cluster)
                .unwrap_or_else(|| Cluster::new(cluster.as_str(), None));
            if runtime_class.is_some() {
                target.runtime_class = runtime_class;
            }
            let run_dir = dir.unwrap_or_else(|| config.run_dir(&cluster));

            let report = Benchmark::new(
                &config,
                target,
                run_dir,
                sweep.update_cache,
                runner,
                console.clone(),
            )
            .silent(silent)
            .run(&sweep.overrides(), &AtomicBool::new(false))?;
            console.line(&summary(&report));

            Ok(0)
        }
        Commands::Jobs { set } => {
            let overrides = set.into_iter().collect::<Overrides>();

            for job in sweep::generate(&config.base, &config.options, &overrides) {
                console.line(&job);
            }

            Ok(0)
        }
        Commands::NodeExec {
            cluster,
            node,
            interactive,
            program,
            args,
        } => {
            let kubectl = Kubectl::new(runner, cluster, config.job.command_duration());
            let output = node::execute_on_node(
                &kubectl,
                node.as_deref(),
                &config.node.image,
                &program,
                &args,
                interactive,
            )?;

            if !interactive {
                io::stdout().write_all(output.stdout.as_bytes())?;
                io::stderr().write_all(output.stderr.as_bytes())?;
            }

            Ok(output.status)
        }
        Commands::KataCache { toggle } => {
            let clusters = config
                .clusters()
                .into_iter()
                .filter(Cluster::is_kata)
                .collect_vec();

            if clusters.is_empty() {
                warn!("No cluster with a kata runtime_class configured");
            }

            let mut all_set = true;
            for cluster in clusters.iter() {
                let kubectl = Kubectl::new(
                    runner.clone(),
                    cluster.name.as_str(),
                    config.job.command_duration(),
                );

                all_set &= node::set_kata_cache(
                    &kubectl,
                    cluster,
                    &config.node.image,
                    toggle == Toggle::Enable,
                )?;
            }

            Ok(if all_set { 0 } else { 1 })
        }
        Commands::Query {
            root,
            filters,
            with,
            without,
            metrics,
        } => {
            let query = Query {
                base: config.base.clone(),
                filters,
                with,
                without,
                metrics,
            };
            let results = query.run(&root.unwrap_or_else(|| config.data_dir.clone()))?;

            query.render(&results, &mut io::stdout().lock())?;

            Ok(0)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let console = Arc::new(Console::stdout());
    let result = execute(cli, &console);

    // results are already on disk, only the console may hold buffered output
    console.flush();

    match result {
        Ok(code) => exit_code(code),
        Err(error) => {
            error!("{}", job::error_chain(&error));

            if let AppError::Executor(ExecutorError::Fatal { ref output, .. }) = error {
                if !output.is_empty() {
                    eprintln!("{output}");
                }
            }

            exit_code(error.exit_code())
        }
    }
}
