use crate::{
    azure,
    cache::{ResultCache, SharedCache},
    config::{AzureConfig, BenchConfig, Cluster, JobConfig},
    executors::{CommandRunner, ExecutorError},
    ingest::Ingestors,
    job::{JobOutcome, JobRunner, JobState},
    kubectl::Kubectl,
    sink::Console,
    sweep::{self, BenchOption, Overrides},
};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info, instrument, warn};


pub const DESCRIPTION_FILE_NAME: &str = "description.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cluster: String,
    pub total: usize,
    pub cache_hits: usize,
    pub executed: usize,
    pub failed: usize,
    /// stopped early because another cluster failed fatally
    pub aborted: bool,
}

impl SweepReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome.state {
            JobState::CacheHit => self.cache_hits += 1,
            JobState::Failed => self.failed += 1,
            _ => self.executed += 1,
        }
    }
}

/// The parameter sweep against a single cluster
pub struct Benchmark {
    cluster: Cluster,
    run_dir: PathBuf,
    base: String,
    options: Vec<BenchOption>,
    job: JobConfig,
    ingestor: Ingestors,
    azure: AzureConfig,
    cache: SharedCache,
    runner: Arc<dyn CommandRunner>,
    console: Arc<Console>,
    silent: bool,
}

impl Benchmark {
    pub fn new(
        config: &BenchConfig,
        cluster: Cluster,
        run_dir: PathBuf,
        update_cache: bool,
        runner: Arc<dyn CommandRunner>,
        console: Arc<Console>,
    ) -> Self {
        Self {
            cache: SharedCache::new(ResultCache::in_dir(&run_dir, update_cache)),
            cluster,
            run_dir,
            base: config.base.clone(),
            options: config.options.clone(),
            job: config.job.clone(),
            ingestor: config.ingest,
            azure: config.azure.clone(),
            runner,
            console,
            silent: false,
        }
    }

    /// only print cached results, like a sweep nobody watches
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn prepare_run_dir(&self) -> Result<(), ExecutorError> {
        let write_error = |source| ExecutorError::Write {
            path: self.run_dir.clone(),
            source,
        };

        fs::create_dir_all(&self.run_dir).map_err(write_error)?;

        let description = self.run_dir.join(DESCRIPTION_FILE_NAME);
        if !description.exists() {
            fs::write(&description, format!("{}\n", self.cluster.description()))
                .map_err(write_error)?;
        }

        Ok(())
    }

    /// Run every job command of the sweep, one after another. Stops between two
    /// jobs once `abort` is raised.
    #[instrument(skip_all, fields(cluster = %self.cluster.name), level = "info")]
    pub fn run(
        &self,
        overrides: &Overrides,
        abort: &AtomicBool,
    ) -> Result<SweepReport, ExecutorError> {
        self.prepare_run_dir()?;
        self.cache.load()?;
        if self.cache.is_empty() {
            info!(run_dir = ?self.run_dir, "Starting without cached results");
        }

        if let Some((subscription, resource_group)) = self.azure.credentials() {
            azure::fetch_credentials(
                self.runner.as_ref(),
                &self.cluster.name,
                subscription,
                resource_group,
            )?;
        }

        let jobs = sweep::generate(&self.base, &self.options, overrides);
        info!("Generated {} job commands", jobs.len());

        let kubectl = Kubectl::new(
            self.runner.clone(),
            &self.cluster.name,
            self.job.command_duration(),
        );
        let mut job_runner = JobRunner::new(
            &self.cluster,
            &self.job,
            kubectl,
            self.ingestor,
            self.cache.clone(),
            self.run_dir.join(&self.job.manifest),
        );
        let mut report = SweepReport {
            cluster: self.cluster.name.clone(),
            total: jobs.len(),
            ..SweepReport::default()
        };

        for (index, job) in jobs.iter().enumerate() {
            if abort.load(Ordering::SeqCst) {
                warn!(
                    "Stopping after {index}/{} jobs, another cluster failed",
                    jobs.len()
                );
                report.aborted = true;
                break;
            }

            let outcome = job_runner.run(job)?;
            report.record(&outcome);

            if !self.silent || outcome.state == JobState::CacheHit {
                self.console.report(&self.cluster.name, &outcome);
            }

            info!("Done with {}/{}", index + 1, jobs.len());
        }

        info!(
            cache_hits = report.cache_hits,
            executed = report.executed,
            failed = report.failed,
            cached = self.cache.len(),
            "Done with processing"
        );

        Ok(report)
    }
}

/// Run the sweeps of all clusters concurrently, one thread per cluster.
///
/// The first fatal error raises the shared abort flag, letting the other clusters
/// stop after their current job, and is returned once every thread finished.
pub fn run_clusters(
    benchmarks: &[Benchmark],
    overrides: &Overrides,
) -> Result<Vec<SweepReport>, ExecutorError> {
    if benchmarks.is_empty() {
        warn!("No clusters configured, nothing to do");
        return Ok(Vec::new());
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(benchmarks.len())
        .thread_name(|index| format!("cluster-{index}"))
        .build()?;
    let abort = AtomicBool::new(false);

    let results: Vec<Result<SweepReport, ExecutorError>> = pool.install(|| {
        benchmarks
            .par_iter()
            .map(|benchmark| {
                let result = benchmark.run(overrides, &abort);

                if let Err(ref error) = result {
                    error!(
                        cluster = %benchmark.cluster().name,
                        error = ?error,
                        "Fatal error: {error}"
                    );
                    abort.store(true, Ordering::SeqCst);
                }

                result
            })
            .collect()
    });

    results.into_iter().collect()
}
