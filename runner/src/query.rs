use crate::{
    benchmark::DESCRIPTION_FILE_NAME,
    cache::{CacheError, ResultCache, CACHE_FILE_NAME},
    ingest::FioMetrics,
};
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

const SEPARATOR_WIDTH: usize = 120;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Cache glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Failed to read a result cache")]
    Cache(#[from] CacheError),
}

/// Selection of cached results across all run directories below a root
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub base: String,
    /// `--name=value` tokens a command must contain
    pub filters: Vec<(String, String)>,
    /// flags or options a command must contain
    pub with: Vec<String>,
    /// flags or options a command must not contain
    pub without: Vec<String>,
    pub metrics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResults {
    pub dir: PathBuf,
    pub description: Option<String>,
    /// matching (command, result) pairs, sorted by command
    pub entries: Vec<(String, String)>,
}

/// Paths of every result cache below `root`
pub fn find_caches(root: &Path) -> Result<Vec<PathBuf>, QueryError> {
    let matcher = GlobBuilder::new(&format!("**/{CACHE_FILE_NAME}"))
        .build()?
        .compile_matcher();

    Ok(WalkBuilder::new(root)
        // run directories are usually git ignored
        .standard_filters(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("Failed to search for result caches: {error}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .map(DirEntry::into_path)
        .filter(|path| matcher.is_match(path))
        .sorted()
        .collect())
}

/// Collapse runs of whitespace and move bare flags like `--norandommap` to the
/// end, so sorted output groups by the valued options
pub fn printable(command: &str) -> String {
    let (flags, rest): (Vec<&str>, Vec<&str>) = command
        .split_whitespace()
        .partition(|token| token.starts_with("--") && !token.contains('='));

    rest.into_iter().chain(flags).join(" ")
}

fn has_option(tokens: &[&str], name: &str) -> bool {
    let flag = format!("--{name}");
    let prefix = format!("--{name}=");

    tokens
        .iter()
        .any(|token| *token == flag || token.starts_with(&prefix))
}

impl Query {
    pub fn matches(&self, command: &str) -> bool {
        // normalized duplicates written by older runs don't start with the base
        if !command.starts_with(&self.base) {
            return false;
        }

        let tokens = command.split_whitespace().collect_vec();

        self.filters.iter().all(|(name, value)| {
            let expected = format!("--{name}={value}");
            tokens.iter().any(|token| *token == expected)
        }) && self.with.iter().all(|name| has_option(&tokens, name))
            && !self.without.iter().any(|name| has_option(&tokens, name))
    }

    pub fn run(&self, root: &Path) -> Result<Vec<RunResults>, QueryError> {
        find_caches(root)?
            .into_iter()
            .map(|path| {
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                let mut cache = ResultCache::new(&path, false);
                cache.load()?;

                let description = fs::read_to_string(dir.join(DESCRIPTION_FILE_NAME))
                    .ok()
                    .map(|text| text.trim().to_string());
                let entries = cache
                    .entries()
                    .filter(|(command, _)| self.matches(command))
                    .map(|(command, result)| (printable(command), result.to_string()))
                    .sorted()
                    .collect_vec();

                debug!(dir = ?dir, matches = entries.len(), "Queried result cache");

                Ok::<_, QueryError>(RunResults {
                    dir,
                    description,
                    entries,
                })
            })
            .collect()
    }

    pub fn render<W: Write>(&self, results: &[RunResults], out: &mut W) -> io::Result<()> {
        let separator = "-".repeat(SEPARATOR_WIDTH);

        for run in results {
            writeln!(out, "{separator}")?;
            match run.description {
                Some(ref description) => {
                    writeln!(out, "{} : {description}", run.dir.to_string_lossy())?
                }
                None => writeln!(out, "{}", run.dir.to_string_lossy())?,
            }
            writeln!(out, "{separator}")?;

            for (command, result) in run.entries.iter() {
                writeln!(out, "{}", command.trim())?;
                writeln!(out, "   {}", result.trim())?;
                if self.metrics {
                    for metrics in FioMetrics::parse_all(result) {
                        writeln!(out, "   => {metrics}")?;
                    }
                }
                writeln!(out)?;
            }

            writeln!(out, "{separator}")?;
            writeln!(out, "\n")?;
        }

        Ok(())
    }
}
