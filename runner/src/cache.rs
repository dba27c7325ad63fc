use crate::sweep::normalize;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use serde_yaml::Mapping;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
mod cache_test;

pub const CACHE_FILE_NAME: &str = "cache.yaml";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to access cache file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to (de)serialize cache file {path:?}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Results of already measured job commands for one run directory.
///
/// Only the exact command -> result mapping is persisted, the normalized index
/// (normalized command -> exact command) is rebuilt on `load`. Storing a command
/// replaces any other stored command with the same normalized form.
#[derive(Debug)]
pub struct ResultCache {
    path: PathBuf,
    update_cache: bool,
    entries: BTreeMap<String, String>,
    normalized: BTreeMap<String, String>,
}

impl ResultCache {
    pub fn new<P: Into<PathBuf>>(path: P, update_cache: bool) -> Self {
        Self {
            path: path.into(),
            update_cache,
            entries: BTreeMap::new(),
            normalized: BTreeMap::new(),
        }
    }

    /// cache backed by `cache.yaml` inside of `dir`
    pub fn in_dir(dir: &Path, update_cache: bool) -> Self {
        Self::new(dir.join(CACHE_FILE_NAME), update_cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(command, result)| (command.as_str(), result.as_str()))
    }

    /// Read the persisted mapping, a missing file is an empty cache
    pub fn load(&mut self) -> Result<(), CacheError> {
        self.entries.clear();
        self.normalized.clear();

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "No cache file yet, starting empty");

                return Ok(());
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if !content.trim().is_empty() {
            let path = self.path.clone();
            let yaml_error = |source| CacheError::Yaml {
                path: path.clone(),
                source,
            };
            // a mapping keeps the file order, so the last of several reordered
            // duplicates wins like it would have when storing them
            let mapping: Mapping = serde_yaml::from_str(&content).map_err(yaml_error)?;
            let mut collapsed = 0;

            for (command, result) in mapping {
                let command: String = serde_yaml::from_value(command).map_err(yaml_error)?;
                let result: String = serde_yaml::from_value(result).map_err(yaml_error)?;

                if self.insert(command, result).is_some() {
                    collapsed += 1;
                }
            }

            if collapsed > 0 {
                warn!(
                    path = ?self.path,
                    collapsed,
                    "Dropped reordered duplicates from the cache file"
                );
            }
        }

        info!(path = ?self.path, entries = self.entries.len(), "Loaded cached results");

        Ok(())
    }

    /// Stored result for `command`, trying the exact command before its
    /// normalized form. Always `None` while refreshing the cache.
    pub fn lookup(&self, command: &str) -> Option<&str> {
        if self.update_cache {
            return None;
        }

        self.entries
            .get(command)
            .or_else(|| {
                self.normalized
                    .get(&normalize(command))
                    .and_then(|exact| self.entries.get(exact))
            })
            .map(String::as_str)
    }

    /// Record `result` for `command` and write the whole mapping to disk
    pub fn store(&mut self, command: &str, result: String) -> Result<(), CacheError> {
        if let Some(previous) = self.insert(command.to_string(), result) {
            debug!(
                previous = %previous,
                command = %command,
                "Replaced reordered cache entry"
            );
        }

        self.persist()
    }

    /// Insert into both maps, dropping any other exact command with the same
    /// normalized form. Returns the dropped command.
    fn insert(&mut self, command: String, result: String) -> Option<String> {
        let replaced = self
            .normalized
            .insert(normalize(&command), command.clone())
            .filter(|previous| *previous != command);

        if let Some(ref previous) = replaced {
            self.entries.remove(previous);
        }
        self.entries.insert(command, result);

        replaced
    }

    fn persist(&self) -> Result<(), CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content =
            serde_yaml::to_string(&self.entries).map_err(|source| CacheError::Yaml {
                path: self.path.clone(),
                source,
            })?;

        fs::write(&self.path, content).map_err(io_error)
    }
}

#[derive(Debug, Clone)]
/// Thread safe wrapper over `ResultCache`, serializing every write
pub struct SharedCache(Arc<FairMutex<ResultCache>>);

impl SharedCache {
    pub fn new(cache: ResultCache) -> Self {
        Self(Arc::new(FairMutex::new(cache)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, ResultCache> {
        self.0.lock_arc()
    }

    pub fn load(&self) -> Result<(), CacheError> {
        self.lock().load()
    }

    pub fn lookup(&self, command: &str) -> Option<String> {
        self.lock().lookup(command).map(String::from)
    }

    pub fn store(&self, command: &str, result: String) -> Result<(), CacheError> {
        self.lock().store(command, result)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
