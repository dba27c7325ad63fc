mod local;
#[cfg(test)]
pub mod scripted;

pub use local::LocalRunner;

use crate::{cache::CacheError, ingest::RunOutput};
use itertools::Itertools;
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` failed with exit code {code}")]
    Fatal {
        command: String,
        code: i32,
        output: String,
    },
    #[error("No nodes found in cluster {context}")]
    NoNodes { context: String },
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Result cache failed")]
    Cache(#[from] CacheError),
    #[error("Failed to start cluster threads")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ExecutorError {
    /// exit code the process terminates with for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fatal { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }
}

/// A single external command, e.g. one `kubectl` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    /// inherit the terminal instead of capturing the output
    pub interactive: bool,
}

impl Invocation {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            interactive: false,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.program)
        } else {
            write!(f, "{} {}", self.program, self.args.iter().join(" "))
        }
    }
}

/// Seam between the orchestration logic and the processes it spawns
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<RunOutput, ExecutorError>;
}

impl RunOutput {
    /// turn a non-zero exit status into a fatal error carrying the captured output
    pub fn ensure_success(self, invocation: &Invocation) -> Result<Self, ExecutorError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecutorError::Fatal {
                command: invocation.to_string(),
                code: self.status,
                output: self.combined(),
            })
        }
    }
}
