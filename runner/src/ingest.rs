use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

static SUMMARY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(read|write|READ|WRITE):").unwrap());

static METRICS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(read|write): IOPS=(\d+\.?\d*)(k?), BW=(\d+\.?\d*)(MiB/s|KiB/s|B/s)").unwrap()
});

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("No read/write summary found in the job log")]
    NoSummary,
    #[error("The job log is empty")]
    EmptyLog,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// container for information extracted from running a subprocess
pub struct RunOutput {
    pub runtime: u128,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl RunOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, as a user would have seen it on a terminal
    pub fn combined(&self) -> String {
        [self.stdout.trim_end(), self.stderr.trim_end()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .join("\n")
    }
}

/// How the pod log of a finished job is turned into the cached result
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Ingestors {
    /// keep only the fio `read:`/`write:` summary lines
    #[default]
    Summary,
    /// keep the whole log
    Raw,
}

impl Ingestors {
    #[tracing::instrument(level = "debug", skip(logs))]
    pub fn ingest(&self, logs: &str) -> Result<String, IngestorError> {
        match self {
            Self::Summary => {
                let summary = summary_lines(logs)
                    .map(|line| format!("   {line}"))
                    .join("\n");

                if summary.is_empty() {
                    Err(IngestorError::NoSummary)
                } else {
                    Ok(summary)
                }
            }
            Self::Raw => {
                if logs.trim().is_empty() {
                    Err(IngestorError::EmptyLog)
                } else {
                    Ok(logs.to_string())
                }
            }
        }
    }
}

/// trimmed lines starting with `read:`, `write:`, `READ:` or `WRITE:`
pub fn summary_lines(logs: &str) -> impl Iterator<Item = &str> {
    logs.lines()
        .filter(|line| SUMMARY_LINE.is_match(line))
        .map(str::trim)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// IOPS and bandwidth of one `read:`/`write:` line of a fio report
#[derive(Debug, Clone, PartialEq)]
pub struct FioMetrics {
    pub operation: Operation,
    pub iops: u64,
    /// bandwidth in MB/s
    pub bandwidth: f64,
    /// bandwidth as reported by fio, e.g. `48.1MiB/s`
    pub bandwidth_raw: String,
}

impl FioMetrics {
    pub fn parse_all(text: &str) -> Vec<Self> {
        METRICS
            .captures_iter(text)
            .filter_map(|captures| {
                let operation = match &captures[1] {
                    "read" => Operation::Read,
                    _ => Operation::Write,
                };
                let mut iops = captures[2].parse::<f64>().ok()?;
                if &captures[3] == "k" {
                    iops *= 1000.0;
                }

                let mut bandwidth = captures[4].parse::<f64>().ok()?;
                match &captures[5] {
                    "KiB/s" => bandwidth /= 1024.0,
                    "B/s" => bandwidth /= 1024.0 * 1024.0,
                    _ => {}
                }

                Some(Self {
                    operation,
                    iops: iops.ceil() as u64,
                    bandwidth: bandwidth * 1.024,
                    bandwidth_raw: format!("{}{}", &captures[4], &captures[5]),
                })
            })
            .collect()
    }
}

impl fmt::Display for FioMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: IOPS={} BW={:.3}MB/s ({})",
            self.operation, self.iops, self.bandwidth, self.bandwidth_raw
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIO_LOG: &str = "2
fio --name=test --readwrite=randrw --bs=4k
test: (g=0): rw=randrw, bs=(R) 4096B-4096B, (W) 4096B-4096B, ioengine=libaio, iodepth=16
test: (groupid=0, jobs=1): err= 0: pid=12: Mon Jan  2 10:00:00 2023
  read: IOPS=12.3k, BW=48.1MiB/s (50.4MB/s)(2887MiB/60001msec)
    slat (usec): min=2, max=1202, avg= 5.93, stdev= 4.33
  write: IOPS=512, BW=2048KiB/s (2097kB/s)(120MiB/60001msec); 0 zone resets
Run status group 0 (all jobs):
   READ: bw=48.1MiB/s (50.4MB/s), 48.1MiB/s-48.1MiB/s (50.4MB/s-50.4MB/s), io=2887MiB
  WRITE: bw=2048KiB/s (2097kB/s), 2048KiB/s-2048KiB/s (2097kB/s-2097kB/s), io=120MiB
";

    #[test]
    fn summary_keeps_read_write_lines() {
        let summary = Ingestors::Summary.ingest(FIO_LOG).unwrap();

        assert_eq!(summary.lines().count(), 4);
        assert!(summary.starts_with("   read: IOPS=12.3k"));
        assert!(summary.lines().all(|line| line.starts_with("   ")));
        assert!(summary.contains("   WRITE: bw=2048KiB/s"));
        assert!(!summary.contains("slat"));
    }

    #[test]
    fn summary_without_report_fails() {
        assert!(matches!(
            Ingestors::Summary.ingest("nproc\nfio: pid=0, err=2/file:filesetup.c\n"),
            Err(IngestorError::NoSummary)
        ));
    }

    #[test]
    fn raw_keeps_everything() {
        assert_eq!(Ingestors::Raw.ingest(FIO_LOG).unwrap(), FIO_LOG);
        assert!(matches!(
            Ingestors::Raw.ingest("  \n"),
            Err(IngestorError::EmptyLog)
        ));
    }

    #[test]
    fn ingestor_from_config_name() {
        let ingestor: Ingestors = serde_yaml::from_str("raw").unwrap();

        assert_eq!(ingestor, Ingestors::Raw);
    }

    #[test]
    fn metrics_units() {
        let metrics = FioMetrics::parse_all(FIO_LOG);

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].operation, Operation::Read);
        assert_eq!(metrics[0].iops, 12300);
        assert!((metrics[0].bandwidth - 48.1 * 1.024).abs() < 1e-9);
        assert_eq!(metrics[0].bandwidth_raw, "48.1MiB/s");

        assert_eq!(metrics[1].operation, Operation::Write);
        assert_eq!(metrics[1].iops, 512);
        assert!((metrics[1].bandwidth - 2.048).abs() < 1e-9);
    }

    #[test]
    fn combined_output() {
        let output = RunOutput {
            stdout: String::from("applied\n"),
            stderr: String::from("warning\n"),
            ..RunOutput::new()
        };

        assert_eq!(output.combined(), "applied\nwarning");
        assert!(output.success());
    }
}
