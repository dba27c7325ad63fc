use super::{CommandRunner, ExecutorError, Invocation};
use crate::ingest::RunOutput;
use std::{
    io::Read,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Runner spawning the commands as local child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

/// read a child pipe to its end on a helper thread, so a chatty child never
/// blocks on a full pipe while we wait for it
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_end(&mut buffer) {
                warn!(error = ?error, "Failed to read child output");
            }
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

impl CommandRunner for LocalRunner {
    #[instrument(skip(self), fields(command = %invocation), level = "debug")]
    fn run(&self, invocation: &Invocation) -> Result<RunOutput, ExecutorError> {
        let spawn_error = |source| ExecutorError::Spawn {
            command: invocation.to_string(),
            source,
        };

        let mut command = Command::new(&invocation.program);
        command.args(invocation.args.iter());

        if invocation.interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(spawn_error)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match invocation.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(spawn_error)? {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    if let Err(error) = child.kill() {
                        warn!(error = ?error, "Failed to kill timed out child");
                    }
                    if let Err(error) = child.wait() {
                        warn!(error = ?error, "Failed to reap timed out child");
                    }

                    return Err(ExecutorError::Timeout {
                        command: invocation.to_string(),
                        timeout,
                    });
                }
            },
            None => child.wait().map_err(spawn_error)?,
        };

        let output = RunOutput {
            runtime: start.elapsed().as_nanos(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            status: status.code().unwrap_or(-1),
        };

        debug!(
            "Finished in {} ns | status: {}",
            output.runtime,
            status.success()
        );
        trace!("Output: {}", output.stdout);

        Ok(output)
    }
}
