//! Fake `CommandRunner` replaying canned outputs, for tests without a cluster

use super::{CommandRunner, ExecutorError, Invocation};
use crate::ingest::RunOutput;
use parking_lot::Mutex;
use std::{collections::VecDeque, time::Duration};

#[derive(Debug, Clone)]
pub enum Response {
    Output(RunOutput),
    Timeout,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    responses: VecDeque<Response>,
}

/// Answers an invocation with the responses of the first rule whose needle is
/// contained in the rendered command line. Responses are consumed in order, the
/// last one repeats. Unmatched invocations succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

pub fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        stdout: stdout.to_string(),
        ..RunOutput::new()
    }
}

pub fn failed(status: i32, stderr: &str) -> RunOutput {
    RunOutput {
        status,
        stderr: stderr.to_string(),
        ..RunOutput::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, needle: &str, response: Response) -> Self {
        {
            let mut rules = self.rules.lock();

            match rules.iter_mut().find(|rule| rule.needle == needle) {
                Some(rule) => rule.responses.push_back(response),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    responses: VecDeque::from([response]),
                }),
            }
        }

        self
    }

    pub fn on(self, needle: &str, output: RunOutput) -> Self {
        self.push(needle, Response::Output(output))
    }

    pub fn on_timeout(self, needle: &str) -> Self {
        self.push(needle, Response::Timeout)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<RunOutput, ExecutorError> {
        let command = invocation.to_string();
        self.calls.lock().push(command.clone());

        let response = {
            let mut rules = self.rules.lock();

            rules
                .iter_mut()
                .find(|rule| command.contains(&rule.needle))
                .and_then(|rule| {
                    if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    }
                })
        };

        match response {
            Some(Response::Output(output)) => Ok(output),
            Some(Response::Timeout) => Err(ExecutorError::Timeout {
                command,
                timeout: invocation.timeout.unwrap_or(Duration::ZERO),
            }),
            None => Ok(RunOutput::new()),
        }
    }
}
