//! Scripted doubles for the transport and LLM provider, used across the
//! crate's unit tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::{LlmProvider, LlmRequest, LlmResponse, TokenUsage};
use crate::safety::ValidationContext;
use crate::transport::{ExecOutput, SshTransport, TransportError};

#[derive(Clone)]
struct ScriptedOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
    timeout: bool,
}

struct Rule {
    pattern: String,
    outputs: VecDeque<ScriptedOutput>,
}

/// Transport double. Commands are matched by substring against registered
/// rules (first match wins); unmatched commands succeed with empty output.
/// Every executed command is recorded for assertions.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    connect_failure: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent response for commands containing `pattern`
    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(
            pattern,
            ScriptedOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                timeout: false,
            },
        );
    }

    /// Register a sequence of responses; the last one repeats
    pub fn respond_seq(&self, pattern: &str, outputs: &[(i32, &str, &str)]) {
        let mut rules = self.rules.lock().unwrap();
        let outputs = outputs
            .iter()
            .map(|(exit_code, stdout, stderr)| ScriptedOutput {
                exit_code: *exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                timeout: false,
            })
            .collect();
        rules.push(Rule {
            pattern: pattern.to_string(),
            outputs,
        });
    }

    /// Commands containing `pattern` report a transport timeout
    pub fn timeout_on(&self, pattern: &str) {
        self.push_rule(
            pattern,
            ScriptedOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                timeout: true,
            },
        );
    }

    /// Make `connect` fail with the given message
    pub fn fail_connect(&self, message: &str) {
        *self.connect_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Commands executed so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn push_rule(&self, pattern: &str, output: ScriptedOutput) {
        let mut rules = self.rules.lock().unwrap();
        let mut outputs = VecDeque::new();
        outputs.push_back(output);
        rules.push(Rule {
            pattern: pattern.to_string(),
            outputs,
        });
    }

    fn next_output(&self, command: &str) -> ScriptedOutput {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if command.contains(&rule.pattern) {
                if rule.outputs.len() > 1 {
                    return rule.outputs.pop_front().unwrap();
                }
                if let Some(output) = rule.outputs.front() {
                    return output.clone();
                }
            }
        }
        ScriptedOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timeout: false,
        }
    }
}

#[async_trait]
impl SshTransport for ScriptedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if let Some(message) = self.connect_failure.lock().unwrap().clone() {
            return Err(TransportError::Connect(message));
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        _context: Option<&ValidationContext>,
    ) -> Result<ExecOutput, TransportError> {
        self.calls.lock().unwrap().push(command.to_string());
        let output = self.next_output(command);
        if output.timeout {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration_ms: 1,
        })
    }

    async fn upload_file(&self, _local: &Path, _remote: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn download_file(&self, _remote: &str, _local: &Path) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// LLM provider double returning queued responses in order. When the
/// queue is empty the last registered response repeats; with no responses
/// at all, a failure response is returned.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    available: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn push_content(&self, content: &str) {
        self.responses.lock().unwrap().push_back(Ok(content.to_string()));
    }

    pub fn push_failure(&self, error: &str) {
        self.responses.lock().unwrap().push_back(Err(error.to_string()));
    }

    /// Prompts seen so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: LlmRequest) -> LlmResponse {
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };

        match next {
            Some(Ok(content)) => LlmResponse::ok(
                content,
                request.model,
                TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 10,
                    total_tokens: 20,
                },
                1,
            ),
            Some(Err(error)) => LlmResponse::failure(error, request.model, 1),
            None => LlmResponse::failure("no scripted response", request.model, 1),
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}
