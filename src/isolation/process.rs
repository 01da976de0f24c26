//! Process backend: one interpreter process per run.
//!
//! The child starts with a cleared environment and speaks line-delimited
//! JSON. The host writes an `init` message on stdin; the guest writes
//! `log`, `fetch`, `credential`, `result` or `error` messages on stdout.
//! `fetch` and `credential` requests are answered on stdin after going
//! through the run's proxy and broker. Anything else the guest prints is
//! kept as an info log line.
//!
//! The child is killed as soon as its entry future is dropped, which is how
//! the governor aborts a run.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use super::{GuestEntry, IsolationBackend};
use crate::config::RunnerConfig;
use crate::context::{FetchRequest, FetchResponse, GuestHost};
use crate::error::SandboxError;
use crate::source::exported_names;
use crate::types::{LogLevel, SecurityViolation, Severity, ViolationKind};

/// The only variable passed through to guests.
const GUEST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Keep this much of the guest's stderr in error messages.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Longest stdout line the host buffers. A longer line ends the run.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// ── Wire protocol ────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GuestMessage {
    Log {
        #[serde(default)]
        level: Option<LogLevel>,
        message: String,
    },
    Fetch {
        id: u64,
        request: FetchRequest,
    },
    Credential {
        id: u64,
        key: String,
    },
    Result {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Init {
        source: &'a str,
        component: &'a str,
        props: &'a Value,
        capabilities: Vec<&'static str>,
    },
    FetchResult {
        id: u64,
        response: FetchResponse,
    },
    FetchError {
        id: u64,
        error: String,
    },
    CredentialResult {
        id: u64,
        value: Option<String>,
    },
    CredentialError {
        id: u64,
        error: String,
    },
}

// ── ProcessBackend ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: std::env::temp_dir(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
        }
    }
}

impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn resolve_entry(
        &self,
        source: &str,
        component: &str,
    ) -> Result<Arc<dyn GuestEntry>, SandboxError> {
        if !exported_names(source).contains(component) {
            return Err(SandboxError::InvalidEntryPoint(format!(
                "'{component}' is not exported by the submitted source"
            )));
        }
        Ok(Arc::new(ProcessEntry {
            backend: self.clone(),
            source: source.to_string(),
            component: component.to_string(),
        }))
    }
}

struct ProcessEntry {
    backend: ProcessBackend,
    source: String,
    component: String,
}

#[async_trait]
impl GuestEntry for ProcessEntry {
    async fn invoke(&self, host: GuestHost, props: Value) -> Result<Value, SandboxError> {
        let mut child = Command::new(&self.backend.program)
            .args(&self.backend.args)
            .current_dir(&self.backend.workdir)
            .env_clear()
            .env("PATH", GUEST_PATH)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Backend(format!("failed to start '{}': {e}", self.backend.program))
            })?;

        if let Some(pid) = child.id() {
            host.set_pid(pid);
        }
        debug!(pid = ?child.id(), component = %self.component, "Guest process started");

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SandboxError::Backend("guest stdio was not captured".to_string()));
        };

        // Drain stderr concurrently so a chatty guest cannot fill the pipe.
        // Only the tail is kept.
        let stderr_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&chunk[..n]);
                        if tail.len() > STDERR_TAIL_CHARS * 8 {
                            tail.drain(..tail.len() - STDERR_TAIL_CHARS * 4);
                        }
                    }
                }
            }
            String::from_utf8_lossy(&tail).into_owned()
        });

        let init = HostMessage::Init {
            source: &self.source,
            component: &self.component,
            props: &props,
            capabilities: host.capability_names(),
        };
        if let Err(e) = send(&mut stdin, &init).await {
            debug!("Guest closed stdin before init: {e}");
        }

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| SandboxError::Backend(format!("reading guest output: {e}")))?;
            if read == 0 {
                break;
            }
            if buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
                let _ = child.start_kill();
                warn!(limit = MAX_LINE_BYTES, "Guest output line too long, stopping guest");
                host.record_violation(SecurityViolation::new(
                    ViolationKind::Resource,
                    Severity::High,
                    format!("guest output line exceeds {MAX_LINE_BYTES} bytes"),
                ));
                return Err(SandboxError::OutputLimitExceeded {
                    limit: MAX_LINE_BYTES,
                });
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }

            let message = match serde_json::from_str::<GuestMessage>(line) {
                Ok(message) => message,
                Err(_) => {
                    host.log(LogLevel::Info, line);
                    continue;
                }
            };

            match message {
                GuestMessage::Log { level, message } => {
                    host.log(level.unwrap_or(LogLevel::Info), message);
                }
                GuestMessage::Fetch { id, request } => {
                    let reply = match host.fetch(request).await {
                        Ok(response) => HostMessage::FetchResult { id, response },
                        Err(e) => HostMessage::FetchError {
                            id,
                            error: e.to_string(),
                        },
                    };
                    if let Err(e) = send(&mut stdin, &reply).await {
                        warn!("Could not deliver fetch reply to guest: {e}");
                    }
                }
                GuestMessage::Credential { id, key } => {
                    let reply = match host.credential(&key).await {
                        Ok(value) => HostMessage::CredentialResult { id, value },
                        Err(e) => HostMessage::CredentialError {
                            id,
                            error: e.to_string(),
                        },
                    };
                    if let Err(e) = send(&mut stdin, &reply).await {
                        warn!("Could not deliver credential reply to guest: {e}");
                    }
                }
                GuestMessage::Result { value } => {
                    let _ = child.start_kill();
                    return Ok(value);
                }
                GuestMessage::Error { message } => {
                    let _ = child.start_kill();
                    return Err(SandboxError::GuestRuntime(message));
                }
            }
        }

        drop(stdin);
        let status = child
            .wait()
            .await
            .map_err(|e| SandboxError::Backend(format!("waiting for guest: {e}")))?;
        let stderr = stderr_task.await.unwrap_or_default();
        Err(SandboxError::GuestRuntime(format!(
            "guest exited with {status} without a result{}",
            stderr_suffix(&stderr)
        )))
    }
}

async fn send(stdin: &mut ChildStdin, message: &HostMessage<'_>) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!(": {}", &trimmed[start..])
}
