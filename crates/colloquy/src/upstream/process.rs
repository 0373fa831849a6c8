//! Upstream backed by a stream-json agent CLI process.

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use colloquy_protocol::parse_line;

use super::{PermissionMode, RawMessageStream, Upstream, UpstreamError, UpstreamRequest};

/// Keep only the tail of stderr in error messages.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct ProcessUpstreamConfig {
    /// Executable to run (searched in PATH when not absolute).
    pub command: PathBuf,
    /// Arguments placed before the generated ones (e.g. a package name when
    /// the command is a launcher like `npx`).
    pub leading_args: Vec<String>,
    /// Extra arguments appended after the generated ones.
    pub args: Vec<String>,
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for ProcessUpstreamConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("claude"),
            leading_args: Vec::new(),
            args: Vec::new(),
            model: None,
            working_dir: None,
        }
    }
}

/// Spawns one agent process per turn and streams its stdout as JSON lines.
///
/// The child is killed when the returned stream is dropped, so abandoning a
/// turn never leaks a process.
pub struct ProcessUpstream {
    config: ProcessUpstreamConfig,
}

impl ProcessUpstream {
    pub fn new(config: ProcessUpstreamConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for one request.
    pub fn build_args(&self, request: &UpstreamRequest) -> Vec<String> {
        let mut args = self.config.leading_args.clone();
        args.extend([
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if request.permission_mode != PermissionMode::Default {
            args.push("--permission-mode".to_string());
            args.push(request.permission_mode.as_str().to_string());
        }
        args.extend(self.config.args.iter().cloned());
        args
    }
}

#[async_trait]
impl Upstream for ProcessUpstream {
    async fn open(&self, request: UpstreamRequest) -> Result<RawMessageStream, UpstreamError> {
        let args = self.build_args(&request);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            UpstreamError::Spawn(format!("{}: {e}", self.config.command.display()))
        })?;
        info!(
            "spawned upstream {} (pid={}, resume={:?})",
            self.config.command.display(),
            child.id().unwrap_or(0),
            request.resume_session_id
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Spawn("stdout not captured".to_string()))?;
        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.trim().is_empty() {
                        debug!("upstream stderr: {line}");
                        collected.push_str(line);
                        collected.push('\n');
                    }
                }
                collected
            })
        });

        let state = ProcessStream {
            reader: BufReader::new(stdout),
            buf: Vec::new(),
            child,
            stderr,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                state.buf.clear();
                match state.reader.read_until(b'\n', &mut state.buf).await {
                    Ok(0) => {
                        state.finished = true;
                        let failure = state.exit_failure().await;
                        return failure.map(|err| (Err(err), state));
                    }
                    Ok(_) => {
                        // Invalid UTF-8 is a malformed message, not a transport failure.
                        let raw = {
                            let line = String::from_utf8_lossy(&state.buf);
                            if matches!(line, Cow::Owned(_)) {
                                debug!("upstream emitted a line that is not valid UTF-8");
                            }
                            let line = line.trim_end();
                            if line.trim().is_empty() {
                                continue;
                            }
                            parse_line(line)
                        };
                        return Some((Ok(raw), state));
                    }
                    Err(err) => {
                        state.finished = true;
                        return Some((Err(UpstreamError::Io(err)), state));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "process"
    }
}

struct ProcessStream {
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl ProcessStream {
    /// Reap the child after stdout closed. `None` on a clean exit.
    async fn exit_failure(&mut self) -> Option<UpstreamError> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => return Some(UpstreamError::Io(err)),
        };
        if status.success() {
            return None;
        }

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(UpstreamError::Exited {
            status: status.to_string(),
            stderr: tail(stderr.trim(), STDERR_TAIL).to_string(),
        })
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
