use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;
use tutorhost_domain::RuntimeError;

const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// A subprocess invocation, independent of how it is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs provisioning subprocesses (installer, env creation, pip).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<RunOutput, RuntimeError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<RunOutput, RuntimeError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        debug!(command = %spec.display(), "running");
        let mut child = command.spawn().map_err(|err| {
            RuntimeError::ProcessSpawn(format!("failed to start {}: {err}", spec.program.display()))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            read_limited(stdout, MAX_CAPTURE_BYTES),
            read_limited(stderr, MAX_CAPTURE_BYTES),
        );
        let status = status.map_err(|err| {
            RuntimeError::io(format!("waiting for {}", spec.program.display()), &err)
        })?;
        Ok(RunOutput {
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

async fn read_limited(reader: Option<impl AsyncRead + Unpin>, limit: usize) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => append_limited(&mut buffer, &chunk[..read], limit, &mut truncated),
        }
    }
    let mut text = String::from_utf8_lossy(&buffer).to_string();
    if truncated {
        text.insert_str(0, "[...truncated...]\n");
    }
    text
}

fn append_limited(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
    if limit == 0 {
        return;
    }
    if buffer.len().saturating_add(chunk.len()) <= limit {
        buffer.extend_from_slice(chunk);
        return;
    }
    *truncated = true;
    let old_len = buffer.len();
    let excess = old_len.saturating_add(chunk.len()).saturating_sub(limit);
    if excess >= old_len {
        buffer.clear();
        let drop_from_chunk = excess.saturating_sub(old_len).min(chunk.len());
        buffer.extend_from_slice(&chunk[drop_from_chunk..]);
    } else {
        buffer.drain(0..excess);
        buffer.extend_from_slice(chunk);
    }
}

/// Last `limit` characters of a process's stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StderrTail {
    text: String,
    limit: usize,
}

impl StderrTail {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        let count = self.text.chars().count();
        if count > self.limit {
            let cut = self
                .text
                .char_indices()
                .nth(count - self.limit)
                .map_or(self.text.len(), |(idx, _)| idx);
            self.text.drain(..cut);
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_limited_keeps_the_newest_bytes() {
        let mut buffer = Vec::new();
        let mut truncated = false;
        append_limited(&mut buffer, b"abcdef", 4, &mut truncated);
        assert_eq!(buffer, b"cdef");
        assert!(truncated);
        append_limited(&mut buffer, b"gh", 4, &mut truncated);
        assert_eq!(buffer, b"efgh");
    }

    #[test]
    fn stderr_tail_is_bounded_by_characters() {
        let mut tail = StderrTail::new(5);
        tail.push("héllo ");
        tail.push("wörld");
        assert_eq!(tail.as_str(), "wörld");
        tail.push("!");
        assert_eq!(tail.as_str(), "örld!");
        assert_eq!(tail.as_str().chars().count(), 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_output_and_status() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("printf out && printf \"$GREETING\" >&2; exit 7")
            .env("GREETING", "err");
        let output = SystemRunner.run(&spec).await.unwrap();
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("/definitely/not/a/real/program");
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ProcessSpawn(_)), "{err:?}");
    }
}
