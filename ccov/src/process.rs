// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
};

use crate::error::CollectError;

const MAX_LOG_LINE_LENGTH: usize = 8192;

/// Exit status of a finished tool invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitStatus {
    #[cfg(unix)]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
            success: status.success(),
        }
    }

    #[cfg(not(unix))]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

type LogWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Line-oriented log shared by every process of one test.
///
/// Each line is written whole while holding the lock, so output from
/// concurrently drained streams never interleaves mid-line.
#[derive(Clone)]
pub struct ToolLog {
    writer: Arc<Mutex<LogWriter>>,
}

impl ToolLog {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        let writer: LogWriter = Box::pin(writer);
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .await
            .with_context(|| format!("unable to create log file: {}", path.display()))?;
        Ok(Self::new(tokio::io::BufWriter::new(file)))
    }

    pub fn discard() -> Self {
        Self::new(tokio::io::sink())
    }

    pub async fn write_line(&self, label: &str, line: &str) -> Result<()> {
        let line = truncate_line(line.trim_end_matches(['\r', '\n']));
        let entry = format!("[{}] {}\n", label, line);

        let mut writer = self.writer.lock().await;
        writer.write_all(entry.as_bytes()).await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LOG_LINE_LENGTH {
        return line.to_owned();
    }

    let mut end = MAX_LOG_LINE_LENGTH;
    while !line.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...<truncated>", &line[..end])
}

async fn monitor_stream(
    label: &str,
    context: &str,
    stream: impl AsyncRead + Unpin,
    log: &ToolLog,
) -> Result<()> {
    let prefix = format!("{} {}", label, context);
    let mut stream = BufReader::new(stream);
    loop {
        let mut buf = vec![];

        let bytes_read = stream.read_until(b'\n', &mut buf).await?;
        if bytes_read == 0 && buf.is_empty() {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        log.write_line(&prefix, &line).await?;
    }
    Ok(())
}

/// Run `cmd` to completion, copying its output into `log`.
///
/// There is no timeout. A tool that never exits stalls the caller.
pub async fn run_logged(mut cmd: Command, label: &str, log: &ToolLog) -> Result<ExitStatus> {
    cmd.kill_on_drop(true)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("running {}: {:?}", label, cmd);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("process failed to start: {}", label))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| format_err!("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| format_err!("stderr not captured"))?;

    let stdout_log = monitor_stream(label, "stdout", stdout, log);
    let stderr_log = monitor_stream(label, "stderr", stderr, log);
    let wait = async {
        child
            .wait()
            .await
            .with_context(|| format!("process failed to run: {}", label))
    };

    let (_, _, status) = futures::try_join!(stdout_log, stderr_log, wait)?;
    log.flush().await?;

    let status = ExitStatus::from(status);
    debug!("{} exited: {}", label, status);
    Ok(status)
}

/// Like [`run_logged`], but a non-zero exit is an `ExternalToolFailure`.
pub async fn run_checked(cmd: Command, tool: &str, step: &str, log: &ToolLog) -> Result<()> {
    let label = format!("{} {}", tool, step);
    let status = run_logged(cmd, &label, log).await?;

    if !status.success {
        return Err(CollectError::ExternalToolFailure {
            tool: tool.to_owned(),
            step: step.to_owned(),
            status: status.to_string(),
        }
        .into());
    }

    Ok(())
}
