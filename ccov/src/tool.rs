// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use crate::process::{run_checked, ToolLog};

/// The external coverage tool. Any failure is fatal to the invocation.
#[async_trait]
pub trait CoverageTool: Send + Sync {
    /// Compute a tracefile from the notes and counts under `dir`, recording
    /// `label` as the test name.
    async fn capture(&self, dir: &Path, label: &str, output: &Path, log: &ToolLog) -> Result<()>;

    /// Keep only source files matching the glob `include`.
    async fn filter(&self, input: &Path, include: &str, output: &Path, log: &ToolLog)
        -> Result<()>;

    /// Sum two tracefiles. `output` may name one of the inputs.
    async fn merge(&self, a: &Path, b: &Path, output: &Path, log: &ToolLog) -> Result<()>;
}

/// Command-line driver for `ccov.py` (or any lcov-compatible tool).
#[derive(Clone, Debug)]
pub struct Ccov {
    exe: PathBuf,
    gcov_tool: String,
}

impl Ccov {
    pub fn new(exe: impl Into<PathBuf>, gcov_tool: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            gcov_tool: gcov_tool.into(),
        }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn command(&self) -> Command {
        Command::new(&self.exe)
    }
}

#[async_trait]
impl CoverageTool for Ccov {
    async fn capture(&self, dir: &Path, label: &str, output: &Path, log: &ToolLog) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-c")
            .arg(dir)
            .arg("-o")
            .arg(output)
            .arg("-t")
            .arg(label)
            .arg("--gcov-tool")
            .arg(&self.gcov_tool);

        run_checked(cmd, "ccov", "capture", log).await
    }

    async fn filter(
        &self,
        input: &Path,
        include: &str,
        output: &Path,
        log: &ToolLog,
    ) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-a").arg(input).arg("-e").arg(include).arg("-o").arg(output);

        run_checked(cmd, "ccov", "filter", log).await
    }

    async fn merge(&self, a: &Path, b: &Path, output: &Path, log: &ToolLog) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-a").arg(a).arg("-a").arg(b).arg("-o").arg(output);

        run_checked(cmd, "ccov", "merge", log).await
    }
}
