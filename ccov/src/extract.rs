// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

use crate::process::{run_checked, ToolLog};

/// Unpacks an archive into an existing directory, overwriting files that
/// are already present.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, archive: &Path, dst: &Path, log: &ToolLog) -> Result<()>;
}

/// Extracts zip archives with the `unzip` program.
#[derive(Clone, Debug)]
pub struct Unzip {
    exe: PathBuf,
}

impl Default for Unzip {
    fn default() -> Self {
        Self::new("unzip")
    }
}

impl Unzip {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

#[async_trait]
impl Extractor for Unzip {
    async fn extract(&self, archive: &Path, dst: &Path, log: &ToolLog) -> Result<()> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("-o").arg("-q").arg(archive).arg("-d").arg(dst);

        run_checked(cmd, "unzip", "extract", log).await
    }
}
