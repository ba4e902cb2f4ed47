// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{fs, task::spawn_blocking};
use tracefile::Summary;

use crate::process::ToolLog;
use crate::tool::CoverageTool;

/// The run-wide tracefile every fragment is folded into.
pub struct MasterAggregate {
    /// Absolute path to the aggregate tracefile.
    ///
    /// May not yet exist on disk.
    path: PathBuf,
}

impl MasterAggregate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate to an empty, valid tracefile.
    pub async fn reset(&self) -> Result<()> {
        fs::write(self.path(), "")
            .await
            .with_context(|| format!("unable to create {}", self.path.display()))
    }

    pub async fn summary(&self) -> Result<Summary> {
        let path = self.path.clone();
        spawn_blocking(move || -> Result<Summary> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("unable to open {}", path.display()))?;
            Summary::scan(std::io::BufReader::new(file))
        })
        .await?
    }
}

/// Folds fragments into a [`MasterAggregate`] one at a time.
///
/// Each step hands the tool only the running aggregate and one fragment, so
/// peak memory is bounded by their sizes rather than by the whole run.
pub struct IncrementalMerger {
    tool: Arc<dyn CoverageTool>,
}

impl IncrementalMerger {
    pub fn new(tool: Arc<dyn CoverageTool>) -> Self {
        Self { tool }
    }

    /// Any failing step fails the whole merge; the aggregate is then invalid.
    pub async fn merge_all(
        &self,
        fragments: &[PathBuf],
        aggregate: &MasterAggregate,
        log: &ToolLog,
    ) -> Result<()> {
        aggregate.reset().await?;

        let total = fragments.len();
        for (index, fragment) in fragments.iter().enumerate() {
            info!(
                "merging fragment {}/{}: {}",
                index + 1,
                total,
                fragment.display()
            );
            self.tool
                .merge(aggregate.path(), fragment, aggregate.path(), log)
                .await
                .with_context(|| format!("unable to merge {}", fragment.display()))?;
        }

        Ok(())
    }
}
