// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{fs, task::spawn_blocking};
use tracefile::SourceRewrite;

use crate::extract::Extractor;
use crate::fs::{exists, find_build_root, persist, remove_files_named};
use crate::process::ToolLog;
use crate::tool::CoverageTool;

/// Counts file that sends gcov into an infinite loop.
pub const POISON_GCDA: &str = "jchuff.gcda";

const SCRATCH_SUFFIX: &str = "unpack-gcda";

/// Which source files a fragment keeps, and how their paths are normalized.
#[derive(Clone, Debug)]
pub struct SourceFilter {
    /// Glob of source paths to keep, e.g. `/builds/*`.
    pub include: String,

    /// Maps build-machine paths to repository-relative ones.
    pub rewrite: Option<SourceRewrite>,
}

pub struct CoverageUnpacker {
    tool: Arc<dyn CoverageTool>,
    extractor: Arc<dyn Extractor>,
    filter: SourceFilter,
}

impl CoverageUnpacker {
    pub fn new(
        tool: Arc<dyn CoverageTool>,
        extractor: Arc<dyn Extractor>,
        filter: SourceFilter,
    ) -> Self {
        Self {
            tool,
            extractor,
            filter,
        }
    }

    /// Produce the fragment for one counts archive at `fragment`.
    ///
    /// If `fragment` exists it is returned as-is. Tool output is written to
    /// `fragment` with a `.log` extension.
    pub async fn unpack(
        &self,
        counts: &Path,
        notes: &Path,
        label: &str,
        fragment: &Path,
    ) -> Result<PathBuf> {
        if exists(fragment).await? {
            debug!("reusing fragment {}", fragment.display());
            return Ok(fragment.to_path_buf());
        }

        let log = ToolLog::create(fragment.with_extension("log")).await?;
        let scratch = tempfile::Builder::new()
            .suffix(SCRATCH_SUFFIX)
            .tempdir()
            .context("unable to create scratch directory")?;

        let result = self
            .unpack_in(scratch.path(), counts, notes, label, fragment, &log)
            .await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            warn!(
                "unable to remove scratch directory {}: {}",
                scratch_path.display(),
                err
            );
        }

        result.with_context(|| format!("unable to compute coverage for {}", label))?;
        Ok(fragment.to_path_buf())
    }

    async fn unpack_in(
        &self,
        scratch: &Path,
        counts: &Path,
        notes: &Path,
        label: &str,
        fragment: &Path,
        log: &ToolLog,
    ) -> Result<()> {
        let unpacked = scratch.join("unpacked");
        fs::create_dir_all(&unpacked).await?;

        self.extractor
            .extract(counts, &unpacked, log)
            .await
            .with_context(|| format!("unable to extract {}", counts.display()))?;

        let build_root = find_build_root(&unpacked).await?;
        debug!("{}: build root is {}", label, build_root.display());

        self.extractor
            .extract(notes, &build_root, log)
            .await
            .with_context(|| format!("unable to extract {}", notes.display()))?;

        let removed = remove_files_named(&build_root, POISON_GCDA).await?;
        if removed > 0 {
            debug!("{}: removed {} {}", label, removed, POISON_GCDA);
        }

        let raw = scratch.join("raw.info");
        self.tool.capture(&build_root, label, &raw, log).await?;

        let filtered = scratch.join("filtered.info");
        self.tool
            .filter(&raw, &self.filter.include, &filtered, log)
            .await?;

        let finished = match &self.filter.rewrite {
            Some(rewrite) => {
                let rewritten = scratch.join("rewritten.info");
                rewrite_sources(rewrite.clone(), filtered, rewritten.clone()).await?;
                rewritten
            }
            None => filtered,
        };

        persist(&finished, fragment).await
    }
}

async fn rewrite_sources(rewrite: SourceRewrite, input: PathBuf, output: PathBuf) -> Result<()> {
    spawn_blocking(move || -> Result<()> {
        let reader = BufReader::new(std::fs::File::open(&input)?);
        let writer = BufWriter::new(std::fs::File::create(&output)?);
        let count = rewrite.apply(reader, writer)?;
        debug!(
            "rewrote {} source paths matching {}",
            count,
            rewrite.pattern()
        );
        Ok(())
    })
    .await?
}
