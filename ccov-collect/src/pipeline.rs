// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ccov::catalog::{Artifact, ArtifactCatalog, BuildSystem, Job, PlatformBucket};
use ccov::error::CollectError;
use ccov::extract::Extractor;
use ccov::identity::{TestIdentity, TestIdentityResolver};
use ccov::merge::{IncrementalMerger, MasterAggregate};
use ccov::process::ToolLog;
use ccov::tool::CoverageTool;
use ccov::transport::{fetch_once, ArtifactTransport, Fetched};
use ccov::unpack::{CoverageUnpacker, SourceFilter};
use strum_macros::Display;
use tokio::fs;
use tracefile::Summary;

use crate::config::CollectConfig;

/// Local name of a bucket's notes archive.
pub const NOTES_FILE: &str = "gcno.zip";

/// Name of the master aggregate in the output directory.
pub const AGGREGATE_FILE: &str = "all.info";

const AGGREGATE_LOG: &str = "all.log";

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum BucketState {
    /// Denylisted or busted; never entered discovery.
    Excluded,
    Discovering,
    NotesReady,
    ProcessingJob,
    Done,
    Failed,
}

/// What happened to one test job.
#[derive(Debug)]
pub enum JobOutcome {
    /// At least one of the job's archives produced a fragment. `failed`
    /// names the canonical names whose archive did not.
    Fragments {
        fragments: Vec<PathBuf>,
        failed: Vec<String>,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug)]
pub struct JobReport {
    pub symbol: String,
    pub build_system: BuildSystem,
    pub outcome: JobOutcome,
}

#[derive(Debug)]
pub struct BucketReport {
    pub key: String,
    pub state: BucketState,
    pub jobs: Vec<JobReport>,
}

impl BucketReport {
    fn new(key: String) -> Self {
        Self {
            key,
            state: BucketState::Discovering,
            jobs: vec![],
        }
    }

    fn transition(&mut self, state: BucketState) {
        debug!("{}: {} -> {}", self.key, self.state, state);
        self.state = state;
    }

    pub fn fragments(&self) -> impl Iterator<Item = &PathBuf> {
        self.jobs
            .iter()
            .filter_map(|job| match &job.outcome {
                JobOutcome::Fragments { fragments, .. } => Some(fragments),
                JobOutcome::Skipped { .. } => None,
            })
            .flatten()
    }

    pub fn skipped(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.outcome, JobOutcome::Skipped { .. }))
            .count()
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub buckets: Vec<BucketReport>,

    /// Fragments folded into the aggregate, in fold order.
    pub fragments: Vec<PathBuf>,
    pub aggregate: PathBuf,

    /// `None` if the aggregate could not be summarized.
    pub summary: Option<Summary>,
}

/// Drives one revision through discovery, unpacking and the final merge.
///
/// Buckets and jobs are processed one at a time. Failures local to a job
/// skip that job; a bucket without notes is skipped as a whole; failing to
/// enumerate jobs, to fetch a bucket's notes, or to merge aborts the run.
pub struct PipelineDriver {
    config: CollectConfig,
    catalog: ArtifactCatalog,
    resolver: TestIdentityResolver,
    transport: Arc<dyn ArtifactTransport>,
    unpacker: CoverageUnpacker,
    merger: IncrementalMerger,
}

impl PipelineDriver {
    pub fn new(
        config: CollectConfig,
        catalog: ArtifactCatalog,
        resolver: TestIdentityResolver,
        transport: Arc<dyn ArtifactTransport>,
        tool: Arc<dyn CoverageTool>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        let filter = SourceFilter {
            include: config.source_include.clone(),
            rewrite: config.source_rewrite()?,
        };

        Ok(Self {
            unpacker: CoverageUnpacker::new(tool.clone(), extractor, filter),
            merger: IncrementalMerger::new(tool),
            config,
            catalog,
            resolver,
            transport,
        })
    }

    pub async fn run(&self, revision: &str) -> Result<RunReport> {
        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("unable to create {}", output_dir.display()))?;

        let buckets = self
            .catalog
            .buckets(revision)
            .await
            .with_context(|| format!("unable to enumerate jobs for {}", revision))?;

        let mut reports = vec![];
        for bucket in &buckets {
            reports.push(self.process_bucket(bucket).await?);
        }

        // A retriggered job resolves to the same canonical name, and so to
        // the same fragment.
        let mut seen = HashSet::new();
        let fragments: Vec<PathBuf> = reports
            .iter()
            .flat_map(|report| report.fragments())
            .filter(|fragment| seen.insert(fragment.to_path_buf()))
            .cloned()
            .collect();

        let aggregate = MasterAggregate::new(output_dir.join(AGGREGATE_FILE));
        let log = ToolLog::create(output_dir.join(AGGREGATE_LOG)).await?;
        info!(
            "merging {} fragments into {}",
            fragments.len(),
            aggregate.path().display()
        );
        self.merger
            .merge_all(&fragments, &aggregate, &log)
            .await
            .context("unable to build the coverage aggregate")?;

        let summary = match aggregate.summary().await {
            Ok(summary) => {
                info!("coverage for {}: {}", revision, summary);
                Some(summary)
            }
            Err(err) => {
                warn!(
                    "unable to summarize {}: {:#}",
                    aggregate.path().display(),
                    err
                );
                None
            }
        };

        Ok(RunReport {
            buckets: reports,
            fragments,
            aggregate: aggregate.path().to_path_buf(),
            summary,
        })
    }

    async fn process_bucket(&self, bucket: &PlatformBucket) -> Result<BucketReport> {
        let mut report = BucketReport::new(bucket.key());

        if let Some(pattern) = self.config.platform_denylist.denies(&report.key) {
            warn!("skipping platform {}: denylisted by {}", report.key, pattern);
            report.state = BucketState::Excluded;
            return Ok(report);
        }

        if bucket.is_busted() {
            warn!("skipping platform {}: a job is busted", report.key);
            report.state = BucketState::Excluded;
            return Ok(report);
        }

        info!("processing platform {}", report.key);

        let notes = match self.catalog.find_notes(bucket).await {
            Ok(notes) => notes,
            Err(err) => {
                warn!("skipping platform {}: {:#}", report.key, err);
                report.transition(BucketState::Failed);
                return Ok(report);
            }
        };

        let dir = self.config.output_dir.join(&report.key);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("unable to create {}", dir.display()))?;

        let notes_path = dir.join(NOTES_FILE);
        let fetched = fetch_once(self.transport.as_ref(), &notes.location, &notes_path)
            .await
            .with_context(|| format!("unable to fetch notes for platform {}", report.key))?;
        if fetched == Fetched::Downloaded {
            let build_system = bucket.builders().next().map(|b| b.build_system);
            info!(
                "downloaded {} for {} ({})",
                notes.name,
                report.key,
                build_system.map_or_else(|| "unknown".to_owned(), |b| b.to_string())
            );
        }
        report.transition(BucketState::NotesReady);

        for job in bucket.tests() {
            report.transition(BucketState::ProcessingJob);
            let symbol = job.short_symbol();

            let outcome = self
                .process_job(&dir, &notes_path, job)
                .await
                .unwrap_or_else(|err| JobOutcome::Skipped {
                    reason: format!("{:#}", err),
                });
            if let JobOutcome::Skipped { reason } = &outcome {
                warn!("skipping {} ({}): {}", job, job.build_system, reason);
            }

            report.jobs.push(JobReport {
                symbol,
                build_system: job.build_system,
                outcome,
            });
        }

        report.transition(BucketState::Done);
        info!(
            "finished platform {}: {} fragments, {} jobs skipped",
            report.key,
            report.fragments().count(),
            report.skipped()
        );
        Ok(report)
    }

    async fn process_job(&self, dir: &Path, notes: &Path, job: &Job) -> Result<JobOutcome> {
        let identity = self.resolver.resolve(&job.short_symbol())?;
        debug!(
            "{} resolved to {:?} ({})",
            job, identity.names, identity.step
        );

        self.unpack_job(dir, notes, job, &identity)
            .await
            .with_context(|| format!("attempted {}", identity.names.join(", ")))
    }

    async fn unpack_job(
        &self,
        dir: &Path,
        notes: &Path,
        job: &Job,
        identity: &TestIdentity,
    ) -> Result<JobOutcome> {
        let artifacts = self.catalog.list_artifacts(job).await?;

        if artifacts.is_empty() {
            return Ok(JobOutcome::Skipped {
                reason: "no coverage data".to_owned(),
            });
        }

        if artifacts.len() != identity.names.len() {
            return Err(CollectError::ArtifactMismatch {
                expected: identity.names.len(),
                found: artifacts.len(),
            }
            .into());
        }

        // Archives of one job are independent: a broken one costs only its
        // own fragment.
        let mut fragments = vec![];
        let mut failed = vec![];
        let mut reasons = vec![];
        for (artifact, (name, label)) in artifacts.iter().zip(identity.pairs()) {
            match self.unpack_artifact(dir, notes, artifact, name, label).await {
                Ok(fragment) => fragments.push(fragment),
                Err(err) => {
                    warn!(
                        "unable to unpack {} of {} ({}) as {}: {:#}",
                        artifact.name, job, job.build_system, name, err
                    );
                    reasons.push(format!("{}: {:#}", name, err));
                    failed.push(name.to_owned());
                }
            }
        }

        if fragments.is_empty() {
            return Ok(JobOutcome::Skipped {
                reason: reasons.join("; "),
            });
        }

        Ok(JobOutcome::Fragments { fragments, failed })
    }

    async fn unpack_artifact(
        &self,
        dir: &Path,
        notes: &Path,
        artifact: &Artifact,
        name: &str,
        label: &str,
    ) -> Result<PathBuf> {
        let counts = dir.join(counts_file_name(name, &artifact.name));
        if fetch_once(self.transport.as_ref(), &artifact.location, &counts).await?
            == Fetched::Downloaded
        {
            info!("retrieved {} for test {}", artifact.name, name);
        }

        let fragment = dir.join(format!("{}.info", name));
        self.unpacker.unpack(&counts, notes, label, &fragment).await
    }
}

/// Local name of a counts archive. Backends may name artifacts by path, as
/// in `public/test_info/code-coverage-gcda.zip`; only the last segment is kept.
fn counts_file_name(name: &str, artifact: &str) -> String {
    let file_name = artifact.rsplit('/').next().unwrap_or(artifact);
    format!("{}-{}", name, file_name)
}
