// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use strum_macros::{Display, EnumString};
use url::Url;

use crate::error::CollectError;

/// Accepted suffixes of the notes archive, in order of preference.
pub const NOTES_EXTS: &[&str] = &["code-coverage-gcno.zip", "code-coverage-gcno.nzip"];

/// Type symbol of build jobs.
pub const BUILDER_SYMBOL: &str = "B";

lazy_static! {
    static ref COUNTS_ARCHIVE: Regex = Regex::new(r"gcda.*\.zip$").unwrap();
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Completed,
    Pending,
    Running,
    Other,
}

impl JobState {
    pub fn parse(value: &str) -> Self {
        value.parse().unwrap_or(JobState::Other)
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum JobResult {
    Success,
    TestFailed,
    Busted,
    Exception,
    Retry,
    UserCancel,
    Unknown,
}

impl JobResult {
    pub fn parse(value: &str) -> Self {
        value.parse().unwrap_or(JobResult::Unknown)
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum JobRole {
    /// Produces the notes archive of its platform.
    Builder,

    /// Produces execution-count archives.
    Test,
}

impl JobRole {
    pub fn classify(type_symbol: &str) -> Self {
        if type_symbol == BUILDER_SYMBOL {
            JobRole::Builder
        } else {
            JobRole::Test
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BuildSystem {
    Buildbot,
    Taskcluster,
}

impl BuildSystem {
    pub fn parse(value: &str) -> Self {
        value.parse().unwrap_or(BuildSystem::Buildbot)
    }
}

/// One build-farm execution, as reported by a [`BuildMetadataSource`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    /// Backend-specific identifier, opaque to the pipeline.
    pub id: String,
    pub platform: String,
    pub build_option: String,
    pub group_symbol: String,
    pub type_symbol: String,
    pub state: JobState,
    pub result: JobResult,
    pub role: JobRole,
    pub build_system: BuildSystem,
}

impl Job {
    /// Symbol shown on the dashboard, e.g. `M-bc2`, or `?-X` for ungrouped
    /// jobs.
    pub fn short_symbol(&self) -> String {
        if self.group_symbol.is_empty() {
            self.type_symbol.clone()
        } else {
            format!("{}-{}", self.group_symbol, self.type_symbol)
        }
    }

    pub fn bucket_key(&self) -> String {
        format!("{}-{}", self.platform, self.build_option)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.bucket_key(), self.short_symbol())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub location: Url,
}

/// Where jobs and their uploaded artifacts come from.
///
/// Implementations hide the shape of the backend (paginated result sets,
/// nested push trees, ...). Calls are not retried.
#[async_trait]
pub trait BuildMetadataSource: Send + Sync {
    async fn jobs(&self, revision: &str) -> Result<Vec<Job>>;

    /// Every artifact the job uploaded, in any order.
    async fn artifacts(&self, job: &Job) -> Result<Vec<Artifact>>;
}

/// All jobs of one `(platform, build option)` pair.
#[derive(Clone, Debug)]
pub struct PlatformBucket {
    pub platform: String,
    pub build_option: String,
    pub jobs: Vec<Job>,
}

impl PlatformBucket {
    pub fn key(&self) -> String {
        format!("{}-{}", self.platform, self.build_option)
    }

    pub fn builders(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.role == JobRole::Builder)
    }

    pub fn tests(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.role == JobRole::Test)
    }

    pub fn is_busted(&self) -> bool {
        self.jobs.iter().any(|j| j.result == JobResult::Busted)
    }
}

/// Group jobs by bucket. Buckets are ordered by key; jobs keep their order.
pub fn group_buckets(jobs: impl IntoIterator<Item = Job>) -> Vec<PlatformBucket> {
    let mut buckets: BTreeMap<(String, String), Vec<Job>> = BTreeMap::new();

    for job in jobs {
        buckets
            .entry((job.platform.clone(), job.build_option.clone()))
            .or_default()
            .push(job);
    }

    buckets
        .into_iter()
        .map(|((platform, build_option), jobs)| PlatformBucket {
            platform,
            build_option,
            jobs,
        })
        .collect()
}

pub fn is_notes_artifact(name: &str) -> bool {
    NOTES_EXTS.iter().any(|ext| name.ends_with(ext))
}

pub fn is_counts_artifact(name: &str) -> bool {
    COUNTS_ARCHIVE.is_match(name)
}

/// Coverage artifact lookup on top of a [`BuildMetadataSource`].
pub struct ArtifactCatalog {
    source: Box<dyn BuildMetadataSource>,
}

impl ArtifactCatalog {
    pub fn new(source: impl BuildMetadataSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Completed jobs of `revision`, grouped into platform buckets.
    pub async fn buckets(&self, revision: &str) -> Result<Vec<PlatformBucket>> {
        let jobs = self.source.jobs(revision).await?;
        let total = jobs.len();

        let completed = jobs.into_iter().filter(|job| {
            let done = job.state == JobState::Completed;
            if !done {
                info!("{} has not completed ({}), ignoring", job, job.state);
            }
            done
        });
        let buckets = group_buckets(completed);

        info!(
            "found {} jobs in {} platform buckets for {}",
            total,
            buckets.len(),
            revision
        );
        Ok(buckets)
    }

    /// Execution-count archives of `job`, sorted by name.
    pub async fn list_artifacts(&self, job: &Job) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .source
            .artifacts(job)
            .await?
            .into_iter()
            .filter(|a| is_counts_artifact(&a.name))
            .collect();

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    /// The one notes archive uploaded by the builders of `bucket`.
    pub async fn find_notes(&self, bucket: &PlatformBucket) -> Result<Artifact> {
        let mut uploaded = vec![];
        for builder in bucket.builders() {
            match self.source.artifacts(builder).await {
                Ok(artifacts) => uploaded.extend(artifacts),
                Err(err) => warn!("unable to list artifacts of builder {}: {:?}", builder, err),
            }
        }

        select_notes(&bucket.key(), uploaded)
    }
}

fn select_notes(platform: &str, uploaded: Vec<Artifact>) -> Result<Artifact> {
    let mut candidates = 0;

    for ext in NOTES_EXTS {
        let mut matches: Vec<&Artifact> = uploaded.iter().filter(|a| a.name.ends_with(ext)).collect();

        if matches.len() == 1 {
            return Ok(matches.remove(0).clone());
        }

        candidates = candidates.max(matches.len());
    }

    Err(CollectError::MissingNotesArtifact {
        platform: platform.to_owned(),
        candidates,
    }
    .into())
}
