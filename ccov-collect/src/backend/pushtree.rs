// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ccov::catalog::{
    Artifact, BuildMetadataSource, BuildSystem, Job, JobResult, JobRole, JobState,
};
use ccov::transport::ResponseExt;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Name of the job listing inside a push directory.
pub const JOB_LISTING: &str = "jobs.json";

#[derive(Debug, Deserialize)]
struct PushDocument {
    platforms: Vec<PlatformNode>,
}

#[derive(Debug, Deserialize)]
struct PlatformNode {
    platform: String,
    build_option: String,
    #[serde(default)]
    groups: Vec<GroupNode>,
}

#[derive(Debug, Deserialize)]
struct GroupNode {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    jobs: Vec<JobNode>,
}

#[derive(Debug, Deserialize)]
struct JobNode {
    id: Option<String>,
    symbol: String,
    state: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    build_system: String,
    #[serde(default)]
    artifacts: Vec<ArtifactNode>,
}

#[derive(Debug, Deserialize)]
struct ArtifactNode {
    name: String,

    /// Absolute, or relative to the push directory.
    url: String,
}

/// A push directory on the archive server, `<archive>/<username>-<revision>/`,
/// whose `jobs.json` lists every job of the push as a platform/group/job
/// tree with the artifacts each job uploaded.
pub struct PushTree {
    client: Client,
    archive: Url,
    username: String,
    artifacts: Mutex<HashMap<String, Vec<Artifact>>>,
}

impl PushTree {
    pub fn new(archive: Url, username: impl Into<String>) -> Self {
        Self::with_client(Client::new(), archive, username)
    }

    pub fn with_client(client: Client, archive: Url, username: impl Into<String>) -> Self {
        Self {
            client,
            archive,
            username: username.into(),
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    pub fn push_url(&self, revision: &str) -> Result<Url> {
        let mut archive = self.archive.clone();
        if !archive.path().ends_with('/') {
            let path = format!("{}/", archive.path());
            archive.set_path(&path);
        }

        let dir = format!("{}-{}/", self.username, revision);
        archive
            .join(&dir)
            .with_context(|| format!("invalid push directory {}", dir))
    }

    async fn load(&self, url: &Url) -> Result<PushDocument> {
        let text = if url.scheme().eq_ignore_ascii_case("file") {
            let path = url
                .to_file_path()
                .map_err(|_| format_err!("invalid file url: {}", url))?;
            tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("unable to read {}", path.display()))?
        } else {
            self.client
                .get(url.clone())
                .send()
                .await
                .with_context(|| format!("request failed: {}", url))?
                .error_for_status_with_body()
                .await?
                .text()
                .await?
        };

        serde_json::from_str(&text).with_context(|| format!("invalid job listing {}", url))
    }
}

#[async_trait]
impl BuildMetadataSource for PushTree {
    async fn jobs(&self, revision: &str) -> Result<Vec<Job>> {
        let push = self.push_url(revision)?;
        let listing = push.join(JOB_LISTING)?;
        info!("loading jobs from {}", listing);
        let document = self.load(&listing).await?;

        let mut jobs = vec![];
        let mut uploaded = HashMap::new();

        for platform in document.platforms {
            for group in platform.groups {
                for (index, node) in group.jobs.into_iter().enumerate() {
                    let id = node.id.unwrap_or_else(|| {
                        format!(
                            "{}-{}-{}-{}-{}",
                            platform.platform, platform.build_option, group.symbol, node.symbol, index
                        )
                    });

                    let mut artifacts = vec![];
                    for artifact in node.artifacts {
                        let location = push.join(&artifact.url).with_context(|| {
                            format!("invalid location for artifact {}", artifact.name)
                        })?;
                        artifacts.push(Artifact {
                            name: artifact.name,
                            location,
                        });
                    }
                    uploaded.insert(id.clone(), artifacts);

                    jobs.push(Job {
                        id,
                        platform: platform.platform.clone(),
                        build_option: platform.build_option.clone(),
                        group_symbol: group.symbol.clone(),
                        role: JobRole::classify(&node.symbol),
                        type_symbol: node.symbol,
                        state: JobState::parse(&node.state),
                        result: JobResult::parse(&node.result),
                        build_system: BuildSystem::parse(&node.build_system),
                    });
                }
            }
        }

        self.artifacts
            .lock()
            .map_err(|_| format_err!("artifact index lock poisoned"))?
            .extend(uploaded);

        Ok(jobs)
    }

    async fn artifacts(&self, job: &Job) -> Result<Vec<Artifact>> {
        let index = self
            .artifacts
            .lock()
            .map_err(|_| format_err!("artifact index lock poisoned"))?;

        index
            .get(&job.id)
            .cloned()
            .ok_or_else(|| format_err!("unknown job {} ({})", job, job.id))
    }
}
