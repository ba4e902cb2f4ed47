// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ccov::catalog::{
    Artifact, BuildMetadataSource, BuildSystem, Job, JobResult, JobRole, JobState,
};
use ccov::transport::ResponseExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// Jobs requested per page of the job list.
pub const PAGE_SIZE: usize = 2000;

const JOB_INFO: &str = "Job Info";
const ARTIFACT_UPLOADED: &str = "artifact uploaded";

#[derive(Debug, Deserialize)]
struct ResultSets {
    results: Vec<ResultSet>,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    id: u64,
}

/// Jobs come back as rows of values, named by `job_property_names`.
#[derive(Debug, Deserialize)]
struct JobPage {
    job_property_names: Vec<String>,
    results: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct JobInfo {
    blob: JobInfoBlob,
}

#[derive(Debug, Deserialize)]
struct JobInfoBlob {
    #[serde(default)]
    job_details: Vec<JobDetail>,
}

#[derive(Debug, Deserialize)]
struct JobDetail {
    title: Option<String>,
    value: Option<String>,
    url: Option<String>,
}

/// The result-set/job REST API of a Treeherder instance.
pub struct Treeherder {
    client: Client,
    base: Url,
    repository: String,
}

impl Treeherder {
    pub fn new(base: Url, repository: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base, repository)
    }

    pub fn with_client(client: Client, base: Url, repository: impl Into<String>) -> Self {
        Self {
            client,
            base,
            repository: repository.into(),
        }
    }

    fn endpoint(&self, name: &str, query: &[(&str, String)]) -> Result<Url> {
        let path = format!("api/project/{}/{}/", self.repository, name);
        let mut url = self.base.join(&path)?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("GET {}", url);
        let value = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request failed: {}", url))?
            .error_for_status_with_body()
            .await?
            .json()
            .await
            .with_context(|| format!("invalid response from {}", url))?;
        Ok(value)
    }

    async fn result_set_id(&self, revision: &str) -> Result<u64> {
        let url = self.endpoint("resultset", &[("revision", revision.to_owned())])?;
        let sets: ResultSets = self.get(url).await?;

        sets.results
            .first()
            .map(|set| set.id)
            .ok_or_else(|| format_err!("no result set for revision {}", revision))
    }
}

fn field<'a>(row: &'a HashMap<&str, &Value>, name: &str) -> Option<&'a Value> {
    row.get(name).copied().filter(|value| !value.is_null())
}

fn text(row: &HashMap<&str, &Value>, name: &str) -> String {
    match field(row, name) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_job(names: &[String], values: &[Value]) -> Result<Job> {
    let row: HashMap<&str, &Value> = names.iter().map(String::as_str).zip(values).collect();

    let id = match field(&row, "id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => bail!("job without an id"),
    };
    let type_symbol = text(&row, "job_type_symbol");

    Ok(Job {
        id,
        platform: text(&row, "platform"),
        build_option: text(&row, "platform_option"),
        group_symbol: text(&row, "job_group_symbol"),
        role: JobRole::classify(&type_symbol),
        type_symbol,
        state: JobState::parse(&text(&row, "state")),
        result: JobResult::parse(&text(&row, "result")),
        build_system: BuildSystem::parse(&text(&row, "build_system_type")),
    })
}

#[async_trait]
impl BuildMetadataSource for Treeherder {
    async fn jobs(&self, revision: &str) -> Result<Vec<Job>> {
        let result_set = self.result_set_id(revision).await?;
        info!("revision {} is result set {}", revision, result_set);

        let mut jobs = vec![];
        loop {
            let url = self.endpoint(
                "jobs",
                &[
                    ("count", PAGE_SIZE.to_string()),
                    ("offset", jobs.len().to_string()),
                    ("return_type", "list".to_owned()),
                    ("result_set_id", result_set.to_string()),
                ],
            )?;
            let page: JobPage = self.get(url).await?;
            let rows = page.results.len();

            for row in &page.results {
                jobs.push(parse_job(&page.job_property_names, row)?);
            }

            if rows < PAGE_SIZE {
                break;
            }
        }

        Ok(jobs)
    }

    async fn artifacts(&self, job: &Job) -> Result<Vec<Artifact>> {
        let url = self.endpoint(
            "artifact",
            &[("job_id", job.id.clone()), ("name", JOB_INFO.to_owned())],
        )?;
        let infos: Vec<JobInfo> = self.get(url).await?;

        let mut artifacts = vec![];
        for detail in infos.into_iter().flat_map(|info| info.blob.job_details) {
            if detail.title.as_deref() != Some(ARTIFACT_UPLOADED) {
                continue;
            }
            if let (Some(name), Some(url)) = (detail.value, detail.url) {
                let location = Url::parse(&url)
                    .with_context(|| format!("invalid location for artifact {} of {}", name, job))?;
                artifacts.push(Artifact { name, location });
            }
        }

        Ok(artifacts)
    }
}
