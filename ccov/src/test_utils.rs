// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stand-ins for the external seams of the pipeline: build metadata,
//! transport, archive extraction and the coverage tool.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracefile::Tracefile;
use url::Url;

use crate::catalog::{
    Artifact, BuildMetadataSource, BuildSystem, Job, JobResult, JobRole, JobState,
};
use crate::error::CollectError;
use crate::extract::Extractor;
use crate::process::ToolLog;
use crate::tool::CoverageTool;
use crate::transport::ArtifactTransport;

pub const BUILD_SOURCE_ROOT: &str = "/builds/slave/try-linux64/build/src";

pub fn job(platform: &str, group: &str, type_symbol: &str) -> Job {
    Job {
        id: format!("{}-{}-{}", platform, group, type_symbol),
        platform: platform.to_owned(),
        build_option: "debug".to_owned(),
        group_symbol: group.to_owned(),
        type_symbol: type_symbol.to_owned(),
        state: JobState::Completed,
        result: JobResult::Success,
        role: JobRole::classify(type_symbol),
        build_system: BuildSystem::Buildbot,
    }
}

pub fn artifact(name: &str) -> Artifact {
    let location = Url::parse("https://example.com/artifacts/")
        .and_then(|base| base.join(name))
        .unwrap();

    Artifact {
        name: name.to_owned(),
        location,
    }
}

/// An in-memory build metadata service.
#[derive(Default)]
pub struct StaticSource {
    jobs: Vec<Job>,
    artifacts: HashMap<String, Vec<Artifact>>,
}

impl StaticSource {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            artifacts: HashMap::new(),
        }
    }

    pub fn with_artifacts(mut self, job: &Job, artifacts: Vec<Artifact>) -> Self {
        self.artifacts.insert(job.id.clone(), artifacts);
        self
    }

    pub fn add(&mut self, job: Job, artifacts: Vec<Artifact>) {
        self.artifacts.insert(job.id.clone(), artifacts);
        self.jobs.push(job);
    }
}

#[async_trait]
impl BuildMetadataSource for StaticSource {
    async fn jobs(&self, _revision: &str) -> Result<Vec<Job>> {
        Ok(self.jobs.clone())
    }

    async fn artifacts(&self, job: &Job) -> Result<Vec<Artifact>> {
        Ok(self.artifacts.get(&job.id).cloned().unwrap_or_default())
    }
}

/// Treats an "archive" as a directory and copies its contents.
pub struct CopyExtractor;

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src).with_context(|| format!("no archive {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

fn write_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "")?;
    Ok(())
}

/// Artifacts are directories standing in for zip archives, addressed by
/// `file://` locations.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact(&self, key: &str, name: &str) -> Result<(PathBuf, Artifact)> {
        // Artifact names may be paths; the store keeps them flat.
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let dir = self.root.join(key).join(file_name);
        let location = Url::from_directory_path(&dir)
            .map_err(|_| format_err!("not an absolute path: {}", dir.display()))?;
        Ok((
            dir,
            Artifact {
                name: name.to_owned(),
                location,
            },
        ))
    }

    /// A notes archive holding `<source>.gcno` for each source.
    pub fn notes(&self, key: &str, name: &str, sources: &[&str]) -> Result<Artifact> {
        let (dir, artifact) = self.artifact(key, name)?;
        for source in sources {
            write_file(&dir.join(format!("{}.gcno", source)))?;
        }
        Ok(artifact)
    }

    /// A counts archive nesting `<source>.gcda` under `builds/obj`.
    pub fn counts(&self, key: &str, name: &str, sources: &[&str]) -> Result<Artifact> {
        let (dir, artifact) = self.artifact(key, name)?;
        for source in sources {
            write_file(&dir.join("builds/obj").join(format!("{}.gcda", source)))?;
        }
        Ok(artifact)
    }

    /// An archive without a single entry.
    pub fn empty(&self, key: &str, name: &str) -> Result<Artifact> {
        let (dir, artifact) = self.artifact(key, name)?;
        std::fs::create_dir_all(dir)?;
        Ok(artifact)
    }
}

/// Copies directory "archives" from `file://` locations.
#[derive(Default)]
pub struct DirTransport {
    failing: HashSet<String>,
    fetches: AtomicUsize,
}

impl DirTransport {
    /// Fail every fetch of an archive whose file name is in `names`.
    pub fn failing_on(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactTransport for DirTransport {
    async fn fetch(&self, location: &Url, dst: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let src = location
            .to_file_path()
            .map_err(|_| format_err!("not a file url: {}", location))?;
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            bail!("connection reset fetching {}", name);
        }

        copy_tree(&src, dst)
    }
}

#[async_trait]
impl Extractor for CopyExtractor {
    async fn extract(&self, archive: &Path, dst: &Path, _log: &ToolLog) -> Result<()> {
        copy_tree(archive, dst)
    }
}

/// Stand-in for `ccov.py`.
///
/// `capture` emits one record per counts file that has matching notes,
/// `filter` keeps records by source prefix, and `merge` sums with
/// [`Tracefile::merge`].
#[derive(Default)]
pub struct StubTool {
    fail_capture: Option<String>,
    fail_filter: bool,
    fail_merge: bool,
    merge_output: Option<String>,
    captured: Mutex<Vec<PathBuf>>,
    labels: Mutex<Vec<String>>,
    captures: AtomicUsize,
    merges: AtomicUsize,
    invocations: AtomicUsize,
}

impl StubTool {
    /// Fail `capture` for the test named `label` only.
    pub fn failing_capture(label: &str) -> Self {
        Self {
            fail_capture: Some(label.to_owned()),
            ..Self::default()
        }
    }

    pub fn failing_filter() -> Self {
        Self {
            fail_filter: true,
            ..Self::default()
        }
    }

    pub fn failing_merge() -> Self {
        Self {
            fail_merge: true,
            ..Self::default()
        }
    }

    /// Write `text` as the output of every merge, whatever the inputs.
    pub fn merging_into(text: &str) -> Self {
        Self {
            merge_output: Some(text.to_owned()),
            ..Self::default()
        }
    }

    pub fn captured_dirs(&self) -> Vec<PathBuf> {
        self.captured.lock().unwrap().clone()
    }

    /// Labels of successful captures, in call order.
    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn failure(step: &str) -> anyhow::Error {
        CollectError::ExternalToolFailure {
            tool: "ccov".to_owned(),
            step: step.to_owned(),
            status: "exit code 1".to_owned(),
        }
        .into()
    }
}

fn counts_files(root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            counts_files(root, &path, found)?;
        } else if path.extension().map_or(false, |e| e == "gcda")
            && path.with_extension("gcno").exists()
        {
            found.push(path.strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(())
}

#[async_trait]
impl CoverageTool for StubTool {
    async fn capture(&self, dir: &Path, label: &str, output: &Path, _log: &ToolLog) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.captured.lock().unwrap().push(dir.to_path_buf());
        if self.fail_capture.as_deref() == Some(label) {
            return Err(Self::failure("capture"));
        }

        let mut found = vec![];
        counts_files(dir, dir, &mut found)?;
        found.sort();

        let mut text = format!("TN:{}\nSF:/usr/include/c++/vector\nDA:1,1\nend_of_record\n", label);
        for relative in found {
            let source = relative.with_extension("cpp");
            text.push_str(&format!(
                "TN:{}\nSF:{}/{}\nDA:1,1\nend_of_record\n",
                label,
                BUILD_SOURCE_ROOT,
                source.display()
            ));
        }

        std::fs::write(output, text)?;
        self.labels.lock().unwrap().push(label.to_owned());
        Ok(())
    }

    async fn filter(
        &self,
        input: &Path,
        include: &str,
        output: &Path,
        _log: &ToolLog,
    ) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail_filter {
            return Err(Self::failure("filter"));
        }

        let prefix = include.trim_end_matches('*');
        let text = std::fs::read_to_string(input)?;

        let mut kept = String::new();
        let mut record = String::new();
        let mut keep = false;
        for line in text.lines() {
            record.push_str(line);
            record.push('\n');
            if let Some(source) = line.strip_prefix("SF:") {
                keep = source.starts_with(prefix);
            }
            if line == "end_of_record" {
                if keep {
                    kept.push_str(&record);
                }
                record.clear();
                keep = false;
            }
        }

        std::fs::write(output, kept)?;
        Ok(())
    }

    async fn merge(&self, a: &Path, b: &Path, output: &Path, _log: &ToolLog) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.fail_merge {
            return Err(Self::failure("merge"));
        }
        if let Some(text) = &self.merge_output {
            std::fs::write(output, text)?;
            return Ok(());
        }

        let mut total = Tracefile::parse(&std::fs::read_to_string(a)?)?;
        total.merge(&Tracefile::parse(&std::fs::read_to_string(b)?)?);
        std::fs::write(output, total.to_text())?;
        Ok(())
    }
}
