// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use ccov::catalog::{ArtifactCatalog, BuildSystem, JobResult};
use ccov::error::CollectError;
use ccov::identity::{IdentityTable, TestIdentityResolver};
use ccov::test_utils::{job, ArtifactStore, CopyExtractor, DirTransport, StaticSource, StubTool};
use ccov_collect_lib::config::CollectConfig;
use ccov_collect_lib::pipeline::{
    BucketReport, BucketState, JobOutcome, JobReport, PipelineDriver, RunReport,
};
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};
use tracefile::{Summary, Tracefile};

const REVISION: &str = "abcdef012345";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    dir: TempDir,
    store: ArtifactStore,
    source: StaticSource,
}

impl Harness {
    fn new() -> Result<Self> {
        init_logging();
        let dir = tempdir()?;
        let store = ArtifactStore::new(dir.path().join("store"));
        Ok(Self {
            dir,
            store,
            source: StaticSource::default(),
        })
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    /// A linux64 push: a builder, two single-archive suites, a job with an
    /// extra archive, and a job nobody knows.
    fn linux64(&mut self) -> Result<()> {
        let sources = ["dom/nsDocument", "js/jsapi", "layout/nsFrame"];

        let builder = job("linux64", "?", "B");
        let notes = self.store.notes(&builder.id, "firefox.code-coverage-gcno.zip", &sources)?;
        self.source.add(builder, vec![notes]);

        let crashtest = job("linux64", "R", "C");
        let counts = self.store.counts(&crashtest.id, "code-coverage-gcda.zip", &sources[..2])?;
        self.source.add(crashtest, vec![counts]);

        let xpcshell = job("linux64", "?", "X");
        let counts = self.store.counts(&xpcshell.id, "code-coverage-gcda.zip", &sources)?;
        self.source.add(xpcshell, vec![counts]);

        let browser = job("linux64", "M", "bc2");
        let first = self.store.counts(&browser.id, "code-coverage-gcda-1.zip", &sources)?;
        let second = self.store.counts(&browser.id, "code-coverage-gcda-2.zip", &sources)?;
        self.source.add(browser, vec![first, second]);

        let unknown = job("linux64", "Q", "zz");
        let counts = self.store.counts(&unknown.id, "code-coverage-gcda.zip", &sources)?;
        self.source.add(unknown, vec![counts]);

        Ok(())
    }

    fn driver(
        self,
        transport: Arc<DirTransport>,
        tool: Arc<StubTool>,
    ) -> Result<(TempDir, PipelineDriver)> {
        let config = CollectConfig::new(self.output(), "ccov.py")?;
        let driver = PipelineDriver::new(
            config,
            ArtifactCatalog::new(self.source),
            TestIdentityResolver::new(IdentityTable::builtin()),
            transport,
            tool,
            Arc::new(CopyExtractor),
        )?;
        Ok((self.dir, driver))
    }
}

fn bucket<'a>(report: &'a RunReport, key: &str) -> &'a BucketReport {
    report
        .buckets
        .iter()
        .find(|b| b.key == key)
        .unwrap_or_else(|| panic!("no bucket {}", key))
}

fn job_report<'a>(report: &'a RunReport, key: &str, symbol: &str) -> &'a JobReport {
    bucket(report, key)
        .jobs
        .iter()
        .find(|j| j.symbol == symbol)
        .unwrap_or_else(|| panic!("no job {} in {}", symbol, key))
}

fn skip_reason<'a>(report: &'a RunReport, key: &str, symbol: &str) -> Option<&'a str> {
    match &job_report(report, key, symbol).outcome {
        JobOutcome::Skipped { reason } => Some(reason.as_str()),
        JobOutcome::Fragments { .. } => None,
    }
}

fn read_tracefile(path: &Path) -> Result<Tracefile> {
    Tracefile::parse(&std::fs::read_to_string(path)?)
}

#[tokio::test]
async fn test_collect_revision() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;
    let output = harness.output();

    let transport = Arc::new(DirTransport::default());
    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(transport.clone(), tool.clone())?;

    let report = driver.run(REVISION).await?;

    let linux64 = bucket(&report, "linux64-debug");
    assert_eq!(linux64.state, BucketState::Done);
    assert_eq!(linux64.jobs.len(), 4);
    assert_eq!(linux64.skipped(), 2);

    // Extra archive: the job is skipped, its siblings are not.
    let mismatch = skip_reason(&report, "linux64-debug", "M-bc2").unwrap_or_default();
    assert!(mismatch.contains("mochitest-browser-chrome-2"), "{}", mismatch);
    assert!(
        mismatch.contains("expected 1 coverage artifacts, found 2"),
        "{}",
        mismatch
    );
    let unknown = skip_reason(&report, "linux64-debug", "Q-zz").unwrap_or_default();
    assert!(unknown.contains("unknown test identity"), "{}", unknown);

    let bucket_dir = output.join("linux64-debug");
    assert_eq!(
        report.fragments,
        vec![bucket_dir.join("crashtest.info"), bucket_dir.join("xpcshell.info")]
    );
    assert!(bucket_dir.join("gcno.zip").exists());
    assert!(bucket_dir.join("crashtest-code-coverage-gcda.zip").exists());
    assert!(bucket_dir.join("crashtest.log").exists());
    assert!(!bucket_dir.join("mochitest-browser-chrome-2.info").exists());

    assert_eq!(tool.labels(), vec!["crashtest", "xpcshell"]);
    assert_eq!(tool.merges(), 2);
    // Notes once, one archive per unpacked test.
    assert_eq!(transport.fetches(), 3);

    assert_eq!(report.aggregate, output.join("all.info"));
    let total = read_tracefile(&report.aggregate)?;
    let sources: Vec<_> = total.files.keys().map(String::as_str).collect();
    assert_eq!(
        sources,
        vec!["dom/nsDocument.cpp", "js/jsapi.cpp", "layout/nsFrame.cpp"]
    );
    assert_eq!(total.files["dom/nsDocument.cpp"].lines[&1], 2);
    assert_eq!(total.files["js/jsapi.cpp"].lines[&1], 2);
    assert_eq!(total.files["layout/nsFrame.cpp"].lines[&1], 1);
    assert_eq!(
        report.summary,
        Some(Summary {
            files: 3,
            lines_found: 3,
            lines_hit: 3,
        })
    );
    assert!(linux64
        .jobs
        .iter()
        .all(|j| j.build_system == BuildSystem::Buildbot));

    Ok(())
}

#[tokio::test]
async fn test_bucket_without_notes_is_skipped_once() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    // No builder uploaded notes for linux.
    for symbol in ["C", "R", "J"] {
        let test = job("linux", "R", symbol);
        let counts = harness
            .store
            .counts(&test.id, "code-coverage-gcda.zip", &["dom/nsDocument"])?;
        harness.source.add(test, vec![counts]);
    }
    let output = harness.output();

    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;
    let report = driver.run(REVISION).await?;

    let linux = bucket(&report, "linux-debug");
    assert_eq!(linux.state, BucketState::Failed);
    assert!(linux.jobs.is_empty());
    assert_eq!(linux.fragments().count(), 0);
    assert!(!output.join("linux-debug").exists());

    // The other platform is unaffected.
    assert_eq!(bucket(&report, "linux64-debug").fragments().count(), 2);
    assert_eq!(tool.captures(), 2);
    Ok(())
}

#[tokio::test]
async fn test_excluded_platforms() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let builder = job("android-api-11", "?", "B");
    let notes = harness
        .store
        .notes(&builder.id, "target.code-coverage-gcno.zip", &["dom/nsDocument"])?;
    harness.source.add(builder, vec![notes]);

    let mut busted = job("linux64-asan", "?", "B");
    busted.result = JobResult::Busted;
    harness.source.add(busted, vec![]);

    let transport = Arc::new(DirTransport::default());
    let (_dir, driver) = harness.driver(transport.clone(), Arc::new(StubTool::default()))?;
    let report = driver.run(REVISION).await?;

    assert_eq!(bucket(&report, "android-api-11-debug").state, BucketState::Excluded);
    assert_eq!(bucket(&report, "linux64-asan-debug").state, BucketState::Excluded);
    assert_eq!(report.fragments.len(), 2);
    assert_eq!(transport.fetches(), 3);
    Ok(())
}

#[tokio::test]
async fn test_rerun_reuses_downloads_and_fragments() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;
    let dir = harness.dir.path().to_path_buf();
    let source_jobs = std::mem::take(&mut harness.source);

    let transport = Arc::new(DirTransport::default());
    let tool = Arc::new(StubTool::default());
    let config = CollectConfig::new(dir.join("output"), "ccov.py")?;
    let driver = PipelineDriver::new(
        config,
        ArtifactCatalog::new(source_jobs),
        TestIdentityResolver::new(IdentityTable::builtin()),
        transport.clone(),
        tool.clone(),
        Arc::new(CopyExtractor),
    )?;

    let first = driver.run(REVISION).await?;
    let fetches = transport.fetches();
    let captures = tool.captures();

    let second = driver.run(REVISION).await?;
    assert_eq!(transport.fetches(), fetches);
    assert_eq!(tool.captures(), captures);
    assert_eq!(second.fragments, first.fragments);

    // The aggregate is rebuilt from scratch, not accumulated across runs.
    assert_eq!(second.summary, first.summary);
    assert_eq!(
        read_tracefile(&second.aggregate)?,
        read_tracefile(&first.aggregate)?
    );
    Ok(())
}

#[tokio::test]
async fn test_retriggered_job_contributes_once() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let mut retrigger = job("linux64", "R", "C");
    retrigger.id.push_str("-1");
    let counts = harness
        .store
        .counts(&retrigger.id, "code-coverage-gcda.zip", &["layout/nsFrame"])?;
    harness.source.add(retrigger, vec![counts]);

    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;
    let report = driver.run(REVISION).await?;

    assert_eq!(report.fragments.len(), 2);
    assert_eq!(tool.merges(), 2);
    Ok(())
}

#[tokio::test]
async fn test_counts_fetch_failure_skips_job() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let flaky = job("linux64", "R", "J");
    let counts = harness
        .store
        .counts(&flaky.id, "code-coverage-gcda-flaky.zip", &["dom/nsDocument"])?;
    harness.source.add(flaky, vec![counts]);

    let transport = Arc::new(DirTransport::failing_on(&["code-coverage-gcda-flaky.zip"]));
    let (_dir, driver) = harness.driver(transport, Arc::new(StubTool::default()))?;
    let report = driver.run(REVISION).await?;

    let reason = skip_reason(&report, "linux64-debug", "R-J").unwrap_or_default();
    assert!(reason.contains("unable to fetch"), "{}", reason);
    assert_eq!(report.fragments.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_notes_fetch_failure_is_fatal() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let transport = Arc::new(DirTransport::failing_on(&["firefox.code-coverage-gcno.zip"]));
    let (_dir, driver) = harness.driver(transport, Arc::new(StubTool::default()))?;

    let err = driver.run(REVISION).await.unwrap_err();
    assert!(matches!(
        CollectError::find(&err),
        Some(CollectError::TransportFailure { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_merge_failure_is_fatal() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let (_dir, driver) = harness.driver(
        Arc::new(DirTransport::default()),
        Arc::new(StubTool::failing_merge()),
    )?;

    let err = driver.run(REVISION).await.unwrap_err();
    assert!(matches!(
        CollectError::find(&err),
        Some(CollectError::ExternalToolFailure { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_empty_push() -> Result<()> {
    let harness = Harness::new()?;
    let output = harness.output();

    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;
    let report = driver.run(REVISION).await?;

    assert!(report.buckets.is_empty());
    assert_eq!(tool.merges(), 0);
    assert_eq!(std::fs::read_to_string(output.join("all.info"))?, "");
    assert_eq!(report.summary, Some(Summary::default()));
    Ok(())
}

#[tokio::test]
async fn test_partial_job_keeps_good_fragments() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;
    let output = harness.output();

    // Pairs with mochitest-a11y, mochitest-plugins and mochitest-chrome.
    let other = job("linux64", "M", "oth");
    let a11y = harness.store.counts(
        &other.id,
        "code-coverage-gcda-1.zip",
        &["dom/nsDocument", "js/jsapi"],
    )?;
    let plugins = harness.store.counts(
        &other.id,
        "code-coverage-gcda-2.zip",
        &["dom/nsDocument", "layout/nsFrame"],
    )?;
    let chrome = harness.store.empty(&other.id, "code-coverage-gcda.zip")?;
    harness.source.add(other, vec![chrome, a11y, plugins]);

    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;

    let bucket_dir = output.join("linux64-debug");
    let expected = vec![
        bucket_dir.join("crashtest.info"),
        bucket_dir.join("xpcshell.info"),
        bucket_dir.join("mochitest-a11y.info"),
        bucket_dir.join("mochitest-plugins.info"),
    ];

    for _ in 0..2 {
        let report = driver.run(REVISION).await?;

        match &job_report(&report, "linux64-debug", "M-oth").outcome {
            JobOutcome::Fragments { fragments, failed } => {
                assert_eq!(fragments, &expected[2..]);
                assert_eq!(failed, &vec!["mochitest-chrome".to_owned()]);
            }
            JobOutcome::Skipped { reason } => panic!("M-oth skipped: {}", reason),
        }
        assert_eq!(report.fragments, expected);
        assert!(!bucket_dir.join("mochitest-chrome.info").exists());
    }

    assert_eq!(tool.merges(), 8);
    Ok(())
}

#[tokio::test]
async fn test_capture_failure_skips_only_that_job() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;
    let output = harness.output();

    let tool = Arc::new(StubTool::failing_capture("crashtest"));
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;
    let report = driver.run(REVISION).await?;

    let reason = skip_reason(&report, "linux64-debug", "R-C").unwrap_or_default();
    assert!(reason.contains("ccov capture failed"), "{}", reason);
    assert!(
        reason.contains("unable to compute coverage for crashtest"),
        "{}",
        reason
    );

    assert_eq!(
        report.fragments,
        vec![output.join("linux64-debug").join("xpcshell.info")]
    );
    assert_eq!(tool.labels(), vec!["xpcshell"]);
    assert_eq!(bucket(&report, "linux64-debug").state, BucketState::Done);
    Ok(())
}

#[tokio::test]
async fn test_empty_counts_archive_skips_job() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let jsreftest = job("linux64", "R", "J");
    let counts = harness.store.empty(&jsreftest.id, "code-coverage-gcda.zip")?;
    harness.source.add(jsreftest, vec![counts]);

    let tool = Arc::new(StubTool::default());
    let (_dir, driver) = harness.driver(Arc::new(DirTransport::default()), tool.clone())?;
    let report = driver.run(REVISION).await?;

    let reason = skip_reason(&report, "linux64-debug", "R-J").unwrap_or_default();
    assert!(reason.contains("artifact unpacked to an empty directory"), "{}", reason);
    assert_eq!(report.fragments.len(), 2);
    // The empty archive never reaches the coverage tool.
    assert_eq!(tool.labels(), vec!["crashtest", "xpcshell"]);
    Ok(())
}

#[tokio::test]
async fn test_job_without_counts_archives_is_skipped() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let reftest = job("linux64", "R", "R");
    let log = harness.store.empty(&reftest.id, "live_backing.log")?;
    harness.source.add(reftest, vec![log]);

    let transport = Arc::new(DirTransport::default());
    let (_dir, driver) = harness.driver(transport.clone(), Arc::new(StubTool::default()))?;
    let report = driver.run(REVISION).await?;

    assert_eq!(
        skip_reason(&report, "linux64-debug", "R-R"),
        Some("no coverage data")
    );
    assert_eq!(report.fragments.len(), 2);
    assert_eq!(transport.fetches(), 3);
    Ok(())
}

#[tokio::test]
async fn test_artifact_names_with_paths() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;
    let output = harness.output();

    let mut jsreftest = job("linux64", "R", "J");
    jsreftest.build_system = BuildSystem::Taskcluster;
    let counts = harness.store.counts(
        &jsreftest.id,
        "public/test_info/code-coverage-gcda.zip",
        &["dom/nsDocument", "js/jsapi"],
    )?;
    harness.source.add(jsreftest, vec![counts]);

    let (_dir, driver) = harness.driver(
        Arc::new(DirTransport::default()),
        Arc::new(StubTool::default()),
    )?;
    let report = driver.run(REVISION).await?;

    let bucket_dir = output.join("linux64-debug");
    assert!(bucket_dir.join("jsreftest-code-coverage-gcda.zip").exists());
    assert_eq!(report.fragments.len(), 3);
    assert_eq!(report.fragments[2], bucket_dir.join("jsreftest.info"));

    let jsreftest = job_report(&report, "linux64-debug", "R-J");
    assert_eq!(jsreftest.build_system, BuildSystem::Taskcluster);
    assert!(matches!(jsreftest.outcome, JobOutcome::Fragments { .. }));
    Ok(())
}

#[tokio::test]
async fn test_unreadable_aggregate_is_not_fatal() -> Result<()> {
    let mut harness = Harness::new()?;
    harness.linux64()?;

    let text = "SF:dom/nsDocument.cpp\nDA:1,-1\nend_of_record\n";
    let (_dir, driver) = harness.driver(
        Arc::new(DirTransport::default()),
        Arc::new(StubTool::merging_into(text)),
    )?;
    let report = driver.run(REVISION).await?;

    assert_eq!(report.summary, None);
    assert_eq!(report.fragments.len(), 2);
    assert_eq!(std::fs::read_to_string(&report.aggregate)?, text);
    Ok(())
}
