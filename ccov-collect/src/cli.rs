// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ccov::catalog::ArtifactCatalog;
use ccov::extract::Unzip;
use ccov::identity::TestIdentityResolver;
use ccov::tool::Ccov;
use ccov::transport::HttpTransport;
use clap::{crate_version, value_parser, Arg, ArgMatches, Command};

use crate::backend::{pushtree::PushTree, treeherder::Treeherder};
use crate::config::CollectConfig;
use crate::pipeline::{PipelineDriver, RunReport};

pub const REVISION: &str = "revision";
pub const USERNAME: &str = "username";
pub const OUTPUT_DIR: &str = "output_dir";
pub const CCOV_PATH: &str = "ccov_path";

pub fn args(name: &'static str) -> Command {
    Command::new(name)
        .version(crate_version!())
        .about("collect per-test coverage of a try push into one tracefile")
        .arg(
            Arg::new(REVISION)
                .required(true)
                .help("revision of the push to collect"),
        )
        .arg(
            Arg::new(USERNAME)
                .required(false)
                .help("pusher; reads the push directory <username>-<revision> on the archive server"),
        )
        .arg(
            Arg::new(OUTPUT_DIR)
                .short('o')
                .long("output-dir")
                .value_parser(value_parser!(PathBuf))
                .help("directory for downloads, fragments and the aggregate (default: <tmp>/output)"),
        )
        .arg(
            Arg::new(CCOV_PATH)
                .short('c')
                .long("ccov-path")
                .value_parser(value_parser!(PathBuf))
                .help("coverage tool (default: <exe dir>/../mozilla-coverage/ccov.py)"),
        )
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("output")
}

fn default_ccov_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("unable to locate the running executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| format_err!("executable has no parent directory"))?;
    Ok(dir.join("..").join("mozilla-coverage").join("ccov.py"))
}

/// Configuration from the command line alone, before environment overrides.
pub fn build_config(args: &ArgMatches) -> Result<CollectConfig> {
    let output_dir = args
        .get_one::<PathBuf>(OUTPUT_DIR)
        .cloned()
        .unwrap_or_else(default_output_dir);
    let ccov_path = match args.get_one::<PathBuf>(CCOV_PATH) {
        Some(path) => path.clone(),
        None => default_ccov_path()?,
    };

    CollectConfig::new(output_dir, ccov_path)
}

pub async fn run(args: &ArgMatches) -> Result<RunReport> {
    let revision = args
        .get_one::<String>(REVISION)
        .ok_or_else(|| format_err!("missing revision"))?;
    let username = args.get_one::<String>(USERNAME);

    let config = build_config(args)?.with_env()?;
    let table = config.load_identity_table().await?;

    let catalog = match username {
        Some(username) => {
            info!("collecting {} pushed by {}", revision, username);
            ArtifactCatalog::new(PushTree::new(config.archive_url.clone(), username))
        }
        None => {
            info!("collecting {} from {}", revision, config.treeherder_url);
            ArtifactCatalog::new(Treeherder::new(
                config.treeherder_url.clone(),
                config.repository.clone(),
            ))
        }
    };
    let tool = Arc::new(Ccov::new(
        config.ccov_path.clone(),
        config.gcov_tool.clone(),
    ));

    let driver = PipelineDriver::new(
        config,
        catalog,
        TestIdentityResolver::new(table),
        Arc::new(HttpTransport::default()),
        tool,
        Arc::new(Unzip::default()),
    )?;

    driver.run(revision).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_positionals() -> Result<()> {
        let matches = args("ccov-collect").try_get_matches_from(["ccov-collect", "abcdef"])?;
        assert_eq!(
            matches.get_one::<String>(REVISION).map(String::as_str),
            Some("abcdef")
        );
        assert!(matches.get_one::<String>(USERNAME).is_none());

        let matches =
            args("ccov-collect").try_get_matches_from(["ccov-collect", "abcdef", "jdoe"])?;
        assert_eq!(
            matches.get_one::<String>(USERNAME).map(String::as_str),
            Some("jdoe")
        );
        Ok(())
    }

    #[test]
    fn test_argument_count_mismatch() {
        assert!(args("ccov-collect")
            .try_get_matches_from(["ccov-collect"])
            .is_err());
        assert!(args("ccov-collect")
            .try_get_matches_from(["ccov-collect", "abcdef", "jdoe", "extra"])
            .is_err());
    }

    #[test]
    fn test_build_config() -> Result<()> {
        let matches = args("ccov-collect").try_get_matches_from([
            "ccov-collect",
            "-o",
            "/data/coverage",
            "--ccov-path",
            "/opt/ccov.py",
            "abcdef",
        ])?;
        let config = build_config(&matches)?;
        assert_eq!(config.output_dir, PathBuf::from("/data/coverage"));
        assert_eq!(config.ccov_path, PathBuf::from("/opt/ccov.py"));

        let matches = args("ccov-collect").try_get_matches_from(["ccov-collect", "abcdef"])?;
        let config = build_config(&matches)?;
        assert_eq!(config.output_dir, std::env::temp_dir().join("output"));
        assert!(config.ccov_path.ends_with("mozilla-coverage/ccov.py"));
        Ok(())
    }
}
