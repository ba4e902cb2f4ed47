// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use ccov::identity::IdentityTable;
use tracefile::SourceRewrite;
use url::Url;

/// Prefix of the environment variables that override configuration fields.
pub const ENV_PREFIX: &str = "CCOV_COLLECT_";

pub const DEFAULT_GCOV_TOOL: &str = "gcov-4.7";
pub const DEFAULT_REPOSITORY: &str = "try";
pub const DEFAULT_TREEHERDER_URL: &str = "https://treeherder.mozilla.org";
pub const DEFAULT_ARCHIVE_URL: &str = "https://ftp.mozilla.org/pub/firefox/try-builds/";
pub const DEFAULT_SOURCE_INCLUDE: &str = "/builds/*";
pub const DEFAULT_SOURCE_PREFIX: &str = "^/builds/slave/[^/]*/build/src/";
pub const DEFAULT_PLATFORM_DENYLIST: &[&str] = &["android*", "osx*", "*b2g*", "*mulet*"];

/// One denylist entry, written as a glob with `*` only at either end:
/// `android*` (prefix), `*b2g*` (substring), `*-asan` (suffix) or
/// `linux64-debug` (exact).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlatformPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl PlatformPattern {
    pub fn matches(&self, platform: &str) -> bool {
        match self {
            Self::Exact(value) => platform == value,
            Self::Prefix(value) => platform.starts_with(value.as_str()),
            Self::Suffix(value) => platform.ends_with(value.as_str()),
            Self::Contains(value) => platform.contains(value.as_str()),
        }
    }
}

impl FromStr for PlatformPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let leading = s.starts_with('*');
        let trailing = s.len() > 1 && s.ends_with('*');
        let inner = s.trim_matches('*');

        if inner.is_empty() {
            bail!("empty platform pattern: {:?}", s);
        }
        if inner.contains('*') {
            bail!("`*` is only allowed at either end of a platform pattern: {:?}", s);
        }

        let inner = inner.to_owned();
        Ok(match (leading, trailing) {
            (true, true) => Self::Contains(inner),
            (false, true) => Self::Prefix(inner),
            (true, false) => Self::Suffix(inner),
            (false, false) => Self::Exact(inner),
        })
    }
}

impl fmt::Display for PlatformPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exact(value) => write!(f, "{}", value),
            Self::Prefix(value) => write!(f, "{}*", value),
            Self::Suffix(value) => write!(f, "*{}", value),
            Self::Contains(value) => write!(f, "*{}*", value),
        }
    }
}

/// Platforms known not to produce usable coverage.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlatformDenylist(Vec<PlatformPattern>);

impl PlatformDenylist {
    /// Parse a comma-separated list of patterns. Blank entries are ignored.
    pub fn parse(list: &str) -> Result<Self> {
        let patterns = list
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(PlatformPattern::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(patterns))
    }

    /// The pattern that excludes `platform`, if any.
    pub fn denies(&self, platform: &str) -> Option<&PlatformPattern> {
        self.0.iter().find(|pattern| pattern.matches(platform))
    }

    pub fn patterns(&self) -> &[PlatformPattern] {
        &self.0
    }
}

/// Everything a collection run needs to know. Built once at startup and
/// handed to the driver; nothing is read from globals afterwards.
#[derive(Clone, Debug)]
pub struct CollectConfig {
    pub output_dir: PathBuf,
    pub ccov_path: PathBuf,
    pub gcov_tool: String,
    pub repository: String,
    pub treeherder_url: Url,
    pub archive_url: Url,
    pub platform_denylist: PlatformDenylist,
    pub source_include: String,

    /// Regex of the build-machine prefix stripped from source paths. `None`
    /// keeps paths as the coverage tool reported them.
    pub source_prefix: Option<String>,

    /// JSON file replacing the built-in identity table.
    pub identity_table: Option<PathBuf>,
}

impl CollectConfig {
    pub fn new(output_dir: impl Into<PathBuf>, ccov_path: impl Into<PathBuf>) -> Result<Self> {
        let platform_denylist = DEFAULT_PLATFORM_DENYLIST
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            output_dir: output_dir.into(),
            ccov_path: ccov_path.into(),
            gcov_tool: DEFAULT_GCOV_TOOL.to_owned(),
            repository: DEFAULT_REPOSITORY.to_owned(),
            treeherder_url: Url::parse(DEFAULT_TREEHERDER_URL)?,
            archive_url: Url::parse(DEFAULT_ARCHIVE_URL)?,
            platform_denylist: PlatformDenylist(platform_denylist),
            source_include: DEFAULT_SOURCE_INCLUDE.to_owned(),
            source_prefix: Some(DEFAULT_SOURCE_PREFIX.to_owned()),
            identity_table: None,
        })
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(std::env::vars())
    }

    /// Apply `CCOV_COLLECT_<FIELD>` overrides from `vars`. Unknown variables
    /// with the prefix are logged and ignored.
    pub fn with_overrides(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        for (key, value) in vars {
            let field = match key.strip_prefix(ENV_PREFIX) {
                Some(field) => field,
                None => continue,
            };

            debug!("configuration override {}={}", key, value);
            match field {
                "GCOV_TOOL" => self.gcov_tool = value,
                "REPOSITORY" => self.repository = value,
                "TREEHERDER_URL" => {
                    self.treeherder_url =
                        Url::parse(&value).with_context(|| format!("invalid {}", key))?
                }
                "ARCHIVE_URL" => {
                    self.archive_url = Url::parse(&value).with_context(|| format!("invalid {}", key))?
                }
                "PLATFORM_DENYLIST" => {
                    self.platform_denylist =
                        PlatformDenylist::parse(&value).with_context(|| format!("invalid {}", key))?
                }
                "SOURCE_INCLUDE" => self.source_include = value,
                "SOURCE_PREFIX" => {
                    self.source_prefix = if value.is_empty() { None } else { Some(value) }
                }
                "IDENTITY_TABLE" => self.identity_table = Some(PathBuf::from(value)),
                _ => warn!("ignoring unknown configuration variable {}", key),
            }
        }

        Ok(self)
    }

    pub fn source_rewrite(&self) -> Result<Option<SourceRewrite>> {
        self.source_prefix
            .as_deref()
            .map(|prefix| SourceRewrite::new(prefix, ""))
            .transpose()
    }

    pub async fn load_identity_table(&self) -> Result<IdentityTable> {
        match &self.identity_table {
            Some(path) => load_identity_table(path).await,
            None => Ok(IdentityTable::builtin()),
        }
    }
}

async fn load_identity_table(path: &Path) -> Result<IdentityTable> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read identity table {}", path.display()))?;
    let table = IdentityTable::from_json(&text)
        .with_context(|| format!("unable to parse identity table {}", path.display()))?;
    info!(
        "loaded {} test identities from {}",
        table.len(),
        path.display()
    );
    Ok(table)
}
