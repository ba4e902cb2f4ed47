// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolution of build-farm job symbols (e.g. `M-bc2`) to canonical test
//! suite names (e.g. `mochitest-browser-chrome-2`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::error::CollectError;

/// Group symbol the dashboard uses for jobs without a group.
pub const UNKNOWN_GROUP_MARKER: &str = "?";

lazy_static! {
    static ref NUMERIC_SUFFIX: Regex = Regex::new("^(.*?)-?([0-9]+)$").unwrap();
}

/// One row of the symbol table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(from = "RawEntry")]
pub enum IdentityEntry {
    /// One canonical name. `label` is what the coverage tool records as the
    /// test name, when it differs from the canonical name.
    Single { name: String, label: Option<String> },

    /// A job that uploads one archive per listed suite.
    ///
    /// With `rotate`, the first name is moved to the end before pairing:
    /// the unnumbered archive of such a group sorts after the numbered ones.
    Group { names: Vec<String>, rotate: bool },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Name(String),
    Names(Vec<String>),
    Single {
        name: String,
        label: Option<String>,
    },
    Group {
        names: Vec<String>,
        #[serde(default = "default_rotate")]
        rotate: bool,
    },
}

fn default_rotate() -> bool {
    true
}

impl From<RawEntry> for IdentityEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Name(name) => IdentityEntry::Single { name, label: None },
            RawEntry::Names(names) => IdentityEntry::Group {
                names,
                rotate: true,
            },
            RawEntry::Single { name, label } => IdentityEntry::Single { name, label },
            RawEntry::Group { names, rotate } => IdentityEntry::Group { names, rotate },
        }
    }
}

impl IdentityEntry {
    pub fn single(name: impl Into<String>) -> Self {
        IdentityEntry::Single {
            name: name.into(),
            label: None,
        }
    }

    pub fn group<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        IdentityEntry::Group {
            names: names.into_iter().map(Into::into).collect(),
            rotate: true,
        }
    }

    /// `(canonical name, test label)` pairs in artifact pairing order.
    fn pairs(&self, suffix: Option<&str>) -> Vec<(String, String)> {
        let with_suffix = |name: &str| match suffix {
            Some(digits) => format!("{}-{}", name, digits),
            None => name.to_owned(),
        };

        match self {
            IdentityEntry::Single { name, label } => {
                let label = label.as_deref().unwrap_or(name);
                vec![(with_suffix(name), label.to_owned())]
            }
            IdentityEntry::Group { names, rotate } => {
                let mut pairs: Vec<_> = names
                    .iter()
                    .map(|name| (with_suffix(name), name.clone()))
                    .collect();
                if *rotate && !pairs.is_empty() {
                    pairs.rotate_left(1);
                }
                pairs
            }
        }
    }
}

/// Immutable symbol → identity table.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct IdentityTable {
    entries: BTreeMap<String, IdentityEntry>,
}

impl IdentityTable {
    pub fn new(entries: impl IntoIterator<Item = (String, IdentityEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid identity table")
    }

    pub fn get(&self, symbol: &str) -> Option<&IdentityEntry> {
        self.entries.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Symbols of the try server test suites with coverage builds.
    pub fn builtin() -> Self {
        let single = [
            ("M", "mochitest"),
            ("M-bc", "mochitest-browser-chrome"),
            ("M-dt", "mochitest-devtools-chrome"),
            ("M-c", "mochitest-chrome"),
            ("M-a11y", "mochitest-a11y"),
            ("M-gl", "mochitest-gl"),
            ("M-jp", "mochitest-jetpack"),
            ("M-e10s", "mochitest-e10s"),
            ("R-R", "reftest"),
            ("R-Ru", "reftest-no-accel"),
            ("R-C", "crashtest"),
            ("R-J", "jsreftest"),
            ("X", "xpcshell"),
            ("Cpp", "cppunit"),
            ("Jit", "jittest"),
            ("GTest", "gtest"),
            ("Mn", "marionette"),
            ("W", "web-platform-tests"),
            ("W-Wr", "web-platform-tests-reftests"),
        ];

        let mut entries: Vec<(String, IdentityEntry)> = single
            .iter()
            .map(|(symbol, name)| (symbol.to_string(), IdentityEntry::single(*name)))
            .collect();

        entries.push((
            "M-oth".to_owned(),
            IdentityEntry::group(["mochitest-chrome", "mochitest-a11y", "mochitest-plugins"]),
        ));

        Self::new(entries)
    }
}

/// The step of the resolution chain that produced an identity.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ResolutionStep {
    /// The normalized symbol is a key of the table.
    Exact,

    /// `<prefix>[-]<digits>`, where `<prefix>` is a key of the table.
    NumericSuffix,
}

impl ResolutionStep {
    pub fn apply(self, table: &IdentityTable, symbol: &str) -> Option<TestIdentity> {
        let pairs = match self {
            ResolutionStep::Exact => table.get(symbol)?.pairs(None),
            ResolutionStep::NumericSuffix => {
                let captures = NUMERIC_SUFFIX.captures(symbol)?;
                let prefix = captures.get(1)?.as_str();
                let digits = captures.get(2)?.as_str();
                table.get(prefix)?.pairs(Some(digits))
            }
        };

        let (names, labels) = pairs.into_iter().unzip();

        Some(TestIdentity {
            symbol: symbol.to_owned(),
            names,
            labels,
            step: self,
        })
    }
}

/// Canonical names for one job, in the order they pair with the job's
/// coverage artifacts sorted by name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestIdentity {
    pub symbol: String,

    pub names: Vec<String>,

    /// Test name passed to the coverage tool, positionally matching `names`.
    pub labels: Vec<String>,

    pub step: ResolutionStep,
}

impl TestIdentity {
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.labels.iter().map(String::as_str))
    }
}

#[derive(Clone, Debug)]
pub struct TestIdentityResolver {
    table: IdentityTable,
}

impl TestIdentityResolver {
    pub fn new(table: IdentityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &IdentityTable {
        &self.table
    }

    /// Strip the unknown-group marker, so `?-X` resolves as `X`.
    pub fn normalize(symbol: &str) -> &str {
        symbol
            .strip_prefix(UNKNOWN_GROUP_MARKER)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(symbol)
    }

    pub fn resolve(&self, symbol: &str) -> Result<TestIdentity> {
        let normalized = Self::normalize(symbol);

        ResolutionStep::iter()
            .find_map(|step| step.apply(&self.table, normalized))
            .ok_or_else(|| {
                CollectError::UnknownTestIdentity {
                    symbol: symbol.to_owned(),
                }
                .into()
            })
    }
}
