// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::io::BufRead;

use anyhow::{format_err, Context, Result};

/// Counts of instrumented and executed lines in a tracefile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files: usize,
    pub lines_found: usize,
    pub lines_hit: usize,
}

impl Summary {
    /// Summarize a tracefile without materializing it.
    ///
    /// Only per-record state is held, so this is safe to run over an
    /// aggregate of any size. Records repeating a source file are counted
    /// independently; merged tracefiles never repeat one.
    pub fn scan(reader: impl BufRead) -> Result<Self> {
        let mut summary = Summary::default();
        let mut lines: BTreeMap<u32, bool> = BTreeMap::new();
        let mut in_record = false;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();

            if line.starts_with("SF:") {
                in_record = true;
                lines.clear();
            } else if line == "end_of_record" {
                if in_record {
                    summary.files += 1;
                    summary.lines_found += lines.len();
                    summary.lines_hit += lines.values().filter(|&&hit| hit).count();
                }
                in_record = false;
            } else if let Some(value) = line.strip_prefix("DA:") {
                let (line_no, hit) = parse_da(value)
                    .with_context(|| format!("line {}: invalid DA entry {:?}", index + 1, value))?;
                *lines.entry(line_no).or_insert(false) |= hit;
            }
        }

        Ok(summary)
    }
}

fn parse_da(value: &str) -> Result<(u32, bool)> {
    let mut parts = value.split(',');
    let line: u32 = parts
        .next()
        .ok_or_else(|| format_err!("missing line"))?
        .parse()?;
    let hits: u64 = parts
        .next()
        .ok_or_else(|| format_err!("missing count"))?
        .parse()?;
    Ok((line, hits > 0))
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "files:{} lines_found:{} lines_hit:{}",
            self.files, self.lines_found, self.lines_hit
        )
    }
}
