// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::BufRead;

use anyhow::{bail, format_err, Context, Result};

pub type SourceFile = String;
pub type HitCount = u64;

/// Parsed tracefile, keyed by source file.
///
/// Records for the same source file are combined on parse, so a tracefile
/// written back out always has exactly one record per file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tracefile {
    pub files: BTreeMap<SourceFile, FileRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileRecord {
    /// Value of the `TN:` line. Dropped when records of different tests are
    /// combined.
    pub test_name: Option<String>,

    /// Function name to `(line, hits)`.
    pub functions: BTreeMap<String, (u32, HitCount)>,

    /// `(line, block, branch)` to times taken. `None` encodes `-`, a branch
    /// whose block was never executed.
    pub branches: BTreeMap<(u32, u32, u32), Option<HitCount>>,

    /// Line number (1-indexed) to hits.
    pub lines: BTreeMap<u32, HitCount>,
}

impl FileRecord {
    pub fn merge(&mut self, other: &FileRecord) {
        if self.test_name != other.test_name {
            self.test_name = None;
        }

        for (name, (line, hits)) in &other.functions {
            let entry = self.functions.entry(name.clone()).or_insert((*line, 0));
            entry.1 += hits;
        }

        for (key, taken) in &other.branches {
            let entry = self.branches.entry(*key).or_insert(None);
            *entry = match (*entry, *taken) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            };
        }

        for (line, hits) in &other.lines {
            *self.lines.entry(*line).or_insert(0) += hits;
        }
    }

    pub fn lines_hit(&self) -> usize {
        self.lines.values().filter(|&&hits| hits > 0).count()
    }
}

impl Tracefile {
    pub fn parse(text: &str) -> Result<Self> {
        Self::read(text.as_bytes())
    }

    pub fn read(reader: impl BufRead) -> Result<Self> {
        let mut tracefile = Tracefile::default();
        let mut test_name: Option<String> = None;
        let mut current: Option<(SourceFile, FileRecord)> = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            let line_no = index + 1;

            if line.is_empty() {
                continue;
            }

            if line == "end_of_record" {
                let (file, record) = current
                    .take()
                    .ok_or_else(|| format_err!("line {}: end_of_record outside of record", line_no))?;
                tracefile.insert(file, record);
                continue;
            }

            let (tag, value) = match line.split_once(':') {
                Some(split) => split,
                None => bail!("line {}: expected `TAG:value`, got {:?}", line_no, line),
            };

            if tag == "TN" {
                test_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_owned())
                };
                continue;
            }

            if tag == "SF" {
                if current.is_some() {
                    bail!("line {}: SF inside unterminated record", line_no);
                }
                let record = FileRecord {
                    test_name: test_name.clone(),
                    ..FileRecord::default()
                };
                current = Some((value.to_owned(), record));
                continue;
            }

            let (_, record) = match current.as_mut() {
                Some(current) => current,
                // Unknown header lines (e.g. `VER:`) may precede the first record.
                None => continue,
            };

            parse_entry(record, tag, value)
                .with_context(|| format!("line {}: invalid {} entry {:?}", line_no, tag, value))?;
        }

        if let Some((file, _)) = current {
            bail!("unterminated record for source file {}", file);
        }

        Ok(tracefile)
    }

    fn insert(&mut self, file: SourceFile, record: FileRecord) {
        match self.files.get_mut(&file) {
            Some(existing) => existing.merge(&record),
            None => {
                self.files.insert(file, record);
            }
        }
    }

    /// Sum `other` into `self`. Commutative and associative over line,
    /// function and branch counts.
    pub fn merge(&mut self, other: &Tracefile) {
        for (file, record) in &other.files {
            self.insert(file.clone(), record.clone());
        }
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();

        for (file, record) in &self.files {
            write_record(&mut text, file, record);
        }

        text
    }
}

fn parse_entry(record: &mut FileRecord, tag: &str, value: &str) -> Result<()> {
    match tag {
        "DA" => {
            let mut parts = value.split(',');
            let line: u32 = next_field(&mut parts)?.parse()?;
            let hits: HitCount = next_field(&mut parts)?.parse()?;
            if line == 0 {
                bail!("source lines must be 1-indexed");
            }
            *record.lines.entry(line).or_insert(0) += hits;
        }
        "FN" => {
            let (line, name) = value
                .split_once(',')
                .ok_or_else(|| format_err!("missing function name"))?;
            let line: u32 = line.parse()?;
            record.functions.entry(name.to_owned()).or_insert((line, 0)).0 = line;
        }
        "FNDA" => {
            let (hits, name) = value
                .split_once(',')
                .ok_or_else(|| format_err!("missing function name"))?;
            let hits: HitCount = hits.parse()?;
            record.functions.entry(name.to_owned()).or_insert((0, 0)).1 += hits;
        }
        "BRDA" => {
            let mut parts = value.split(',');
            let line: u32 = next_field(&mut parts)?.parse()?;
            let block: u32 = next_field(&mut parts)?.parse()?;
            let branch: u32 = next_field(&mut parts)?.parse()?;
            let taken = match next_field(&mut parts)? {
                "-" => None,
                hits => Some(hits.parse::<HitCount>()?),
            };
            let entry = record.branches.entry((line, block, branch)).or_insert(None);
            *entry = match (*entry, taken) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            };
        }
        // Totals are recomputed on write.
        "LF" | "LH" | "FNF" | "FNH" | "BRF" | "BRH" => {}
        _ => {}
    }

    Ok(())
}

fn next_field<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Result<&'a str> {
    parts.next().ok_or_else(|| format_err!("missing field"))
}

fn write_record(text: &mut String, file: &str, record: &FileRecord) {
    // Writing into a `String` cannot fail.
    let _ = writeln!(text, "TN:{}", record.test_name.as_deref().unwrap_or_default());
    let _ = writeln!(text, "SF:{}", file);

    for (name, (line, _)) in &record.functions {
        let _ = writeln!(text, "FN:{},{}", line, name);
    }
    for (name, (_, hits)) in &record.functions {
        let _ = writeln!(text, "FNDA:{},{}", hits, name);
    }
    let functions_hit = record.functions.values().filter(|(_, hits)| *hits > 0).count();
    let _ = writeln!(text, "FNF:{}", record.functions.len());
    let _ = writeln!(text, "FNH:{}", functions_hit);

    for ((line, block, branch), taken) in &record.branches {
        match taken {
            Some(taken) => {
                let _ = writeln!(text, "BRDA:{},{},{},{}", line, block, branch, taken);
            }
            None => {
                let _ = writeln!(text, "BRDA:{},{},{},-", line, block, branch);
            }
        }
    }
    let branches_hit = record
        .branches
        .values()
        .filter(|taken| matches!(taken, Some(hits) if *hits > 0))
        .count();
    let _ = writeln!(text, "BRF:{}", record.branches.len());
    let _ = writeln!(text, "BRH:{}", branches_hit);

    for (line, hits) in &record.lines {
        let _ = writeln!(text, "DA:{},{}", line, hits);
    }
    let _ = writeln!(text, "LF:{}", record.lines.len());
    let _ = writeln!(text, "LH:{}", record.lines_hit());
    text.push_str("end_of_record\n");
}
