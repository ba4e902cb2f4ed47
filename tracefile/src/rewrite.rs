// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{BufRead, Write};

use anyhow::Result;
use regex::Regex;

const SOURCE_FILE_TAG: &str = "SF:";

/// Rewrites the path of every `SF:` line matching `pattern`.
///
/// Only the first match in each path is replaced. All other lines are copied
/// through unchanged, so output produced by newer tools survives untouched.
#[derive(Clone, Debug)]
pub struct SourceRewrite {
    pattern: Regex,
    replacement: String,
}

impl SourceRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        let replacement = replacement.into();
        Ok(Self {
            pattern,
            replacement,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn rewrite_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        self.pattern.replace(path, self.replacement.as_str())
    }

    /// Stream `reader` to `writer`, returning the number of rewritten paths.
    pub fn apply(&self, reader: impl BufRead, mut writer: impl Write) -> Result<usize> {
        let mut rewritten = 0;

        for line in reader.lines() {
            let line = line?;

            match line.strip_prefix(SOURCE_FILE_TAG) {
                Some(path) => {
                    let new_path = self.rewrite_path(path);
                    if new_path != path {
                        rewritten += 1;
                    }
                    writeln!(writer, "{}{}", SOURCE_FILE_TAG, new_path)?;
                }
                None => writeln!(writer, "{}", line)?,
            }
        }

        writer.flush()?;
        Ok(rewritten)
    }
}
