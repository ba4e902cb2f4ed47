// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading and writing of LCOV tracefiles (`.info`).
//!
//! Coverage computation itself is done by external tools. This crate only
//! understands enough of the format to normalize source paths, summarize a
//! tracefile, and model the summation merge those tools perform.

pub mod record;
pub mod rewrite;
pub mod summary;

pub use record::{FileRecord, Tracefile};
pub use rewrite::SourceRewrite;
pub use summary::Summary;
