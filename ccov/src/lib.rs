// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub mod catalog;
pub mod error;
pub mod extract;
pub mod fs;
pub mod identity;
pub mod merge;
pub mod process;
pub mod tool;
pub mod transport;
pub mod unpack;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
