// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

pub mod backend;
pub mod cli;
pub mod config;
pub mod pipeline;
