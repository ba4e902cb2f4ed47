// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

use anyhow::Result;
use ccov_collect_lib::cli;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli::args("ccov-collect").get_matches();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(cli::run(&matches))?;

    info!(
        "wrote {} ({} fragments)",
        report.aggregate.display(),
        report.fragments.len()
    );
    Ok(())
}
