/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

mod bench;
mod config;
mod topology;

use clap::Subcommand;
use enum_dispatch::enum_dispatch;

/// Error that `Runnable` throws.
type Error = anyhow::Error;

/// The run logic for each subcommand.
#[enum_dispatch]
pub trait Runnable {
    fn run(&self) -> Result<(), Error>;
}

/// Sub-commands of the CLI.
#[derive(Subcommand, Debug)]
#[enum_dispatch(Runnable)]
pub enum Command {
    /// Prints the resolved configuration as JSON
    #[command()]
    Config(config::Cmd),
    /// Prints the workers the configuration starts and where they run
    #[command()]
    Topology(topology::Cmd),
    /// Runs a demo computation on in-process workers and reports timing
    #[command()]
    Bench(bench::Cmd),
}
