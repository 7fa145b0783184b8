/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::process::ExitCode;

use clap::Parser;
use spartan_tools::Cli;
use spartan_tools::commands::Runnable;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.subcmd.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error running subcommand: {:?} ", e);
            ExitCode::FAILURE
        }
    }
}
