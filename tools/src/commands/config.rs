/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use clap::Parser;

use crate::args::ClusterArgs;
use crate::commands::Error;
use crate::commands::Runnable;

#[derive(Parser, Debug)]
pub struct Cmd {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// Print on a single line
    #[arg(long)]
    pub compact: bool,
}

impl Cmd {
    fn render(&self) -> Result<String, Error> {
        let config = self.cluster.config()?;
        Ok(if self.compact {
            serde_json::to_string(&config)?
        } else {
            serde_json::to_string_pretty(&config)?
        })
    }
}

impl Runnable for Cmd {
    fn run(&self) -> Result<(), Error> {
        println!("{}", self.render()?);
        Ok(())
    }
}
