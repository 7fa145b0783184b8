/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use clap::Parser;
use spartan::cluster::WorkerSpec;

use crate::args::ClusterArgs;
use crate::commands::Error;
use crate::commands::Runnable;

#[derive(Parser, Debug)]
pub struct Cmd {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// Print the workers as a JSON array
    #[arg(long)]
    pub json: bool,
}

impl Cmd {
    fn workers(&self) -> Result<Vec<WorkerSpec>, Error> {
        Ok(self.cluster.config()?.topology().worker_specs())
    }
}

impl Runnable for Cmd {
    fn run(&self) -> Result<(), Error> {
        let workers = self.workers()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&workers)?);
            return Ok(());
        }
        for worker in &workers {
            println!("{}\t{}\tslots={}", worker.id, worker.hostname, worker.slots);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::Cli;
    use crate::commands::Command;

    #[test]
    fn test_by_node_and_by_core() {
        let cli = Cli::parse_from([
            "spartan",
            "topology",
            "--hosts",
            "a:2,b:3",
            "--assign-mode",
            "by_node",
        ]);
        let Command::Topology(cmd) = &cli.subcmd else {
            panic!("parsed {:?}", cli.subcmd);
        };
        let workers = cmd.workers().unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[1].hostname, "b");
        assert_eq!(workers[1].slots, 3);

        let cli = Cli::parse_from([
            "spartan",
            "topology",
            "--hosts",
            "a:2,b:3",
            "--assign-mode",
            "by_core",
        ]);
        let Command::Topology(cmd) = &cli.subcmd else {
            panic!("parsed {:?}", cli.subcmd);
        };
        assert_eq!(cmd.workers().unwrap().len(), 5);
    }
}
