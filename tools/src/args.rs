/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use clap::Args;
use spartan::Config;
use spartan::cluster::AssignMode;
use spartan::cluster::HostSpec;

/// A comma separated list of `host:slots` entries, for example
/// `node1:8,node2:8`. A host without a slot count has one slot.
#[derive(Clone, Debug, PartialEq)]
pub struct HostList(pub Vec<HostSpec>);

impl FromStr for HostList {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let hosts = HostSpec::parse_list(s)?;
        anyhow::ensure!(!hosts.is_empty(), "{s:?} names no hosts");
        Ok(HostList(hosts))
    }
}

impl Display for HostList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .0
            .iter()
            .map(|h| format!("{}:{}", h.hostname, h.worker_slots))
            .collect();
        write!(f, "{}", entries.join(","))
    }
}

/// Cluster flags shared by every subcommand. Unset flags keep the value
/// from the `SPARTAN_*` environment, or the default.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Number of workers
    #[arg(short = 'n', long)]
    pub num_workers: Option<usize>,
    /// Hosts and their worker slots
    #[arg(long)]
    pub hosts: Option<HostList>,
    /// Worker assignment: by_core or by_node
    #[arg(long)]
    pub assign_mode: Option<AssignMode>,
    /// 0 error, 1 warn, 2 info, 3 debug, 4 trace
    #[arg(long)]
    pub log_level: Option<u8>,
    /// Log the duration of every tile kernel
    #[arg(long)]
    pub profile_kernels: bool,
    /// Retries of a tile on another worker after its worker is lost
    #[arg(long)]
    pub tile_retries: Option<usize>,
    /// Tiles per worker when an array has no tile hint
    #[arg(long)]
    pub tiles_per_worker: Option<usize>,
    /// Disable special functions such as the normal CDF
    #[arg(long)]
    pub no_special_functions: bool,
}

impl ClusterArgs {
    /// Resolve the configuration: environment first, then flags.
    pub fn config(&self) -> anyhow::Result<Config> {
        let mut config = Config::from_env()?;
        if let Some(num_workers) = self.num_workers {
            config = Config {
                log_level: config.log_level,
                ..Config::local(num_workers)
            };
        }
        if let Some(hosts) = &self.hosts {
            config.hosts = hosts.0.clone();
            config.num_workers = config.topology().worker_specs().len();
        }
        if let Some(assign_mode) = self.assign_mode {
            config.assign_mode = assign_mode;
            config.num_workers = config.topology().worker_specs().len();
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if let Some(tile_retries) = self.tile_retries {
            config.tile_retries = tile_retries;
        }
        if let Some(tiles_per_worker) = self.tiles_per_worker {
            config.tiles_per_worker = tiles_per_worker;
        }
        config.profile_kernels |= self.profile_kernels;
        if self.no_special_functions {
            config.capabilities.special_functions = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_list() {
        let hosts = HostList::from_str("a:4, b").unwrap();
        assert_eq!(hosts.0, vec![HostSpec::new("a", 4), HostSpec::new("b", 1)]);
        assert_eq!(hosts.to_string(), "a:4,b:1");
    }

    #[test]
    fn test_host_list_invalid() {
        assert!(HostList::from_str("a:four").is_err());
        assert!(HostList::from_str(" , ").is_err());
    }

    #[test]
    fn test_flags_override() {
        let args = ClusterArgs {
            hosts: Some(HostList::from_str("a:2,b:3").unwrap()),
            assign_mode: Some(AssignMode::ByCore),
            tiles_per_worker: Some(4),
            no_special_functions: true,
            ..ClusterArgs::default()
        };
        let config = args.config().unwrap();
        assert_eq!(config.num_workers, 5);
        assert_eq!(config.tiles_per_worker, 4);
        assert!(!config.capabilities.special_functions);
    }
}
