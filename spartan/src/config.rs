/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration.
//!
//! A [`Config`] is built once at startup (from defaults, the
//! environment, or the command line) and handed to the [`Cluster`],
//! which shares it with everything that needs it. Nothing reads
//! configuration from global state.
//!
//! [`Cluster`]: crate::cluster::Cluster

use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::cluster::AssignMode;
use crate::cluster::HostSpec;
use crate::cluster::Topology;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SPARTAN_";

/// Optional features resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Special functions such as the normal CDF.
    pub special_functions: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            special_functions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Total number of workers to start; also sets the default tiling
    /// granularity.
    pub num_workers: usize,
    /// Run against remote hosts rather than in-process workers.
    pub cluster: bool,
    /// First port used by remote workers.
    pub port_base: u16,
    pub assign_mode: AssignMode,
    pub hosts: Vec<HostSpec>,
    /// 0 error, 1 warn, 2 info, 3 debug, 4 trace.
    pub log_level: u8,
    /// Log the duration of every tile kernel.
    pub profile_kernels: bool,
    /// How many times a tile operation whose worker was lost is retried
    /// on another worker. Kernel errors are not retried.
    pub tile_retries: usize,
    /// Default number of tiles per worker when no tile hint is given.
    pub tiles_per_worker: usize,
    pub capabilities: Capabilities,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 1,
            cluster: false,
            port_base: 10000,
            assign_mode: AssignMode::ByNode,
            hosts: vec![HostSpec::new("localhost", 1)],
            log_level: 2,
            profile_kernels: false,
            tile_retries: 1,
            tiles_per_worker: 1,
            capabilities: Capabilities::default(),
        }
    }
}

impl Config {
    /// `num_workers` in-process workers, one per core of `localhost`.
    pub fn local(num_workers: usize) -> Self {
        Self {
            num_workers,
            assign_mode: AssignMode::ByCore,
            hosts: vec![HostSpec::new("localhost", num_workers)],
            ..Self::default()
        }
    }

    /// Defaults overridden by `SPARTAN_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`, which is given the
    /// full variable name (for example `SPARTAN_NUM_WORKERS`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn parse<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid value {:?} for {}", value, key))
        }
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        let mut config = Self::default();
        if let Some((key, value)) = get("NUM_WORKERS") {
            config.num_workers = parse(&key, &value)?;
            config.hosts = vec![HostSpec::new("localhost", config.num_workers)];
        }
        if let Some((key, value)) = get("CLUSTER") {
            config.cluster = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PORT_BASE") {
            config.port_base = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("ASSIGN_MODE") {
            config.assign_mode = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("HOSTS") {
            config.hosts = HostSpec::parse_list(&value).with_context(|| format!("parsing {}", key))?;
        }
        if let Some((key, value)) = get("LOG_LEVEL") {
            config.log_level = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PROFILE_KERNELS") {
            config.profile_kernels = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("TILE_RETRIES") {
            config.tile_retries = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("TILES_PER_WORKER") {
            config.tiles_per_worker = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SPECIAL_FUNCTIONS") {
            config.capabilities.special_functions = parse(&key, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_workers > 0, "num_workers must be positive");
        anyhow::ensure!(self.tiles_per_worker > 0, "tiles_per_worker must be positive");
        anyhow::ensure!(!self.hosts.is_empty(), "at least one host is required");
        anyhow::ensure!(
            self.hosts.iter().all(|h| h.worker_slots > 0),
            "every host needs at least one worker slot"
        );
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        Topology {
            hosts: self.hosts.clone(),
            assign_mode: self.assign_mode,
        }
    }

    /// Number of tiles an array is split into when no tile hint is
    /// given.
    pub fn default_tile_count(&self) -> usize {
        (self.num_workers * self.tiles_per_worker).max(1)
    }
}
