/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster topology, worker allocation, and the [`Cluster`] handle
//! shared by arrays and the evaluator.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::error::SpartanError;
use crate::worker::LocalWorker;
use crate::worker::Worker;
use crate::worker::WorkerId;

/// A host and the number of worker slots it offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub hostname: String,
    pub worker_slots: usize,
}

impl HostSpec {
    pub fn new(hostname: impl Into<String>, worker_slots: usize) -> Self {
        Self {
            hostname: hostname.into(),
            worker_slots,
        }
    }

    /// Parse a comma separated list of `host:slots` entries. A missing
    /// slot count means one slot.
    pub fn parse_list(list: &str) -> anyhow::Result<Vec<HostSpec>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((host, slots)) => Ok(HostSpec::new(
                    host,
                    slots
                        .parse()
                        .with_context(|| format!("invalid slot count in {:?}", entry))?,
                )),
                None => Ok(HostSpec::new(entry, 1)),
            })
            .collect()
    }
}

/// How workers are assigned to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignMode {
    /// One worker per slot.
    ByCore,
    /// One worker per host, owning all of its slots.
    ByNode,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown assign mode {0:?}; expected by_core or by_node")]
pub struct ParseAssignModeError(String);

impl FromStr for AssignMode {
    type Err = ParseAssignModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "by_core" | "core" => Ok(AssignMode::ByCore),
            "by_node" | "node" => Ok(AssignMode::ByNode),
            _ => Err(ParseAssignModeError(s.to_string())),
        }
    }
}

/// The static list of hosts and the assignment policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub hosts: Vec<HostSpec>,
    pub assign_mode: AssignMode,
}

/// The placement of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub hostname: String,
    pub slots: usize,
}

impl Topology {
    /// Workers to start, numbered in host order.
    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        let mut specs = Vec::new();
        for host in &self.hosts {
            match self.assign_mode {
                AssignMode::ByCore => {
                    for _ in 0..host.worker_slots {
                        specs.push(WorkerSpec {
                            id: WorkerId(specs.len()),
                            hostname: host.hostname.clone(),
                            slots: 1,
                        });
                    }
                }
                AssignMode::ByNode => specs.push(WorkerSpec {
                    id: WorkerId(specs.len()),
                    hostname: host.hostname.clone(),
                    slots: host.worker_slots,
                }),
            }
        }
        specs
    }
}

/// An allocator starts the workers of a topology.
#[async_trait]
pub trait Allocator {
    async fn allocate(&mut self, topology: &Topology) -> Result<Vec<Arc<dyn Worker>>, SpartanError>;
}

/// Allocates in-process workers.
#[derive(Debug, Default)]
pub struct LocalAllocator {
    workers: Vec<Arc<LocalWorker>>,
}

impl LocalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The workers allocated so far, with their concrete type.
    pub fn workers(&self) -> &[Arc<LocalWorker>] {
        &self.workers
    }
}

#[async_trait]
impl Allocator for LocalAllocator {
    async fn allocate(&mut self, topology: &Topology) -> Result<Vec<Arc<dyn Worker>>, SpartanError> {
        let base = self.workers.len();
        let mut allocated: Vec<Arc<dyn Worker>> = Vec::new();
        for spec in topology.worker_specs() {
            let worker = Arc::new(LocalWorker::new(
                WorkerId(base + spec.id.0),
                spec.hostname,
                spec.slots,
            ));
            tracing::debug!(worker = %worker.id(), slots = worker.slots(), "allocated local worker");
            self.workers.push(Arc::clone(&worker));
            allocated.push(worker);
        }
        Ok(allocated)
    }
}

/// Identifier of a distributed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(pub u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// A handle to the running workers and the configuration they were
/// started with. Cheap to clone.
#[derive(Clone)]
pub struct Cluster(Arc<ClusterState>);

struct ClusterState {
    config: Arc<Config>,
    workers: Vec<Arc<dyn Worker>>,
    next_array: AtomicU64,
    next_tile: AtomicU64,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("workers", &self.0.workers.len())
            .field("config", &self.0.config)
            .finish()
    }
}

impl Cluster {
    /// Start in-process workers for `config`.
    pub async fn start(config: Config) -> Result<Self, SpartanError> {
        if config.cluster {
            return Err(SpartanError::CapabilityUnavailable(
                "remote workers require an external allocator",
            ));
        }
        Self::with_allocator(config, &mut LocalAllocator::new()).await
    }

    /// Start workers for `config` using `allocator`.
    pub async fn with_allocator<A: Allocator + ?Sized + Send>(
        config: Config,
        allocator: &mut A,
    ) -> Result<Self, SpartanError> {
        let workers = allocator.allocate(&config.topology()).await?;
        Self::from_workers(config, workers)
    }

    /// Build a cluster over workers that are already running.
    pub fn from_workers(config: Config, workers: Vec<Arc<dyn Worker>>) -> Result<Self, SpartanError> {
        if workers.is_empty() {
            return Err(SpartanError::WorkerUnavailable(WorkerId(0)));
        }
        tracing::info!(
            workers = workers.len(),
            assign_mode = ?config.assign_mode,
            "cluster started"
        );
        Ok(Self(Arc::new(ClusterState {
            config: Arc::new(config),
            workers,
            next_array: AtomicU64::new(0),
            next_tile: AtomicU64::new(0),
        })))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.0.workers
    }

    pub fn num_workers(&self) -> usize {
        self.0.workers.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<dyn Worker>> {
        self.0.workers.iter().find(|w| w.id() == id).cloned()
    }

    /// The worker for the `index`-th tile of a new array: round-robin
    /// over the workers that are still alive.
    pub fn place(&self, index: usize) -> Result<Arc<dyn Worker>, SpartanError> {
        let alive: Vec<&Arc<dyn Worker>> = self.0.workers.iter().filter(|w| w.is_alive()).collect();
        if alive.is_empty() {
            return Err(SpartanError::WorkerUnavailable(self.0.workers[0].id()));
        }
        Ok(Arc::clone(alive[index % alive.len()]))
    }

    /// The next live worker after `failed`, used to retry its work.
    pub fn fallback_worker(&self, failed: WorkerId) -> Option<Arc<dyn Worker>> {
        let n = self.0.workers.len();
        let start = self
            .0
            .workers
            .iter()
            .position(|w| w.id() == failed)
            .unwrap_or(0);
        (1..=n)
            .map(|offset| &self.0.workers[(start + offset) % n])
            .find(|w| w.is_alive() && w.id() != failed)
            .cloned()
    }

    pub(crate) fn next_array_id(&self) -> ArrayId {
        ArrayId(self.0.next_array.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_tile_id(&self) -> crate::worker::TileId {
        crate::worker::TileId(self.0.next_tile.fetch_add(1, Ordering::Relaxed))
    }
}
