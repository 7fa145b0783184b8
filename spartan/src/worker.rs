/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker protocol, and an in-process worker implementation.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::accum::MergeFn;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::tile::Buffer;
use crate::tile::Tile;

/// Stable identifier of a worker within a cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identifier of one tile stored on a worker. Unique within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u64);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A worker stores tiles and runs per-tile tasks. Regions passed to
/// `fetch` and `update` are in the tile's local coordinates.
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    fn id(&self) -> WorkerId;

    fn hostname(&self) -> &str;

    /// False once the worker has been lost. Tiles held by a lost worker
    /// are gone.
    fn is_alive(&self) -> bool;

    /// Create an unwritten tile.
    async fn allocate(
        &self,
        tile: TileId,
        shape: Vec<usize>,
        dtype: DType,
        sparse: bool,
    ) -> Result<(), SpartanError>;

    /// Read `region` of a tile.
    async fn fetch(&self, tile: TileId, region: Vec<Range<usize>>) -> Result<Buffer, SpartanError>;

    /// Merge `data` into `region` of a tile using `merge`.
    async fn update(
        &self,
        tile: TileId,
        region: Vec<Range<usize>>,
        data: Buffer,
        merge: MergeFn,
    ) -> Result<(), SpartanError>;

    /// Drop a tile. Releasing an unknown tile is a no-op.
    fn release(&self, tile: TileId);

    /// Run a task on this worker. The task runs to completion; there is
    /// no cancellation.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), SpartanError>;
}

/// A worker living in this process. Tasks run on the tokio runtime,
/// at most `slots` at a time.
pub struct LocalWorker {
    id: WorkerId,
    hostname: String,
    slots: usize,
    alive: AtomicBool,
    store: DashMap<TileId, Tile>,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorker")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("slots", &self.slots)
            .field("alive", &self.is_alive())
            .field("tiles", &self.store.len())
            .finish()
    }
}

impl LocalWorker {
    pub fn new(id: WorkerId, hostname: impl Into<String>, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            id,
            hostname: hostname.into(),
            slots,
            alive: AtomicBool::new(true),
            store: DashMap::new(),
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Number of tiles currently stored.
    pub fn num_tiles(&self) -> usize {
        self.store.len()
    }

    /// Simulate the loss of this worker: its tiles are dropped and all
    /// further requests fail.
    pub fn kill(&self) {
        tracing::warn!(worker = %self.id, tiles = self.store.len(), "killing worker");
        self.alive.store(false, Ordering::SeqCst);
        self.permits.close();
        self.store.clear();
    }

    fn check_alive(&self) -> Result<(), SpartanError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SpartanError::WorkerUnavailable(self.id))
        }
    }

    fn missing(&self, tile: TileId) -> SpartanError {
        SpartanError::OutOfBounds(format!("tile {} is not stored on worker {}", tile, self.id))
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn allocate(
        &self,
        tile: TileId,
        shape: Vec<usize>,
        dtype: DType,
        sparse: bool,
    ) -> Result<(), SpartanError> {
        self.check_alive()?;
        self.store.insert(tile, Tile::empty(&shape, dtype, sparse)?);
        Ok(())
    }

    async fn fetch(&self, tile: TileId, region: Vec<Range<usize>>) -> Result<Buffer, SpartanError> {
        self.check_alive()?;
        let entry = self.store.get(&tile).ok_or_else(|| self.missing(tile))?;
        entry.read(&region)
    }

    async fn update(
        &self,
        tile: TileId,
        region: Vec<Range<usize>>,
        data: Buffer,
        merge: MergeFn,
    ) -> Result<(), SpartanError> {
        self.check_alive()?;
        let mut entry = self.store.get_mut(&tile).ok_or_else(|| self.missing(tile))?;
        entry.update(&region, data, merge.as_ref())
    }

    fn release(&self, tile: TileId) {
        self.store.remove(&tile);
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), SpartanError> {
        self.check_alive()?;
        let permits = Arc::clone(&self.permits);
        let id = self.id;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::debug!(worker = %id, "worker stopped before task started");
                return;
            };
            task.await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use ndarray::array;
    use tokio::sync::oneshot;

    use super::*;
    use crate::accum;

    #[tokio::test]
    async fn test_allocate_update_fetch() {
        let worker = LocalWorker::new(WorkerId(0), "localhost", 2);
        worker
            .allocate(TileId(1), vec![2, 2], DType::F64, false)
            .await
            .unwrap();
        worker
            .update(
                TileId(1),
                vec![0..1, 0..2],
                Buffer::from_elem(&[1, 2], 5.0),
                accum::replace(),
            )
            .await
            .unwrap();
        let got = worker.fetch(TileId(1), vec![0..2, 1..2]).await.unwrap();
        assert_eq!(got, Buffer::Dense(array![[5.0], [0.0]].into_dyn()));

        worker.release(TileId(1));
        assert_eq!(worker.num_tiles(), 0);
        assert!(matches!(
            worker.fetch(TileId(1), vec![0..1, 0..1]).await,
            Err(SpartanError::OutOfBounds(_))
        ));
    }

    #[tokio::test]
    async fn test_killed_worker_refuses_requests() {
        let worker = LocalWorker::new(WorkerId(4), "localhost", 1);
        worker
            .allocate(TileId(1), vec![2], DType::F64, false)
            .await
            .unwrap();
        worker.kill();
        assert!(!worker.is_alive());
        assert_eq!(worker.num_tiles(), 0);
        assert!(matches!(
            worker.fetch(TileId(1), vec![0..1]).await,
            Err(SpartanError::WorkerUnavailable(WorkerId(4)))
        ));
        assert!(worker.spawn(async {}.boxed()).is_err());
    }

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let worker = LocalWorker::new(WorkerId(0), "localhost", 1);
        let (tx, rx) = oneshot::channel();
        worker
            .spawn(
                async move {
                    let _ = tx.send(42);
                }
                .boxed(),
            )
            .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }
}
