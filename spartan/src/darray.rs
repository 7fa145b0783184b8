/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Distributed arrays: a mapping from extents to the workers holding
//! their tiles.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::DashSet;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::try_join_all;
use ndextent::Extent;
use ndextent::Index;
use ndextent::from_slice;

use crate::accum;
use crate::accum::MergeFn;
use crate::cluster::ArrayId;
use crate::cluster::Cluster;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::rpc;
use crate::rpc::FutureGroup;
use crate::tile::Buffer;
use crate::tiling;
use crate::worker::TileId;
use crate::worker::Worker;

/// A per-tile operation. It is invoked once per tile with the tile's
/// extent and the worker that owns it, runs on that worker, and
/// returns any number of results. A tile with nothing to report
/// returns an empty vector.
pub type TileMapper<T> =
    Arc<dyn Fn(Extent, Arc<dyn Worker>) -> BoxFuture<'static, anyhow::Result<Vec<T>>> + Send + Sync>;

/// Build a [`TileMapper`] from an async closure.
pub fn tile_mapper<T, F, Fut>(f: F) -> TileMapper<T>
where
    F: Fn(Extent, Arc<dyn Worker>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
{
    Arc::new(move |extent, worker| f(extent, worker).boxed())
}

/// Where a tile lives.
#[derive(Debug, Clone)]
pub struct TileLocation {
    pub worker: Arc<dyn Worker>,
    pub tile: TileId,
}

/// Parameters of a new array.
#[derive(Debug, Clone)]
pub struct ArraySpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub sparse: bool,
    /// Preferred tile shape.
    pub tile_hint: Option<Vec<usize>>,
    /// Combines overlapping writes; [`accum::replace`] when unset.
    pub merge: Option<MergeFn>,
}

impl ArraySpec {
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            dtype: DType::F64,
            sparse: false,
            tile_hint: None,
            merge: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn with_tile_hint(mut self, tile_hint: impl Into<Vec<usize>>) -> Self {
        self.tile_hint = Some(tile_hint.into());
        self
    }

    pub fn with_merge(mut self, merge: MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn validate(&self) -> Result<(), SpartanError> {
        if self.sparse && self.shape.len() != 2 {
            return Err(SpartanError::ShapeMismatch(format!(
                "sparse arrays are 2-dimensional, got shape {:?}",
                self.shape
            )));
        }
        if let Some(hint) = &self.tile_hint {
            if hint.len() != self.shape.len() || hint.contains(&0) {
                return Err(SpartanError::ShapeMismatch(format!(
                    "tile hint {:?} does not fit shape {:?}",
                    hint, self.shape
                )));
            }
        }
        Ok(())
    }
}

/// A sharded N-dimensional array. Cloning yields another handle to the
/// same array; tiles are released when the last handle is dropped.
#[derive(Clone)]
pub struct DistArray(Arc<DistArrayState>);

struct DistArrayState {
    id: ArrayId,
    cluster: Cluster,
    shape: Vec<usize>,
    dtype: DType,
    sparse: bool,
    merge: MergeFn,
    tiles: DashMap<Extent, TileLocation>,
    bad_tiles: DashSet<Extent>,
}

impl Drop for DistArrayState {
    fn drop(&mut self) {
        for entry in self.tiles.iter() {
            entry.worker.release(entry.tile);
        }
        tracing::trace!(array = %self.id, tiles = self.tiles.len(), "released array");
    }
}

impl fmt::Debug for DistArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistArray")
            .field("id", &self.0.id)
            .field("shape", &self.0.shape)
            .field("dtype", &self.0.dtype)
            .field("sparse", &self.0.sparse)
            .field("tiles", &self.0.tiles.len())
            .field("bad_tiles", &self.0.bad_tiles.len())
            .finish()
    }
}

fn check_region(shape: &[usize], region: &Extent) -> Result<(), SpartanError> {
    if region.array_shape() != shape || !Extent::from_shape(shape).contains(region) {
        return Err(SpartanError::OutOfBounds(format!(
            "{} is not within an array of shape {:?}",
            region, shape
        )));
    }
    Ok(())
}

impl DistArray {
    /// Allocate an unwritten array, tiled per `spec` (or by the
    /// cluster's default granularity) and placed round-robin.
    pub async fn create(cluster: &Cluster, spec: &ArraySpec) -> Result<Self, SpartanError> {
        spec.validate()?;
        let extents = tiling::split(
            &spec.shape,
            spec.tile_hint.as_deref(),
            cluster.config().default_tile_count(),
        )?;
        let layout = extents
            .into_iter()
            .enumerate()
            .map(|(i, ex)| Ok((ex, cluster.place(i)?)))
            .collect::<Result<Vec<_>, SpartanError>>()?;
        Self::with_layout(
            cluster,
            spec.shape.clone(),
            spec.dtype,
            spec.sparse,
            spec.merge.clone().unwrap_or_else(accum::replace),
            layout,
        )
        .await
    }

    /// Allocate an unwritten array with the given tiles on the given
    /// workers. Dead workers are replaced by live ones. Zero-volume
    /// extents are skipped.
    pub async fn with_layout(
        cluster: &Cluster,
        shape: Vec<usize>,
        dtype: DType,
        sparse: bool,
        merge: MergeFn,
        layout: Vec<(Extent, Arc<dyn Worker>)>,
    ) -> Result<Self, SpartanError> {
        let tiles = DashMap::new();
        let mut allocations = Vec::new();
        for (i, (extent, worker)) in layout.into_iter().enumerate() {
            check_region(&shape, &extent)?;
            if extent.is_empty() {
                continue;
            }
            let worker = if worker.is_alive() {
                worker
            } else {
                cluster.place(i)?
            };
            let tile = cluster.next_tile_id();
            let tile_shape = extent.shape();
            let owner = Arc::clone(&worker);
            allocations.push(async move { owner.allocate(tile, tile_shape, dtype, sparse).await });
            tiles.insert(extent, TileLocation { worker, tile });
        }
        let array = Self(Arc::new(DistArrayState {
            id: cluster.next_array_id(),
            cluster: cluster.clone(),
            shape,
            dtype,
            sparse,
            merge,
            tiles,
            bad_tiles: DashSet::new(),
        }));
        // On failure the partially allocated array is dropped, which
        // releases whatever tiles were created.
        try_join_all(allocations).await?;
        tracing::debug!(
            array = %array.id(),
            shape = ?array.shape(),
            tiles = array.num_tiles(),
            "allocated array"
        );
        Ok(array)
    }

    pub fn id(&self) -> ArrayId {
        self.0.id
    }

    pub fn cluster(&self) -> &Cluster {
        &self.0.cluster
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn ndim(&self) -> usize {
        self.0.shape.len()
    }

    pub fn size(&self) -> usize {
        self.0.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn is_sparse(&self) -> bool {
        self.0.sparse
    }

    pub fn merge(&self) -> &MergeFn {
        &self.0.merge
    }

    pub fn num_tiles(&self) -> usize {
        self.0.tiles.len()
    }

    /// The extent covering the whole array.
    pub fn full_extent(&self) -> Extent {
        Extent::from_shape(&self.0.shape)
    }

    /// Tiles in upper-left order.
    pub fn tiles(&self) -> Vec<(Extent, TileLocation)> {
        let mut tiles: Vec<_> = self
            .0
            .tiles
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        tiles.sort_by(|a, b| a.0.cmp(&b.0));
        tiles
    }

    /// Tile extents in upper-left order.
    pub fn extents(&self) -> Vec<Extent> {
        self.tiles().into_iter().map(|(ex, _)| ex).collect()
    }

    /// Tile extents with their owning workers, in upper-left order.
    pub fn layout(&self) -> Vec<(Extent, Arc<dyn Worker>)> {
        self.tiles()
            .into_iter()
            .map(|(ex, loc)| (ex, loc.worker))
            .collect()
    }

    /// Mark tiles whose worker has been lost. Returns the number of bad
    /// tiles.
    pub fn refresh_bad_tiles(&self) -> usize {
        for entry in self.0.tiles.iter() {
            if !entry.worker.is_alive() && self.0.bad_tiles.insert(entry.key().clone()) {
                tracing::warn!(
                    array = %self.0.id,
                    extent = %entry.key(),
                    worker = %entry.worker.id(),
                    "tile lost"
                );
            }
        }
        self.0.bad_tiles.len()
    }

    /// Extents whose data is currently unavailable, in upper-left order.
    pub fn bad_tiles(&self) -> Vec<Extent> {
        self.refresh_bad_tiles();
        let mut bad: Vec<Extent> = self.0.bad_tiles.iter().map(|e| e.key().clone()).collect();
        bad.sort();
        bad
    }

    fn lost(&self, extent: &Extent, location: &TileLocation) -> SpartanError {
        SpartanError::TileFailure {
            extent: extent.clone(),
            worker: location.worker.id(),
            message: format!("tile of array {} was lost", self.0.id),
            lost: true,
        }
    }

    /// Run `mapper` once per tile, on the tile's worker, and collect the
    /// results in tile order. A tile whose worker is lost is retried on
    /// another live worker up to the configured number of times; the
    /// first error that survives retries fails the whole operation.
    pub async fn foreach_tile<T: Send + 'static>(
        &self,
        mapper: TileMapper<T>,
    ) -> Result<Vec<T>, SpartanError> {
        self.run_tiles(self.tiles(), mapper).await
    }

    /// [`DistArray::foreach_tile`] over only the tiles overlapping
    /// `region`.
    pub async fn foreach_tile_within<T: Send + 'static>(
        &self,
        region: &Extent,
        mapper: TileMapper<T>,
    ) -> Result<Vec<T>, SpartanError> {
        let tiles = self
            .tiles()
            .into_iter()
            .filter(|(extent, _)| extent.intersection(region).is_some())
            .collect();
        self.run_tiles(tiles, mapper).await
    }

    async fn run_tiles<T: Send + 'static>(
        &self,
        tiles: Vec<(Extent, TileLocation)>,
        mapper: TileMapper<T>,
    ) -> Result<Vec<T>, SpartanError> {
        self.refresh_bad_tiles();
        let config = self.cluster().config();
        let retries = config.tile_retries;
        let profile = config.profile_kernels;
        let mut group = FutureGroup::new();
        for (i, (extent, location)) in tiles.into_iter().enumerate() {
            let cluster = self.cluster().clone();
            let mapper = Arc::clone(&mapper);
            group.push(async move {
                run_tile(&cluster, &mapper, extent, location.worker, retries, profile)
                    .await
                    .map(|results| (i, results))
            });
        }
        let mut results = group.wait_all().await?;
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().flat_map(|(_, r)| r).collect())
    }

    /// Read `region`, stitching together the tiles it overlaps.
    pub async fn fetch(&self, region: &Extent) -> Result<Buffer, SpartanError> {
        check_region(&self.0.shape, region)?;
        if region.is_empty() {
            return Buffer::assemble(&region.shape(), self.0.sparse, Vec::new());
        }
        self.refresh_bad_tiles();
        let mut covered = 0;
        let mut reads = Vec::new();
        for (extent, location) in self.tiles() {
            let Some(overlap) = extent.intersection(region) else {
                continue;
            };
            if self.0.bad_tiles.contains(&extent) {
                return Err(self.lost(&extent, &location));
            }
            covered += overlap.size();
            let dst = region.offset_slice(&overlap)?;
            let src = extent.offset_slice(&overlap)?;
            reads.push(async move {
                let data = location.worker.fetch(location.tile, src).await?;
                Ok::<_, SpartanError>((dst, data))
            });
        }
        if covered != region.size() {
            return Err(SpartanError::OutOfBounds(format!(
                "fetch of {} spans missing tiles",
                region
            )));
        }
        let pieces = try_join_all(reads).await?;
        Buffer::assemble(&region.shape(), self.0.sparse, pieces)
    }

    /// Read with numpy-style indexing. Axes indexed by a single position
    /// are dropped from the result.
    pub async fn select(&self, index: &[Index]) -> Result<Buffer, SpartanError> {
        let region = from_slice(index, &self.0.shape)?;
        self.fetch(&region.extent).await?.reshape(&region.shape())
    }

    /// Read the whole array.
    pub async fn glom(&self) -> Result<Buffer, SpartanError> {
        self.fetch(&self.full_extent()).await
    }

    /// Write `data` into `region`, merging with existing values through
    /// the array's merge function. The writes are in flight when this
    /// returns; wait on the group to observe their completion. If any
    /// overlapped tile is lost, nothing is written.
    pub fn update(&self, region: &Extent, data: Buffer) -> Result<FutureGroup<()>, SpartanError> {
        check_region(&self.0.shape, region)?;
        if data.shape() != region.shape() {
            return Err(SpartanError::ShapeMismatch(format!(
                "cannot write data of shape {:?} to {}",
                data.shape(),
                region
            )));
        }
        let mut group = FutureGroup::new();
        if region.is_empty() {
            return Ok(group);
        }
        let mut writes = Vec::new();
        for (extent, location) in self.tiles() {
            let Some(overlap) = extent.intersection(region) else {
                continue;
            };
            if self.0.bad_tiles.contains(&extent) || !location.worker.is_alive() {
                return Err(self.lost(&extent, &location));
            }
            let piece = data.slice(&region.offset_slice(&overlap)?)?;
            let dst = extent.offset_slice(&overlap)?;
            writes.push((location, dst, piece));
        }
        for (location, dst, piece) in writes {
            let merge = Arc::clone(&self.0.merge);
            group.spawn(async move {
                location
                    .worker
                    .update(location.tile, dst, piece, merge)
                    .await
            });
        }
        Ok(group)
    }

    /// [`DistArray::update`], then wait for the writes to land.
    pub async fn update_and_wait(&self, region: &Extent, data: Buffer) -> Result<(), SpartanError> {
        self.update(region, data)?.wait_all().await?;
        Ok(())
    }
}

async fn run_tile<T: Send + 'static>(
    cluster: &Cluster,
    mapper: &TileMapper<T>,
    extent: Extent,
    mut worker: Arc<dyn Worker>,
    retries: usize,
    profile: bool,
) -> Result<Vec<T>, SpartanError> {
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        let result = match rpc::submit(&worker, &extent, mapper(extent.clone(), Arc::clone(&worker))) {
            Ok(pending) => pending.wait().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(results) => {
                if profile {
                    tracing::info!(
                        extent = %extent,
                        worker = %worker.id(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "tile kernel"
                    );
                }
                return Ok(results);
            }
            Err(err) if err.is_retryable() && attempt < retries => {
                let Some(next) = cluster.fallback_worker(worker.id()) else {
                    return Err(err);
                };
                attempt += 1;
                tracing::warn!(
                    extent = %extent,
                    failed = %worker.id(),
                    retry = %next.id(),
                    attempt,
                    "retrying tile: {}",
                    err
                );
                worker = next;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use ndarray::array;
    use ndextent::index;

    use super::*;
    use crate::cluster::LocalAllocator;
    use crate::config::Config;

    async fn cluster(workers: usize) -> (Cluster, LocalAllocator) {
        let mut allocator = LocalAllocator::new();
        let cluster = Cluster::with_allocator(Config::local(workers), &mut allocator)
            .await
            .unwrap();
        (cluster, allocator)
    }

    fn ex(ul: &[usize], lr: &[usize], shape: &[usize]) -> Extent {
        Extent::new(ul.to_vec(), lr.to_vec(), shape.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_create_places_round_robin() {
        let (cluster, _alloc) = cluster(2).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([10, 10]).with_tile_hint([5, 5]))
            .await
            .unwrap();
        let tiles = array.tiles();
        assert_eq!(tiles.len(), 4);
        let owners: Vec<usize> = tiles.iter().map(|(_, l)| l.worker.id().0).collect();
        assert_eq!(owners, vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_update_and_fetch_across_tiles() {
        let (cluster, _alloc) = cluster(2).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([4, 4]).with_tile_hint([2, 2]))
            .await
            .unwrap();
        array
            .update_and_wait(&ex(&[1, 1], &[3, 3], &[4, 4]), Buffer::from_elem(&[2, 2], 7.0))
            .await
            .unwrap();
        let got = array.fetch(&ex(&[0, 0], &[3, 2], &[4, 4])).await.unwrap();
        assert_eq!(
            got,
            Buffer::Dense(array![[0.0, 0.0], [0.0, 7.0], [0.0, 7.0]].into_dyn())
        );
        let row = array.select(&index![2]).await.unwrap();
        assert_eq!(row, Buffer::Dense(array![0.0, 7.0, 7.0, 0.0].into_dyn()));
    }

    #[tokio::test]
    async fn test_fetch_out_of_bounds() {
        let (cluster, _alloc) = cluster(1).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([4])).await.unwrap();
        let outside = ex(&[0], &[4], &[5]);
        assert!(matches!(
            array.fetch(&outside).await,
            Err(SpartanError::OutOfBounds(_))
        ));
        assert!(matches!(
            array.update(&ex(&[0], &[2], &[4]), Buffer::zeros(&[3])),
            Err(SpartanError::ShapeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_writes_merge() {
        let (cluster, _alloc) = cluster(2).await;
        let spec = ArraySpec::new([4]).with_tile_hint([2]).with_merge(accum::sum());
        let array = DistArray::create(&cluster, &spec).await.unwrap();
        let mut group = array
            .update(&ex(&[0], &[3], &[4]), Buffer::from_elem(&[3], 1.0))
            .unwrap();
        group.extend(
            array
                .update(&ex(&[1], &[4], &[4]), Buffer::from_elem(&[3], 2.0))
                .unwrap(),
        );
        group.wait_all().await.unwrap();
        assert_eq!(
            array.glom().await.unwrap(),
            Buffer::Dense(array![1.0, 3.0, 3.0, 2.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_replace_is_last_writer_wins() {
        let (cluster, _alloc) = cluster(1).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([3])).await.unwrap();
        let full = array.full_extent();
        array
            .update_and_wait(&full, Buffer::from_elem(&[3], 1.0))
            .await
            .unwrap();
        array
            .update_and_wait(&ex(&[1], &[2], &[3]), Buffer::from_elem(&[1], 9.0))
            .await
            .unwrap();
        assert_eq!(
            array.glom().await.unwrap(),
            Buffer::Dense(array![1.0, 9.0, 1.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_update_over_lost_tile_writes_nothing() {
        let (cluster, alloc) = cluster(2).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([6]).with_tile_hint([2]))
            .await
            .unwrap();
        // tiles [0, 2) and [4, 6) live on w0, [2, 4) on w1
        alloc.workers()[1].kill();
        let err = array
            .update(&array.full_extent(), Buffer::from_elem(&[6], 5.0))
            .unwrap_err();
        assert!(matches!(err, SpartanError::TileFailure { lost: true, .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = array.fetch(&ex(&[0], &[2], &[6])).await.unwrap();
        assert_eq!(first, Buffer::zeros(&[2]));
    }

    #[tokio::test]
    async fn test_foreach_tile_collects_in_tile_order() {
        let (cluster, _alloc) = cluster(3).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([9]).with_tile_hint([3]))
            .await
            .unwrap();
        let mapper = tile_mapper(|extent, _worker| async move {
            if extent.ul()[0] == 3 {
                // a tile with nothing to report
                return Ok(vec![]);
            }
            Ok(vec![extent.ul()[0]])
        });
        assert_eq!(array.foreach_tile(mapper).await.unwrap(), vec![0, 6]);
    }

    #[tokio::test]
    async fn test_lost_tiles() {
        let (cluster, alloc) = cluster(2).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([4]).with_tile_hint([2]))
            .await
            .unwrap();
        alloc.workers()[1].kill();
        assert_eq!(array.bad_tiles(), vec![ex(&[2], &[4], &[4])]);
        // the surviving tile is still readable
        assert!(array.fetch(&ex(&[0], &[2], &[4])).await.is_ok());
        assert!(matches!(
            array.glom().await,
            Err(SpartanError::TileFailure { lost: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_kernel_runs_once() {
        let (cluster, _alloc) = cluster(2).await;
        assert_eq!(cluster.config().tile_retries, 1);
        let array = DistArray::create(&cluster, &ArraySpec::new([4]).with_tile_hint([2]))
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mapper = tile_mapper(move |extent, _worker| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(extent.ul()[0] == 0, "kernel failed");
                Ok(Vec::<()>::new())
            }
        });
        match array.foreach_tile(mapper).await {
            Err(SpartanError::TileFailure { message, lost, .. }) => {
                assert!(message.contains("kernel failed"));
                assert!(!lost);
            }
            other => panic!("unexpected {:?}", other),
        }
        // let the other tile's kernel finish
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lost_worker_is_retried() {
        let (cluster, alloc) = cluster(2).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([4]).with_tile_hint([2]))
            .await
            .unwrap();
        alloc.workers()[1].kill();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mapper = tile_mapper(move |_extent, worker| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![worker.id().0])
            }
        });
        // the second tile's worker is gone, so its kernel runs on w0
        assert_eq!(array.foreach_tile(mapper).await.unwrap(), vec![0, 0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_releases_tiles() {
        let (cluster, alloc) = cluster(1).await;
        let array = DistArray::create(&cluster, &ArraySpec::new([4]).with_tile_hint([1]))
            .await
            .unwrap();
        assert_eq!(alloc.workers()[0].num_tiles(), 4);
        drop(array);
        assert_eq!(alloc.workers()[0].num_tiles(), 0);
    }
}
