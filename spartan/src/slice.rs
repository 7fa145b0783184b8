/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Non-copying views of a distributed array.

use std::sync::Arc;

use futures::FutureExt;
use ndextent::Extent;
use ndextent::Index;
use ndextent::Region;
use ndextent::from_slice;

use crate::darray::DistArray;
use crate::darray::TileMapper;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::tile::Buffer;
use crate::worker::Worker;

/// A view of `darray` restricted to a region. Extents handed to
/// readers of the view are in the view's own frame: axes indexed by a
/// single position are dropped and coordinates start at zero.
#[derive(Debug, Clone)]
pub struct Slice {
    darray: DistArray,
    region: Region,
}

/// Wrap `mapper` so that it runs over the tiles of the backing array
/// but only sees the part of each tile inside `region`, expressed in
/// the view's frame. Tiles outside the region contribute nothing.
pub fn project<T: Send + 'static>(region: Region, mapper: TileMapper<T>) -> TileMapper<T> {
    Arc::new(move |extent: Extent, worker: Arc<dyn Worker>| {
        let Some(overlap) = region.extent.intersection(&extent) else {
            return futures::future::ready(Ok(Vec::new())).boxed();
        };
        match region.squeeze(&overlap) {
            Ok(local) => mapper(local, worker),
            Err(err) => futures::future::ready(Err(err.into())).boxed(),
        }
    })
}

impl Slice {
    /// A view of `darray` selected by `index`.
    pub fn new(darray: DistArray, index: &[Index]) -> Result<Self, SpartanError> {
        let region = from_slice(index, darray.shape())?;
        Ok(Self { darray, region })
    }

    /// A view of `darray` over `region`, which must lie within it.
    pub fn from_region(darray: DistArray, region: Region) -> Result<Self, SpartanError> {
        if region.extent.array_shape() != darray.shape() || region.dropped.len() != darray.ndim() {
            return Err(SpartanError::OutOfBounds(format!(
                "region {} does not fit an array of shape {:?}",
                region.extent,
                darray.shape()
            )));
        }
        Ok(Self { darray, region })
    }

    /// A view of this view, selected by `index` in this view's frame.
    pub fn subslice(&self, index: &[Index]) -> Result<Self, SpartanError> {
        let inner = from_slice(index, &self.shape())?;
        let extent = self.region.expand(&inner.extent)?;
        let mut inner_dropped = inner.dropped.into_iter();
        let dropped = self
            .region
            .dropped
            .iter()
            .map(|outer| *outer || inner_dropped.next().unwrap_or(false))
            .collect();
        Ok(Self {
            darray: self.darray.clone(),
            region: Region { extent, dropped },
        })
    }

    pub fn darray(&self) -> &DistArray {
        &self.darray
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn shape(&self) -> Vec<usize> {
        self.region.shape()
    }

    pub fn dtype(&self) -> DType {
        self.darray.dtype()
    }

    pub fn is_sparse(&self) -> bool {
        self.darray.is_sparse() && self.shape().len() == 2
    }

    /// The view's tiles, in its own frame, with their owning workers.
    pub fn layout(&self) -> Vec<(Extent, Arc<dyn Worker>)> {
        self.darray
            .layout()
            .into_iter()
            .filter_map(|(extent, worker)| {
                let overlap = self.region.extent.intersection(&extent)?;
                let local = self.region.squeeze(&overlap).ok()?;
                Some((local, worker))
            })
            .collect()
    }

    pub fn extents(&self) -> Vec<Extent> {
        self.layout().into_iter().map(|(ex, _)| ex).collect()
    }

    /// Unavailable parts of the view, in its own frame.
    pub fn bad_tiles(&self) -> Vec<Extent> {
        self.darray
            .bad_tiles()
            .into_iter()
            .filter_map(|bad| {
                let overlap = self.region.extent.intersection(&bad)?;
                self.region.squeeze(&overlap).ok()
            })
            .collect()
    }

    /// Run `mapper` over the backing tiles that overlap the view.
    pub async fn foreach_tile<T: Send + 'static>(
        &self,
        mapper: TileMapper<T>,
    ) -> Result<Vec<T>, SpartanError> {
        self.darray
            .foreach_tile_within(&self.region.extent, project(self.region.clone(), mapper))
            .await
    }

    /// Read `extent`, given in the view's frame.
    pub async fn fetch(&self, extent: &Extent) -> Result<Buffer, SpartanError> {
        if extent.array_shape() != self.shape() {
            return Err(SpartanError::OutOfBounds(format!(
                "{} is not within a view of shape {:?}",
                extent,
                self.shape()
            )));
        }
        let backing = self.region.expand(extent)?;
        self.darray.fetch(&backing).await?.reshape(&extent.shape())
    }

    /// Read with numpy-style indexing relative to the view.
    pub async fn select(&self, index: &[Index]) -> Result<Buffer, SpartanError> {
        let inner = from_slice(index, &self.shape())?;
        self.fetch(&inner.extent).await?.reshape(&inner.shape())
    }

    pub async fn glom(&self) -> Result<Buffer, SpartanError> {
        self.fetch(&Extent::from_shape(&self.shape())).await
    }
}
