/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A materialized array: either a distributed array or a view of one.

use std::sync::Arc;

use enum_as_inner::EnumAsInner;
use ndextent::Extent;
use ndextent::Index;

use crate::cluster::Cluster;
use crate::darray::DistArray;
use crate::darray::TileMapper;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::slice::Slice;
use crate::tile::Buffer;
use crate::worker::Worker;

/// The result of forcing an expression.
#[derive(Debug, Clone, EnumAsInner)]
pub enum ArrayRef {
    Dist(DistArray),
    Slice(Slice),
}

impl From<DistArray> for ArrayRef {
    fn from(array: DistArray) -> Self {
        ArrayRef::Dist(array)
    }
}

impl From<Slice> for ArrayRef {
    fn from(slice: Slice) -> Self {
        ArrayRef::Slice(slice)
    }
}

impl ArrayRef {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ArrayRef::Dist(a) => a.shape().to_vec(),
            ArrayRef::Slice(s) => s.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayRef::Dist(a) => a.dtype(),
            ArrayRef::Slice(s) => s.dtype(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        match self {
            ArrayRef::Dist(a) => a.is_sparse(),
            ArrayRef::Slice(s) => s.is_sparse(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        match self {
            ArrayRef::Dist(a) => a.cluster(),
            ArrayRef::Slice(s) => s.darray().cluster(),
        }
    }

    pub fn full_extent(&self) -> Extent {
        Extent::from_shape(&self.shape())
    }

    /// Tile extents in this array's frame, with their owning workers.
    pub fn layout(&self) -> Vec<(Extent, Arc<dyn Worker>)> {
        match self {
            ArrayRef::Dist(a) => a.layout(),
            ArrayRef::Slice(s) => s.layout(),
        }
    }

    pub fn extents(&self) -> Vec<Extent> {
        match self {
            ArrayRef::Dist(a) => a.extents(),
            ArrayRef::Slice(s) => s.extents(),
        }
    }

    pub fn bad_tiles(&self) -> Vec<Extent> {
        match self {
            ArrayRef::Dist(a) => a.bad_tiles(),
            ArrayRef::Slice(s) => s.bad_tiles(),
        }
    }

    pub async fn foreach_tile<T: Send + 'static>(
        &self,
        mapper: TileMapper<T>,
    ) -> Result<Vec<T>, SpartanError> {
        match self {
            ArrayRef::Dist(a) => a.foreach_tile(mapper).await,
            ArrayRef::Slice(s) => s.foreach_tile(mapper).await,
        }
    }

    pub async fn fetch(&self, extent: &Extent) -> Result<Buffer, SpartanError> {
        match self {
            ArrayRef::Dist(a) => a.fetch(extent).await,
            ArrayRef::Slice(s) => s.fetch(extent).await,
        }
    }

    pub async fn select(&self, index: &[Index]) -> Result<Buffer, SpartanError> {
        match self {
            ArrayRef::Dist(a) => a.select(index).await,
            ArrayRef::Slice(s) => s.select(index).await,
        }
    }

    pub async fn glom(&self) -> Result<Buffer, SpartanError> {
        match self {
            ArrayRef::Dist(a) => a.glom().await,
            ArrayRef::Slice(s) => s.glom().await,
        }
    }

    /// A view of this array selected by `index`.
    pub fn view(&self, index: &[Index]) -> Result<Slice, SpartanError> {
        match self {
            ArrayRef::Dist(a) => Slice::new(a.clone(), index),
            ArrayRef::Slice(s) => s.subslice(index),
        }
    }
}
