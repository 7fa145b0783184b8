/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Elementwise evaluation.

use std::sync::Arc;

use ndextent::Extent;

use super::Evaluator;
use super::MapExpr;
use super::map_output_shape;
use crate::accum;
use crate::array::ArrayRef;
use crate::darray::DistArray;
use crate::darray::tile_mapper;
use crate::error::SpartanError;
use crate::tile::Buffer;

/// Read the part of `input` that broadcasts onto `extent`, an extent of
/// the (possibly larger) output.
async fn fetch_broadcast(input: &ArrayRef, extent: &Extent) -> Result<Buffer, SpartanError> {
    let shape = input.shape();
    if shape == extent.array_shape() {
        return input.fetch(extent).await;
    }
    let offset = extent.ndim() - shape.len();
    let (ul, lr): (Vec<usize>, Vec<usize>) = shape
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            if *dim == 1 {
                (0, 1)
            } else {
                (extent.ul()[offset + axis], extent.lr()[offset + axis])
            }
        })
        .unzip();
    let region = Extent::new(ul, lr, shape)?;
    input.fetch(&region).await?.broadcast_to(&extent.shape())
}

/// Run the kernel over the tiles of the input whose shape is the output
/// shape; the output takes that input's tiling.
pub(super) async fn evaluate(ev: &Evaluator, node: &MapExpr) -> Result<ArrayRef, SpartanError> {
    let inputs = ev.force_all(&node.inputs).await?;
    let shapes: Vec<Vec<usize>> = inputs.iter().map(ArrayRef::shape).collect();
    let shape = map_output_shape(&shapes)?;
    let primary = inputs
        .iter()
        .find(|input| input.shape() == shape)
        .cloned()
        .ok_or_else(|| SpartanError::ShapeMismatch(format!("no map input has shape {:?}", shape)))?;
    let dtype = node.dtype.unwrap_or_else(|| inputs[0].dtype());

    let target = DistArray::with_layout(
        ev.cluster(),
        shape,
        dtype,
        node.sparse,
        accum::replace(),
        primary.layout(),
    )
    .await?;

    let inputs: Arc<[ArrayRef]> = inputs.into();
    let kernel = Arc::clone(&node.kernel);
    let out = target.clone();
    let mapper = tile_mapper(move |extent, _worker| {
        let inputs = Arc::clone(&inputs);
        let kernel = Arc::clone(&kernel);
        let out = out.clone();
        async move {
            let mut tiles = Vec::with_capacity(inputs.len());
            for input in inputs.iter() {
                tiles.push(fetch_broadcast(input, &extent).await?);
            }
            let result = kernel(&tiles, &extent)?;
            out.update_and_wait(&extent, result).await?;
            Ok(Vec::<()>::new())
        }
    });
    primary.foreach_tile(mapper).await?;
    Ok(target.into())
}
