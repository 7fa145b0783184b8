/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Two-pass prefix scans.
//!
//! The first pass reduces every tile along the scan axis. The partials
//! of tiles that share a cross-section are accumulated in order along
//! the axis, giving each tile the total of everything before it. The
//! second pass folds that total into the first slab of the tile and
//! runs the scan kernel locally.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use ndarray::Axis;
use ndarray::Zip;
use ndextent::Extent;

use super::Evaluator;
use super::ScanExpr;
use crate::accum;
use crate::accum::Accumulator;
use crate::array::ArrayRef;
use crate::darray::DistArray;
use crate::darray::tile_mapper;
use crate::error::SpartanError;
use crate::rpc;
use crate::tile::Buffer;

/// Fold `prefix` into the first slab of `tile` along `axis`.
fn apply_prefix(
    tile: Buffer,
    prefix: &Buffer,
    axis: usize,
    accumulate: &dyn Accumulator,
) -> anyhow::Result<Buffer> {
    let mut data = tile.into_dense();
    let prefix = prefix.to_dense();
    let mut first = data.index_axis_mut(Axis(axis), 0);
    anyhow::ensure!(
        first.shape() == prefix.shape(),
        "scan prefix of shape {:?} does not fit slab of shape {:?}",
        prefix.shape(),
        first.shape()
    );
    Zip::from(&mut first)
        .and(&prefix)
        .for_each(|state, p| accumulate.accumulate(state, *p));
    Ok(Buffer::Dense(data))
}

pub(super) async fn evaluate(ev: &Evaluator, node: &ScanExpr) -> Result<ArrayRef, SpartanError> {
    let input = ev.force(&node.input).await?;
    let shape = input.shape();
    let axis = node.axis;
    if axis >= shape.len() {
        return Err(SpartanError::ShapeMismatch(format!(
            "scan axis {} out of range for shape {:?}",
            axis, shape
        )));
    }
    let dtype = node.dtype.unwrap_or_else(|| input.dtype());
    let target = DistArray::with_layout(
        ev.cluster(),
        shape,
        dtype,
        false,
        accum::replace(),
        input.layout(),
    )
    .await?;

    let scan_fn = Arc::clone(&node.scan_fn);
    let out = target.clone();
    let source = input.clone();
    match &node.reduce_fn {
        Some(reduce_fn) => {
            // Pass 1.
            let reduce_fn = Arc::clone(reduce_fn);
            let reader = input.clone();
            let mapper = tile_mapper(move |extent: Extent, _worker| {
                let reduce_fn = Arc::clone(&reduce_fn);
                let reader = reader.clone();
                async move {
                    let tile = reader.fetch(&extent).await?;
                    let partial = reduce_fn(&extent, tile, Some(axis))?;
                    Ok(vec![(extent, partial)])
                }
            });
            let partials = input.foreach_tile(mapper).await?;

            // Tiles arrive in upper-left order, which within one
            // cross-section is their order along the axis.
            let mut running: HashMap<Extent, Buffer> = HashMap::new();
            let mut prefixes: HashMap<Extent, Buffer> = HashMap::new();
            for (extent, partial) in partials {
                match running.entry(extent.drop_axis(axis)?) {
                    Entry::Vacant(entry) => {
                        entry.insert(partial);
                    }
                    Entry::Occupied(mut entry) => {
                        prefixes.insert(extent, entry.get().clone());
                        entry.get_mut().accumulate(&partial, node.accumulate.as_ref())?;
                    }
                }
            }
            tracing::debug!(
                axis,
                sections = running.len(),
                carried = prefixes.len(),
                "scan prefixes computed"
            );

            // Pass 2.
            let prefixes = Arc::new(prefixes);
            let accumulate = Arc::clone(&node.accumulate);
            let mapper = tile_mapper(move |extent: Extent, _worker| {
                let prefixes = Arc::clone(&prefixes);
                let accumulate = Arc::clone(&accumulate);
                let scan_fn = Arc::clone(&scan_fn);
                let source = source.clone();
                let out = out.clone();
                async move {
                    let mut tile = source.fetch(&extent).await?;
                    if let Some(prefix) = prefixes.get(&extent) {
                        tile = apply_prefix(tile, prefix, axis, accumulate.as_ref())?;
                    }
                    out.update_and_wait(&extent, scan_fn(tile, axis)?).await?;
                    Ok(Vec::<()>::new())
                }
            });
            input.foreach_tile(mapper).await?;
        }
        None => {
            // Gather everything and scan it in one piece on one worker.
            let gathered = input.glom().await?;
            let worker = ev.cluster().place(0)?;
            let scan = Arc::clone(&scan_fn);
            let scanned = rpc::submit(&worker, &input.full_extent(), async move {
                scan(gathered, axis)
            })?
            .wait()
            .await?;
            let scanned = Arc::new(scanned);
            let mapper = tile_mapper(move |extent: Extent, _worker| {
                let scanned = Arc::clone(&scanned);
                let out = out.clone();
                async move {
                    out.update_and_wait(&extent, scanned.slice(&extent.to_slice())?)
                        .await?;
                    Ok(Vec::<()>::new())
                }
            });
            input.foreach_tile(mapper).await?;
        }
    }
    Ok(target.into())
}
