/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Indexing: views for basic indexing, and gathers for integer-array
//! and boolean indexing.

use std::sync::Arc;

use ndarray::Array1;
use ndextent::Extent;

use super::Evaluator;
use super::Expr;
use super::SliceExpr;
use super::SliceIndex;
use crate::array::ArrayRef;
use crate::darray::ArraySpec;
use crate::darray::DistArray;
use crate::darray::tile_mapper;
use crate::error::SpartanError;
use crate::tile::Buffer;

pub(super) async fn evaluate(ev: &Evaluator, node: &SliceExpr) -> Result<ArrayRef, SpartanError> {
    match &node.index {
        SliceIndex::Basic(index) => Ok(ev.force(&node.input).await?.view(index)?.into()),
        SliceIndex::Take(indices) => take(ev, &node.input, indices).await,
        SliceIndex::Mask(mask) => mask_select(ev, &node.input, mask).await,
    }
}

/// Resolve a take index against an axis of length `len`. Negative
/// indices count from the end.
fn resolve_row(value: f64, len: usize) -> Result<usize, SpartanError> {
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(SpartanError::ShapeMismatch(format!(
            "take index {} is not an integer",
            value
        )));
    }
    let row = if value < 0.0 { value + len as f64 } else { value };
    if row < 0.0 || row >= len as f64 {
        return Err(SpartanError::OutOfBounds(format!(
            "take index {} out of range for axis of length {}",
            value, len
        )));
    }
    Ok(row as usize)
}

/// Gather rows of `input` along axis 0.
async fn take(ev: &Evaluator, input: &Expr, indices: &Expr) -> Result<ArrayRef, SpartanError> {
    let source = ev.force(input).await?;
    let shape = source.shape();
    let Some(&len) = shape.first() else {
        return Err(SpartanError::ShapeMismatch(
            "cannot take from a 0-dimensional array".to_string(),
        ));
    };
    let indices = ev.force(indices).await?.glom().await?.into_dense();
    if indices.ndim() != 1 {
        return Err(SpartanError::ShapeMismatch(format!(
            "take indices must be 1-dimensional, got shape {:?}",
            indices.shape()
        )));
    }
    let rows: Arc<[usize]> = indices
        .iter()
        .map(|v| resolve_row(*v, len))
        .collect::<Result<Vec<_>, _>>()?
        .into();

    let mut out_shape = vec![rows.len()];
    out_shape.extend_from_slice(&shape[1..]);
    let spec = ArraySpec::new(out_shape).with_dtype(source.dtype());
    let target = DistArray::create(ev.cluster(), &spec).await?;

    let out = target.clone();
    let mapper = tile_mapper(move |extent: Extent, _worker| {
        let rows = Arc::clone(&rows);
        let source = source.clone();
        let out = out.clone();
        async move {
            let src_shape = source.shape();
            let rest: Vec<_> = extent.to_slice().into_iter().skip(1).collect();
            let mut pieces = Vec::with_capacity(extent.shape()[0]);
            for (local, row) in (extent.ul()[0]..extent.lr()[0]).enumerate() {
                let src = rows[row];
                let mut ul = vec![src];
                let mut lr = vec![src + 1];
                ul.extend(rest.iter().map(|r| r.start));
                lr.extend(rest.iter().map(|r| r.end));
                let data = source
                    .fetch(&Extent::new(ul, lr, src_shape.clone())?)
                    .await?;
                let mut at = vec![local..local + 1];
                at.extend(rest.iter().map(|r| 0..r.len()));
                pieces.push((at, data));
            }
            let gathered = Buffer::assemble(&extent.shape(), false, pieces)?;
            out.update_and_wait(&extent, gathered).await?;
            Ok(Vec::<()>::new())
        }
    });
    target.foreach_tile(mapper).await?;
    Ok(target.into())
}

/// Select the elements of `input` where `mask` is nonzero, in row-major
/// order, as a 1-dimensional array.
async fn mask_select(ev: &Evaluator, input: &Expr, mask: &Expr) -> Result<ArrayRef, SpartanError> {
    let source = ev.force(input).await?;
    let mask = ev.force(mask).await?;
    if mask.shape() != source.shape() {
        return Err(SpartanError::ShapeMismatch(format!(
            "mask of shape {:?} applied to array of shape {:?}",
            mask.shape(),
            source.shape()
        )));
    }

    let reader = source.clone();
    let mapper = tile_mapper(move |extent: Extent, _worker| {
        let reader = reader.clone();
        let mask = mask.clone();
        async move {
            let values = reader.fetch(&extent).await?.into_dense();
            let keep = mask.fetch(&extent).await?.into_dense();
            Ok(values
                .iter()
                .zip(keep.iter())
                .enumerate()
                .filter(|(_, (_, k))| **k != 0.0)
                .map(|(local, (v, _))| (extent.to_global(local, None), *v))
                .collect::<Vec<_>>())
        }
    });
    let mut selected = source.foreach_tile(mapper).await?;
    selected.sort_by_key(|(pos, _)| *pos);

    let spec = ArraySpec::new([selected.len()]).with_dtype(source.dtype());
    let target = DistArray::create(ev.cluster(), &spec).await?;
    if !selected.is_empty() {
        let values: Array1<f64> = selected.into_iter().map(|(_, v)| v).collect();
        target
            .update_and_wait(&target.full_extent(), Buffer::Dense(values.into_dyn()))
            .await?;
    }
    Ok(target.into())
}
