/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reductions along one axis or over a whole array.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use ndextent::Extent;

use super::Evaluator;
use super::ReduceExpr;
use crate::array::ArrayRef;
use crate::darray::ArraySpec;
use crate::darray::DistArray;
use crate::darray::tile_mapper;
use crate::error::SpartanError;
use crate::rpc::FutureGroup;
use crate::tile::Buffer;

pub(super) async fn evaluate(ev: &Evaluator, node: &ReduceExpr) -> Result<ArrayRef, SpartanError> {
    let input = ev.force(&node.input).await?;
    let mut shape = input.shape();
    if let Some(axis) = node.axis {
        if axis >= shape.len() {
            return Err(SpartanError::ShapeMismatch(format!(
                "axis {} out of range for shape {:?}",
                axis, shape
            )));
        }
        shape.remove(axis);
    } else {
        shape.clear();
    }
    let dtype = (node.dtype_fn)(input.dtype());

    // Pass 1: one partial per tile, keyed by the output region it
    // reduces into.
    let axis = node.axis;
    let local_reduce = Arc::clone(&node.local_reduce);
    let source = input.clone();
    let mapper = tile_mapper(move |extent: Extent, _worker| {
        let local_reduce = Arc::clone(&local_reduce);
        let source = source.clone();
        async move {
            let dst = extent.index_for_reduction(axis)?;
            let tile = source.fetch(&extent).await?;
            let partial = local_reduce(&extent, tile, axis)?;
            anyhow::ensure!(
                partial.shape() == dst.shape(),
                "partial of shape {:?} does not fit reduction output {}",
                partial.shape(),
                dst
            );
            Ok(vec![(dst, partial)])
        }
    });
    let partials = input.foreach_tile(mapper).await?;

    // Partials arrive in upper-left order of their source tiles, so
    // accumulators that keep the current value on ties keep the
    // earliest tile's.
    let mut folded: BTreeMap<Extent, Buffer> = BTreeMap::new();
    for (dst, partial) in partials {
        match folded.entry(dst) {
            Entry::Vacant(entry) => {
                entry.insert(partial);
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().accumulate(&partial, node.accumulate.as_ref())?;
            }
        }
    }
    tracing::debug!(
        axis = ?node.axis,
        outputs = folded.len(),
        "folded reduction partials"
    );

    let cluster = ev.cluster();
    let target = if folded.is_empty() {
        let spec = ArraySpec::new(shape)
            .with_dtype(dtype)
            .with_merge(Arc::clone(&node.accumulate));
        DistArray::create(cluster, &spec).await?
    } else {
        let layout = folded
            .keys()
            .enumerate()
            .map(|(i, dst)| Ok((dst.clone(), cluster.place(i)?)))
            .collect::<Result<Vec<_>, SpartanError>>()?;
        DistArray::with_layout(
            cluster,
            shape,
            dtype,
            false,
            Arc::clone(&node.accumulate),
            layout,
        )
        .await?
    };

    let mut writes = FutureGroup::new();
    for (dst, partial) in folded {
        writes.extend(target.update(&dst, partial)?);
    }
    writes.wait_all().await?;
    Ok(target.into())
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::builtins;
    use crate::cluster::Cluster;
    use crate::config::Config;

    async fn evaluator() -> Evaluator {
        Evaluator::new(Cluster::start(Config::local(3)).await.unwrap())
    }

    #[tokio::test]
    async fn test_sum_all_and_along_axis() {
        let ev = evaluator().await;
        let a = builtins::ones(ArraySpec::new([6, 4]).with_tile_hint([4, 3])).unwrap();
        let total = builtins::sum(&a, None).unwrap();
        let got = ev.glom(&total).await.unwrap();
        assert!(got.shape().is_empty());
        assert_eq!(got.into_dense().sum(), 24.0);

        let rows = builtins::sum(&a, Some(1)).unwrap();
        let got = ev.force(&rows).await.unwrap();
        assert_eq!(got.shape(), vec![6]);
        // one output tile per row band of the input
        assert_eq!(got.extents().len(), 2);
        assert_eq!(
            got.glom().await.unwrap(),
            Buffer::Dense(array![4.0, 4.0, 4.0, 4.0, 4.0, 4.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_argmin_ties_keep_first_tile() {
        let ev = evaluator().await;
        let data = array![3.0, 1.0, 5.0, 1.0, 2.0, 1.0].into_dyn();
        let a = builtins::from_dense(data, Some(vec![2])).unwrap();
        let idx = ev.glom(&builtins::argmin(&a, None).unwrap()).await.unwrap();
        assert_eq!(idx.into_dense().sum(), 1.0);
        let idx = ev.glom(&builtins::argmax(&a, None).unwrap()).await.unwrap();
        assert_eq!(idx.into_dense().sum(), 2.0);
    }

    #[tokio::test]
    async fn test_reduce_empty_array() {
        let ev = evaluator().await;
        let a = builtins::ones(ArraySpec::new([0, 3])).unwrap();
        let total = ev.glom(&builtins::sum(&a, Some(0)).unwrap()).await.unwrap();
        assert_eq!(total, Buffer::zeros(&[3]));
    }
}
