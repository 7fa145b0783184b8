/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shuffles: every source tile emits `(destination, data)` pairs that
//! are merged into a target array.

use std::sync::Arc;

use super::Evaluator;
use super::Expr;
use super::ShuffleContext;
use super::ShuffleExpr;
use super::ShuffleFn;
use super::ShuffleTarget;
use super::shuffle_kernel;
use crate::accum;
use crate::array::ArrayRef;
use crate::darray::ArraySpec;
use crate::darray::DistArray;
use crate::darray::tile_mapper;
use crate::error::SpartanError;
use crate::rpc::FutureGroup;

/// Run `kernel` over the tiles of `inputs[0]` and merge everything it
/// emits into `target`. Returns the number of pieces written.
pub(crate) async fn scatter(
    inputs: Arc<[ArrayRef]>,
    target: &DistArray,
    kernel: ShuffleFn,
) -> Result<usize, SpartanError> {
    let Some(source) = inputs.first().cloned() else {
        return Err(SpartanError::ShapeMismatch(
            "shuffle needs at least one input".to_string(),
        ));
    };
    let out = target.clone();
    let mapper = tile_mapper(move |extent, worker| {
        let emitted = kernel(ShuffleContext {
            inputs: Arc::clone(&inputs),
            extent,
            worker,
        });
        let out = out.clone();
        async move {
            let mut writes = FutureGroup::new();
            let mut count: usize = 0;
            for (dst, data) in emitted.await? {
                if dst.is_empty() {
                    continue;
                }
                writes.extend(out.update(&dst, data)?);
                count += 1;
            }
            writes.wait_all().await?;
            Ok(vec![count])
        }
    });
    let written: usize = source.foreach_tile(mapper).await?.into_iter().sum();
    tracing::debug!(array = %target.id(), written, "shuffle complete");
    Ok(written)
}

pub(super) async fn evaluate(ev: &Evaluator, node: &ShuffleExpr) -> Result<ArrayRef, SpartanError> {
    let inputs = ev.force_all(&node.inputs).await?;
    let Some(first) = inputs.first() else {
        return Err(SpartanError::ShapeMismatch(
            "shuffle needs at least one input".to_string(),
        ));
    };
    let target = match &node.target {
        ShuffleTarget::LikeInput { dtype, merge } => {
            DistArray::with_layout(
                ev.cluster(),
                first.shape(),
                dtype.unwrap_or_else(|| first.dtype()),
                first.is_sparse(),
                Arc::clone(merge),
                first.layout(),
            )
            .await?
        }
        ShuffleTarget::New(spec) => DistArray::create(ev.cluster(), spec).await?,
        ShuffleTarget::Flat(dtype) => {
            let spec = ArraySpec::new([first.size()]).with_dtype(*dtype);
            DistArray::create(ev.cluster(), &spec).await?
        }
        ShuffleTarget::Existing(expr) => match ev.force(expr).await? {
            ArrayRef::Dist(array) => array,
            ArrayRef::Slice(_) => {
                return Err(SpartanError::ShapeMismatch(
                    "a shuffle cannot write into a view".to_string(),
                ));
            }
        },
    };
    scatter(inputs.into(), &target, Arc::clone(&node.kernel)).await?;
    Ok(target.into())
}

/// Reverse the axes of `input`. Every tile is transposed locally and
/// written to the mirrored extent of a new array, on the same worker.
pub(super) async fn transpose(ev: &Evaluator, input: &Expr) -> Result<ArrayRef, SpartanError> {
    let source = ev.force(input).await?;
    let mut shape = source.shape();
    shape.reverse();
    let layout = source
        .layout()
        .into_iter()
        .map(|(extent, worker)| (extent.transposed(), worker))
        .collect();
    let target = DistArray::with_layout(
        ev.cluster(),
        shape,
        source.dtype(),
        source.is_sparse(),
        accum::replace(),
        layout,
    )
    .await?;
    let kernel = shuffle_kernel(|ctx: ShuffleContext| async move {
        let tile = ctx.inputs[0].fetch(&ctx.extent).await?;
        Ok(vec![(ctx.extent.transposed(), tile.transposed())])
    });
    scatter(vec![source].into(), &target, kernel).await?;
    Ok(target.into())
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use ndarray::array;
    use ndextent::Extent;

    use super::*;
    use crate::builtins;
    use crate::cluster::Cluster;
    use crate::config::Config;
    use crate::tile::Buffer;

    async fn evaluator() -> Evaluator {
        Evaluator::new(Cluster::start(Config::local(2)).await.unwrap())
    }

    #[tokio::test]
    async fn test_transpose() {
        let ev = evaluator().await;
        let data = Array::from_shape_fn((3, 5), |(i, j)| (i * 10 + j) as f64).into_dyn();
        let a = builtins::from_dense(data.clone(), Some(vec![2, 2])).unwrap();
        let t = builtins::transpose(&a);
        let got = ev.glom(&t).await.unwrap().into_dense();
        assert_eq!(got.shape(), &[5, 3]);
        assert_eq!(got, data.t().to_owned());
    }

    #[tokio::test]
    async fn test_fan_out_into_new_target() {
        let ev = evaluator().await;
        let a = builtins::ones(ArraySpec::new([4]).with_tile_hint([2])).unwrap();
        // every source tile adds its total to both cells of the target
        let node = ShuffleExpr {
            inputs: vec![a],
            kernel: shuffle_kernel(|ctx: ShuffleContext| async move {
                let total = ctx.inputs[0].fetch(&ctx.extent).await?.into_dense().sum();
                let dst = Extent::from_shape(&[2]);
                Ok(vec![(dst, Buffer::from_elem(&[2], total))])
            }),
            target: ShuffleTarget::New(ArraySpec::new([2]).with_merge(accum::sum())),
        };
        let out = Expr::shuffle(node).unwrap();
        assert_eq!(
            ev.glom(&out).await.unwrap(),
            Buffer::Dense(array![4.0, 4.0].into_dyn())
        );
    }

    #[tokio::test]
    async fn test_write_into_existing() {
        let ev = evaluator().await;
        let target = builtins::zeros(ArraySpec::new([3])).unwrap();
        let src = builtins::ones(ArraySpec::new([3])).unwrap();
        let node = ShuffleExpr {
            inputs: vec![src],
            kernel: shuffle_kernel(|ctx: ShuffleContext| async move {
                let tile = ctx.inputs[0].fetch(&ctx.extent).await?;
                Ok(vec![(ctx.extent, tile)])
            }),
            target: ShuffleTarget::Existing(target.clone()),
        };
        let out = ev.force(&Expr::shuffle(node).unwrap()).await.unwrap();
        let forced = ev.force(&target).await.unwrap();
        assert_eq!(out.as_dist().unwrap().id(), forced.as_dist().unwrap().id());
        assert_eq!(forced.glom().await.unwrap(), Buffer::from_elem(&[3], 1.0));
    }
}
