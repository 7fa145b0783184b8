/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Splitting an array shape into tiles.

use itertools::Itertools;
use ndextent::Extent;

use crate::error::SpartanError;

fn chunks(size: usize, chunk: usize) -> Vec<(usize, usize)> {
    (0..size)
        .step_by(chunk.max(1))
        .map(|ul| (ul, (ul + chunk).min(size)))
        .collect()
}

/// Split `shape` into tiles, returned in upper-left order.
///
/// With a `tile_hint`, each axis is cut into chunks of the hinted
/// length. Otherwise the array is cut into about `num_tiles` tiles by
/// repeatedly halving the axis with the largest chunk. Shapes with a
/// zero-length axis have no tiles; a 0-dimensional shape has one.
pub fn split(
    shape: &[usize],
    tile_hint: Option<&[usize]>,
    num_tiles: usize,
) -> Result<Vec<Extent>, SpartanError> {
    if shape.iter().any(|s| *s == 0) {
        return Ok(Vec::new());
    }
    if shape.is_empty() {
        return Ok(vec![Extent::from_shape(shape)]);
    }

    let chunk_shape: Vec<usize> = match tile_hint {
        Some(hint) => {
            if hint.len() != shape.len() || hint.contains(&0) {
                return Err(SpartanError::ShapeMismatch(format!(
                    "tile hint {:?} does not fit shape {:?}",
                    hint, shape
                )));
            }
            hint.iter().zip(shape).map(|(h, s)| *h.min(s)).collect()
        }
        None => {
            let mut chunk = shape.to_vec();
            let count = |chunk: &[usize]| -> usize {
                chunk
                    .iter()
                    .zip(shape)
                    .map(|(c, s)| s.div_ceil(*c))
                    .product()
            };
            while count(&chunk) < num_tiles {
                let (axis, largest) = chunk
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
                    .unwrap_or((0, 1));
                if largest <= 1 {
                    break;
                }
                chunk[axis] = largest.div_ceil(2);
            }
            chunk
        }
    };

    shape
        .iter()
        .zip(&chunk_shape)
        .map(|(s, c)| chunks(*s, *c))
        .multi_cartesian_product()
        .map(|bounds| {
            let (ul, lr): (Vec<usize>, Vec<usize>) = bounds.into_iter().unzip();
            Extent::new(ul, lr, shape.to_vec()).map_err(SpartanError::from)
        })
        .collect()
}
