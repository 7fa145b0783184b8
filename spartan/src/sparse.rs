/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A coordinate-format sparse matrix used as the buffer of sparse tiles.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Range;

use ndarray::Array2;
use ndarray::ArrayView2;

use crate::accum::Accumulator;
use crate::error::SpartanError;

/// A 2-dimensional sparse buffer. Entries are kept in row-major order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseTile {
    shape: [usize; 2],
    entries: BTreeMap<(usize, usize), f64>,
}

impl SparseTile {
    pub fn new(shape: [usize; 2]) -> Self {
        Self {
            shape,
            entries: BTreeMap::new(),
        }
    }

    /// Build from the nonzero entries of a dense matrix.
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Self {
        let (rows, cols) = dense.dim();
        let entries = dense
            .indexed_iter()
            .filter(|(_, v)| **v != 0.0)
            .map(|(pos, v)| (pos, *v))
            .collect();
        Self {
            shape: [rows, cols],
            entries,
        }
    }

    /// Build from `(row, col, value)` triplets. Later duplicates replace
    /// earlier ones.
    pub fn from_triplets(
        shape: [usize; 2],
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, SpartanError> {
        let mut tile = Self::new(shape);
        for (r, c, v) in triplets {
            if r >= shape[0] || c >= shape[1] {
                return Err(SpartanError::OutOfBounds(format!(
                    "entry ({}, {}) outside sparse tile of shape {:?}",
                    r, c, shape
                )));
            }
            tile.entries.insert((r, c), v);
        }
        Ok(tile)
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries.get(&(row, col)).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), f64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.shape[0], self.shape[1]));
        for ((r, c), v) in self.iter() {
            dense[[r, c]] = v;
        }
        dense
    }

    /// The sub-matrix `rows x cols`, re-based to start at (0, 0).
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> SparseTile {
        let entries = self
            .entries
            .range((rows.start, 0)..(rows.end, 0))
            .filter(|((_, c), _)| cols.contains(c))
            .map(|((r, c), v)| ((r - rows.start, c - cols.start), *v))
            .collect();
        SparseTile {
            shape: [rows.len(), cols.len()],
            entries,
        }
    }

    pub fn transpose(&self) -> SparseTile {
        SparseTile {
            shape: [self.shape[1], self.shape[0]],
            entries: self.iter().map(|((r, c), v)| ((c, r), v)).collect(),
        }
    }

    /// Sparse-by-dense matrix product.
    pub fn dot_dense(&self, rhs: ArrayView2<'_, f64>) -> Result<Array2<f64>, SpartanError> {
        let (k, n) = rhs.dim();
        if k != self.shape[1] {
            return Err(SpartanError::ShapeMismatch(format!(
                "cannot multiply sparse {:?} by dense {:?}",
                self.shape,
                [k, n]
            )));
        }
        let mut out = Array2::zeros((self.shape[0], n));
        for ((r, c), v) in self.iter() {
            out.row_mut(r).scaled_add(v, &rhs.row(c));
        }
        Ok(out)
    }

    /// Merge `update` into this tile with its upper-left corner at
    /// `offset`. Every position covered by `update` is written; those it
    /// does not store are written as zero. Positions without a stored
    /// entry take the update as is, and entries that merge to zero are
    /// dropped.
    pub fn merge_at(
        &mut self,
        offset: (usize, usize),
        update: &SparseTile,
        merge: &dyn Accumulator,
        cast: impl Fn(f64) -> f64,
    ) {
        let rows = offset.0..offset.0 + update.shape[0];
        let cols = offset.1..offset.1 + update.shape[1];
        let zeroed: Vec<(usize, usize)> = self
            .entries
            .range((rows.start, 0)..(rows.end, 0))
            .map(|(pos, _)| *pos)
            .filter(|(r, c)| {
                cols.contains(c) && !update.entries.contains_key(&(r - offset.0, c - offset.1))
            })
            .collect();
        for pos in zeroed {
            self.merge_entry(pos, 0.0, merge, &cast);
        }
        for ((r, c), v) in update.iter() {
            self.merge_entry((r + offset.0, c + offset.1), v, merge, &cast);
        }
    }

    fn merge_entry(
        &mut self,
        pos: (usize, usize),
        value: f64,
        merge: &dyn Accumulator,
        cast: &impl Fn(f64) -> f64,
    ) {
        match self.entries.entry(pos) {
            Entry::Vacant(e) => {
                let value = cast(value);
                if value != 0.0 {
                    e.insert(value);
                }
            }
            Entry::Occupied(mut e) => {
                let state = e.get_mut();
                merge.accumulate(state, value);
                *state = cast(*state);
                if *state == 0.0 {
                    e.remove();
                }
            }
        }
    }

    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> SparseTile {
        SparseTile {
            shape: self.shape,
            entries: self.iter().map(|(k, v)| (k, f(v))).collect(),
        }
    }
}
