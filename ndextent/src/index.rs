/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ops::Range;
use std::ops::RangeFrom;
use std::ops::RangeFull;
use std::ops::RangeTo;

use serde::Deserialize;
use serde::Serialize;

use crate::Extent;
use crate::ExtentError;

/// A single component of a numpy-style index expression.
///
/// Negative positions count from the end of the axis. Range bounds are
/// clamped to the axis; a position outside the axis is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Index {
    /// Select one position and drop the axis.
    At(isize),
    /// Select `start..stop`, keeping the axis. `None` means the axis end.
    Range(Option<isize>, Option<isize>),
}

impl Index {
    /// The whole axis.
    pub fn full() -> Self {
        Index::Range(None, None)
    }

    /// Resolve against an axis of `size`, returning `(ul, lr, dropped)`.
    fn resolve(&self, axis: usize, size: usize) -> Result<(usize, usize, bool), ExtentError> {
        let isize_size = size as isize;
        match *self {
            Index::At(i) => {
                let pos = if i < 0 { i + isize_size } else { i };
                if pos < 0 || pos >= isize_size {
                    return Err(ExtentError::IndexOutOfRange {
                        index: i,
                        axis,
                        size,
                    });
                }
                Ok((pos as usize, pos as usize + 1, true))
            }
            Index::Range(start, stop) => {
                let clamp = |v: isize| -> usize {
                    let v = if v < 0 { v + isize_size } else { v };
                    v.clamp(0, isize_size) as usize
                };
                let ul = start.map_or(0, clamp);
                let lr = stop.map_or(size, clamp).max(ul);
                Ok((ul, lr, false))
            }
        }
    }
}

impl From<isize> for Index {
    fn from(i: isize) -> Self {
        Index::At(i)
    }
}

impl From<Range<isize>> for Index {
    fn from(r: Range<isize>) -> Self {
        Index::Range(Some(r.start), Some(r.end))
    }
}

impl From<RangeFrom<isize>> for Index {
    fn from(r: RangeFrom<isize>) -> Self {
        Index::Range(Some(r.start), None)
    }
}

impl From<RangeTo<isize>> for Index {
    fn from(r: RangeTo<isize>) -> Self {
        Index::Range(None, Some(r.end))
    }
}

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Self {
        Index::full()
    }
}

/// Build a `Vec<Index>` from numpy-like components.
///
/// ```
/// use ndextent::index;
/// use ndextent::Index;
///
/// let idx = index![1, 2..4, ..];
/// assert_eq!(idx[0], Index::At(1));
/// assert_eq!(idx[1], Index::Range(Some(2), Some(4)));
/// assert_eq!(idx[2], Index::full());
/// ```
#[macro_export]
macro_rules! index {
    () => { ::std::vec::Vec::<$crate::Index>::new() };
    ($($e:expr),+ $(,)?) => {
        vec![$($crate::Index::from($e)),+]
    };
}

/// The result of applying an index expression: the selected region of
/// the underlying array plus the axes that were indexed by a single
/// position. Dropped axes are kept in `extent` with unit length so the
/// region can still be intersected with tiles of the underlying array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub extent: Extent,
    pub dropped: Vec<bool>,
}

impl Region {
    /// A region that selects all of `extent` with no dropped axes.
    pub fn whole(extent: Extent) -> Self {
        let dropped = vec![false; extent.ndim()];
        Self { extent, dropped }
    }

    /// Shape of the selection as seen by a reader, with dropped axes
    /// removed.
    pub fn shape(&self) -> Vec<usize> {
        self.extent
            .shape()
            .into_iter()
            .zip(&self.dropped)
            .filter(|(_, d)| !**d)
            .map(|(s, _)| s)
            .collect()
    }

    pub fn size(&self) -> usize {
        self.extent.size()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.is_empty()
    }

    /// Map a sub-extent of the underlying array (contained in this
    /// region) into the reader's frame.
    pub fn squeeze(&self, ex: &Extent) -> Result<Extent, ExtentError> {
        let off = self.extent.offset_from(ex)?;
        let keep = |v: &[usize]| -> Vec<usize> {
            v.iter()
                .zip(&self.dropped)
                .filter(|(_, d)| !**d)
                .map(|(x, _)| *x)
                .collect()
        };
        Extent::new(keep(off.ul()), keep(off.lr()), self.shape())
    }

    /// Inverse of [`Region::squeeze`]: map an extent in the reader's
    /// frame back onto the underlying array.
    pub fn expand(&self, ex: &Extent) -> Result<Extent, ExtentError> {
        let ndim = self.extent.ndim();
        let mut ul = Vec::with_capacity(ndim);
        let mut lr = Vec::with_capacity(ndim);
        let mut local = 0;
        for axis in 0..ndim {
            let base = self.extent.ul()[axis];
            if self.dropped[axis] {
                ul.push(base);
                lr.push(base + 1);
            } else {
                ul.push(base + ex.ul()[local]);
                lr.push(base + ex.lr()[local]);
                local += 1;
            }
        }
        Extent::new(ul, lr, self.extent.array_shape().to_vec())
    }
}

/// Apply `idx` to an array of `shape`. Missing trailing components
/// select whole axes.
pub fn from_slice(idx: &[Index], shape: &[usize]) -> Result<Region, ExtentError> {
    compute_slice(&Extent::from_shape(shape), idx)
}

/// Apply `idx` to the region `base`, treating `base` as an array of its
/// own shape. The resulting extent is expressed in `base`'s array frame.
pub fn compute_slice(base: &Extent, idx: &[Index]) -> Result<Region, ExtentError> {
    if idx.len() > base.ndim() {
        return Err(ExtentError::TooManyIndices {
            given: idx.len(),
            ndim: base.ndim(),
        });
    }
    let shape = base.shape();
    let mut ul = Vec::with_capacity(base.ndim());
    let mut lr = Vec::with_capacity(base.ndim());
    let mut dropped = Vec::with_capacity(base.ndim());
    for axis in 0..base.ndim() {
        let (u, l, d) = idx
            .get(axis)
            .copied()
            .unwrap_or_else(Index::full)
            .resolve(axis, shape[axis])?;
        ul.push(base.ul()[axis] + u);
        lr.push(base.ul()[axis] + l);
        dropped.push(d);
    }
    Ok(Region {
        extent: Extent::new(ul, lr, base.array_shape().to_vec())?,
        dropped,
    })
}

impl Extent {
    /// Apply `idx` to this extent. See [`compute_slice`].
    pub fn compute_slice(&self, idx: &[Index]) -> Result<Region, ExtentError> {
        compute_slice(self, idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_slice() {
        let r = from_slice(&index![1..3, ..], &[10, 10]).unwrap();
        assert_eq!(r.extent.ul(), &[1, 0]);
        assert_eq!(r.extent.lr(), &[3, 10]);
        assert_eq!(r.shape(), vec![2, 10]);
    }

    #[test]
    fn test_integer_drops_axis() {
        let r = from_slice(&index![4], &[10, 8]).unwrap();
        assert_eq!(r.extent.ul(), &[4, 0]);
        assert_eq!(r.extent.lr(), &[5, 8]);
        assert_eq!(r.dropped, vec![true, false]);
        assert_eq!(r.shape(), vec![8]);
    }

    #[test]
    fn test_negative_and_clamping() {
        let r = from_slice(&index![-1, -3..], &[10, 8]).unwrap();
        assert_eq!(r.extent.ul(), &[9, 5]);
        assert_eq!(r.extent.lr(), &[10, 8]);

        let r = from_slice(&index![5..100], &[10]).unwrap();
        assert_eq!(r.extent.lr(), &[10]);

        // start past stop gives an empty selection rather than an error
        let r = from_slice(&index![7..3], &[10]).unwrap();
        assert!(r.is_empty());
        assert_eq!(r.shape(), vec![0]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            from_slice(&index![10], &[10]),
            Err(ExtentError::IndexOutOfRange { index: 10, .. })
        ));
        assert!(matches!(
            from_slice(&index![-11], &[10]),
            Err(ExtentError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            from_slice(&index![1, 2], &[10]),
            Err(ExtentError::TooManyIndices { given: 2, ndim: 1 })
        ));
    }

    #[test]
    fn test_compute_slice_relative_to_base() {
        let base = Extent::new(vec![2, 4], vec![6, 10], vec![10, 10]).unwrap();
        let r = base.compute_slice(&index![1..3, 2]).unwrap();
        assert_eq!(r.extent.ul(), &[3, 6]);
        assert_eq!(r.extent.lr(), &[5, 7]);
        assert_eq!(r.extent.array_shape(), &[10, 10]);
        assert_eq!(r.shape(), vec![2]);
    }

    #[test]
    fn test_squeeze_expand() {
        let r = from_slice(&index![2..8, 3], &[10, 10]).unwrap();
        let tile = Extent::new(vec![4, 3], vec![6, 4], vec![10, 10]).unwrap();
        let sq = r.squeeze(&tile).unwrap();
        assert_eq!(sq.ul(), &[2]);
        assert_eq!(sq.lr(), &[4]);
        assert_eq!(sq.array_shape(), &[6]);
        assert_eq!(r.expand(&sq).unwrap(), tile);
    }

    #[test]
    fn test_to_index_roundtrip() {
        let e = Extent::new(vec![1, 2], vec![3, 7], vec![5, 9]).unwrap();
        let r = from_slice(&e.to_index(), e.array_shape()).unwrap();
        assert_eq!(r.extent, e);
    }
}
