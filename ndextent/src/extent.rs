/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::ops::Range;

use itertools::izip;
use serde::Deserialize;
use serde::Serialize;

/// Errors that can occur when constructing or combining extents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtentError {
    #[error("rank mismatch: ul has {ul} dims, lr has {lr}, array shape has {shape}")]
    RankMismatch { ul: usize, lr: usize, shape: usize },

    #[error("invalid bounds {ul}..{lr} on axis {axis} of size {size}")]
    InvalidBounds {
        axis: usize,
        ul: usize,
        lr: usize,
        size: usize,
    },

    #[error("axis {axis} out of range for {ndim}-dimensional extent")]
    AxisOutOfRange { axis: usize, ndim: usize },

    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange {
        index: isize,
        axis: usize,
        size: usize,
    },

    #[error("too many indices: {given} given for a {ndim}-dimensional array")]
    TooManyIndices { given: usize, ndim: usize },

    #[error("{sub} does not lie within {base}")]
    NotContained { base: Box<Extent>, sub: Box<Extent> },
}

/// A rectangular region `[ul, lr)` of an array of shape `array_shape`.
///
/// The invariant `0 <= ul <= lr <= array_shape` holds elementwise for
/// every constructed extent. An extent may have zero volume (some
/// `ul[i] == lr[i]`), which is how empty index results are
/// represented; [`intersection`] never returns such an extent.
///
/// Extents order by upper-left corner first, which is the canonical
/// tile order used throughout the system.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct Extent {
    ul: Vec<usize>,
    lr: Vec<usize>,
    array_shape: Vec<usize>,
}

impl Extent {
    /// Create a new extent, validating `0 <= ul <= lr <= array_shape`.
    pub fn new(
        ul: Vec<usize>,
        lr: Vec<usize>,
        array_shape: Vec<usize>,
    ) -> Result<Self, ExtentError> {
        if ul.len() != lr.len() || lr.len() != array_shape.len() {
            return Err(ExtentError::RankMismatch {
                ul: ul.len(),
                lr: lr.len(),
                shape: array_shape.len(),
            });
        }
        for (axis, (&u, &l, &size)) in izip!(&ul, &lr, &array_shape).enumerate() {
            if u > l || l > size {
                return Err(ExtentError::InvalidBounds {
                    axis,
                    ul: u,
                    lr: l,
                    size,
                });
            }
        }
        Ok(Self {
            ul,
            lr,
            array_shape,
        })
    }

    /// The extent covering an entire array of the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            ul: vec![0; shape.len()],
            lr: shape.to_vec(),
            array_shape: shape.to_vec(),
        }
    }

    /// Upper-left (inclusive) corner.
    pub fn ul(&self) -> &[usize] {
        &self.ul
    }

    /// Lower-right (exclusive) corner.
    pub fn lr(&self) -> &[usize] {
        &self.lr
    }

    /// Shape of the array this extent is a region of.
    pub fn array_shape(&self) -> &[usize] {
        &self.array_shape
    }

    /// Shape of the region itself (`lr - ul`).
    pub fn shape(&self) -> Vec<usize> {
        self.ul.iter().zip(&self.lr).map(|(u, l)| l - u).collect()
    }

    pub fn ndim(&self) -> usize {
        self.ul.len()
    }

    /// Number of elements in the region. A 0-dimensional extent holds
    /// exactly one element.
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    /// True when the region holds no elements.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when `other` lies entirely within this extent.
    pub fn contains(&self, other: &Extent) -> bool {
        self.ndim() == other.ndim()
            && izip!(&self.ul, &self.lr, &other.ul, &other.lr)
                .all(|(su, sl, ou, ol)| su <= ou && ol <= sl)
    }

    /// The overlap of two extents, or `None` when they share no
    /// elements. Zero-volume overlaps are reported as `None`.
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        intersection(self, other)
    }

    /// Re-express `sub` in this extent's local coordinate frame. The
    /// result's array shape is this extent's shape.
    pub fn offset_from(&self, sub: &Extent) -> Result<Extent, ExtentError> {
        if !self.contains(sub) {
            return Err(ExtentError::NotContained {
                base: Box::new(self.clone()),
                sub: Box::new(sub.clone()),
            });
        }
        Extent::new(
            sub.ul.iter().zip(&self.ul).map(|(s, b)| s - b).collect(),
            sub.lr.iter().zip(&self.ul).map(|(s, b)| s - b).collect(),
            self.shape(),
        )
    }

    /// Index ranges selecting `sub` out of a buffer holding this extent.
    pub fn offset_slice(&self, sub: &Extent) -> Result<Vec<Range<usize>>, ExtentError> {
        Ok(self.offset_from(sub)?.to_slice())
    }

    /// Index ranges of this extent within its array.
    pub fn to_slice(&self) -> Vec<Range<usize>> {
        self.ul.iter().zip(&self.lr).map(|(&u, &l)| u..l).collect()
    }

    /// Row-major flat position of the upper-left corner.
    pub fn ravelled_pos(&self) -> usize {
        ravelled_pos(&self.ul, &self.array_shape)
    }

    /// Translate an index local to this extent into the array's frame.
    ///
    /// With an axis, `local` is a position along that axis; otherwise it
    /// is a row-major flat position within the extent and the result is
    /// a row-major flat position within the array.
    pub fn to_global(&self, local: usize, axis: Option<usize>) -> usize {
        match axis {
            Some(axis) => local + self.ul[axis],
            None => {
                let pos: Vec<usize> = unravelled_pos(local, &self.shape())
                    .into_iter()
                    .zip(&self.ul)
                    .map(|(p, u)| p + u)
                    .collect();
                ravelled_pos(&pos, &self.array_shape)
            }
        }
    }

    /// Remove `axis`, from both the region and the array shape.
    pub fn drop_axis(&self, axis: usize) -> Result<Extent, ExtentError> {
        if axis >= self.ndim() {
            return Err(ExtentError::AxisOutOfRange {
                axis,
                ndim: self.ndim(),
            });
        }
        let keep = |v: &[usize]| -> Vec<usize> {
            v.iter()
                .enumerate()
                .filter(|(i, _)| *i != axis)
                .map(|(_, x)| *x)
                .collect()
        };
        Extent::new(keep(&self.ul), keep(&self.lr), keep(&self.array_shape))
    }

    /// The region a reduction of this extent over `axis` writes to:
    /// the axis is removed, or every axis when `axis` is `None`.
    pub fn index_for_reduction(&self, axis: Option<usize>) -> Result<Extent, ExtentError> {
        match axis {
            Some(axis) => self.drop_axis(axis),
            None => Extent::new(vec![], vec![], vec![]),
        }
    }

    /// Append a trailing unit axis.
    pub fn add_dim(&self) -> Extent {
        let mut ex = self.clone();
        ex.ul.push(0);
        ex.lr.push(1);
        ex.array_shape.push(1);
        ex
    }

    /// Reverse every axis, as a transpose does.
    pub fn transposed(&self) -> Extent {
        let rev = |v: &[usize]| v.iter().rev().copied().collect::<Vec<_>>();
        Extent {
            ul: rev(&self.ul),
            lr: rev(&self.lr),
            array_shape: rev(&self.array_shape),
        }
    }

    /// The same region, stamped with a different array shape.
    pub fn with_array_shape(&self, array_shape: Vec<usize>) -> Result<Extent, ExtentError> {
        Extent::new(self.ul.clone(), self.lr.clone(), array_shape)
    }

    /// Replace the bounds along `axis`.
    pub fn with_axis(
        &self,
        axis: usize,
        ul: usize,
        lr: usize,
        size: usize,
    ) -> Result<Extent, ExtentError> {
        if axis >= self.ndim() {
            return Err(ExtentError::AxisOutOfRange {
                axis,
                ndim: self.ndim(),
            });
        }
        let mut ex = self.clone();
        ex.ul[axis] = ul;
        ex.lr[axis] = lr;
        ex.array_shape[axis] = size;
        Extent::new(ex.ul, ex.lr, ex.array_shape)
    }

    /// Index expressions selecting exactly this extent.
    pub fn to_index(&self) -> Vec<crate::Index> {
        self.ul
            .iter()
            .zip(&self.lr)
            .map(|(&u, &l)| crate::Index::Range(Some(u as isize), Some(l as isize)))
            .collect()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (u, l)) in self.ul.iter().zip(&self.lr).enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", u, l)?;
        }
        write!(f, "] of {:?}", self.array_shape)
    }
}

/// The overlap of `a` and `b`, or `None` if the overlap holds no
/// elements. Both extents must describe the same array.
pub fn intersection(a: &Extent, b: &Extent) -> Option<Extent> {
    debug_assert_eq!(a.array_shape, b.array_shape, "intersecting extents of different arrays");
    if a.ndim() != b.ndim() {
        return None;
    }
    let ul: Vec<usize> = a.ul.iter().zip(&b.ul).map(|(x, y)| *x.max(y)).collect();
    let lr: Vec<usize> = a.lr.iter().zip(&b.lr).map(|(x, y)| *x.min(y)).collect();
    if ul.iter().zip(&lr).any(|(u, l)| u >= l) {
        return None;
    }
    Some(Extent {
        ul,
        lr,
        array_shape: a.array_shape.clone(),
    })
}

/// Row-major flat position of `idx` within an array of `shape`.
pub fn ravelled_pos(idx: &[usize], shape: &[usize]) -> usize {
    let mut pos = 0;
    let mut mul = 1;
    for (i, s) in idx.iter().zip(shape).rev() {
        pos += i * mul;
        mul *= s;
    }
    pos
}

/// Inverse of [`ravelled_pos`].
pub fn unravelled_pos(mut pos: usize, shape: &[usize]) -> Vec<usize> {
    let mut idx = vec![0; shape.len()];
    for (i, s) in shape.iter().enumerate().rev() {
        if *s == 0 {
            continue;
        }
        idx[i] = pos % s;
        pos /= s;
    }
    idx
}

/// The smallest shape covering every extent (elementwise max of `lr`).
pub fn find_shape<'a>(extents: impl IntoIterator<Item = &'a Extent>) -> Option<Vec<usize>> {
    extents.into_iter().fold(None, |acc, ex| match acc {
        None => Some(ex.lr.clone()),
        Some(shape) => Some(shape.iter().zip(&ex.lr).map(|(s, l)| *s.max(l)).collect()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(ul: &[usize], lr: &[usize], shape: &[usize]) -> Extent {
        Extent::new(ul.to_vec(), lr.to_vec(), shape.to_vec()).unwrap()
    }

    #[test]
    fn test_create_validates() {
        assert!(Extent::new(vec![0, 0], vec![2, 3], vec![4, 4]).is_ok());
        assert!(matches!(
            Extent::new(vec![3], vec![2], vec![4]),
            Err(ExtentError::InvalidBounds { axis: 0, .. })
        ));
        assert!(matches!(
            Extent::new(vec![0], vec![5], vec![4]),
            Err(ExtentError::InvalidBounds { .. })
        ));
        assert!(matches!(
            Extent::new(vec![0, 0], vec![1], vec![4, 4]),
            Err(ExtentError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_intersection() {
        let a = ex(&[0, 0], &[5, 5], &[10, 10]);
        let b = ex(&[3, 2], &[8, 10], &[10, 10]);
        let i = ex(&[3, 2], &[5, 5], &[10, 10]);
        assert_eq!(intersection(&a, &b), Some(i.clone()));
        assert_eq!(intersection(&b, &a), Some(i));
        assert_eq!(intersection(&a, &a), Some(a.clone()));
    }

    #[test]
    fn test_intersection_zero_volume() {
        // Touching edges share no elements.
        let a = ex(&[0, 0], &[5, 5], &[10, 10]);
        let b = ex(&[5, 0], &[10, 5], &[10, 10]);
        assert_eq!(intersection(&a, &b), None);
        assert_eq!(intersection(&b, &a), None);

        let c = ex(&[7, 7], &[9, 9], &[10, 10]);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_offset_from() {
        let base = ex(&[2, 4], &[6, 10], &[10, 10]);
        let sub = ex(&[3, 5], &[5, 9], &[10, 10]);
        let off = base.offset_from(&sub).unwrap();
        assert_eq!(off.ul(), &[1, 1]);
        assert_eq!(off.lr(), &[3, 5]);
        assert_eq!(off.array_shape(), &[4, 6]);
        assert_eq!(base.offset_slice(&sub).unwrap(), vec![1..3, 1..5]);

        let outside = ex(&[0, 0], &[3, 3], &[10, 10]);
        assert!(matches!(
            base.offset_from(&outside),
            Err(ExtentError::NotContained { .. })
        ));
    }

    #[test]
    fn test_ravel() {
        assert_eq!(ravelled_pos(&[1, 2], &[3, 4]), 6);
        assert_eq!(ravelled_pos(&[2, 3], &[3, 4]), 11);
        assert_eq!(unravelled_pos(6, &[3, 4]), vec![1, 2]);
        assert_eq!(unravelled_pos(11, &[3, 4]), vec![2, 3]);
        assert_eq!(ex(&[1, 2], &[2, 4], &[3, 4]).ravelled_pos(), 6);
        assert_eq!(ravelled_pos(&[], &[]), 0);
    }

    #[test]
    fn test_to_global() {
        let e = ex(&[2, 4], &[4, 8], &[10, 10]);
        assert_eq!(e.to_global(1, Some(0)), 3);
        assert_eq!(e.to_global(1, Some(1)), 5);
        // local (1, 3) -> global (3, 7)
        assert_eq!(e.to_global(7, None), 37);
    }

    #[test]
    fn test_index_for_reduction() {
        let e = ex(&[2, 4, 0], &[4, 8, 3], &[10, 10, 3]);
        let r = e.index_for_reduction(Some(1)).unwrap();
        assert_eq!(r.ul(), &[2, 0]);
        assert_eq!(r.lr(), &[4, 3]);
        assert_eq!(r.array_shape(), &[10, 3]);

        let all = e.index_for_reduction(None).unwrap();
        assert_eq!(all.ndim(), 0);
        assert_eq!(all.size(), 1);

        assert!(matches!(
            e.index_for_reduction(Some(3)),
            Err(ExtentError::AxisOutOfRange { axis: 3, ndim: 3 })
        ));
    }

    #[test]
    fn test_add_dim_and_transpose() {
        let e = ex(&[2, 4], &[4, 8], &[10, 12]);
        let d = e.add_dim();
        assert_eq!(d.ul(), &[2, 4, 0]);
        assert_eq!(d.lr(), &[4, 8, 1]);
        assert_eq!(d.array_shape(), &[10, 12, 1]);

        let t = e.transposed();
        assert_eq!(t.ul(), &[4, 2]);
        assert_eq!(t.lr(), &[8, 4]);
        assert_eq!(t.array_shape(), &[12, 10]);
        assert_eq!(t.transposed(), e);
    }

    #[test]
    fn test_ordering_is_upper_left_first() {
        let mut tiles = vec![
            ex(&[5, 0], &[10, 5], &[10, 10]),
            ex(&[0, 5], &[5, 10], &[10, 10]),
            ex(&[0, 0], &[5, 5], &[10, 10]),
        ];
        tiles.sort();
        assert_eq!(tiles[0].ul(), &[0, 0]);
        assert_eq!(tiles[1].ul(), &[0, 5]);
        assert_eq!(tiles[2].ul(), &[5, 0]);
    }

    #[test]
    fn test_find_shape() {
        let tiles = [ex(&[0, 0], &[5, 3], &[10, 10]), ex(&[2, 1], &[4, 7], &[10, 10])];
        assert_eq!(find_shape(&tiles), Some(vec![5, 7]));
        assert_eq!(find_shape(&[]), None);
    }

    #[test]
    fn test_display() {
        let e = ex(&[0, 2], &[5, 5], &[10, 10]);
        assert_eq!(e.to_string(), "[0:5,2:5] of [10, 10]");
    }
}
