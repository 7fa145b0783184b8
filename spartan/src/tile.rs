/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tile buffers and the per-tile merge logic.

use std::ops::Range;

use ndarray::ArrayD;
use ndarray::AxisDescription;
use ndarray::Ix2;
use ndarray::IxDyn;
use ndarray::Slice;
use ndarray::Zip;

use crate::accum;
use crate::accum::Accumulator;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::sparse::SparseTile;

/// `(index, value)` pairs, as produced by arg reductions.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedValues {
    pub idx: ArrayD<usize>,
    pub val: ArrayD<f64>,
}

impl IndexedValues {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            idx: ArrayD::zeros(IxDyn(shape)),
            val: ArrayD::zeros(IxDyn(shape)),
        }
    }
}

/// The data held by a tile, or moved between tiles.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Dense(ArrayD<f64>),
    Sparse(SparseTile),
    Indexed(IndexedValues),
}

fn axis_slicer(ranges: &[Range<usize>]) -> impl Fn(AxisDescription) -> Slice + '_ {
    move |ax: AxisDescription| Slice::from(ranges[ax.axis.index()].clone())
}

fn check_ranges(shape: &[usize], ranges: &[Range<usize>]) -> Result<(), SpartanError> {
    if ranges.len() != shape.len() || ranges.iter().zip(shape).any(|(r, s)| r.end > *s || r.start > r.end) {
        return Err(SpartanError::OutOfBounds(format!(
            "region {:?} outside buffer of shape {:?}",
            ranges, shape
        )));
    }
    Ok(())
}

impl Buffer {
    pub fn zeros(shape: &[usize]) -> Self {
        Buffer::Dense(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn from_elem(shape: &[usize], value: f64) -> Self {
        Buffer::Dense(ArrayD::from_elem(IxDyn(shape), value))
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Buffer::Dense(a) => a.shape().to_vec(),
            Buffer::Sparse(s) => s.shape().to_vec(),
            Buffer::Indexed(iv) => iv.val.shape().to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Buffer::Dense(_))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Buffer::Sparse(_))
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, Buffer::Indexed(_))
    }

    pub fn as_sparse(&self) -> Option<&SparseTile> {
        match self {
            Buffer::Sparse(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_indexed(&self) -> Option<&IndexedValues> {
        match self {
            Buffer::Indexed(iv) => Some(iv),
            _ => None,
        }
    }

    /// Copy out the sub-buffer selected by `ranges`.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Buffer, SpartanError> {
        check_ranges(&self.shape(), ranges)?;
        Ok(match self {
            Buffer::Dense(a) => Buffer::Dense(a.slice_each_axis(axis_slicer(ranges)).to_owned()),
            Buffer::Sparse(s) => Buffer::Sparse(s.slice(ranges[0].clone(), ranges[1].clone())),
            Buffer::Indexed(iv) => Buffer::Indexed(IndexedValues {
                idx: iv.idx.slice_each_axis(axis_slicer(ranges)).to_owned(),
                val: iv.val.slice_each_axis(axis_slicer(ranges)).to_owned(),
            }),
        })
    }

    /// A dense copy of the values. Indexed buffers yield their values.
    pub fn to_dense(&self) -> ArrayD<f64> {
        match self {
            Buffer::Dense(a) => a.clone(),
            Buffer::Sparse(s) => s.to_dense().into_dyn(),
            Buffer::Indexed(iv) => iv.val.clone(),
        }
    }

    pub fn into_dense(self) -> ArrayD<f64> {
        match self {
            Buffer::Dense(a) => a,
            other => other.to_dense(),
        }
    }

    /// Convert to a sparse buffer. Only 2-dimensional buffers can be
    /// sparse.
    pub fn into_sparse(self) -> Result<SparseTile, SpartanError> {
        match self {
            Buffer::Sparse(s) => Ok(s),
            Buffer::Dense(a) => {
                let shape = a.shape().to_vec();
                let a = a.into_dimensionality::<Ix2>().map_err(|_| {
                    SpartanError::ShapeMismatch(format!(
                        "sparse buffers are 2-dimensional, got shape {:?}",
                        shape
                    ))
                })?;
                Ok(SparseTile::from_dense(a.view()))
            }
            Buffer::Indexed(_) => Err(SpartanError::ShapeMismatch(
                "indexed values cannot be stored sparsely".to_string(),
            )),
        }
    }

    /// Reshape to `shape`, which must hold the same number of elements.
    /// Sparse buffers are densified unless the shape is unchanged.
    pub fn reshape(self, shape: &[usize]) -> Result<Buffer, SpartanError> {
        if self.shape() == shape {
            return Ok(self);
        }
        let mismatch = |from: Vec<usize>| {
            SpartanError::ShapeMismatch(format!("cannot reshape {:?} into {:?}", from, shape))
        };
        let from = self.shape();
        match self {
            Buffer::Indexed(iv) => Ok(Buffer::Indexed(IndexedValues {
                idx: iv
                    .idx
                    .into_shape_with_order(IxDyn(shape))
                    .map_err(|_| mismatch(from.clone()))?,
                val: iv
                    .val
                    .into_shape_with_order(IxDyn(shape))
                    .map_err(|_| mismatch(from.clone()))?,
            })),
            other => Ok(Buffer::Dense(
                other
                    .into_dense()
                    .into_shape_with_order(IxDyn(shape))
                    .map_err(|_| mismatch(from))?,
            )),
        }
    }

    /// Reverse the order of all axes.
    pub fn transposed(&self) -> Buffer {
        match self {
            Buffer::Dense(a) => Buffer::Dense(a.t().to_owned()),
            Buffer::Sparse(s) => Buffer::Sparse(s.transpose()),
            Buffer::Indexed(iv) => Buffer::Indexed(IndexedValues {
                idx: iv.idx.t().to_owned(),
                val: iv.val.t().to_owned(),
            }),
        }
    }

    /// Numpy-style broadcast of a dense copy to `shape`.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Buffer, SpartanError> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        let dense = self.to_dense();
        let view = dense.broadcast(IxDyn(shape)).ok_or_else(|| {
            SpartanError::ShapeMismatch(format!(
                "cannot broadcast {:?} to {:?}",
                dense.shape(),
                shape
            ))
        })?;
        Ok(Buffer::Dense(view.to_owned()))
    }

    /// Elementwise `self = merge(self, other)` over two fully written
    /// buffers of the same shape.
    pub fn accumulate(&mut self, other: &Buffer, merge: &dyn Accumulator) -> Result<(), SpartanError> {
        if self.shape() != other.shape() {
            return Err(SpartanError::ShapeMismatch(format!(
                "cannot accumulate {:?} into {:?}",
                other.shape(),
                self.shape()
            )));
        }
        match (&mut *self, other) {
            (Buffer::Sparse(s), Buffer::Sparse(o)) => {
                s.merge_at((0, 0), o, merge, |v| v);
            }
            (Buffer::Indexed(s), Buffer::Indexed(o)) => {
                Zip::from(&mut s.idx)
                    .and(&mut s.val)
                    .and(&o.idx)
                    .and(&o.val)
                    .for_each(|si, sv, oi, ov| {
                        let mut state = (*si, *sv);
                        merge.accumulate_indexed(&mut state, (*oi, *ov));
                        *si = state.0;
                        *sv = state.1;
                    });
            }
            (Buffer::Indexed(_), _) | (_, Buffer::Indexed(_)) => {
                return Err(SpartanError::ShapeMismatch(
                    "cannot accumulate indexed and plain values".to_string(),
                ));
            }
            (Buffer::Dense(s), o) => {
                let o = o.to_dense();
                Zip::from(s).and(&o).for_each(|s, o| merge.accumulate(s, *o));
            }
            (this @ Buffer::Sparse(_), o) => {
                let mut dense = this.to_dense();
                let o = o.to_dense();
                Zip::from(&mut dense)
                    .and(&o)
                    .for_each(|s, o| merge.accumulate(s, *o));
                *this = Buffer::Dense(dense);
            }
        }
        Ok(())
    }

    /// Stitch `pieces`, each placed at its ranges, into one buffer of
    /// `shape`. Regions not covered by any piece are zero.
    pub fn assemble(
        shape: &[usize],
        sparse: bool,
        pieces: Vec<(Vec<Range<usize>>, Buffer)>,
    ) -> Result<Buffer, SpartanError> {
        if pieces.len() == 1 && pieces[0].1.shape() == shape {
            if let Some((_, piece)) = pieces.into_iter().next() {
                return Ok(piece);
            }
            return Ok(Buffer::zeros(shape));
        }
        for (ranges, piece) in &pieces {
            check_ranges(shape, ranges)?;
            let extent: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
            if extent != piece.shape() {
                return Err(SpartanError::ShapeMismatch(format!(
                    "piece of shape {:?} placed at {:?}",
                    piece.shape(),
                    ranges
                )));
            }
        }

        if sparse {
            if shape.len() != 2 {
                return Err(SpartanError::ShapeMismatch(format!(
                    "sparse buffers are 2-dimensional, got shape {:?}",
                    shape
                )));
            }
            let replace = accum::replace();
            let mut out = SparseTile::new([shape[0], shape[1]]);
            for (ranges, piece) in pieces {
                let piece = piece.into_sparse()?;
                out.merge_at((ranges[0].start, ranges[1].start), &piece, replace.as_ref(), |v| v);
            }
            return Ok(Buffer::Sparse(out));
        }

        if pieces.iter().any(|(_, p)| p.is_indexed()) {
            let mut out = IndexedValues::zeros(shape);
            for (ranges, piece) in pieces {
                let Buffer::Indexed(piece) = piece else {
                    return Err(SpartanError::ShapeMismatch(
                        "cannot stitch indexed and plain values".to_string(),
                    ));
                };
                out.idx
                    .slice_each_axis_mut(axis_slicer(&ranges))
                    .assign(&piece.idx);
                out.val
                    .slice_each_axis_mut(axis_slicer(&ranges))
                    .assign(&piece.val);
            }
            return Ok(Buffer::Indexed(out));
        }

        let mut out = ArrayD::zeros(IxDyn(shape));
        for (ranges, piece) in pieces {
            out.slice_each_axis_mut(axis_slicer(&ranges))
                .assign(&piece.into_dense());
        }
        Ok(Buffer::Dense(out))
    }
}

/// A tile as stored on a worker: a buffer plus a record of which
/// elements have been written. The first write to an element replaces
/// it; later writes are combined with the array's merge function.
/// Unwritten elements read as zero.
#[derive(Debug, Clone)]
pub struct Tile {
    dtype: DType,
    data: Buffer,
    /// Written elements of a dense or indexed tile. Sparse tiles track
    /// writes through their stored entries.
    valid: Option<ArrayD<bool>>,
}

impl Tile {
    /// An unwritten tile.
    pub fn empty(shape: &[usize], dtype: DType, sparse: bool) -> Result<Tile, SpartanError> {
        if sparse {
            if shape.len() != 2 {
                return Err(SpartanError::ShapeMismatch(format!(
                    "sparse tiles are 2-dimensional, got shape {:?}",
                    shape
                )));
            }
            return Ok(Tile {
                dtype,
                data: Buffer::Sparse(SparseTile::new([shape[0], shape[1]])),
                valid: None,
            });
        }
        Ok(Tile {
            dtype,
            data: Buffer::zeros(shape),
            valid: Some(ArrayD::from_elem(IxDyn(shape), false)),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> Vec<usize> {
        self.data.shape()
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    pub fn read(&self, region: &[Range<usize>]) -> Result<Buffer, SpartanError> {
        self.data.slice(region)
    }

    /// Merge `update` into the elements selected by `region`.
    pub fn update(
        &mut self,
        region: &[Range<usize>],
        update: Buffer,
        merge: &dyn Accumulator,
    ) -> Result<(), SpartanError> {
        check_ranges(&self.shape(), region)?;
        let expected: Vec<usize> = region.iter().map(|r| r.len()).collect();
        if update.shape() != expected {
            return Err(SpartanError::ShapeMismatch(format!(
                "update of shape {:?} written to region {:?}",
                update.shape(),
                region
            )));
        }

        // A tile receives indexed values only from arg reductions; it
        // switches representation on the first such write.
        if update.is_indexed() && self.data.is_dense() {
            let written = self.valid.as_ref().is_some_and(|v| v.iter().any(|w| *w));
            if written {
                return Err(SpartanError::ShapeMismatch(
                    "indexed update into a tile holding plain values".to_string(),
                ));
            }
            self.data = Buffer::Indexed(IndexedValues::zeros(&self.shape()));
        }

        let dtype = self.dtype;
        match &mut self.data {
            Buffer::Sparse(cur) => {
                let update = update.into_sparse()?;
                cur.merge_at((region[0].start, region[1].start), &update, merge, |v| dtype.cast(v));
            }
            Buffer::Dense(cur) => {
                let update = match update {
                    Buffer::Indexed(_) => {
                        return Err(SpartanError::ShapeMismatch(
                            "indexed update into a tile holding plain values".to_string(),
                        ));
                    }
                    other => other.into_dense(),
                };
                let valid = self
                    .valid
                    .get_or_insert_with(|| ArrayD::from_elem(IxDyn(cur.shape()), true));
                Zip::from(cur.slice_each_axis_mut(axis_slicer(region)))
                    .and(valid.slice_each_axis_mut(axis_slicer(region)))
                    .and(&update)
                    .for_each(|state, written, value| {
                        if *written {
                            merge.accumulate(state, *value);
                        } else {
                            *state = *value;
                            *written = true;
                        }
                        *state = dtype.cast(*state);
                    });
            }
            Buffer::Indexed(cur) => {
                let Buffer::Indexed(update) = update else {
                    return Err(SpartanError::ShapeMismatch(
                        "plain update into a tile holding indexed values".to_string(),
                    ));
                };
                let valid = self
                    .valid
                    .get_or_insert_with(|| ArrayD::from_elem(IxDyn(cur.val.shape()), true));
                Zip::from(cur.idx.slice_each_axis_mut(axis_slicer(region)))
                    .and(cur.val.slice_each_axis_mut(axis_slicer(region)))
                    .and(valid.slice_each_axis_mut(axis_slicer(region)))
                    .and(&update.idx)
                    .and(&update.val)
                    .for_each(|idx, val, written, uidx, uval| {
                        if *written {
                            let mut state = (*idx, *val);
                            merge.accumulate_indexed(&mut state, (*uidx, *uval));
                            *idx = state.0;
                            *val = state.1;
                        } else {
                            *idx = *uidx;
                            *val = *uval;
                            *written = true;
                        }
                        *val = dtype.cast(*val);
                    });
            }
        }
        Ok(())
    }
}
