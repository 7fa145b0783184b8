/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Array constructors and numpy-style operations, expressed as map,
//! reduce, shuffle, scan and slice nodes.

use std::f64::consts::SQRT_2;
use std::sync::Arc;

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayD;
use ndarray::Axis;
use ndarray::Ix2;
use ndarray::IxDyn;
use ndarray::Zip;
use ndarray::s;
use ndextent::Extent;
use ndextent::Index;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::accum;
use crate::config::Capabilities;
use crate::darray::ArraySpec;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::expr::Evaluator;
use crate::expr::Expr;
use crate::expr::MapExpr;
use crate::expr::ReduceExpr;
use crate::expr::ScanExpr;
use crate::expr::ShuffleContext;
use crate::expr::ShuffleExpr;
use crate::expr::ShuffleTarget;
use crate::expr::SliceIndex;
use crate::expr::map_kernel;
use crate::expr::reduce_kernel;
use crate::expr::scan_kernel;
use crate::expr::shuffle_kernel;
use crate::sparse::SparseTile;
use crate::tile::Buffer;
use crate::tile::IndexedValues;

/// An unwritten array; every element reads as zero until written.
pub fn ndarray(spec: ArraySpec) -> Result<Expr, SpartanError> {
    Expr::ndarray(spec)
}

/// An elementwise operation over `inputs` with a user kernel.
pub fn map<F>(inputs: &[Expr], f: F) -> Result<Expr, SpartanError>
where
    F: Fn(&[Buffer], &Extent) -> anyhow::Result<Buffer> + Send + Sync + 'static,
{
    Expr::map(MapExpr::new(inputs.to_vec(), map_kernel(f)))
}

/// Generate every tile of a new array from its extent.
fn generate<F>(spec: ArraySpec, f: F) -> Result<Expr, SpartanError>
where
    F: Fn(&Extent) -> anyhow::Result<Buffer> + Send + Sync + 'static,
{
    let dtype = spec.dtype;
    let sparse = spec.sparse;
    let leaf = Expr::ndarray(spec)?;
    Expr::map(
        MapExpr::new(vec![leaf], map_kernel(move |_, extent| f(extent)))
            .with_dtype(dtype)
            .with_sparse(sparse),
    )
}

pub fn fill(spec: ArraySpec, value: f64) -> Result<Expr, SpartanError> {
    generate(spec, move |extent| Ok(Buffer::from_elem(&extent.shape(), value)))
}

pub fn zeros(spec: ArraySpec) -> Result<Expr, SpartanError> {
    fill(spec, 0.0)
}

pub fn ones(spec: ArraySpec) -> Result<Expr, SpartanError> {
    fill(spec, 1.0)
}

/// Uniform samples from `[0, 1)`.
pub fn rand(spec: ArraySpec) -> Result<Expr, SpartanError> {
    generate(spec, |extent| {
        let mut rng = rand::thread_rng();
        Ok(Buffer::Dense(ArrayD::from_shape_simple_fn(
            IxDyn(&extent.shape()),
            || rng.gen::<f64>(),
        )))
    })
}

/// Samples from the standard normal distribution.
pub fn randn(spec: ArraySpec) -> Result<Expr, SpartanError> {
    generate(spec, |extent| {
        let mut rng = rand::thread_rng();
        Ok(Buffer::Dense(ArrayD::from_shape_simple_fn(
            IxDyn(&extent.shape()),
            || rng.sample::<f64, _>(StandardNormal),
        )))
    })
}

/// Each element holds its row-major position.
pub fn arange(spec: ArraySpec) -> Result<Expr, SpartanError> {
    let dtype = spec.dtype;
    let leaf = Expr::ndarray(spec.with_sparse(false))?;
    Expr::shuffle(ShuffleExpr {
        inputs: vec![leaf],
        kernel: shuffle_kernel(|ctx: ShuffleContext| async move {
            let extent = ctx.extent;
            let positions: Array1<f64> = (0..extent.size())
                .map(|local| extent.to_global(local, None) as f64)
                .collect();
            let data = positions.into_shape_with_order(IxDyn(&extent.shape()))?;
            Ok(vec![(extent, Buffer::Dense(data))])
        }),
        target: ShuffleTarget::LikeInput {
            dtype: Some(dtype),
            merge: accum::replace(),
        },
    })
}

/// Distribute a local array.
pub fn from_dense(data: ArrayD<f64>, tile_hint: Option<Vec<usize>>) -> Result<Expr, SpartanError> {
    let mut spec = ArraySpec::new(data.shape());
    spec.tile_hint = tile_hint;
    let data = Arc::new(Buffer::Dense(data));
    generate(spec, move |extent| Ok(data.slice(&extent.to_slice())?))
}

/// An unwritten sparse matrix.
pub fn sparse_empty(spec: ArraySpec) -> Result<Expr, SpartanError> {
    ndarray(spec.with_sparse(true))
}

/// A sparse matrix where each element is nonzero with probability
/// `density`, drawn uniformly from `[0, 1)`.
pub fn sparse_rand(spec: ArraySpec, density: f64) -> Result<Expr, SpartanError> {
    if !(0.0..=1.0).contains(&density) {
        return Err(SpartanError::ShapeMismatch(format!(
            "density {} is not within [0, 1]",
            density
        )));
    }
    generate(spec.with_sparse(true), move |extent| {
        let shape = extent.shape();
        let mut rng = rand::thread_rng();
        let mut triplets = Vec::new();
        for r in 0..shape[0] {
            for c in 0..shape[1] {
                if rng.gen_bool(density) {
                    triplets.push((r, c, rng.gen::<f64>()));
                }
            }
        }
        Ok(Buffer::Sparse(SparseTile::from_triplets(
            [shape[0], shape[1]],
            triplets,
        )?))
    })
}

/// A sparse matrix with ones on the main diagonal.
pub fn sparse_diagonal(spec: ArraySpec) -> Result<Expr, SpartanError> {
    generate(spec.with_sparse(true), |extent| {
        let (ul, lr) = (extent.ul(), extent.lr());
        let diagonal = ul[0].max(ul[1])..lr[0].min(lr[1]);
        let triplets = diagonal.map(|i| (i - ul[0], i - ul[1], 1.0));
        let shape = extent.shape();
        Ok(Buffer::Sparse(SparseTile::from_triplets(
            [shape[0], shape[1]],
            triplets,
        )?))
    })
}

fn rank(dtype: DType) -> u8 {
    match dtype {
        DType::Bool => 0,
        DType::I32 => 1,
        DType::I64 => 2,
        DType::F32 => 3,
        DType::F64 => 4,
    }
}

/// The dtype of a binary operation on `a` and `b`.
fn promote(a: DType, b: DType) -> DType {
    if rank(a) >= rank(b) { a } else { b }
}

fn binary(
    a: &Expr,
    b: &Expr,
    dtype: DType,
    sparse: bool,
    f: fn(f64, f64) -> f64,
) -> Result<Expr, SpartanError> {
    let kernel = map_kernel(move |inputs, _| {
        let lhs = inputs[0].to_dense();
        let rhs = inputs[1].to_dense();
        Ok(Buffer::Dense(
            Zip::from(&lhs).and(&rhs).map_collect(|x, y| f(*x, *y)),
        ))
    });
    Expr::map(
        MapExpr::new(vec![a.clone(), b.clone()], kernel)
            .with_dtype(dtype)
            .with_sparse(sparse),
    )
}

/// Elementwise sum, with numpy broadcasting.
pub fn add(a: &Expr, b: &Expr) -> Result<Expr, SpartanError> {
    let sparse = a.is_sparse() && b.is_sparse();
    binary(a, b, promote(a.dtype(), b.dtype()), sparse, |x, y| x + y)
}

pub fn sub(a: &Expr, b: &Expr) -> Result<Expr, SpartanError> {
    let sparse = a.is_sparse() && b.is_sparse();
    binary(a, b, promote(a.dtype(), b.dtype()), sparse, |x, y| x - y)
}

pub fn mul(a: &Expr, b: &Expr) -> Result<Expr, SpartanError> {
    let sparse = a.is_sparse() || b.is_sparse();
    binary(a, b, promote(a.dtype(), b.dtype()), sparse, |x, y| x * y)
}

pub fn div(a: &Expr, b: &Expr) -> Result<Expr, SpartanError> {
    let dtype = promote(a.dtype(), b.dtype()).float_dtype();
    binary(a, b, dtype, false, |x, y| x / y)
}

/// Apply `f` to every element. Sparse inputs stay sparse when `f`
/// maps zero to zero.
fn unary<F>(a: &Expr, dtype: DType, f: F) -> Result<Expr, SpartanError>
where
    F: Fn(f64) -> f64 + Copy + Send + Sync + 'static,
{
    let sparse = a.is_sparse() && f(0.0) == 0.0;
    let kernel = map_kernel(move |inputs, _| {
        Ok(match &inputs[0] {
            Buffer::Sparse(tile) if sparse => Buffer::Sparse(tile.map_values(f)),
            other => Buffer::Dense(other.to_dense().mapv(f)),
        })
    });
    Expr::map(
        MapExpr::new(vec![a.clone()], kernel)
            .with_dtype(dtype)
            .with_sparse(sparse),
    )
}

fn scalar_dtype(dtype: DType, scalar: f64) -> DType {
    if dtype.is_integral() && scalar.fract() != 0.0 {
        DType::F64
    } else {
        dtype
    }
}

pub fn add_scalar(a: &Expr, scalar: f64) -> Result<Expr, SpartanError> {
    unary(a, scalar_dtype(a.dtype(), scalar), move |x| x + scalar)
}

pub fn mul_scalar(a: &Expr, scalar: f64) -> Result<Expr, SpartanError> {
    unary(a, scalar_dtype(a.dtype(), scalar), move |x| x * scalar)
}

/// Natural logarithm.
pub fn ln(a: &Expr) -> Result<Expr, SpartanError> {
    unary(a, a.dtype().float_dtype(), f64::ln)
}

/// Natural logarithm, under numpy's name.
pub fn log(a: &Expr) -> Result<Expr, SpartanError> {
    ln(a)
}

pub fn exp(a: &Expr) -> Result<Expr, SpartanError> {
    unary(a, a.dtype().float_dtype(), f64::exp)
}

pub fn sqrt(a: &Expr) -> Result<Expr, SpartanError> {
    unary(a, a.dtype().float_dtype(), f64::sqrt)
}

pub fn abs(a: &Expr) -> Result<Expr, SpartanError> {
    unary(a, a.dtype(), f64::abs)
}

/// Error function, Abramowitz and Stegun 7.1.26 (absolute error below
/// 1.5e-7).
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let y = 1.0 - poly * (-x * x).exp();
    if x < 0.0 { -y } else { y }
}

/// Standard normal cumulative distribution function.
pub fn norm_cdf(a: &Expr, capabilities: &Capabilities) -> Result<Expr, SpartanError> {
    if !capabilities.special_functions {
        return Err(SpartanError::CapabilityUnavailable("special_functions"));
    }
    unary(a, a.dtype().float_dtype(), |x| 0.5 * (1.0 + erf(x / SQRT_2)))
}

/// Convert to `dtype`.
pub fn astype(a: &Expr, dtype: DType) -> Result<Expr, SpartanError> {
    let sparse = a.is_sparse();
    Expr::map(
        MapExpr::new(vec![a.clone()], map_kernel(|inputs, _| Ok(inputs[0].clone())))
            .with_dtype(dtype)
            .with_sparse(sparse),
    )
}

fn local_sum(_extent: &Extent, tile: Buffer, axis: Option<usize>) -> anyhow::Result<Buffer> {
    let dense = tile.into_dense();
    Ok(Buffer::Dense(match axis {
        Some(axis) => dense.sum_axis(Axis(axis)),
        None => ArrayD::from_elem(IxDyn(&[]), dense.sum()),
    }))
}

pub fn sum(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    Expr::reduce(ReduceExpr {
        input: a.clone(),
        axis,
        dtype_fn: |dtype| dtype.sum_dtype(),
        local_reduce: reduce_kernel(local_sum),
        accumulate: accum::sum(),
    })
}

/// The number of elements `sum` over `axis` adds up.
fn reduced_count(a: &Expr, axis: Option<usize>) -> Result<usize, SpartanError> {
    let shape = a.compute_shape()?;
    match axis {
        Some(axis) => shape.get(axis).copied().ok_or_else(|| {
            SpartanError::ShapeMismatch(format!("axis {} out of range for shape {:?}", axis, shape))
        }),
        None => Ok(shape.iter().product()),
    }
}

pub fn mean(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    let total = sum(a, axis)?;
    let dtype = a.dtype().float_dtype();
    match reduced_count(a, axis) {
        Ok(count) => {
            let count = count as f64;
            unary(&total, dtype, move |x| x / count)
        }
        Err(SpartanError::NotShapeable(_)) => {
            // count the elements alongside the sum
            let count = sum(&unary(a, DType::I64, |_| 1.0)?, axis)?;
            let divide = map_kernel(|inputs, _| {
                Ok(Buffer::Dense(&inputs[0].to_dense() / &inputs[1].to_dense()))
            });
            Expr::map(MapExpr::new(vec![total, count], divide).with_dtype(dtype))
        }
        Err(err) => Err(err),
    }
}

/// Position and value of the preferred element of `tile`, overall or
/// along `axis`. Ties keep the earliest element.
fn local_arg(
    extent: &Extent,
    tile: Buffer,
    axis: Option<usize>,
    prefer: fn(f64, f64) -> bool,
) -> anyhow::Result<Buffer> {
    let dense = tile.into_dense();
    let pick = |values: &mut dyn Iterator<Item = f64>| {
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in values.enumerate() {
            if best.is_none_or(|(_, b)| prefer(v, b)) {
                best = Some((i, v));
            }
        }
        best
    };
    match axis {
        None => {
            let (local, val) = pick(&mut dense.iter().copied())
                .ok_or_else(|| anyhow::anyhow!("arg reduction of empty tile {}", extent))?;
            Ok(Buffer::Indexed(IndexedValues {
                idx: ArrayD::from_elem(IxDyn(&[]), extent.to_global(local, None)),
                val: ArrayD::from_elem(IxDyn(&[]), val),
            }))
        }
        Some(axis) => {
            let shape = extent.drop_axis(axis)?.shape();
            let mut idx = Vec::new();
            let mut val = Vec::new();
            for lane in dense.lanes(Axis(axis)) {
                let (local, v) = pick(&mut lane.iter().copied())
                    .ok_or_else(|| anyhow::anyhow!("arg reduction of empty tile {}", extent))?;
                idx.push(extent.to_global(local, Some(axis)));
                val.push(v);
            }
            Ok(Buffer::Indexed(IndexedValues {
                idx: ArrayD::from_shape_vec(IxDyn(&shape), idx)?,
                val: ArrayD::from_shape_vec(IxDyn(&shape), val)?,
            }))
        }
    }
}

fn arg_reduce(a: &Expr, axis: Option<usize>, minimum: bool) -> Result<Expr, SpartanError> {
    let (prefer, accumulate): (fn(f64, f64) -> bool, _) = if minimum {
        (accum::less, accum::arg_min())
    } else {
        (accum::greater, accum::arg_max())
    };
    let pairs = Expr::reduce(ReduceExpr {
        input: a.clone(),
        axis,
        dtype_fn: |dtype| dtype,
        local_reduce: reduce_kernel(move |extent, tile, axis| local_arg(extent, tile, axis, prefer)),
        accumulate,
    })?;
    let take_index = map_kernel(|inputs, extent| match &inputs[0] {
        Buffer::Indexed(pairs) => Ok(Buffer::Dense(pairs.idx.mapv(|i| i as f64))),
        _ => anyhow::bail!("expected indexed values at {}", extent),
    });
    Expr::map(MapExpr::new(vec![pairs], take_index).with_dtype(DType::I64))
}

/// Positions of the minimum, as flat indices when `axis` is `None`.
pub fn argmin(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    arg_reduce(a, axis, true)
}

/// Positions of the maximum, as flat indices when `axis` is `None`.
pub fn argmax(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    arg_reduce(a, axis, false)
}

pub fn count_nonzero(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    let flags = unary(a, DType::I64, |x| if x != 0.0 { 1.0 } else { 0.0 })?;
    sum(&flags, axis)
}

pub fn count_zero(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    let flags = unary(a, DType::I64, |x| if x == 0.0 { 1.0 } else { 0.0 })?;
    sum(&flags, axis)
}

/// Number of elements. A shape that depends on data is found by
/// evaluating `a`.
pub async fn size(ev: &Evaluator, a: &Expr) -> Result<usize, SpartanError> {
    match a.compute_shape() {
        Ok(shape) => Ok(shape.iter().product()),
        Err(SpartanError::NotShapeable(_)) => Ok(ev.force(a).await?.size()),
        Err(err) => Err(err),
    }
}

/// Flatten to one dimension in row-major order.
pub fn ravel(a: &Expr) -> Result<Expr, SpartanError> {
    Expr::shuffle(ShuffleExpr {
        inputs: vec![a.clone()],
        kernel: shuffle_kernel(|ctx: ShuffleContext| async move {
            let total = ctx.inputs[0].size();
            let tile = ctx.inputs[0].fetch(&ctx.extent).await?.into_dense();
            // consecutive positions form one run per output write
            let mut runs: Vec<(usize, Vec<f64>)> = Vec::new();
            for (local, value) in tile.iter().enumerate() {
                let pos = ctx.extent.to_global(local, None);
                match runs.last_mut() {
                    Some((start, values)) if *start + values.len() == pos => values.push(*value),
                    _ => runs.push((pos, vec![*value])),
                }
            }
            let mut pieces = Vec::with_capacity(runs.len());
            for (start, values) in runs {
                let dst = Extent::new(vec![start], vec![start + values.len()], vec![total])?;
                pieces.push((dst, Buffer::Dense(Array1::from(values).into_dyn())));
            }
            Ok(pieces)
        }),
        target: ShuffleTarget::Flat(a.dtype()),
    })
}

fn matrix_shape(expr: &Expr) -> Result<[usize; 2], SpartanError> {
    let shape = expr.compute_shape()?;
    match shape[..] {
        [rows, cols] => Ok([rows, cols]),
        _ => Err(SpartanError::ShapeMismatch(format!(
            "expected a matrix, got shape {:?}",
            shape
        ))),
    }
}

/// Multiply one tile of the left operand by the rows of the right
/// operand it spans.
fn multiply_tile(lhs: Buffer, rhs: ndarray::ArrayView2<'_, f64>) -> anyhow::Result<Array2<f64>> {
    Ok(match lhs {
        Buffer::Sparse(tile) => tile.dot_dense(rhs)?,
        other => other.into_dense().into_dimensionality::<Ix2>()?.dot(&rhs),
    })
}

/// Matrix product of two distributed matrices. The left operand may be
/// sparse; partial products of each row band are summed.
pub fn dot(a: &Expr, b: &Expr) -> Result<Expr, SpartanError> {
    let [m, k] = matrix_shape(a)?;
    let [kb, n] = matrix_shape(b)?;
    if k != kb {
        return Err(SpartanError::ShapeMismatch(format!(
            "cannot multiply ({}, {}) by ({}, {})",
            m, k, kb, n
        )));
    }
    let spec = ArraySpec::new([m, n])
        .with_dtype(promote(a.dtype(), b.dtype()))
        .with_merge(accum::sum());
    Expr::shuffle(ShuffleExpr {
        inputs: vec![a.clone(), b.clone()],
        kernel: shuffle_kernel(move |ctx: ShuffleContext| async move {
            let (ul, lr) = (ctx.extent.ul(), ctx.extent.lr());
            let lhs = ctx.inputs[0].fetch(&ctx.extent).await?;
            let rows = Extent::new(vec![ul[1], 0], vec![lr[1], n], vec![k, n])?;
            let rhs = ctx.inputs[1]
                .fetch(&rows)
                .await?
                .into_dense()
                .into_dimensionality::<Ix2>()?;
            let product = multiply_tile(lhs, rhs.view())?;
            let dst = Extent::new(vec![ul[0], 0], vec![lr[0], n], vec![m, n])?;
            Ok(vec![(dst, Buffer::Dense(product.into_dyn()))])
        }),
        target: ShuffleTarget::New(spec),
    })
}

/// Matrix product of a distributed matrix by a local one.
pub fn dot_local(a: &Expr, b: Array2<f64>) -> Result<Expr, SpartanError> {
    let [m, k] = matrix_shape(a)?;
    let (kb, n) = b.dim();
    if k != kb {
        return Err(SpartanError::ShapeMismatch(format!(
            "cannot multiply ({}, {}) by ({}, {})",
            m, k, kb, n
        )));
    }
    let b = Arc::new(b);
    let spec = ArraySpec::new([m, n])
        .with_dtype(a.dtype().float_dtype())
        .with_merge(accum::sum());
    Expr::shuffle(ShuffleExpr {
        inputs: vec![a.clone()],
        kernel: shuffle_kernel(move |ctx: ShuffleContext| {
            let b = Arc::clone(&b);
            async move {
                let (ul, lr) = (ctx.extent.ul(), ctx.extent.lr());
                let lhs = ctx.inputs[0].fetch(&ctx.extent).await?;
                let product = multiply_tile(lhs, b.slice(s![ul[1]..lr[1], ..]))?;
                let dst = Extent::new(vec![ul[0], 0], vec![lr[0], n], vec![m, n])?;
                Ok(vec![(dst, Buffer::Dense(product.into_dyn()))])
            }
        }),
        target: ShuffleTarget::New(spec),
    })
}

/// Reverse the order of the axes.
pub fn transpose(a: &Expr) -> Expr {
    Expr::transpose(a.clone())
}

/// A general prefix scan. With `axis` `None` the array is scanned in
/// row-major order and the result is 1-dimensional.
pub fn scan(
    a: &Expr,
    axis: Option<usize>,
    reduce_fn: Option<crate::expr::ReduceFn>,
    scan_fn: crate::expr::ScanFn,
    accumulate: accum::MergeFn,
    dtype: Option<DType>,
) -> Result<Expr, SpartanError> {
    let (input, axis) = match axis {
        Some(axis) => (a.clone(), axis),
        None => match a.compute_shape() {
            Ok(shape) if shape.len() == 1 => (a.clone(), 0),
            Ok(_) | Err(SpartanError::NotShapeable(_)) => (ravel(a)?, 0),
            Err(err) => return Err(err),
        },
    };
    Expr::scan(ScanExpr {
        input,
        axis,
        reduce_fn,
        scan_fn,
        accumulate,
        dtype,
    })
}

/// Cumulative sum.
pub fn cumsum(a: &Expr, axis: Option<usize>) -> Result<Expr, SpartanError> {
    scan(
        a,
        axis,
        Some(reduce_kernel(local_sum)),
        scan_kernel(|tile, axis| {
            let mut data = tile.into_dense();
            data.accumulate_axis_inplace(Axis(axis), |prev, cur| *cur += *prev);
            Ok(Buffer::Dense(data))
        }),
        accum::sum(),
        Some(a.dtype().sum_dtype()),
    )
}

/// Basic numpy indexing; the result is a view of `a`.
pub fn select(a: &Expr, index: Vec<Index>) -> Result<Expr, SpartanError> {
    Expr::slice(a.clone(), SliceIndex::Basic(index))
}

/// Rows of `a` at the positions held in the 1-dimensional `indices`.
pub fn take(a: &Expr, indices: &Expr) -> Result<Expr, SpartanError> {
    Expr::slice(a.clone(), SliceIndex::Take(indices.clone()))
}

/// Elements of `a` where `mask` is nonzero, in row-major order.
pub fn mask_select(a: &Expr, mask: &Expr) -> Result<Expr, SpartanError> {
    Expr::slice(a.clone(), SliceIndex::Mask(mask.clone()))
}
