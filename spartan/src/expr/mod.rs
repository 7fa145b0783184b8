/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lazy array expressions.
//!
//! An [`Expr`] describes a deferred array computation as an immutable
//! node in a DAG. Nodes are built by the constructors in this module
//! (usually via [`crate::builtins`]), which check shapes eagerly
//! whenever the shapes of their inputs are known. Nothing runs until an
//! [`Evaluator`] forces a node.

mod eval;
mod map;
mod reduce;
mod scan;
mod select;
mod shuffle;

use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use ndextent::Extent;
use ndextent::Index;
use ndextent::from_slice;

use crate::accum::MergeFn;
use crate::array::ArrayRef;
use crate::darray::ArraySpec;
use crate::dtype::DType;
use crate::error::SpartanError;
use crate::tile::Buffer;
use crate::worker::Worker;

pub use self::eval::Evaluator;

/// An elementwise tile kernel. Receives one buffer per input, all
/// shaped like the output tile at `extent`, and returns the output
/// tile.
pub type MapFn = Arc<dyn Fn(&[Buffer], &Extent) -> anyhow::Result<Buffer> + Send + Sync>;

/// A tile-local reduction. Receives the tile at `extent` and the
/// reduction axis, and returns a partial shaped like
/// `extent.index_for_reduction(axis)`.
pub type ReduceFn =
    Arc<dyn Fn(&Extent, Buffer, Option<usize>) -> anyhow::Result<Buffer> + Send + Sync>;

/// What a shuffle kernel sees for one source tile.
#[derive(Debug, Clone)]
pub struct ShuffleContext {
    /// Every input of the shuffle; the kernel may read any of them.
    pub inputs: Arc<[ArrayRef]>,
    /// The source tile, in the frame of the first input.
    pub extent: Extent,
    /// The worker running the kernel.
    pub worker: Arc<dyn Worker>,
}

/// A shuffle kernel. Emits any number of `(destination, data)` pairs,
/// each merged into the target array.
pub type ShuffleFn = Arc<
    dyn Fn(ShuffleContext) -> BoxFuture<'static, anyhow::Result<Vec<(Extent, Buffer)>>>
        + Send
        + Sync,
>;

/// A tile-local scan along an axis.
pub type ScanFn = Arc<dyn Fn(Buffer, usize) -> anyhow::Result<Buffer> + Send + Sync>;

pub fn map_kernel<F>(f: F) -> MapFn
where
    F: Fn(&[Buffer], &Extent) -> anyhow::Result<Buffer> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn reduce_kernel<F>(f: F) -> ReduceFn
where
    F: Fn(&Extent, Buffer, Option<usize>) -> anyhow::Result<Buffer> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn shuffle_kernel<F, Fut>(f: F) -> ShuffleFn
where
    F: Fn(ShuffleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<(Extent, Buffer)>>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

pub fn scan_kernel<F>(f: F) -> ScanFn
where
    F: Fn(Buffer, usize) -> anyhow::Result<Buffer> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies an expression node for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u64);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

fn next_expr_id() -> ExprId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    ExprId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A lazy array expression. Cloning yields another handle to the same
/// node.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

struct ExprNode {
    id: ExprId,
    kind: ExprKind,
    shape: OnceLock<Result<Vec<usize>, SpartanError>>,
}

/// The closed set of node kinds.
#[derive(Clone)]
pub enum ExprKind {
    NdArray(Leaf),
    Map(MapExpr),
    Reduce(ReduceExpr),
    Shuffle(ShuffleExpr),
    Scan(ScanExpr),
    Slice(SliceExpr),
    Transpose(Expr),
}

#[derive(Clone)]
pub enum Leaf {
    /// A new, unwritten array.
    Alloc(ArraySpec),
    /// An array that already exists.
    Array(ArrayRef),
}

#[derive(Clone)]
pub struct MapExpr {
    pub inputs: Vec<Expr>,
    pub kernel: MapFn,
    /// Output dtype; the first input's when unset.
    pub dtype: Option<DType>,
    pub sparse: bool,
}

impl MapExpr {
    pub fn new(inputs: Vec<Expr>, kernel: MapFn) -> Self {
        Self {
            inputs,
            kernel,
            dtype: None,
            sparse: false,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }
}

#[derive(Clone)]
pub struct ReduceExpr {
    pub input: Expr,
    /// `None` reduces over every axis to a 0-dimensional result.
    pub axis: Option<usize>,
    pub dtype_fn: fn(DType) -> DType,
    pub local_reduce: ReduceFn,
    /// Combines partials that land on the same output element. Must be
    /// associative and commutative.
    pub accumulate: MergeFn,
}

#[derive(Clone)]
pub enum ShuffleTarget {
    /// A new array with the first input's shape and tiling.
    LikeInput {
        dtype: Option<DType>,
        merge: MergeFn,
    },
    /// A new array allocated from a spec.
    New(ArraySpec),
    /// A new 1-dimensional array with as many elements as the first
    /// input, sized once that input is evaluated.
    Flat(DType),
    /// An existing array, written in place.
    Existing(Expr),
}

#[derive(Clone)]
pub struct ShuffleExpr {
    /// The kernel runs once per tile of the first input.
    pub inputs: Vec<Expr>,
    pub kernel: ShuffleFn,
    pub target: ShuffleTarget,
}

#[derive(Clone)]
pub struct ScanExpr {
    pub input: Expr,
    pub axis: usize,
    /// Per-tile reduction used to carry totals across tiles. Without
    /// one, the input is gathered and scanned in one piece.
    pub reduce_fn: Option<ReduceFn>,
    pub scan_fn: ScanFn,
    pub accumulate: MergeFn,
    pub dtype: Option<DType>,
}

#[derive(Clone)]
pub enum SliceIndex {
    /// Numpy basic indexing; produces a view.
    Basic(Vec<Index>),
    /// Integer-array indexing along axis 0.
    Take(Expr),
    /// Boolean indexing; produces a 1-dimensional array.
    Mask(Expr),
}

#[derive(Clone)]
pub struct SliceExpr {
    pub input: Expr,
    pub index: SliceIndex,
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expr")
            .field("id", &self.id())
            .field("kind", &self.kind_name())
            .field("dependencies", &self.dependencies().len())
            .finish()
    }
}

/// Numpy broadcasting of `shapes` to a common shape.
pub fn broadcast_shapes(shapes: &[Vec<usize>]) -> Result<Vec<usize>, SpartanError> {
    let ndim = shapes.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = vec![1; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (axis, dim) in shape.iter().enumerate() {
            let cur = &mut out[offset + axis];
            if *cur == 1 {
                *cur = *dim;
            } else if *dim != 1 && *dim != *cur {
                return Err(SpartanError::ShapeMismatch(format!(
                    "shapes {:?} cannot be broadcast together",
                    shapes
                )));
            }
        }
    }
    Ok(out)
}

/// Shapes of `exprs`, or `None` if any of them is not known before
/// evaluation.
fn known_shapes(exprs: &[Expr]) -> Result<Option<Vec<Vec<usize>>>, SpartanError> {
    let mut shapes = Vec::with_capacity(exprs.len());
    for expr in exprs {
        match expr.compute_shape() {
            Ok(shape) => shapes.push(shape),
            Err(SpartanError::NotShapeable(_)) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    Ok(Some(shapes))
}

/// Output shape of an elementwise operation: the broadcast of its input
/// shapes, which at least one input must already have.
pub(crate) fn map_output_shape(shapes: &[Vec<usize>]) -> Result<Vec<usize>, SpartanError> {
    let out = broadcast_shapes(shapes)?;
    if !shapes.iter().any(|s| *s == out) {
        return Err(SpartanError::ShapeMismatch(format!(
            "no operand of {:?} has the broadcast shape {:?}",
            shapes, out
        )));
    }
    Ok(out)
}

fn check_axis(axis: usize, shape: &[usize]) -> Result<(), SpartanError> {
    if axis >= shape.len() {
        return Err(SpartanError::ShapeMismatch(format!(
            "axis {} out of range for shape {:?}",
            axis, shape
        )));
    }
    Ok(())
}

impl Expr {
    fn new(kind: ExprKind) -> Self {
        Self(Arc::new(ExprNode {
            id: next_expr_id(),
            kind,
            shape: OnceLock::new(),
        }))
    }

    /// A leaf allocating a new array.
    pub fn ndarray(spec: ArraySpec) -> Result<Self, SpartanError> {
        spec.validate()?;
        Ok(Self::new(ExprKind::NdArray(Leaf::Alloc(spec))))
    }

    /// A leaf wrapping an existing array.
    pub fn from_array(array: impl Into<ArrayRef>) -> Self {
        Self::new(ExprKind::NdArray(Leaf::Array(array.into())))
    }

    pub fn map(node: MapExpr) -> Result<Self, SpartanError> {
        if node.inputs.is_empty() {
            return Err(SpartanError::ShapeMismatch(
                "map needs at least one input".to_string(),
            ));
        }
        if let Some(shapes) = known_shapes(&node.inputs)? {
            map_output_shape(&shapes)?;
        }
        Ok(Self::new(ExprKind::Map(node)))
    }

    pub fn reduce(node: ReduceExpr) -> Result<Self, SpartanError> {
        if let (Some(axis), Some(shapes)) = (node.axis, known_shapes(&[node.input.clone()])?) {
            check_axis(axis, &shapes[0])?;
        }
        Ok(Self::new(ExprKind::Reduce(node)))
    }

    pub fn shuffle(node: ShuffleExpr) -> Result<Self, SpartanError> {
        if node.inputs.is_empty() {
            return Err(SpartanError::ShapeMismatch(
                "shuffle needs at least one input".to_string(),
            ));
        }
        if let ShuffleTarget::New(spec) = &node.target {
            spec.validate()?;
        }
        Ok(Self::new(ExprKind::Shuffle(node)))
    }

    pub fn scan(node: ScanExpr) -> Result<Self, SpartanError> {
        if let Some(shapes) = known_shapes(&[node.input.clone()])? {
            check_axis(node.axis, &shapes[0])?;
        }
        Ok(Self::new(ExprKind::Scan(node)))
    }

    pub fn slice(input: Expr, index: SliceIndex) -> Result<Self, SpartanError> {
        let node = SliceExpr { input, index };
        if let Some(shapes) = known_shapes(&[node.input.clone()])? {
            let shape = &shapes[0];
            match &node.index {
                SliceIndex::Basic(index) => {
                    from_slice(index, shape)?;
                }
                SliceIndex::Take(idx) => {
                    if shape.is_empty() {
                        return Err(SpartanError::ShapeMismatch(
                            "cannot take from a 0-dimensional array".to_string(),
                        ));
                    }
                    if let Some(idx_shape) = known_shapes(&[idx.clone()])? {
                        if idx_shape[0].len() != 1 {
                            return Err(SpartanError::ShapeMismatch(format!(
                                "take indices must be 1-dimensional, got shape {:?}",
                                idx_shape[0]
                            )));
                        }
                    }
                }
                SliceIndex::Mask(mask) => {
                    if let Some(mask_shape) = known_shapes(&[mask.clone()])? {
                        if mask_shape[0] != *shape {
                            return Err(SpartanError::ShapeMismatch(format!(
                                "mask of shape {:?} applied to array of shape {:?}",
                                mask_shape[0], shape
                            )));
                        }
                    }
                }
            }
        }
        Ok(Self::new(ExprKind::Slice(node)))
    }

    pub fn transpose(input: Expr) -> Self {
        Self::new(ExprKind::Transpose(input))
    }

    pub fn id(&self) -> ExprId {
        self.0.id
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.0.kind {
            ExprKind::NdArray(_) => "ndarray",
            ExprKind::Map(_) => "map",
            ExprKind::Reduce(_) => "reduce",
            ExprKind::Shuffle(_) => "shuffle",
            ExprKind::Scan(_) => "scan",
            ExprKind::Slice(_) => "slice",
            ExprKind::Transpose(_) => "transpose",
        }
    }

    /// The expressions this node reads.
    pub fn dependencies(&self) -> Vec<Expr> {
        match &self.0.kind {
            ExprKind::NdArray(_) => Vec::new(),
            ExprKind::Map(node) => node.inputs.clone(),
            ExprKind::Reduce(node) => vec![node.input.clone()],
            ExprKind::Shuffle(node) => {
                let mut deps = node.inputs.clone();
                if let ShuffleTarget::Existing(target) = &node.target {
                    deps.push(target.clone());
                }
                deps
            }
            ExprKind::Scan(node) => vec![node.input.clone()],
            ExprKind::Slice(node) => match &node.index {
                SliceIndex::Basic(_) => vec![node.input.clone()],
                SliceIndex::Take(other) | SliceIndex::Mask(other) => {
                    vec![node.input.clone(), other.clone()]
                }
            },
            ExprKind::Transpose(input) => vec![input.clone()],
        }
    }

    /// The shape this node evaluates to, derived without evaluating
    /// anything. Fails with [`SpartanError::NotShapeable`] when the
    /// shape depends on data. The result is computed once per node.
    pub fn compute_shape(&self) -> Result<Vec<usize>, SpartanError> {
        self.0.shape.get_or_init(|| self.derive_shape()).clone()
    }

    fn derive_shape(&self) -> Result<Vec<usize>, SpartanError> {
        match &self.0.kind {
            ExprKind::NdArray(Leaf::Alloc(spec)) => Ok(spec.shape.clone()),
            ExprKind::NdArray(Leaf::Array(array)) => Ok(array.shape()),
            ExprKind::Map(node) => {
                let shapes = node
                    .inputs
                    .iter()
                    .map(Expr::compute_shape)
                    .collect::<Result<Vec<_>, _>>()?;
                map_output_shape(&shapes)
            }
            ExprKind::Reduce(node) => {
                let mut shape = node.input.compute_shape()?;
                match node.axis {
                    Some(axis) => {
                        check_axis(axis, &shape)?;
                        shape.remove(axis);
                        Ok(shape)
                    }
                    None => Ok(Vec::new()),
                }
            }
            ExprKind::Shuffle(node) => match &node.target {
                ShuffleTarget::LikeInput { .. } => node.inputs[0].compute_shape(),
                ShuffleTarget::New(spec) => Ok(spec.shape.clone()),
                ShuffleTarget::Flat(_) => {
                    Ok(vec![node.inputs[0].compute_shape()?.iter().product()])
                }
                ShuffleTarget::Existing(target) => target.compute_shape(),
            },
            ExprKind::Scan(node) => node.input.compute_shape(),
            ExprKind::Slice(node) => match &node.index {
                SliceIndex::Basic(index) => {
                    let shape = node.input.compute_shape()?;
                    Ok(from_slice(index, &shape)?.shape())
                }
                SliceIndex::Take(idx) => {
                    let shape = node.input.compute_shape()?;
                    let idx_shape = idx.compute_shape()?;
                    let mut out = idx_shape;
                    out.extend(shape.iter().skip(1));
                    Ok(out)
                }
                SliceIndex::Mask(_) => Err(SpartanError::NotShapeable("boolean index")),
            },
            ExprKind::Transpose(input) => {
                let mut shape = input.compute_shape()?;
                shape.reverse();
                Ok(shape)
            }
        }
    }

    pub fn dtype(&self) -> DType {
        match &self.0.kind {
            ExprKind::NdArray(Leaf::Alloc(spec)) => spec.dtype,
            ExprKind::NdArray(Leaf::Array(array)) => array.dtype(),
            ExprKind::Map(node) => node.dtype.unwrap_or_else(|| node.inputs[0].dtype()),
            ExprKind::Reduce(node) => (node.dtype_fn)(node.input.dtype()),
            ExprKind::Shuffle(node) => match &node.target {
                ShuffleTarget::LikeInput { dtype, .. } => {
                    dtype.unwrap_or_else(|| node.inputs[0].dtype())
                }
                ShuffleTarget::New(spec) => spec.dtype,
                ShuffleTarget::Flat(dtype) => *dtype,
                ShuffleTarget::Existing(target) => target.dtype(),
            },
            ExprKind::Scan(node) => node.dtype.unwrap_or_else(|| node.input.dtype()),
            ExprKind::Slice(node) => node.input.dtype(),
            ExprKind::Transpose(input) => input.dtype(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        match &self.0.kind {
            ExprKind::NdArray(Leaf::Alloc(spec)) => spec.sparse,
            ExprKind::NdArray(Leaf::Array(array)) => array.is_sparse(),
            ExprKind::Map(node) => node.sparse,
            ExprKind::Reduce(_) | ExprKind::Scan(_) => false,
            ExprKind::Shuffle(node) => match &node.target {
                ShuffleTarget::LikeInput { .. } => node.inputs[0].is_sparse(),
                ShuffleTarget::New(spec) => spec.sparse,
                ShuffleTarget::Flat(_) => false,
                ShuffleTarget::Existing(target) => target.is_sparse(),
            },
            ExprKind::Slice(node) => match &node.index {
                SliceIndex::Basic(_) => {
                    node.input.is_sparse()
                        && self.compute_shape().is_ok_and(|shape| shape.len() == 2)
                }
                _ => false,
            },
            ExprKind::Transpose(input) => input.is_sparse(),
        }
    }

    /// A printable outline of the DAG rooted at this node. Nodes
    /// reachable along several paths are expanded once.
    pub fn dag(&self) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        self.write_dag(&mut out, 0, &mut seen);
        out
    }

    fn write_dag(&self, out: &mut String, depth: usize, seen: &mut HashSet<ExprId>) {
        let shape = match self.compute_shape() {
            Ok(shape) => format!("{:?}", shape),
            Err(_) => "?".to_string(),
        };
        let _ = write!(
            out,
            "{:indent$}{} {} {} {}",
            "",
            self.id(),
            self.kind_name(),
            shape,
            self.dtype(),
            indent = depth * 2
        );
        if !seen.insert(self.id()) {
            out.push_str(" (see above)\n");
            return;
        }
        out.push('\n');
        for dep in self.dependencies() {
            dep.write_dag(out, depth + 1, seen);
        }
    }
}
