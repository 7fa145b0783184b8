/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::Expr;
use super::ExprId;
use super::ExprKind;
use super::Leaf;
use super::map;
use super::reduce;
use super::scan;
use super::select;
use super::shuffle;
use crate::array::ArrayRef;
use crate::cluster::Cluster;
use crate::darray::DistArray;
use crate::error::SpartanError;
use crate::tile::Buffer;

/// Materializes expressions on a cluster.
///
/// Each node is evaluated at most once per evaluator: its result is
/// cached by node identity, so forcing a node again, or forcing
/// another node that shares it, reuses the cached array. Dropping the
/// evaluator (or calling [`Evaluator::clear`]) releases the cached
/// arrays.
pub struct Evaluator {
    cluster: Cluster,
    memo: DashMap<ExprId, ArrayRef>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("cluster", &self.cluster)
            .field("cached", &self.memo.len())
            .finish()
    }
}

impl Evaluator {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            memo: DashMap::new(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Whether `expr` has already been evaluated.
    pub fn is_cached(&self, expr: &Expr) -> bool {
        self.memo.contains_key(&expr.id())
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        self.memo.clear();
    }

    /// Evaluate `expr` and everything it depends on. On failure nothing
    /// from the failed node is kept.
    pub fn force<'a>(&'a self, expr: &'a Expr) -> BoxFuture<'a, Result<ArrayRef, SpartanError>> {
        async move {
            if let Some(cached) = self.memo.get(&expr.id()).map(|entry| entry.value().clone()) {
                return Ok(cached);
            }
            let array = self.evaluate(expr).await?;
            self.memo.insert(expr.id(), array.clone());
            Ok(array)
        }
        .boxed()
    }

    /// Evaluate `exprs` in order.
    pub(crate) async fn force_all(&self, exprs: &[Expr]) -> Result<Vec<ArrayRef>, SpartanError> {
        let mut arrays = Vec::with_capacity(exprs.len());
        for expr in exprs {
            arrays.push(self.force(expr).await?);
        }
        Ok(arrays)
    }

    /// Evaluate `expr` and read the whole result into one buffer.
    pub async fn glom(&self, expr: &Expr) -> Result<Buffer, SpartanError> {
        self.force(expr).await?.glom().await
    }

    /// Evaluate `expr` now and return its result as a leaf.
    pub async fn evaluate_eager(&self, expr: &Expr) -> Result<Expr, SpartanError> {
        Ok(Expr::from_array(self.force(expr).await?))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(expr = %expr.id(), kind = expr.kind_name()))]
    async fn evaluate(&self, expr: &Expr) -> Result<ArrayRef, SpartanError> {
        let started = Instant::now();
        let array = match expr.kind() {
            ExprKind::NdArray(Leaf::Alloc(spec)) => DistArray::create(&self.cluster, spec).await?.into(),
            ExprKind::NdArray(Leaf::Array(array)) => array.clone(),
            ExprKind::Map(node) => map::evaluate(self, node).await?,
            ExprKind::Reduce(node) => reduce::evaluate(self, node).await?,
            ExprKind::Shuffle(node) => shuffle::evaluate(self, node).await?,
            ExprKind::Scan(node) => scan::evaluate(self, node).await?,
            ExprKind::Slice(node) => select::evaluate(self, node).await?,
            ExprKind::Transpose(input) => shuffle::transpose(self, input).await?,
        };
        tracing::info!(
            expr = %expr.id(),
            kind = expr.kind_name(),
            shape = ?array.shape(),
            tiles = array.extents().len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "evaluated"
        );
        Ok(array)
    }
}
