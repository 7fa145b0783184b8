/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors raised by the array runtime.

use ndextent::Extent;
use ndextent::ExtentError;

use crate::worker::WorkerId;

/// Errors that occur while building or evaluating array expressions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpartanError {
    /// Operands have incompatible shapes or dtypes.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The shape of an expression cannot be known before it is
    /// evaluated (for example, boolean indexing). Callers should defer
    /// shape-dependent decisions until after evaluation.
    #[error("shape of {0} expression cannot be determined before evaluation")]
    NotShapeable(&'static str),

    /// An extent lies outside its array, or a read spans tiles that do
    /// not exist.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// A per-tile computation failed, or its worker became unreachable.
    /// `lost` is set only in the latter case.
    #[error("tile {extent} failed on worker {worker}: {message}")]
    TileFailure {
        extent: Extent,
        worker: WorkerId,
        message: String,
        lost: bool,
    },

    /// Two extents share no elements. Slice and shuffle adapters treat
    /// this as a no-op; it only surfaces from direct extent queries.
    #[error("{0} and {1} do not intersect")]
    EmptyIntersection(Extent, Extent),

    /// An operation depends on a capability that was disabled at startup.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),

    #[error("worker {0} is unavailable")]
    WorkerUnavailable(WorkerId),

    /// A runtime task panicked or was aborted before reporting a result.
    #[error("task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Extent(#[from] ExtentError),
}

impl SpartanError {
    /// Re-express an arbitrary kernel error as a failure of the tile at
    /// `extent`. Errors that already describe a tile or worker failure
    /// pass through unchanged; anything else is a failure of the kernel
    /// itself.
    pub fn from_kernel(err: anyhow::Error, extent: &Extent, worker: WorkerId) -> Self {
        match err.downcast::<SpartanError>() {
            Ok(err @ (SpartanError::TileFailure { .. } | SpartanError::WorkerUnavailable(_))) => {
                err
            }
            Ok(err) => SpartanError::TileFailure {
                extent: extent.clone(),
                worker,
                message: err.to_string(),
                lost: false,
            },
            Err(err) => SpartanError::TileFailure {
                extent: extent.clone(),
                worker,
                message: format!("{:#}", err),
                lost: false,
            },
        }
    }

    /// True if the error came from a lost worker rather than from the
    /// operation itself, so that a retry elsewhere may succeed. Kernel
    /// failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpartanError::TileFailure { lost: true, .. } | SpartanError::WorkerUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kernel_wraps_plain_errors() {
        let ex = Extent::from_shape(&[4]);
        let err = SpartanError::from_kernel(anyhow::anyhow!("boom"), &ex, WorkerId(3));
        match err {
            SpartanError::TileFailure {
                ref extent,
                worker,
                ref message,
                lost,
            } => {
                assert_eq!(extent, &ex);
                assert_eq!(worker, WorkerId(3));
                assert_eq!(message, "boom");
                assert!(!lost);
                assert!(!err.is_retryable());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_from_kernel_passes_through_worker_loss() {
        let ex = Extent::from_shape(&[4]);
        let err = SpartanError::from_kernel(
            SpartanError::WorkerUnavailable(WorkerId(1)).into(),
            &ex,
            WorkerId(0),
        );
        assert!(matches!(err, SpartanError::WorkerUnavailable(WorkerId(1))));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_only_lost_tiles_are_retryable() {
        let ex = Extent::from_shape(&[4]);
        let lost = SpartanError::TileFailure {
            extent: ex.clone(),
            worker: WorkerId(0),
            message: "tile was lost".to_string(),
            lost: true,
        };
        assert!(lost.is_retryable());
        let passed = SpartanError::from_kernel(lost.into(), &ex, WorkerId(2));
        assert!(matches!(
            passed,
            SpartanError::TileFailure { worker: WorkerId(0), lost: true, .. }
        ));
        let shape = SpartanError::from_kernel(
            SpartanError::ShapeMismatch("bad".to_string()).into(),
            &ex,
            WorkerId(0),
        );
        assert!(!shape.is_retryable());
        assert!(!SpartanError::OutOfBounds("x".to_string()).is_retryable());
    }
}
