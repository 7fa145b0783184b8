/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Defines the accumulator trait used to merge overlapping tile writes,
//! and the common accumulators.

use std::fmt;
use std::sync::Arc;

/// An accumulator merges an update into the current value of one
/// array element. Accumulators used for arrays that receive
/// overlapping writes should be associative and commutative.
pub trait Accumulator: Send + Sync + fmt::Debug {
    /// Accumulate an update into the current state.
    fn accumulate(&self, state: &mut f64, update: f64);

    /// Accumulate an `(index, value)` update. The index follows
    /// whichever value the accumulator keeps; on ties the current
    /// index is kept.
    fn accumulate_indexed(&self, state: &mut (usize, f64), update: (usize, f64)) {
        let mut value = state.1;
        self.accumulate(&mut value, update.1);
        if value.to_bits() != state.1.to_bits() {
            *state = (update.0, value);
        }
    }
}

/// Shared handle to an accumulator, as stored on arrays and shipped
/// with updates.
pub type MergeFn = Arc<dyn Accumulator>;

/// The update replaces the current value.
#[derive(Debug)]
struct ReplaceAccumulator;

impl Accumulator for ReplaceAccumulator {
    fn accumulate(&self, state: &mut f64, update: f64) {
        *state = update;
    }

    fn accumulate_indexed(&self, state: &mut (usize, f64), update: (usize, f64)) {
        *state = update;
    }
}

/// Last writer wins. This is the merge used when none is given.
pub fn replace() -> MergeFn {
    Arc::new(ReplaceAccumulator)
}

/// Accumulate the sum of received updates.
#[derive(Debug)]
struct SumAccumulator;

impl Accumulator for SumAccumulator {
    fn accumulate(&self, state: &mut f64, update: f64) {
        *state += update;
    }
}

pub fn sum() -> MergeFn {
    Arc::new(SumAccumulator)
}

/// Keep whichever value `prefer(update, state)` selects. Comparison is
/// strict, so an equal update never displaces the current value.
struct OrdAccumulator {
    name: &'static str,
    prefer: fn(f64, f64) -> bool,
}

impl fmt::Debug for OrdAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Accumulator for OrdAccumulator {
    fn accumulate(&self, state: &mut f64, update: f64) {
        if (self.prefer)(update, *state) {
            *state = update;
        }
    }

    fn accumulate_indexed(&self, state: &mut (usize, f64), update: (usize, f64)) {
        if (self.prefer)(update.1, state.1) {
            *state = update;
        }
    }
}

/// Strict "update is smaller"; any number displaces NaN.
pub(crate) fn less(update: f64, state: f64) -> bool {
    update < state || (state.is_nan() && !update.is_nan())
}

pub(crate) fn greater(update: f64, state: f64) -> bool {
    update > state || (state.is_nan() && !update.is_nan())
}

/// Accumulate the min of received updates.
pub fn min() -> MergeFn {
    Arc::new(OrdAccumulator { name: "min", prefer: less })
}

/// Accumulate the max of received updates.
pub fn max() -> MergeFn {
    Arc::new(OrdAccumulator {
        name: "max",
        prefer: greater,
    })
}

/// Keep the `(index, value)` pair with the smallest value. Ties keep the
/// pair already accumulated.
pub fn arg_min() -> MergeFn {
    Arc::new(OrdAccumulator {
        name: "arg_min",
        prefer: less,
    })
}

/// Keep the `(index, value)` pair with the largest value. Ties keep the
/// pair already accumulated.
pub fn arg_max() -> MergeFn {
    Arc::new(OrdAccumulator {
        name: "arg_max",
        prefer: greater,
    })
}
