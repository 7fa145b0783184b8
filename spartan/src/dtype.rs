/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Element type of an array.
///
/// Tile buffers always hold `f64`; the dtype determines how values are
/// normalized when they are written into a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DType {
    Bool,
    I32,
    I64,
    F32,
    #[default]
    F64,
}

impl DType {
    /// Normalize `value` to this dtype.
    pub fn cast(&self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::I32 => (value.trunc() as i32) as f64,
            DType::I64 => (value.trunc() as i64) as f64,
            DType::F32 => (value as f32) as f64,
            DType::F64 => value,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, DType::Bool | DType::I32 | DType::I64)
    }

    /// The dtype a sum over values of this dtype produces.
    pub fn sum_dtype(&self) -> DType {
        match self {
            DType::Bool | DType::I32 | DType::I64 => DType::I64,
            other => *other,
        }
    }

    /// The dtype of a mean or other floating result.
    pub fn float_dtype(&self) -> DType {
        match self {
            DType::F32 => DType::F32,
            _ => DType::F64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast() {
        assert_eq!(DType::Bool.cast(3.5), 1.0);
        assert_eq!(DType::Bool.cast(0.0), 0.0);
        assert_eq!(DType::I32.cast(-2.7), -2.0);
        assert_eq!(DType::I64.cast(2.7), 2.0);
        assert_eq!(DType::F32.cast(0.1), 0.1f32 as f64);
        assert_eq!(DType::F64.cast(0.1), 0.1);
    }

    #[test]
    fn test_sum_dtype() {
        assert_eq!(DType::Bool.sum_dtype(), DType::I64);
        assert_eq!(DType::F32.sum_dtype(), DType::F32);
        assert_eq!(DType::I32.float_dtype(), DType::F64);
    }
}
