/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lazily evaluated, tiled N-dimensional arrays over a pool of workers.
//!
//! Operations on arrays build an expression graph ([`Expr`]). Forcing an
//! expression through an [`Evaluator`] partitions its inputs into tiles,
//! runs kernels on the workers that own those tiles, and returns a
//! distributed array ([`DistArray`]) or a view of one ([`Slice`]).

pub mod accum;
pub mod array;
pub mod builtins;
pub mod cluster;
pub mod config;
pub mod darray;
pub mod dtype;
pub mod error;
pub mod expr;
pub mod rpc;
pub mod slice;
pub mod sparse;
pub mod telemetry;
pub mod tile;
pub mod tiling;
pub mod worker;

pub use array::ArrayRef;
pub use cluster::Cluster;
pub use config::Capabilities;
pub use config::Config;
pub use darray::ArraySpec;
pub use darray::DistArray;
pub use dtype::DType;
pub use error::SpartanError;
pub use expr::Evaluator;
pub use expr::Expr;
pub use ndextent::Extent;
pub use ndextent::Index;
pub use ndextent::index;
pub use slice::Slice;
pub use telemetry::initialize_logging;
pub use tile::Buffer;
