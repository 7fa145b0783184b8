/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rectangular regions of N-dimensional arrays.
//!
//! Provides [`Extent`], a value type describing a rectangular sub-region
//! of an N-dimensional array together with the shape of the array it
//! lives in, and [`Index`], numpy-style indexing that translates into
//! extents. Extents carry no data; they are the unit of placement and
//! addressing for distributed tiles.
//!
//! The crate avoids any dependency on the runtime, so that tile
//! arithmetic can be used (and tested) in isolation.

/// Extent arithmetic.
pub mod extent;

/// Numpy-style index expressions.
pub mod index;

pub use extent::Extent;
pub use extent::ExtentError;
pub use extent::find_shape;
pub use extent::intersection;
pub use extent::ravelled_pos;
pub use extent::unravelled_pos;
pub use index::Index;
pub use index::Region;
pub use index::compute_slice;
pub use index::from_slice;
