/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use ndarray::Array;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use ndarray::Ix2;
use spartan::ArraySpec;
use spartan::Buffer;
use spartan::Cluster;
use spartan::Config;
use spartan::DistArray;
use spartan::Evaluator;
use spartan::Extent;
use spartan::SpartanError;
use spartan::builtins;
use spartan::cluster::LocalAllocator;
use spartan::darray::tile_mapper;
use spartan::index;
use spartan::worker::Worker;
use spartan::worker::WorkerId;

async fn evaluator(num_workers: usize) -> Evaluator {
    Evaluator::new(Cluster::start(Config::local(num_workers)).await.unwrap())
}

async fn dist(ev: &Evaluator, expr: &spartan::Expr) -> DistArray {
    ev.force(expr).await.unwrap().into_dist().unwrap()
}

#[tokio::test]
async fn test_add_ones() {
    let ev = evaluator(4).await;
    let a = builtins::ones(ArraySpec::new([20, 20])).unwrap();
    let b = builtins::add(&a, &a).unwrap();
    assert_eq!(b.compute_shape().unwrap(), vec![20, 20]);
    let got = ev.glom(&b).await.unwrap();
    assert_eq!(got, Buffer::from_elem(&[20, 20], 2.0));
}

#[tokio::test]
async fn test_map_preserves_shape() {
    let ev = evaluator(3).await;
    let a = builtins::add_scalar(
        &builtins::rand(ArraySpec::new([7, 9]).with_tile_hint([3, 4])).unwrap(),
        1.0,
    )
    .unwrap();
    let b = builtins::ones(ArraySpec::new([7, 9])).unwrap();
    for expr in [
        builtins::add(&a, &b).unwrap(),
        builtins::sub(&a, &b).unwrap(),
        builtins::ln(&a).unwrap(),
        builtins::exp(&a).unwrap(),
    ] {
        assert_eq!(expr.compute_shape().unwrap(), vec![7, 9]);
        assert_eq!(ev.glom(&expr).await.unwrap().shape(), vec![7, 9]);
    }
}

#[tokio::test]
async fn test_broadcast_row() {
    let ev = evaluator(2).await;
    let a = builtins::arange(ArraySpec::new([3, 4]).with_tile_hint([2, 2])).unwrap();
    let row = builtins::from_dense(ndarray::array![[10.0, 20.0, 30.0, 40.0]].into_dyn(), None)
        .unwrap();
    let got = ev
        .glom(&builtins::add(&a, &row).unwrap())
        .await
        .unwrap()
        .into_dense();
    assert_eq!(got[[0, 0]], 10.0);
    assert_eq!(got[[2, 3]], 51.0);
}

#[tokio::test]
async fn test_sum_of_ones() {
    let ev = evaluator(4).await;
    for shape in [vec![5], vec![6, 7], vec![3, 4, 5]] {
        let a = builtins::ones(ArraySpec::new(shape.clone())).unwrap();
        let total = ev.glom(&builtins::sum(&a, None).unwrap()).await.unwrap();
        let expected: usize = shape.iter().product();
        assert_eq!(total.into_dense().sum(), expected as f64);
    }

    let a = builtins::ones(ArraySpec::new([6, 7, 8])).unwrap();
    for axis in 0..3 {
        let reduced = dist(&ev, &builtins::sum(&a, Some(axis)).unwrap()).await;
        let predicted = Extent::from_shape(&[6, 7, 8])
            .index_for_reduction(Some(axis))
            .unwrap();
        assert_eq!(reduced.shape(), predicted.array_shape());
        let data = reduced.glom().await.unwrap().into_dense();
        assert!(data.iter().all(|v| *v == [6.0, 7.0, 8.0][axis]));
    }
}

#[tokio::test]
async fn test_cumsum_matches_reference() {
    let ev = evaluator(4).await;
    for n in [1usize, 2, 17, 100] {
        let a = builtins::arange(ArraySpec::new([n])).unwrap();
        let got = ev
            .glom(&builtins::cumsum(&a, None).unwrap())
            .await
            .unwrap()
            .into_dense();
        let mut expected = Array1::from_iter((0..n).map(|v| v as f64));
        expected.accumulate_axis_inplace(Axis(0), |prev, cur| *cur += *prev);
        assert_eq!(got, expected.into_dyn());
        assert_eq!(got[[n - 1]], (n * (n - 1) / 2) as f64);
    }
}

#[tokio::test]
async fn test_cumsum_of_matrix_ravels() {
    let ev = evaluator(2).await;
    let a = builtins::ones(ArraySpec::new([3, 4])).unwrap();
    let scanned = builtins::cumsum(&a, None).unwrap();
    assert_eq!(scanned.compute_shape().unwrap(), vec![12]);
    let got = ev.glom(&scanned).await.unwrap().into_dense();
    assert_eq!(got[[11]], 12.0);
}

#[tokio::test]
async fn test_transpose_is_involutive() {
    let ev = evaluator(3).await;
    let x = builtins::rand(ArraySpec::new([9, 5]).with_tile_hint([4, 2])).unwrap();
    let twice = builtins::transpose(&builtins::transpose(&x));
    let original = ev.glom(&x).await.unwrap();
    assert_eq!(ev.glom(&twice).await.unwrap(), original);
}

#[tokio::test]
async fn test_slice_fetch_equals_indexed_fetch() {
    let ev = evaluator(3).await;
    let a = dist(
        &ev,
        &builtins::arange(ArraySpec::new([8, 6]).with_tile_hint([3, 4])).unwrap(),
    )
    .await;
    let idx = index![2..7, 1..5];
    let view = spartan::Slice::new(a.clone(), &idx).unwrap();
    let full = Extent::from_shape(&view.shape());
    assert_eq!(
        view.fetch(&full).await.unwrap(),
        a.select(&idx).await.unwrap()
    );
}

#[tokio::test]
async fn test_out_of_range_slice_is_empty() {
    let ev = evaluator(2).await;
    let a = dist(&ev, &builtins::ones(ArraySpec::new([10, 4])).unwrap()).await;
    let view = spartan::Slice::new(a, &index![20..30, ..]).unwrap();
    assert_eq!(view.shape(), vec![0, 4]);
    assert!(view.extents().is_empty());
    assert!(view.glom().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_take_rows_of_arange() {
    let ev = evaluator(4).await;
    let a = builtins::arange(ArraySpec::new([10, 10])).unwrap();
    let idx = builtins::ones(ArraySpec::new([10]).with_dtype(spartan::DType::I64)).unwrap();
    let taken = builtins::take(&a, &idx).unwrap();
    assert_eq!(taken.compute_shape().unwrap(), vec![10, 10]);

    let reference = Array::from_shape_fn((10, 10), |(i, j)| (i * 10 + j) as f64);
    let rows = vec![1usize; 10];
    let expected = reference.select(Axis(0), &rows).into_dyn();
    assert_eq!(ev.glom(&taken).await.unwrap().into_dense(), expected);
}

fn reference_dot(a: Buffer, b: Buffer) -> Array2<f64> {
    let a = a.into_dense().into_dimensionality::<Ix2>().unwrap();
    let b = b.into_dense().into_dimensionality::<Ix2>().unwrap();
    a.dot(&b)
}

#[tokio::test]
async fn test_dot_dense() {
    let ev = evaluator(4).await;
    let (m, k) = (13, 11);
    let a = dist(
        &ev,
        &builtins::rand(ArraySpec::new([m, k]).with_tile_hint([5, 4])).unwrap(),
    )
    .await;
    let b = dist(&ev, &builtins::rand(ArraySpec::new([k, 1])).unwrap()).await;
    let expected = reference_dot(a.glom().await.unwrap(), b.glom().await.unwrap());

    let product = builtins::dot(
        &spartan::Expr::from_array(a),
        &spartan::Expr::from_array(b),
    )
    .unwrap();
    let got = ev.glom(&product).await.unwrap().into_dense();
    assert_eq!(got.shape(), &[m, 1]);
    for (g, e) in got.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*g, *e, epsilon = 1e-9);
    }
}

#[tokio::test]
async fn test_dot_sparse_left() {
    let ev = evaluator(4).await;
    let (m, k) = (20, 16);
    let a = dist(
        &ev,
        &builtins::sparse_rand(ArraySpec::new([m, k]).with_tile_hint([8, 8]), 0.3).unwrap(),
    )
    .await;
    assert!(a.is_sparse());
    let b = dist(&ev, &builtins::randn(ArraySpec::new([k, 1])).unwrap()).await;
    let expected = reference_dot(a.glom().await.unwrap(), b.glom().await.unwrap());

    let product = builtins::dot(
        &spartan::Expr::from_array(a),
        &spartan::Expr::from_array(b),
    )
    .unwrap();
    let got = ev.glom(&product).await.unwrap().into_dense();
    for (g, e) in got.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*g, *e, epsilon = 1e-9);
    }
}

#[tokio::test]
async fn test_dot_shape_mismatch() {
    let a = builtins::ones(ArraySpec::new([3, 4])).unwrap();
    let b = builtins::ones(ArraySpec::new([5, 1])).unwrap();
    assert!(matches!(
        builtins::dot(&a, &b),
        Err(SpartanError::ShapeMismatch(_))
    ));
}

#[tokio::test]
async fn test_overlapping_writes_replace_in_order() {
    let ev = evaluator(2).await;
    let cluster = ev.cluster().clone();
    let target = DistArray::create(&cluster, &ArraySpec::new([6]).with_tile_hint([3]))
        .await
        .unwrap();
    let first = Extent::new(vec![0], vec![4], vec![6]).unwrap();
    let second = Extent::new(vec![2], vec![6], vec![6]).unwrap();
    target
        .update_and_wait(&first, Buffer::from_elem(&[4], 1.0))
        .await
        .unwrap();
    target
        .update_and_wait(&second, Buffer::from_elem(&[4], 2.0))
        .await
        .unwrap();
    assert_eq!(
        target.glom().await.unwrap(),
        Buffer::Dense(ndarray::array![1.0, 1.0, 2.0, 2.0, 2.0, 2.0].into_dyn())
    );
}

#[test]
fn test_intersection_properties() {
    let shape = vec![10, 10];
    let a = Extent::new(vec![0, 2], vec![5, 8], shape.clone()).unwrap();
    let b = Extent::new(vec![3, 0], vec![9, 4], shape.clone()).unwrap();
    assert_eq!(a.intersection(&b), b.intersection(&a));
    assert_eq!(a.intersection(&a), Some(a.clone()));
    // touching along one axis shares no elements
    let c = Extent::new(vec![5, 0], vec![9, 10], shape).unwrap();
    assert_eq!(a.intersection(&c), None);
}

#[tokio::test]
async fn test_mask_select_is_not_shapeable() {
    let ev = evaluator(2).await;
    let a = builtins::arange(ArraySpec::new([4, 4])).unwrap();
    let mask = builtins::map(&[a.clone()], |inputs, _| {
        Ok(Buffer::Dense(
            inputs[0].to_dense().mapv(|v| if v >= 10.0 { 1.0 } else { 0.0 }),
        ))
    })
    .unwrap();
    let picked = builtins::mask_select(&a, &mask).unwrap();
    assert!(matches!(
        picked.compute_shape(),
        Err(SpartanError::NotShapeable(_))
    ));
    let got = ev.force(&picked).await.unwrap();
    assert_eq!(got.shape(), vec![6]);
}

#[tokio::test]
async fn test_lost_worker_fails_the_node() {
    let mut allocator = LocalAllocator::new();
    let cluster = Cluster::with_allocator(Config::local(2), &mut allocator)
        .await
        .unwrap();
    let ev = Evaluator::new(cluster);
    let a = dist(
        &ev,
        &builtins::ones(ArraySpec::new([4, 4]).with_tile_hint([2, 4])).unwrap(),
    )
    .await;
    allocator.workers()[1].kill();
    assert_eq!(a.refresh_bad_tiles(), 1);
    let total = builtins::sum(&spartan::Expr::from_array(a), None).unwrap();
    let err = ev.glom(&total).await.unwrap_err();
    assert!(
        matches!(err, SpartanError::TileFailure { lost: true, .. }),
        "unexpected error: {}",
        err
    );
    assert!(err.is_retryable());
    assert!(!ev.is_cached(&total));
}

async fn cluster_with_workers(config: Config) -> (Cluster, LocalAllocator) {
    let mut allocator = LocalAllocator::new();
    let cluster = Cluster::with_allocator(config, &mut allocator)
        .await
        .unwrap();
    (cluster, allocator)
}

#[tokio::test]
async fn test_sparse_overwrite_with_zeros() {
    let ev = evaluator(2).await;
    let spec = ArraySpec::new([2, 2]).with_sparse(true).with_tile_hint([1, 2]);
    let target = DistArray::create(ev.cluster(), &spec).await.unwrap();
    let full = target.full_extent();
    target
        .update_and_wait(&full, Buffer::from_elem(&[2, 2], 1.0))
        .await
        .unwrap();
    target
        .update_and_wait(&full, Buffer::zeros(&[2, 2]))
        .await
        .unwrap();
    let got = target.glom().await.unwrap();
    assert_eq!(got.as_sparse().unwrap().nnz(), 0);
    assert_eq!(got.into_dense(), Array2::<f64>::zeros((2, 2)).into_dyn());
}

#[tokio::test]
async fn test_failing_kernel_is_not_retried() {
    let ev = evaluator(2).await;
    assert_eq!(ev.cluster().config().tile_retries, 1);
    let a = builtins::ones(ArraySpec::new([4]).with_tile_hint([2])).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let bad = builtins::map(&[a], move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("kernel exploded")
    })
    .unwrap();
    let err = ev.glom(&bad).await.unwrap_err();
    assert!(matches!(err, SpartanError::TileFailure { lost: false, .. }));
    assert!(!err.is_retryable());
    tokio::time::sleep(Duration::from_millis(20)).await;
    // one call per tile
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_lost_worker_tile_is_retried_elsewhere() {
    let (cluster, allocator) = cluster_with_workers(Config::local(2)).await;
    let array = DistArray::create(&cluster, &ArraySpec::new([4]).with_tile_hint([2]))
        .await
        .unwrap();
    allocator.workers()[1].kill();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mapper = tile_mapper(move |_extent, worker| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![worker.id()])
        }
    });
    let ran_on = array.foreach_tile(mapper).await.unwrap();
    assert_eq!(ran_on, vec![WorkerId(0), WorkerId(0)]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_update_writes_nothing() {
    let (cluster, allocator) = cluster_with_workers(Config::local(2)).await;
    let array = DistArray::create(&cluster, &ArraySpec::new([2, 4]).with_tile_hint([2, 1]))
        .await
        .unwrap();
    // columns 1 and 3 live on w1
    allocator.workers()[1].kill();
    let result = array.update(&array.full_extent(), Buffer::from_elem(&[2, 4], 3.0));
    assert!(matches!(
        result,
        Err(SpartanError::TileFailure { lost: true, .. })
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let column = Extent::new(vec![0, 0], vec![2, 1], vec![2, 4]).unwrap();
    assert_eq!(array.fetch(&column).await.unwrap(), Buffer::zeros(&[2, 1]));
}

#[tokio::test]
async fn test_view_reports_its_bad_tiles() {
    let config = Config {
        tile_retries: 0,
        ..Config::local(2)
    };
    let (cluster, allocator) = cluster_with_workers(config).await;
    let array = DistArray::create(&cluster, &ArraySpec::new([6, 6]).with_tile_hint([3, 3]))
        .await
        .unwrap();
    allocator.workers()[1].kill();
    assert_eq!(array.bad_tiles().len(), 2);

    let left = spartan::Slice::new(array.clone(), &index![.., 0..3]).unwrap();
    assert!(left.bad_tiles().is_empty());
    let mapper = tile_mapper(|extent, _worker| async move { Ok(vec![extent.size()]) });
    assert_eq!(left.foreach_tile(mapper).await.unwrap(), vec![9, 9]);

    let middle = spartan::Slice::new(array, &index![1..6, 2..5]).unwrap();
    let bad = middle.bad_tiles();
    assert_eq!(bad.len(), 2);
    assert_eq!(bad[0].ul(), &[0, 1]);
    assert_eq!(bad[0].lr(), &[2, 3]);
    assert_eq!(bad[1].ul(), &[2, 1]);
    assert_eq!(bad[1].lr(), &[5, 3]);
    assert!(bad.iter().all(|e| e.array_shape() == [5, 3]));
    assert!(middle.glom().await.is_err());
}
