/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fan-out of per-tile operations to workers and fan-in of their
//! completions.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use ndextent::Extent;
use tokio::sync::oneshot;

use crate::error::SpartanError;
use crate::worker::Worker;
use crate::worker::WorkerId;

/// The pending result of an operation submitted to a worker on behalf
/// of one tile.
#[derive(Debug)]
pub struct TileFuture<T> {
    extent: Extent,
    worker: WorkerId,
    rx: oneshot::Receiver<anyhow::Result<T>>,
}

impl<T> TileFuture<T> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Wait for the operation. Kernel errors are reported as failures of
    /// this future's tile; a worker that drops the operation is reported
    /// as unavailable.
    pub async fn wait(self) -> Result<T, SpartanError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SpartanError::from_kernel(err, &self.extent, self.worker)),
            Err(_) => Err(SpartanError::WorkerUnavailable(self.worker)),
        }
    }
}

/// Run `op` on `worker` for the tile at `extent`.
pub fn submit<T, F>(
    worker: &Arc<dyn Worker>,
    extent: &Extent,
    op: F,
) -> Result<TileFuture<T>, SpartanError>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    worker.spawn(
        async move {
            // The receiver may have given up; the result is then unused.
            let _ = tx.send(op.await);
        }
        .boxed(),
    )?;
    Ok(TileFuture {
        extent: extent.clone(),
        worker: worker.id(),
        rx,
    })
}

/// A batch of outstanding operations. Futures may be added at any
/// time before [`FutureGroup::wait_all`]; the order in which members
/// complete is unspecified.
pub struct FutureGroup<T> {
    pending: FuturesUnordered<BoxFuture<'static, Result<T, SpartanError>>>,
}

impl<T> Default for FutureGroup<T> {
    fn default() -> Self {
        Self {
            pending: FuturesUnordered::new(),
        }
    }
}

impl<T> std::fmt::Debug for FutureGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureGroup")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<T: Send + 'static> FutureGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a future that is driven when the group is waited on.
    pub fn push(&mut self, fut: impl Future<Output = Result<T, SpartanError>> + Send + 'static) {
        self.pending.push(fut.boxed());
    }

    /// Start `fut` immediately on the runtime and track its completion.
    pub fn spawn(&mut self, fut: impl Future<Output = Result<T, SpartanError>> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.pending.push(
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(SpartanError::Aborted(err.to_string())),
                }
            }
            .boxed(),
        );
    }

    pub fn push_tile(&mut self, fut: TileFuture<T>) {
        self.pending.push(fut.wait().boxed());
    }

    /// Move every member of `other` into this group.
    pub fn extend(&mut self, other: FutureGroup<T>) {
        self.pending.extend(other.pending);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for every member, returning results in completion order, or
    /// the first error encountered. Members still running when an error
    /// is returned run to completion unobserved.
    pub async fn wait_all(mut self) -> Result<Vec<T>, SpartanError> {
        let mut results = Vec::with_capacity(self.pending.len());
        while let Some(result) = self.pending.next().await {
            results.push(result?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::LocalWorker;

    fn worker() -> Arc<dyn Worker> {
        Arc::new(LocalWorker::new(WorkerId(7), "localhost", 4))
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let w = worker();
        let ex = Extent::from_shape(&[2]);
        let fut = submit(&w, &ex, async { Ok(3) }).unwrap();
        assert_eq!(fut.worker(), WorkerId(7));
        assert_eq!(fut.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kernel_error_becomes_tile_failure() {
        let w = worker();
        let ex = Extent::from_shape(&[2]);
        let fut = submit::<(), _>(&w, &ex, async { Err(anyhow::anyhow!("bad kernel")) }).unwrap();
        match fut.wait().await {
            Err(SpartanError::TileFailure {
                extent, message, ..
            }) => {
                assert_eq!(extent, ex);
                assert!(message.contains("bad kernel"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_group_accepts_members_while_pending() {
        let mut group = FutureGroup::new();
        group.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(1)
        });
        group.push(async { Ok(2) });
        let mut other = FutureGroup::new();
        other.push(async { Ok(3) });
        group.extend(other);
        assert_eq!(group.len(), 3);
        let mut results = group.wait_all().await.unwrap();
        results.sort();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_group_surfaces_error() {
        let mut group = FutureGroup::new();
        group.push(async { Ok(1) });
        group.push(async { Err(SpartanError::WorkerUnavailable(WorkerId(2))) });
        assert!(matches!(
            group.wait_all().await,
            Err(SpartanError::WorkerUnavailable(WorkerId(2)))
        ));
    }
}
