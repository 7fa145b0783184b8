/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Instant;

use clap::Parser;
use clap::ValueEnum;
use ndarray::Array2;
use ndarray::Ix2;
use spartan::ArraySpec;
use spartan::Buffer;
use spartan::Cluster;
use spartan::Config;
use spartan::Evaluator;
use spartan::builtins;

use crate::args::ClusterArgs;
use crate::commands::Error;
use crate::commands::Runnable;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Demo {
    /// Sum of a square array of ones
    Sum,
    /// Elementwise sum of two random arrays
    Add,
    /// Random matrix times a random column vector
    Dot,
    /// Cumulative sum of a flattened arange
    Cumsum,
    /// Least squares fit by gradient descent
    Sgd,
}

#[derive(Parser, Debug)]
pub struct Cmd {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// Computation to run
    #[arg(value_enum)]
    pub demo: Demo,
    /// Side length of the arrays
    #[arg(short, long, default_value_t = 100)]
    pub size: usize,
    /// Gradient steps for sgd
    #[arg(long, default_value_t = 10)]
    pub iterations: usize,
}

/// What a demo computed.
#[derive(Debug)]
pub struct Report {
    pub shape: Vec<usize>,
    pub checksum: f64,
}

impl Cmd {
    async fn execute(&self, config: Config) -> Result<Report, Error> {
        let ev = Evaluator::new(Cluster::start(config).await?);
        let n = self.size;
        let result = match self.demo {
            Demo::Sum => {
                let a = builtins::ones(ArraySpec::new([n, n]))?;
                ev.glom(&builtins::sum(&a, None)?).await?
            }
            Demo::Add => {
                let a = builtins::rand(ArraySpec::new([n, n]))?;
                let b = builtins::rand(ArraySpec::new([n, n]))?;
                ev.glom(&builtins::add(&a, &b)?).await?
            }
            Demo::Dot => {
                let a = builtins::rand(ArraySpec::new([n, n]))?;
                let v = builtins::rand(ArraySpec::new([n, 1]))?;
                ev.glom(&builtins::dot(&a, &v)?).await?
            }
            Demo::Cumsum => {
                let a = builtins::arange(ArraySpec::new([n, n]))?;
                ev.glom(&builtins::cumsum(&a, None)?).await?
            }
            Demo::Sgd => Buffer::Dense(sgd(&ev, n, self.iterations).await?.into_dyn()),
        };
        Ok(Report {
            shape: result.shape(),
            checksum: result.into_dense().sum(),
        })
    }
}

/// Fit `w` in `y = x w` for random `x` of shape `(n, d)` and a known
/// `w`, returning the fitted weights.
async fn sgd(ev: &Evaluator, n: usize, iterations: usize) -> Result<Array2<f64>, Error> {
    let d = (n / 10).max(1);
    let x = ev
        .evaluate_eager(&builtins::randn(ArraySpec::new([n, d]))?)
        .await?;
    let truth = Array2::from_shape_fn((d, 1), |(i, _)| (i + 1) as f64);
    let y = ev.evaluate_eager(&builtins::dot_local(&x, truth)?).await?;
    let xt = builtins::transpose(&x);
    let step = 0.5 / n as f64;
    let mut w = Array2::<f64>::zeros((d, 1));
    for iteration in 0..iterations {
        let residual = builtins::sub(&builtins::dot_local(&x, w.clone())?, &y)?;
        let grad = ev
            .glom(&builtins::dot(&xt, &residual)?)
            .await?
            .into_dense()
            .into_dimensionality::<Ix2>()?;
        w.scaled_add(-step, &grad);
        let grad_norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        tracing::debug!(iteration, grad_norm, "sgd step");
    }
    Ok(w)
}

impl Runnable for Cmd {
    fn run(&self) -> Result<(), Error> {
        let config = self.cluster.config()?;
        spartan::initialize_logging(&config);
        let runtime = tokio::runtime::Runtime::new()?;
        let start = Instant::now();
        let report = runtime.block_on(self.execute(config))?;
        let elapsed = start.elapsed();
        tracing::info!(
            demo = ?self.demo,
            size = self.size,
            elapsed_ms = elapsed.as_millis() as u64,
            "bench complete"
        );
        println!(
            "{:?}\tshape={:?}\tchecksum={:.6}\telapsed={:.3}s",
            self.demo,
            report.shape,
            report.checksum,
            elapsed.as_secs_f64()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::Cli;
    use crate::commands::Command;

    fn parse(args: &[&str]) -> Cmd {
        let mut argv = vec!["spartan", "bench"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).subcmd {
            Command::Bench(cmd) => cmd,
            other => panic!("parsed {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sum() {
        let cmd = parse(&["sum", "-s", "8", "-n", "2"]);
        let report = cmd.execute(cmd.cluster.config().unwrap()).await.unwrap();
        assert!(report.shape.is_empty());
        assert_eq!(report.checksum, 64.0);
    }

    #[tokio::test]
    async fn test_cumsum() {
        let cmd = parse(&["cumsum", "-s", "4", "-n", "2"]);
        let report = cmd.execute(cmd.cluster.config().unwrap()).await.unwrap();
        assert_eq!(report.shape, vec![16]);
        // sum of the prefix sums of 0..16
        assert_eq!(report.checksum, 680.0);
    }

    #[tokio::test]
    async fn test_sgd_converges() {
        let cmd = parse(&["sgd", "-s", "40", "-n", "2", "--iterations", "60"]);
        let ev = Evaluator::new(Cluster::start(cmd.cluster.config().unwrap()).await.unwrap());
        let w = sgd(&ev, 40, 60).await.unwrap();
        assert_eq!(w.dim(), (4, 1));
        for (i, v) in w.iter().enumerate() {
            assert!((v - (i + 1) as f64).abs() < 0.5, "weight {} is {}", i, v);
        }
    }
}
