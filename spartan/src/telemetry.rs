/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Map the numeric `log_level` setting to a tracing level.
pub fn level_for(log_level: u8) -> Level {
    match log_level {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the process-wide log subscriber. `RUST_LOG`, when set,
/// takes precedence over the configured level. Only the first call
/// has any effect.
pub fn initialize_logging(config: &Config) {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        let level = level_for(config.log_level);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));
        if let Err(err) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
        {
            tracing::debug!("logging already initialized for this process: {}", err);
        }
        tracing::info!(
            level = %level,
            workers = config.num_workers,
            profile_kernels = config.profile_kernels,
            "logging_initialized"
        );
    });
}

/// Set up a tracing subscriber with a filter, so logs at or above
/// `level` are printed. Useful in tests that do not need to assert on
/// log contents.
pub fn set_tracing_env_filter(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.as_str()))
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::debug!("subscriber already set: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0), Level::ERROR);
        assert_eq!(level_for(2), Level::INFO);
        assert_eq!(level_for(9), Level::TRACE);
    }

    #[test]
    fn test_initialize_twice() {
        let config = Config::default();
        initialize_logging(&config);
        initialize_logging(&config);
        set_tracing_env_filter(Level::DEBUG);
    }
}
