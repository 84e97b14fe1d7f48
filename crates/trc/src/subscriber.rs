/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::Path;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the process-wide `tracing` subscriber: `RUST_LOG`-driven
/// filtering, rolling daily file output under `logs/`. Log rotation
/// mechanics beyond the rolling file name are out of scope (spec §1).
pub fn init(logs_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(logs_dir, "epistula.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    guard
}
