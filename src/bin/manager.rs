// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Manager binary: owns the Task Pool and Session Manager (§4.4, §4.6).
//! Configuration file parsing, CLI parsing, and logging sinks are
//! collaborators through narrow interfaces (§1); the core only sees a
//! `Config` and a `tracing::Span`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use task_messenger::{
    cfg::{
        cli::{Cli, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    error::exit_code_for,
    generator::DefaultGenerator,
    manager::SessionManager,
    pool::pool::TaskPool,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("task-messenger-manager: {err:#}");
            exit_code_for(&err) as i32
        },
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(&cli.config).context("resolving --config path")?;
    let cfg = Config::load_from_file(&config_path)
        .map_err(anyhow::Error::new)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let _log_guard = init_logger(&cfg.logging, cli.log_level.as_deref())
        .context("initializing logger")?;
    info!(config = %config_path.display(), "task-messenger-manager starting");

    let pool = Arc::new(TaskPool::new(&cfg.manager.pool, cfg.manager.generator_timeout_ms));
    pool.attach_self();

    // §4.8: wire up the default synthetic generator so the pool has
    // something to refill from out of the box. A deployment that wants its
    // own Task Generator (hook) would swap this `attach_generator` call for
    // its own `TaskGenerator` implementation.
    pool.attach_generator(DefaultGenerator::new(vec![1, 2, 3], 1));

    let manager = SessionManager::new(pool, cfg.manager.clone());
    manager.start().await.context("starting session manager")?;

    wait_for_shutdown_signal().await?;

    info!("shutdown signal received; draining sessions");
    let accounting = manager.stop().await;
    info!(graceful = accounting.graceful, forced = accounting.forced, "session manager stopped");

    Ok(())
}

/// Reacts to SIGINT/SIGTERM as required by §6.3 "Process control".
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}
