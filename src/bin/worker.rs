// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Worker binary: dials the manager and runs the Worker Runtime (§4.7).
//! Concrete skill implementations (string reversal, math, FMA) are
//! collaborators through the `SkillHandler` registry, not part of the
//! core (§1); this binary registers a small built-in string-reverse skill
//! as a working default so the binary is runnable out of the box.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use task_messenger::{
    cfg::{
        cli::{Cli, WorkerModeArg, resolve_config_path},
        config::{Config, WorkerMode},
        logger::init_logger,
    },
    error::exit_code_for,
    worker::{FnHandler, Runtime, SkillOutcome, SkillRegistry},
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Built-in default skill (`skill_id = 1`): reverses the payload bytes.
/// A stand-in for the concrete skill catalog (string reversal, math,
/// FMA), which is out of the core's scope (§1).
const REVERSE_SKILL_ID: u16 = 1;

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("task-messenger-worker: {err:#}");
            exit_code_for(&err) as i32
        },
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(&cli.config).context("resolving --config path")?;
    let mut cfg = Config::load_from_file(&config_path)
        .map_err(anyhow::Error::new)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(mode) = cli.worker_mode {
        cfg.worker.worker_mode = match mode {
            WorkerModeArg::Async => WorkerMode::Async,
            WorkerModeArg::Blocking => WorkerMode::Blocking,
        };
    }

    let _log_guard = init_logger(&cfg.logging, cli.log_level.as_deref())
        .context("initializing logger")?;
    info!(config = %config_path.display(), mode = %cfg.worker.worker_mode, "task-messenger-worker starting");

    let registry = Arc::new(SkillRegistry::new());
    registry.register(REVERSE_SKILL_ID, FnHandler::new(|_skill_id, payload| {
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        SkillOutcome::ok(Bytes::from(reversed))
    }));

    let runtime = Runtime::new(cfg.worker, registry);
    let run_handle = tokio::spawn(runtime.clone().run());

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received; stopping worker runtime");
    runtime.stop();

    let _ = run_handle.await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}
