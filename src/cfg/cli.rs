// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

/// Resolves a config path, accepting both absolute paths and paths relative
/// to the current working directory, and canonicalizes the result.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Command-line arguments shared by both the `manager` and `worker`
/// binaries.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Override the configured log level (e.g. "debug", "info,task_messenger=trace").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the worker execution mode (worker binary only).
    #[arg(long, value_enum)]
    pub worker_mode: Option<WorkerModeArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerModeArg {
    Async,
    Blocking,
}
