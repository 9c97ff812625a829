// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy shared by every layer of the core (§7).
//!
//! Leaf kinds are small `thiserror` enums, one per layer; [`CoreError`] is
//! the umbrella type library code returns, and binaries (`src/bin/*.rs`)
//! fold it into `anyhow::Error` at the boundary.

use std::fmt;

use thiserror::Error;

/// Fatal at startup; never produced once a manager/worker is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transport-level failures surfaced by the Virtual-Network Adapter (§4.1).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("operation timed out")]
    Timeout,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("connection reset")]
    Reset,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify a raw `io::Error` the way the adapter is required to: into
    /// one of the four named kinds, falling back to [`TransportError::Io`]
    /// for anything that doesn't map cleanly.
    pub fn classify(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted => TransportError::Reset,
            BrokenPipe | UnexpectedEof | NotConnected => TransportError::PeerClosed,
            TimedOut => TransportError::Timeout,
            ConnectionRefused | HostUnreachable | NetworkUnreachable => {
                TransportError::Unreachable(err.to_string())
            },
            _ => TransportError::Io(err),
        }
    }
}

/// Protocol-level violations on the wire (§6.1, §7).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds max_frame_size ({limit} bytes)")]
    FrameTooLarge { size: u64, limit: u32 },
    #[error("response for unknown task_id={0}")]
    UnknownTask(u64),
    #[error("peer advertised an incompatible protocol version: {0}")]
    VersionMismatch(u32),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Task Pool violations (§4.4 table).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is at hard_capacity")]
    PoolFull,
    #[error("unknown task_id={0}")]
    UnknownTask(u64),
    #[error("task_id={0} is not in Reserved/InFlight state")]
    NotReserved(u64),
    #[error("task_id={task_id} is not owned by worker_id={worker_id}")]
    NotOwned { task_id: u64, worker_id: u64 },
}

/// Umbrella error returned by library code outside the binaries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A suspension point observed cooperative cancellation (§5). Never
    /// logged as an error — callers match on this variant explicitly and
    /// treat it as a normal control path.
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Process exit codes (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Clean = 0,
    Config = 1,
    Protocol = 2,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

/// Maps a top-level [`anyhow::Error`] to the §6.3 exit code, by downcasting
/// to the known leaf kinds. Unknown errors are treated as protocol-level
/// startup failures (exit 2) rather than silently exiting clean.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ConfigError>().is_some() {
        return ExitCode::Config;
    }
    if err.downcast_ref::<CoreError>().is_some_and(|e| matches!(e, CoreError::Config(_))) {
        return ExitCode::Config;
    }
    ExitCode::Protocol
}
