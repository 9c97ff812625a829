// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Worker Runtime (§4.7): dials the manager, spawns read/write coroutines,
//! feeds a local work queue into a processor, honors pause/stop.
//!
//! Grounded on the same shape as [`crate::session`]: an `AtomicU8` state
//! machine, a hierarchical `CancellationToken` for hard stop, and an
//! [`OnceNotify`](crate::primitives::notify::OnceNotify) for level-triggered
//! wakeups (`resume_signal`), mirroring `Session`'s `notify_on_completion`.
//! The dial/backoff loop is new: a dropped connection isn't a terminal
//! failure here the way it is for a one-shot client.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use rand::Rng;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zerocopy::IntoBytes;

use crate::{
    cfg::config::{WorkerConfig, WorkerMode},
    error::{CoreError, ProtocolError, TransportError},
    net::Stream,
    primitives::notify::OnceNotify,
    proto::{
        codec::{FrameReader, FrameWriter},
        envelope::{ENVELOPE_HEADER_LEN, EnvelopeHeader, HELLO_SKILL_ID, HelloPayload, PROTOCOL_VERSION, Status},
    },
    worker::handler::SkillRegistry,
};

/// One item pulled off the wire by the read coroutine and handed to a
/// processor (§4.7 "Read coroutine").
struct InboxItem {
    task_id: u64,
    skill_id: u16,
    payload: Bytes,
}

/// One item produced by a processor and handed to the write coroutine.
struct OutboxItem {
    task_id: u64,
    skill_id: u16,
    status: Status,
    payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Dialing = 0,
    Connected = 1,
    Paused = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
}

impl From<u8> for RuntimeState {
    fn from(v: u8) -> Self {
        match v {
            0 => RuntimeState::Dialing,
            1 => RuntimeState::Connected,
            2 => RuntimeState::Paused,
            3 => RuntimeState::Running,
            4 => RuntimeState::Stopping,
            _ => RuntimeState::Stopped,
        }
    }
}

/// Lightweight worker-side counters (§11.1), mirroring the manager's
/// `Worker Record.metrics`.
#[derive(Debug, Default)]
struct RuntimeMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeStats {
    pub processed: u64,
    pub failed: u64,
    pub paused: bool,
}

/// Drives one worker's connection lifecycle: dial, hello, steady state,
/// reconnect-on-failure (§4.7).
pub struct Runtime {
    cfg: WorkerConfig,
    registry: Arc<SkillRegistry>,
    state: AtomicU8,
    paused: AtomicBool,
    resume_signal: OnceNotify,
    metrics: RuntimeMetrics,
    cancel: CancellationToken,
}

impl Runtime {
    pub fn new(cfg: WorkerConfig, registry: Arc<SkillRegistry>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            state: AtomicU8::new(RuntimeState::Dialing as u8),
            paused: AtomicBool::new(false),
            resume_signal: OnceNotify::new(),
            metrics: RuntimeMetrics::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: RuntimeState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            processed: self.metrics.processed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Acquire),
        }
    }

    /// Gates work intake without disturbing in-flight completion (§3
    /// "Worker Runtime State": "Pause gates work intake, not in-flight
    /// completion.").
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        if self.state() == RuntimeState::Running {
            self.set_state(RuntimeState::Paused);
        }
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        if self.state() == RuntimeState::Paused {
            self.set_state(RuntimeState::Running);
        }
        self.resume_signal.notify();
    }

    /// Cancels every coroutine; the dial loop observes this and exits
    /// instead of reconnecting (§4.7 `stop`).
    pub fn stop(&self) {
        self.set_state(RuntimeState::Stopping);
        self.cancel.cancel();
        self.resume_signal.notify();
    }

    /// Runs the dial/connect/steady-state loop until `stop()` is called or
    /// a fatal protocol mismatch is observed. Returns on stop; never panics
    /// on a transient transport error (§7 "Per-connection errors never
    /// crash the process").
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(RuntimeState::Dialing);

            match self.dial_and_hello().await {
                Ok((stream, negotiated_max_in_flight)) => {
                    attempt = 0;
                    self.set_state(RuntimeState::Connected);
                    info!(max_in_flight = negotiated_max_in_flight, "worker connected");
                    self.steady_state(stream, negotiated_max_in_flight).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    // Connection dropped; `inbox`/`outbox` were dropped with
                    // `steady_state`'s scope (§4.7 "Failure policy").
                },
                Err(DialError::Fatal(err)) => {
                    warn!(%err, "fatal protocol mismatch; worker stops dialing");
                    break;
                },
                Err(DialError::Transient(err)) => {
                    debug!(%err, attempt, "dial failed; backing off");
                },
            }

            if self.cancel.is_cancelled() {
                break;
            }
            let delay = self.backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        self.set_state(RuntimeState::Stopped);
        info!("worker runtime stopped");
    }

    /// Exponential backoff with cap and ±20% jitter (§4.7, §6.2).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.cfg.backoff_base_ms;
        let cap = self.cfg.backoff_cap_ms;
        let unjittered = base.saturating_mul(1u64 << attempt.min(32)).min(cap);
        let jitter = rand::rng().random_range(0.8..1.2);
        Duration::from_millis(((unjittered as f64) * jitter) as u64)
    }

    async fn dial_and_hello(&self) -> Result<(Stream, u32), DialError> {
        let mut stream = Stream::dial(&self.cfg.connect_endpoint)
            .await
            .map_err(|e| DialError::Transient(CoreError::Transport(e)))?;
        let negotiated = self.hello(&mut stream).await?;
        Ok((stream, negotiated))
    }

    /// Worker-side half of the hello handshake (§6.1, §11.5): the manager
    /// initiates by writing its hello request first; the worker reads it,
    /// checks the protocol version, and replies with `min(manager's
    /// proposal, our own configured max_in_flight)`.
    async fn hello(&self, stream: &mut Stream) -> Result<u32, DialError> {
        let io_timeout = Duration::from_millis(self.cfg.backoff_cap_ms.max(1000));

        let mut len_buf = [0u8; 4];
        self.io(stream.read_exact(&mut len_buf), io_timeout).await?;
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        if !(ENVELOPE_HEADER_LEN..=ENVELOPE_HEADER_LEN + 64).contains(&frame_len) {
            return Err(DialError::Transient(CoreError::Protocol(ProtocolError::MalformedPayload(
                "hello request frame has an implausible length".to_string(),
            ))));
        }

        let mut body = vec![0u8; frame_len];
        self.io(stream.read_exact(&mut body), io_timeout).await?;

        let mut header_arr = [0u8; ENVELOPE_HEADER_LEN];
        header_arr.copy_from_slice(&body[..ENVELOPE_HEADER_LEN]);
        let header = EnvelopeHeader::from_header_bytes(&mut header_arr)
            .ok_or_else(|| {
                DialError::Transient(CoreError::Protocol(ProtocolError::MalformedPayload(
                    "hello request header failed to parse".to_string(),
                )))
            })?
            .clone();

        if header.skill_id.get() != HELLO_SKILL_ID {
            return Err(DialError::Transient(CoreError::Protocol(ProtocolError::MalformedPayload(
                "first frame was not a hello".to_string(),
            ))));
        }

        let payload = &body[ENVELOPE_HEADER_LEN..];
        if payload.len() < 8 {
            return Err(DialError::Transient(CoreError::Protocol(ProtocolError::MalformedPayload(
                "hello payload shorter than HelloPayload".to_string(),
            ))));
        }
        let manager_protocol_version = u32::from_le_bytes(payload[0..4].try_into().expect("slice is 4 bytes"));
        let manager_max_in_flight = u32::from_le_bytes(payload[4..8].try_into().expect("slice is 4 bytes"));

        if manager_protocol_version != PROTOCOL_VERSION {
            let mismatch = EnvelopeHeader::response(0, HELLO_SKILL_ID, Status::Error, 0);
            let mut out = Vec::with_capacity(4 + ENVELOPE_HEADER_LEN);
            out.extend_from_slice(&(ENVELOPE_HEADER_LEN as u32).to_le_bytes());
            out.extend_from_slice(mismatch.as_header_bytes());
            let _ = self.io(stream.write_all(&out), io_timeout).await;
            let _ = stream.close().await;
            return Err(DialError::Fatal(CoreError::Protocol(ProtocolError::VersionMismatch(manager_protocol_version))));
        }

        let negotiated = manager_max_in_flight.min(self.cfg.max_in_flight).max(1);
        let reply = HelloPayload::new(PROTOCOL_VERSION, negotiated);
        let reply_header = EnvelopeHeader::response(0, HELLO_SKILL_ID, Status::Ok, 8);
        let mut out = Vec::with_capacity(4 + ENVELOPE_HEADER_LEN + 8);
        out.extend_from_slice(&((ENVELOPE_HEADER_LEN + 8) as u32).to_le_bytes());
        out.extend_from_slice(reply_header.as_header_bytes());
        out.extend_from_slice(reply.as_bytes());
        self.io(stream.write_all(&out), io_timeout).await?;

        Ok(negotiated)
    }

    async fn io<F, T>(&self, fut: F, io_timeout: Duration) -> Result<T, DialError>
    where F: std::future::Future<Output = Result<T, TransportError>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DialError::Transient(CoreError::Cancelled)),
            res = tokio::time::timeout(io_timeout, fut) => match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(DialError::Transient(CoreError::Transport(e))),
                Err(_) => Err(DialError::Transient(CoreError::Transport(TransportError::Timeout))),
            },
        }
    }

    /// Steady state: read, N processor(s), and write coroutines sharing a
    /// connection, torn down together on the first failure (§4.7).
    async fn steady_state(self: &Arc<Self>, stream: Stream, max_in_flight: u32) {
        self.set_state(if self.paused.load(Ordering::Acquire) { RuntimeState::Paused } else { RuntimeState::Running });
        let (r, w) = stream.into_split();

        let cap = (max_in_flight as usize).max(1);
        let (inbox_tx, inbox_rx) = mpsc::channel::<InboxItem>(cap);
        let (outbox_tx, outbox_rx) = mpsc::channel::<OutboxItem>(cap);

        let read_fut = {
            let rt = self.clone();
            tokio::spawn(async move { rt.read_loop(r, inbox_tx).await })
        };
        let processor_fut = {
            let rt = self.clone();
            tokio::spawn(async move { rt.processor_loop(inbox_rx, outbox_tx).await })
        };
        let write_fut = {
            let rt = self.clone();
            tokio::spawn(async move { rt.write_loop(w, outbox_rx).await })
        };

        let _ = tokio::join!(read_fut, processor_fut, write_fut);
        debug!("steady state torn down");
    }

    async fn read_loop(self: Arc<Self>, mut r: OwnedReadHalf, inbox_tx: mpsc::Sender<InboxItem>) {
        let io_timeout = Duration::from_millis(self.cfg.backoff_cap_ms.max(1000));
        let mut frame_reader = FrameReader::new(self.cfg.max_frame_size);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = frame_reader.read_frame(&mut r, io_timeout, &self.cancel) => {
                    let frame = match res {
                        Ok(f) => f,
                        Err(err) => {
                            warn!(%err, "worker read failed; reconnecting");
                            break;
                        },
                    };
                    if frame.header.skill_id.get() == HELLO_SKILL_ID {
                        continue;
                    }
                    let item = InboxItem {
                        task_id: frame.header.task_id.get(),
                        skill_id: frame.header.skill_id.get(),
                        payload: frame.payload,
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        res = inbox_tx.send(item) => if res.is_err() { break },
                    }
                },
            }
        }
    }

    /// Pulls one item at a time; cancelled only between items, never
    /// mid-item (§4.7 "The processor is cancelled between items, never
    /// mid-item.").
    async fn processor_loop(self: Arc<Self>, mut inbox_rx: mpsc::Receiver<InboxItem>, outbox_tx: mpsc::Sender<OutboxItem>) {
        loop {
            if self.paused.load(Ordering::Acquire) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.resume_signal.wait() => {},
                }
                continue;
            }

            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = inbox_rx.recv() => match item {
                    Some(i) => i,
                    None => break,
                },
            };

            let outcome = self.dispatch(item.skill_id, &item.payload).await;
            match outcome.status {
                Status::Ok => self.metrics.processed.fetch_add(1, Ordering::Relaxed),
                Status::Error => self.metrics.failed.fetch_add(1, Ordering::Relaxed),
            };

            let out = OutboxItem { task_id: item.task_id, skill_id: item.skill_id, status: outcome.status, payload: outcome.response_bytes };
            if outbox_tx.send(out).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(&self, skill_id: u16, payload: &Bytes) -> crate::worker::handler::SkillOutcome {
        match self.cfg.worker_mode {
            WorkerMode::Async => self.registry.dispatch(skill_id, payload),
            WorkerMode::Blocking => {
                let registry = self.registry.clone();
                let payload = payload.clone();
                match tokio::task::spawn_blocking(move || registry.dispatch(skill_id, &payload)).await {
                    Ok(outcome) => outcome,
                    Err(_) => crate::worker::handler::SkillOutcome::error(Bytes::from_static(b"handler_panicked")),
                }
            },
        }
    }

    async fn write_loop(self: Arc<Self>, mut w: OwnedWriteHalf, mut outbox_rx: mpsc::Receiver<OutboxItem>) {
        let io_timeout = Duration::from_millis(self.cfg.backoff_cap_ms.max(1000));
        let mut frame_writer = FrameWriter::new();
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain_outbox_best_effort(&mut w, &mut outbox_rx, &mut frame_writer, io_timeout).await;
                    break;
                },
                item = outbox_rx.recv() => match item {
                    Some(i) => i,
                    None => break,
                },
            };
            if self.write_one(&mut w, &mut frame_writer, &item, io_timeout).await.is_err() {
                break;
            }
        }
    }

    async fn write_one(
        &self,
        w: &mut OwnedWriteHalf,
        frame_writer: &mut FrameWriter,
        item: &OutboxItem,
        io_timeout: Duration,
    ) -> Result<(), ()> {
        let header = EnvelopeHeader::response(item.task_id, item.skill_id, item.status, item.payload.len() as u64);
        frame_writer
            .write_frame(w, &header, &item.payload, io_timeout, &CancellationToken::new())
            .await
            .map_err(|err| warn!(%err, "worker write failed; reconnecting"))
    }

    /// Drains `outbox` best-effort bounded by `stop_timeout` (§4.7 `stop`).
    async fn drain_outbox_best_effort(
        &self,
        w: &mut OwnedWriteHalf,
        outbox_rx: &mut mpsc::Receiver<OutboxItem>,
        frame_writer: &mut FrameWriter,
        io_timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + self.cfg.stop_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, outbox_rx.recv()).await {
                Ok(Some(item)) => {
                    if self.write_one(w, frame_writer, &item, io_timeout).await.is_err() {
                        break;
                    }
                },
                _ => break,
            }
        }
        let _ = w.shutdown().await;
    }
}

enum DialError {
    /// Incompatible protocol version: stop dialing for good (§4.7).
    Fatal(CoreError),
    /// Anything else: backoff and retry.
    Transient(CoreError),
}

impl From<DialError> for CoreError {
    fn from(e: DialError) -> Self {
        match e {
            DialError::Fatal(e) | DialError::Transient(e) => e,
        }
    }
}
