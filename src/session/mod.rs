// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session (manager side) (§4.5): owns one worker connection and drives
//! task dispatch on it.
//!
//! Split read/write halves behind independent coroutines, a hierarchical
//! `CancellationToken` for hard stop plus a soft "stop writes, drain reads"
//! phase, and a `DashMap` tracking in-flight work.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU8, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zerocopy::IntoBytes;

use crate::{
    error::{CoreError, ProtocolError, TransportError},
    net::Stream,
    pool::{pool::TaskPool, task::TaskOutcome},
    primitives::notify::OnceNotify,
    proto::{
        codec::{FrameReader, FrameWriter},
        envelope::{ENVELOPE_HEADER_LEN, EnvelopeHeader, HELLO_SKILL_ID, HelloPayload, PROTOCOL_VERSION, Status},
    },
};

/// Parameters a [`Session`] needs from the manager's configuration; kept
/// separate from `cfg::config::ManagerConfig` so sessions don't need to
/// know about `listen_endpoint`/`pool` sizing.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_in_flight: u32,
    pub max_frame_size: u32,
    pub io_timeout: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// One worker connection, steady-stated by a writer and a reader
/// coroutine sharing this struct (§4.5).
pub struct Session {
    pub worker_id: u64,
    pool: Arc<TaskPool>,
    max_in_flight: u32,
    max_frame_size: u32,
    io_timeout: Duration,
    drain_timeout: Duration,

    state: AtomicU8,
    in_flight_count: AtomicU32,
    in_flight_tasks: DashMap<u64, ()>,
    notify_on_completion: OnceNotify,

    /// Cancelled the moment the session decides to stop taking new work,
    /// whether from the manager's `stop()` or a local read/write error.
    draining: CancellationToken,
    /// Hard-kill token; cancelling it also cancels `draining` (hierarchy).
    cancel: CancellationToken,
    drain_deadline: OnceCell<Instant>,
    metrics: Arc<crate::manager::WorkerMetrics>,
}

impl Session {
    fn new(
        worker_id: u64,
        pool: Arc<TaskPool>,
        max_in_flight: u32,
        cfg: &SessionConfig,
        metrics: Arc<crate::manager::WorkerMetrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let draining = cancel.child_token();
        Arc::new(Self {
            worker_id,
            pool,
            max_in_flight,
            max_frame_size: cfg.max_frame_size,
            io_timeout: cfg.io_timeout,
            drain_timeout: cfg.drain_timeout,
            state: AtomicU8::new(SessionState::Starting as u8),
            in_flight_count: AtomicU32::new(0),
            in_flight_tasks: DashMap::new(),
            notify_on_completion: OnceNotify::new(),
            draining,
            cancel,
            drain_deadline: OnceCell::new(),
            metrics,
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight_count.load(Ordering::Acquire)
    }

    /// Drives one session to completion: hello, steady state, drain,
    /// close. Returns once the connection is fully torn down.
    pub async fn run(
        stream: Stream,
        worker_id: u64,
        pool: Arc<TaskPool>,
        cfg: SessionConfig,
        metrics: Arc<crate::manager::WorkerMetrics>,
        cancel: CancellationToken,
    ) -> Result<(), CoreError> {
        let mut stream = stream;
        let negotiated = Self::hello(&mut stream, cfg.max_in_flight, cfg.io_timeout, &cancel).await?;

        let session = Self::new(worker_id, pool, negotiated, &cfg, metrics, cancel);
        session.set_state(SessionState::Active);
        info!(worker_id, max_in_flight = negotiated, "session active");

        let (r, w) = stream.into_split();
        let writer_session = session.clone();
        let reader_session = session.clone();
        let (writer_res, reader_res) =
            tokio::join!(tokio::spawn(async move { writer_session.write_loop(w).await }), tokio::spawn(async move {
                reader_session.read_loop(r).await
            }),);
        if writer_res.is_err() || reader_res.is_err() {
            warn!(worker_id, "session coroutine panicked");
        }

        session.finalize().await;
        Ok(())
    }

    /// Hello handshake (§4.5, §6.1, §11.5): manager proposes `max_in_flight`;
    /// the worker may only shrink it; the negotiated value is
    /// `min(configured, worker_reported)`. Runs before the stream is split,
    /// using `Stream`'s own `read_exact`/`write_all` directly rather than
    /// the codec, since the codec's `FrameReader`/`FrameWriter` are generic
    /// over `AsyncRead`/`AsyncWrite`, which `Stream` intentionally doesn't
    /// implement (§4.1 keeps it an opaque adapter type).
    async fn hello(stream: &mut Stream, configured_max_in_flight: u32, io_timeout: Duration, cancel: &CancellationToken) -> Result<u32, CoreError> {
        let our_hello = HelloPayload::new(PROTOCOL_VERSION, configured_max_in_flight);
        let header = EnvelopeHeader::request(0, HELLO_SKILL_ID, 8);
        let payload = our_hello.as_bytes();

        let frame_len = (ENVELOPE_HEADER_LEN + payload.len()) as u32;
        let mut out = Vec::with_capacity(4 + frame_len as usize);
        out.extend_from_slice(&frame_len.to_le_bytes());
        out.extend_from_slice(header.as_header_bytes());
        out.extend_from_slice(payload);

        Self::io(stream.write_all(&out), io_timeout, cancel)
            .await
            .map_err(|_| CoreError::Internal("hello write failed".to_string()))?;

        let mut len_buf = [0u8; 4];
        Self::io(stream.read_exact(&mut len_buf), io_timeout, cancel)
            .await
            .map_err(|_| CoreError::Internal("hello read failed".to_string()))?;
        let reply_len = u32::from_le_bytes(len_buf) as usize;
        if !(ENVELOPE_HEADER_LEN..=ENVELOPE_HEADER_LEN + 64).contains(&reply_len) {
            return Err(CoreError::Protocol(ProtocolError::MalformedPayload("hello reply frame has an implausible length".to_string())));
        }

        let mut body = vec![0u8; reply_len];
        Self::io(stream.read_exact(&mut body), io_timeout, cancel)
            .await
            .map_err(|_| CoreError::Internal("hello reply read failed".to_string()))?;

        let mut header_arr = [0u8; ENVELOPE_HEADER_LEN];
        header_arr.copy_from_slice(&body[..ENVELOPE_HEADER_LEN]);
        let reply_header = EnvelopeHeader::from_header_bytes(&mut header_arr)
            .ok_or_else(|| CoreError::Protocol(ProtocolError::MalformedPayload("hello reply header failed to parse".to_string())))?
            .clone();

        if reply_header.flags.has_error() {
            return Err(CoreError::Protocol(ProtocolError::VersionMismatch(0)));
        }

        let reply_payload = &body[ENVELOPE_HEADER_LEN..];
        if reply_payload.len() < 8 {
            return Err(CoreError::Protocol(ProtocolError::MalformedPayload("hello payload shorter than HelloPayload".to_string())));
        }
        let worker_protocol_version = u32::from_le_bytes(reply_payload[0..4].try_into().expect("slice is 4 bytes"));
        let worker_max_in_flight = u32::from_le_bytes(reply_payload[4..8].try_into().expect("slice is 4 bytes"));

        if worker_protocol_version != PROTOCOL_VERSION {
            let mismatch = EnvelopeHeader::response(0, HELLO_SKILL_ID, Status::Error, 0);
            let mut mismatch_out = Vec::with_capacity(4 + ENVELOPE_HEADER_LEN);
            mismatch_out.extend_from_slice(&(ENVELOPE_HEADER_LEN as u32).to_le_bytes());
            mismatch_out.extend_from_slice(mismatch.as_header_bytes());
            let _ = Self::io(stream.write_all(&mismatch_out), io_timeout, cancel).await;
            let _ = stream.close().await;
            return Err(CoreError::Protocol(ProtocolError::VersionMismatch(worker_protocol_version)));
        }

        // §11.5: the worker may only shrink the manager's proposal.
        Ok(configured_max_in_flight.min(worker_max_in_flight).max(1))
    }

    async fn io<F, T>(fut: F, io_timeout: Duration, cancel: &CancellationToken) -> Result<T, TransportError>
    where F: Future<Output = Result<T, TransportError>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::PeerClosed),
            res = timeout(io_timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(TransportError::Timeout),
            },
        }
    }

    async fn write_loop(self: Arc<Self>, mut w: OwnedWriteHalf) {
        let mut frame_writer = FrameWriter::new();
        loop {
            if self.draining.is_cancelled() {
                break;
            }
            let in_flight = self.in_flight();
            if in_flight >= self.max_in_flight {
                tokio::select! {
                    _ = self.notify_on_completion.wait() => {},
                    _ = self.draining.cancelled() => break,
                }
                continue;
            }

            let want = (self.max_in_flight - in_flight) as usize;
            let batch = self.pool.reserve(want, self.worker_id);
            if batch.is_empty() {
                tokio::select! {
                    _ = self.pool.has_work.wait() => {},
                    _ = self.draining.cancelled() => break,
                }
                continue;
            }

            for task in batch {
                if self.draining.is_cancelled() {
                    let _ = self.pool.release(task.task_id, self.worker_id);
                    continue;
                }
                if let Err(err) = self.pool.mark_in_flight(task.task_id, self.worker_id) {
                    warn!(task_id = task.task_id, %err, "mark_in_flight failed");
                    continue;
                }
                self.in_flight_tasks.insert(task.task_id, ());
                self.in_flight_count.fetch_add(1, Ordering::AcqRel);

                let header = EnvelopeHeader::request(task.task_id, task.skill_id, task.payload_bytes.len() as u64);
                if let Err(err) =
                    frame_writer.write_frame(&mut w, &header, &task.payload_bytes, self.io_timeout, &self.cancel).await
                {
                    warn!(worker_id = self.worker_id, %err, "session write failed; draining");
                    self.begin_draining();
                    self.release_task(task.task_id);
                    break;
                }
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(worker_id = self.worker_id, "writer coroutine exited");
    }

    async fn read_loop(self: Arc<Self>, mut r: OwnedReadHalf) {
        let mut frame_reader = FrameReader::new(self.max_frame_size);
        loop {
            if self.draining.is_cancelled() && self.in_flight() == 0 {
                break;
            }

            let read = frame_reader.read_frame(&mut r, self.io_timeout, &self.cancel);
            let frame = if self.draining.is_cancelled() {
                let remaining = self.remaining_drain_time();
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, read).await {
                    Ok(Ok(frame)) => frame,
                    _ => break,
                }
            } else {
                match read.await {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(worker_id = self.worker_id, %err, "session read failed; draining");
                        self.begin_draining();
                        continue;
                    },
                }
            };

            let task_id = frame.header.task_id.get();
            if frame.header.skill_id.get() == HELLO_SKILL_ID {
                continue;
            }
            if self.in_flight_tasks.remove(&task_id).is_none() {
                warn!(worker_id = self.worker_id, task_id, "response for task not in-flight on this session");
                self.begin_draining();
                continue;
            }
            self.in_flight_count.fetch_sub(1, Ordering::AcqRel);

            let status = Status::from(frame.header.status);
            match self.pool.commit(task_id, TaskOutcome { status, response_bytes: frame.payload }) {
                Ok(()) => match status {
                    Status::Ok => {
                        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                    },
                    Status::Error => {
                        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    },
                },
                Err(err) => warn!(task_id, %err, "commit failed"),
            }
            self.notify_on_completion.notify();
        }
        debug!(worker_id = self.worker_id, "reader coroutine exited");
    }

    fn release_task(&self, task_id: u64) {
        if self.in_flight_tasks.remove(&task_id).is_some() {
            self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
        }
        let _ = self.pool.release(task_id, self.worker_id);
    }

    fn begin_draining(&self) {
        if self.state() == SessionState::Active {
            self.set_state(SessionState::Draining);
        }
        let _ = self.drain_deadline.set(Instant::now() + self.drain_timeout);
        self.draining.cancel();
        self.notify_on_completion.notify();
        self.pool.has_work.notify();
    }

    fn remaining_drain_time(&self) -> Duration {
        match self.drain_deadline.get() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.drain_timeout,
        }
    }

    /// Releases any still in-flight tasks back to the pool and transitions
    /// to Closed: a closed session must never leave a task it once held
    /// stranded in Reserved/InFlight state.
    async fn finalize(&self) {
        let stranded: Vec<u64> = self.in_flight_tasks.iter().map(|e| *e.key()).collect();
        for task_id in stranded {
            self.release_task(task_id);
        }
        self.set_state(SessionState::Closed);
        info!(worker_id = self.worker_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn loopback_pair() -> (Stream, Stream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let a = a.unwrap();
        a.set_nodelay(true).unwrap();
        let b = b.unwrap();
        b.set_nodelay(true).unwrap();
        (Stream::from_tcp_stream(a), Stream::from_tcp_stream(b))
    }

    #[tokio::test]
    async fn hello_negotiates_the_smaller_max_in_flight() {
        let (manager_side, worker_side) = loopback_pair().await;
        let mut manager_side = manager_side;
        let mut worker_side = worker_side;

        let manager_fut = Session::hello(&mut manager_side, 16, Duration::from_secs(1), &CancellationToken::new());
        let worker_fut = async {
            let mut len_buf = [0u8; 4];
            worker_side.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            worker_side.read_exact(&mut body).await.unwrap();

            let reply = HelloPayload::new(PROTOCOL_VERSION, 4);
            let header = EnvelopeHeader::response(0, HELLO_SKILL_ID, Status::Ok, 8);
            let frame_len = (ENVELOPE_HEADER_LEN + 8) as u32;
            let mut out = Vec::new();
            out.extend_from_slice(&frame_len.to_le_bytes());
            out.extend_from_slice(header.as_header_bytes());
            out.extend_from_slice(reply.as_bytes());
            worker_side.write_all(&out).await.unwrap();
        };

        let (negotiated, _) = tokio::join!(manager_fut, worker_fut);
        assert_eq!(negotiated.unwrap(), 4, "worker's smaller max_in_flight must win");
    }

    #[tokio::test]
    async fn hello_rejects_protocol_version_mismatch() {
        let (manager_side, worker_side) = loopback_pair().await;
        let mut manager_side = manager_side;
        let mut worker_side = worker_side;

        let manager_fut = Session::hello(&mut manager_side, 16, Duration::from_secs(1), &CancellationToken::new());
        let worker_fut = async {
            let mut len_buf = [0u8; 4];
            worker_side.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            worker_side.read_exact(&mut body).await.unwrap();

            let reply = HelloPayload::new(PROTOCOL_VERSION + 1, 4);
            let header = EnvelopeHeader::response(0, HELLO_SKILL_ID, Status::Ok, 8);
            let frame_len = (ENVELOPE_HEADER_LEN + 8) as u32;
            let mut out = Vec::new();
            out.extend_from_slice(&frame_len.to_le_bytes());
            out.extend_from_slice(header.as_header_bytes());
            out.extend_from_slice(reply.as_bytes());
            worker_side.write_all(&out).await.unwrap();
        };

        let (negotiated, _) = tokio::join!(manager_fut, worker_fut);
        assert!(matches!(negotiated, Err(CoreError::Protocol(ProtocolError::VersionMismatch(v))) if v == PROTOCOL_VERSION + 1));
    }

    #[test]
    fn release_task_clears_bookkeeping_before_returning_to_pool() {
        let pool = Arc::new(TaskPool::new(
            &crate::cfg::config::PoolConfig { hard_capacity: 4, low_watermark: 0, refill_batch: 1, max_release_retries: None },
            100,
        ));
        pool.submit(crate::pool::task::Task::new(1, 1, bytes::Bytes::new())).unwrap();
        let _ = pool.reserve(1, 7);

        let cfg = SessionConfig { max_in_flight: 2, max_frame_size: 1 << 20, io_timeout: Duration::from_secs(1), drain_timeout: Duration::from_secs(1) };
        let metrics = Arc::new(crate::manager::WorkerMetrics::default());
        let session = Session::new(7, pool.clone(), 2, &cfg, metrics, CancellationToken::new());
        session.in_flight_tasks.insert(1, ());
        session.in_flight_count.fetch_add(1, Ordering::SeqCst);

        session.release_task(1);

        assert_eq!(session.in_flight(), 0);
        assert_eq!(pool.stats().ready, 1, "released task must be requeued as ready");
    }
}
