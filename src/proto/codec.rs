// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frame Codec (§4.3): reads and writes Skill Envelopes over a stream.
//!
//! A reusable `BytesMut` scratch buffer is filled by `read_exact` calls
//! and then zero-copy-sliced with `split_to`/`freeze` into the header and
//! payload `Bytes` views, instead of allocating a fresh `Vec` per frame.

use std::{future::Future, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ProtocolError, TransportError},
    proto::envelope::{ENVELOPE_HEADER_LEN, EnvelopeHeader},
};

/// Padding placed before the header in the read scratch buffer so the
/// payload that follows a 20-byte header starts at an offset that is a
/// multiple of 8 (§4.3 "Alignment"). This is a best-effort approximation:
/// it guarantees the payload's *offset within the buffer* is 8-aligned,
/// not that the buffer's backing allocation itself is 8-aligned, since
/// `BytesMut` does not expose an alignment guarantee on its allocation.
const READ_PAD: usize = 4;
const LEN_PREFIX_LEN: usize = 4;

/// A fully decoded frame: header plus a zero-copy view of the payload.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub header: EnvelopeHeader,
    pub payload: Bytes,
}

async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, TransportError>
where F: Future<Output = std::io::Result<T>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::PeerClosed),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(TransportError::classify(e)),
                Err(_) => {
                    tracing::debug!("{label} timed out");
                    Err(TransportError::Timeout)
                },
            }
        }
    }
}

/// Reads one length-prefixed frame from `r`, reusing an internal scratch
/// buffer across calls the way the decoder's "growable ring buffer per
/// stream" policy requires.
pub struct FrameReader {
    scratch: BytesMut,
    max_frame_size: u32,
}

impl FrameReader {
    pub fn new(max_frame_size: u32) -> Self {
        Self { scratch: BytesMut::with_capacity(READ_PAD + ENVELOPE_HEADER_LEN + 4096), max_frame_size }
    }

    pub async fn read_frame<R>(
        &mut self,
        r: &mut R,
        io_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DecodedFrame, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; LEN_PREFIX_LEN];
        io_with_timeout("read frame_length", r.read_exact(&mut len_buf), io_timeout, cancel)
            .await?;
        let frame_len = u32::from_le_bytes(len_buf);

        if frame_len as usize > self.max_frame_size as usize || (frame_len as usize) < ENVELOPE_HEADER_LEN {
            return Err(CodecError::Protocol(ProtocolError::FrameTooLarge {
                size: frame_len as u64,
                limit: self.max_frame_size,
            }));
        }

        self.scratch.clear();
        self.scratch.resize(READ_PAD, 0);
        self.scratch.resize(READ_PAD + frame_len as usize, 0);
        {
            let body = &mut self.scratch[READ_PAD..READ_PAD + frame_len as usize];
            io_with_timeout("read frame body", r.read_exact(body), io_timeout, cancel).await?;
        }

        let body: Bytes = self.scratch.split_off(READ_PAD).freeze();
        let header_bytes = body.slice(0..ENVELOPE_HEADER_LEN);
        let payload = body.slice(ENVELOPE_HEADER_LEN..body.len());

        let mut header_arr = [0u8; ENVELOPE_HEADER_LEN];
        header_arr.copy_from_slice(&header_bytes);
        let header = EnvelopeHeader::from_header_bytes(&mut header_arr)
            .ok_or_else(|| {
                CodecError::Protocol(ProtocolError::MalformedPayload(
                    "envelope header failed to parse".to_string(),
                ))
            })?
            .clone();

        if header.payload_len() != payload.len() as u64 {
            return Err(CodecError::Protocol(ProtocolError::MalformedPayload(format!(
                "declared payload_len={} but body carried {} bytes",
                header.payload_len(),
                payload.len()
            ))));
        }

        Ok(DecodedFrame { header, payload })
    }
}

/// Encodes and writes one frame, reusing a pooled scratch buffer.
pub struct FrameWriter {
    scratch: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { scratch: BytesMut::with_capacity(LEN_PREFIX_LEN + ENVELOPE_HEADER_LEN + 4096) }
    }

    pub async fn write_frame<W>(
        &mut self,
        w: &mut W,
        header: &EnvelopeHeader,
        payload: &[u8],
        io_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame_len = (ENVELOPE_HEADER_LEN + payload.len()) as u32;

        self.scratch.clear();
        self.scratch.extend_from_slice(&frame_len.to_le_bytes());
        self.scratch.extend_from_slice(header.as_header_bytes());
        self.scratch.extend_from_slice(payload);

        io_with_timeout("write frame", w.write_all(&self.scratch), io_timeout, cancel).await?;
        Ok(())
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors the codec itself can raise, distinct from the higher-level
/// [`crate::error::CoreError`] so callers can match on `Protocol` vs.
/// `Transport` without downcasting.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
