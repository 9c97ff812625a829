// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Virtual-Network Adapter (§4.1).
//!
//! Tokio's reactor already provides the non-blocking, readiness-driven
//! socket model §4.1 asks for, so the adapter is a thin newtype over
//! `tokio::net` rather than a hand-rolled reactor: `Stream` wraps a
//! `TcpStream`, `Acceptor` wraps a `TcpListener`, and every I/O error is
//! classified into the four named [`TransportError`] kinds at the edge via
//! [`TransportError::classify`]. Everything above this module only ever
//! sees `Stream`/`Acceptor` and `TransportError`.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::error::TransportError;

/// A reliable, ordered byte-stream connection (TCP-like, per §4.1).
#[derive(Debug)]
pub struct Stream(TcpStream);

/// Listens for inbound connections and yields accepted [`Stream`]s.
#[derive(Debug)]
pub struct Acceptor(TcpListener);

impl Stream {
    /// Wraps an already-connected `TcpStream`. Only exposed to the crate so
    /// tests can drive a loopback pair without going through `dial`/`accept`.
    #[cfg(test)]
    pub(crate) fn from_tcp_stream(stream: TcpStream) -> Self {
        Self(stream)
    }

    /// Dials a remote endpoint, establishing a reliable ordered stream.
    pub async fn dial(endpoint: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(TransportError::classify)?;
        stream.set_nodelay(true).map_err(TransportError::classify)?;
        Ok(Self(stream))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr().ok()
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.0.read(buf).await.map_err(TransportError::classify)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.0
            .read_exact(buf)
            .await
            .map_err(TransportError::classify)?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.0
            .write_all(buf)
            .await
            .map_err(TransportError::classify)
    }

    /// Half-closes the write side (sends FIN). The read side keeps draining
    /// until the peer also closes.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.0.shutdown().await.map_err(TransportError::classify)
    }

    /// Splits into independently-lockable read/write halves, the way
    /// session and worker runtime coroutines each own one half.
    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.0.into_split()
    }
}

impl Acceptor {
    /// Binds a listening endpoint.
    pub async fn listen(endpoint: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint)
            .await
            .map_err(TransportError::classify)?;
        Ok(Self(listener))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.0.local_addr().map_err(TransportError::classify)
    }

    /// Accepts the next inbound connection.
    pub async fn accept(&self) -> Result<(Stream, SocketAddr), TransportError> {
        let (stream, addr) = self.0.accept().await.map_err(TransportError::classify)?;
        stream.set_nodelay(true).map_err(TransportError::classify)?;
        Ok((Stream(stream), addr))
    }
}
