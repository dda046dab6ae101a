//! Thin TCP wrapper for the single full-duplex session to the instrument.
//!
//! Carries no protocol knowledge; framing and retries live in the codec and
//! the acquisition engine. During continuous acquisition the stream is moved
//! into the acquisition task and handed back, drained, when the task stops.

use crate::error::MpError;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct Transport {
    stream: Option<TcpStream>,
}

impl Transport {
    /// Establish the TCP session.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), MpError> {
        debug!("connecting to {host}:{port}");
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Write all bytes or fail.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), MpError> {
        let stream = self.stream.as_mut().ok_or(MpError::NotConnected)?;
        trace!("sending {} bytes", bytes.len());
        stream.write_all(bytes).await?;
        Ok(())
    }

    /// Read until exactly `n` bytes have arrived.
    pub async fn receive_exact(&mut self, n: usize) -> Result<Bytes, MpError> {
        let stream = self.stream.as_mut().ok_or(MpError::NotConnected)?;
        let mut buf = BytesMut::zeroed(n);
        stream.read_exact(&mut buf).await?;
        trace!("received {n} bytes");
        Ok(buf.freeze())
    }

    /// Hand the socket to the acquisition task.
    pub(crate) fn take_stream(&mut self) -> Result<TcpStream, MpError> {
        self.stream.take().ok_or(MpError::NotConnected)
    }

    /// Return the socket after the acquisition task has finished with it.
    pub(crate) fn restore_stream(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
    }
}

/// Discard whatever the instrument has already buffered so that the next
/// read starts on a packet boundary. Returns the number of bytes dropped.
pub(crate) fn drain(stream: &TcpStream) -> usize {
    let mut scratch = [0u8; 4096];
    let mut drained = 0;
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
    if drained > 0 {
        debug!("drained {drained} stale bytes from the socket");
    }
    drained
}
