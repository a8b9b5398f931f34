use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;

use super::codec::PacketCodec;
use super::packet::{Packet, MAX_PACKET_SIZE};
use crate::error::{ProxyError, Result};

/// Byte stream a packet channel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Framed MySQL packet channel tracking the sequence id
pub struct PacketIo {
    framed: Framed<Box<dyn AsyncStream>, PacketCodec>,
    sequence: u8,
    peer: String,
    tls: bool,
}

impl std::fmt::Debug for PacketIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketIo")
            .field("peer", &self.peer)
            .field("sequence", &self.sequence)
            .field("tls", &self.tls)
            .finish()
    }
}

impl PacketIo {
    pub fn new<S: AsyncStream + 'static>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(Box::new(stream), PacketCodec),
            sequence: 0,
            peer: peer.into(),
            tls: false,
        }
    }

    /// Read one logical packet, joining payloads split at the maximum size
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let first = self.next_payload().await?;
        if first.len() < MAX_PACKET_SIZE {
            return Ok(first);
        }

        let mut joined = BytesMut::from(&first[..]);
        loop {
            let next = self.next_payload().await?;
            joined.extend_from_slice(&next);
            if next.len() < MAX_PACKET_SIZE {
                return Ok(joined.freeze());
            }
        }
    }

    async fn next_payload(&mut self) -> Result<Bytes> {
        let packet = match self.framed.next().await {
            Some(packet) => packet?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed by {}", self.peer),
                )
                .into())
            }
        };

        if packet.sequence_id != self.sequence {
            return Err(ProxyError::Protocol(format!(
                "packet sequence mismatch from {}: expected {}, got {}",
                self.peer, self.sequence, packet.sequence_id
            )));
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(packet.payload)
    }

    /// Queue one logical packet; call [`PacketIo::flush`] to send it
    pub async fn write_packet(&mut self, payload: Bytes) -> Result<()> {
        let mut rest = payload;
        loop {
            let chunk = rest.split_to(rest.len().min(MAX_PACKET_SIZE));
            let last = chunk.len() < MAX_PACKET_SIZE;
            self.framed.feed(Packet::new(self.sequence, chunk)).await?;
            self.sequence = self.sequence.wrapping_add(1);
            if last {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.framed.flush().await?;
        Ok(())
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Accept a TLS session from the client on this channel
    pub async fn upgrade_to_server_tls(&mut self, config: Arc<ServerConfig>) -> Result<()> {
        let stream = self.take_stream().await?;
        let tls = TlsAcceptor::from(config)
            .accept(stream)
            .await
            .map_err(|e| ProxyError::Auth(format!("TLS handshake with {} failed: {e}", self.peer)))?;
        self.framed = Framed::new(Box::new(tls), PacketCodec);
        self.tls = true;
        Ok(())
    }

    /// Start a TLS session towards the server on this channel
    pub async fn upgrade_to_client_tls(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let stream = self.take_stream().await?;
        let tls = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Auth(format!("TLS handshake with {} failed: {e}", self.peer)))?;
        self.framed = Framed::new(Box::new(tls), PacketCodec);
        self.tls = true;
        Ok(())
    }

    /// Detach the byte stream; bytes the framer read ahead are replayed first
    async fn take_stream(&mut self) -> Result<Box<dyn AsyncStream>> {
        self.framed.flush().await?;
        let (detached, _) = tokio::io::duplex(1);
        let placeholder: Box<dyn AsyncStream> = Box::new(detached);
        let framed = std::mem::replace(&mut self.framed, Framed::new(placeholder, PacketCodec));
        let parts = framed.into_parts();
        if parts.read_buf.is_empty() {
            return Ok(parts.io);
        }
        Ok(Box::new(Rewind {
            buffered: parts.read_buf,
            inner: parts.io,
        }))
    }

    /// Flush and shut the stream down
    pub async fn close(&mut self) -> Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}

/// A TLS hello sent right behind an SSLRequest may already sit in the read buffer
struct Rewind {
    buffered: BytesMut,
    inner: Box<dyn AsyncStream>,
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            let chunk = self.buffered.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
