//! TCP stream transport.
//!
//! Every message is one frame (see [`framing`](super::framing)). The module
//! text and the ready signal are plain text; calls and replies carry the
//! hex-text wire encoding.

use super::framing::{read_frame, write_frame};
use super::{ClientTransport, ReadySignal, ServerTransport};
use crate::config::StreamConfig;
use crate::error::{OffloadError, Result};
use crate::wire::WireFormat;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug)]
struct FramedStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl FramedStream {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer,
        })
    }

    async fn read(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.reader, max_len).await
    }

    async fn write(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, payload).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            // Already torn down by the peer.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(OffloadError::transport("failed to shut down stream", e)),
        }
    }
}

/// Client side of a stream session.
#[derive(Debug)]
pub struct StreamClientTransport {
    stream: FramedStream,
}

impl StreamClientTransport {
    /// Connect to a server, giving up after [`StreamConfig::CONNECT_TIMEOUT`].
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(StreamConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OffloadError::Transport {
                message: format!("timed out connecting to {}", addr),
                source: None,
            })?
            .map_err(|e| OffloadError::transport(format!("failed to connect to {}", addr), e))?;
        debug!("Connected to offload server at {}", addr);
        Ok(Self {
            stream: FramedStream::new(stream)?,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer
    }
}

#[async_trait::async_trait]
impl ClientTransport for StreamClientTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::HexText
    }

    async fn send_module(&mut self, module_text: &str) -> Result<ReadySignal> {
        self.stream.write(module_text.as_bytes()).await?;
        let ready = self
            .stream
            .read(StreamConfig::MAX_MESSAGE_SIZE)
            .await?
            .ok_or(OffloadError::PeerClosed)?;
        ReadySignal::parse_text(&ready)
    }

    async fn send_call(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.write(payload).await
    }

    async fn receive_reply(&mut self) -> Result<Vec<u8>> {
        self.stream
            .read(StreamConfig::MAX_MESSAGE_SIZE)
            .await?
            .ok_or(OffloadError::PeerClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await
    }
}

/// Server side of a stream session, one per accepted connection.
pub struct StreamServerTransport {
    stream: FramedStream,
}

impl StreamServerTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        Ok(Self {
            stream: FramedStream::new(stream)?,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer
    }
}

#[async_trait::async_trait]
impl ServerTransport for StreamServerTransport {
    fn wire_format(&self) -> WireFormat {
        WireFormat::HexText
    }

    async fn receive_module(&mut self) -> Result<Option<String>> {
        match self.stream.read(StreamConfig::MAX_MODULE_SIZE).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| OffloadError::protocol("module text is not valid UTF-8")),
            None => Ok(None),
        }
    }

    async fn send_ready(&mut self, ready: ReadySignal) -> Result<()> {
        self.stream.write(ready.to_text().as_bytes()).await
    }

    async fn receive_call(&mut self) -> Result<Option<Vec<u8>>> {
        self.stream.read(StreamConfig::MAX_MESSAGE_SIZE).await
    }

    async fn send_reply(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.write(payload).await
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing stream session with {}", self.stream.peer);
        self.stream.shutdown().await
    }
}
