//! Network side of the upstream pusher

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::graph::BranchSink;
use crate::media::{Sample, TS_PACKET_SIZE};

/// Write half of an upstream connection
pub type UpstreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the connection to the upstream peer
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<UpstreamWriter>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<UpstreamWriter> {
        let connect = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", host, port),
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::info!(host, port, "upstream connected");
        Ok(Box::new(stream))
    }
}

/// Fixed-length token as sent ahead of the stream: zero padded or truncated
pub fn token_bytes(token: &str, len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    let raw = token.as_bytes();
    let n = raw.len().min(len);
    buf[..n].copy_from_slice(&raw[..n]);
    Bytes::from(buf)
}

/// One zero-filled transport packet
pub fn keepalive_packet() -> Bytes {
    Bytes::from(vec![0u8; TS_PACKET_SIZE])
}

/// Terminal sink writing transport stream to the peer in fixed-size blocks
pub struct TcpSink {
    writer: UpstreamWriter,
    block_size: usize,
    sent: Arc<AtomicU64>,
}

impl TcpSink {
    pub fn new(writer: UpstreamWriter, block_size: usize) -> Self {
        Self {
            writer,
            block_size: block_size.max(1),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of bytes written, shared with the owner
    pub fn sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sent)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        for block in data.chunks(self.block_size) {
            self.writer.write_all(block).await?;
            self.sent.fetch_add(block.len() as u64, Ordering::Relaxed);
        }
        self.writer.flush().await
    }
}

#[async_trait]
impl BranchSink for TcpSink {
    async fn render(&mut self, sample: &Sample) -> io::Result<()> {
        let data = sample.data.clone();
        self.write(&data).await
    }

    async fn write_raw(&mut self, data: Bytes) -> io::Result<()> {
        self.write(&data).await
    }
}
