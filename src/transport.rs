//! Byte transport between the host and the worklet.
//!
//! An [`Endpoint`] is an ordered, bidirectional stream of raw byte chunks with
//! no message boundaries. Chunks may be split or coalesced arbitrarily; the
//! RPC layer does its own framing.
//!
//! The peer is gone once the inbound side yields `None`. Sends after that are
//! dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Read buffer for I/O-backed endpoints.
const READ_BUF_SIZE: usize = 64 * 1024;

/// One side of a byte transport.
#[derive(Debug)]
pub struct Endpoint {
    /// Chunks written to the peer.
    pub(crate) outbound: UnboundedSender<Vec<u8>>,
    /// Chunks received from the peer. `None` means the peer closed.
    pub(crate) inbound: UnboundedReceiver<Vec<u8>>,
}

impl Endpoint {
    /// Build an endpoint from raw channels.
    ///
    /// Lets callers put a relay between two sides, e.g. one that re-chunks
    /// bytes in transit.
    pub fn from_parts(outbound: UnboundedSender<Vec<u8>>, inbound: UnboundedReceiver<Vec<u8>>) -> Self {
        Self { outbound, inbound }
    }

    /// In-memory duplex pair. Dropping one side closes the other's inbound.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::from_parts(a_tx, a_rx), Self::from_parts(b_tx, b_rx))
    }

    /// Bridge an `AsyncRead`/`AsyncWrite` pair (child stdio, a socket).
    ///
    /// Spawns a read task and a write task. EOF or a read error closes the
    /// inbound side; a write error stops the writer and drops further sends.
    pub fn from_io<R, W>(reader: R, writer: W) -> (Self, IoTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(read_loop(reader, in_tx));
        let write_handle = tokio::spawn(write_loop(writer, out_rx));

        (
            Self::from_parts(out_tx, in_rx),
            IoTasks {
                read_handle,
                write_handle,
            },
        )
    }
}

/// Background tasks owned by an I/O-backed endpoint.
#[derive(Debug)]
pub struct IoTasks {
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl IoTasks {
    /// Abort both tasks.
    pub fn abort(&self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, inbound: UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("[Transport] EOF");
                break;
            }
            Ok(n) => {
                if inbound.send(buf[..n].to_vec()).is_err() {
                    break; // Endpoint dropped
                }
            }
            Err(e) => {
                log::error!("[Transport] Read error: {e}");
                break;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut outbound: UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Transport] Write error: {e}");
            return;
        }
        if let Err(e) = writer.flush().await {
            log::error!("[Transport] Flush error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
