//! Line-framed transport: one JSON frame per newline-delimited line.
//!
//! The reader half stays with the handler task; the writer half is driven
//! by a spawned writer task fed from the link's command channel, so any
//! task holding a `Link` can send without touching the socket.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use causeway_core::wire::{Frame, MAX_FRAME_BYTES};
use causeway_services::{Link, LinkCmd};

/// Reads frames off one transport.
pub struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl FrameReader {
    pub fn new(read: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(read),
            line: String::new(),
        }
    }

    /// Next frame, or None on clean stream end. A malformed or oversized
    /// line is an error; callers treat it as a protocol violation.
    pub async fn next(&mut self) -> Result<Option<Frame>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            if n > MAX_FRAME_BYTES {
                anyhow::bail!("frame of {n} bytes exceeds maximum {MAX_FRAME_BYTES}");
            }
            let line = self.line.trim_end();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(Frame::decode(line)?));
        }
    }
}

/// Spawn the writer task for one transport and return the link handle
/// plus the frame reader. Dropping every link clone, or sending
/// `LinkCmd::Shutdown`, closes the write side; the peer then sees EOF.
pub fn open_link(stream: TcpStream) -> (Link, FrameReader) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_task(write, rx));
    (Link::new(tx), FrameReader::new(read))
}

async fn writer_task(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<LinkCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LinkCmd::Frame(frame) => {
                let line = match frame.encode() {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode frame, dropping");
                        continue;
                    }
                };
                if write.write_all(line.as_bytes()).await.is_err()
                    || write.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            LinkCmd::Shutdown => break,
        }
    }
    let _ = write.shutdown().await;
}

/// Write a terminal protocol-error notice and close the transport.
pub fn protocol_error(link: &Link, text: &str) {
    link.send(Frame::Error {
        text: text.to_string(),
    });
    link.close();
}
