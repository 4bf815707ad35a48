//! Frame-level transports.
//!
//! A link moves whole encoded envelopes, one per frame; everything above it
//! ([`CommPipe`]) is transport agnostic. Byte-stream transports (serial, TCP)
//! use COBS framing with a zero sentinel between frames. The in-memory
//! [`channel`] link skips framing entirely and is used by tests and the node
//! simulator.
//!
//! [`CommPipe`]: crate::pipe::CommPipe

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub mod channel;
pub mod serial;
pub mod tcp;

/// How to reach the physical network: a serial device or a TCP endpoint
/// (e.g. the simulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionParams {
    Serial { port: String, baud: u32 },
    Tcp { addr: String },
}

/// Both directions of an established link.
///
/// `tx` accepts outbound frames; `rx` yields inbound frames in arrival order.
/// Dropping the handle closes the link and stops its worker tasks.
pub struct LinkHandle {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

const LINK_CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 1024;

/// Splits a COBS-framed byte stream into frames.
///
/// Bytes are accumulated until a zero sentinel, then the chunk is COBS
/// decoded. Frames that fail to decode are dropped with a log line; a corrupt
/// frame must never take down the link.
#[derive(Default)]
pub(crate) struct CobsFramer {
    buf: Vec<u8>,
}

impl CobsFramer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if b == 0 {
                if !self.buf.is_empty() {
                    match cobs::decode_vec(&self.buf) {
                        Ok(frame) => frames.push(frame),
                        Err(_) => debug!("dropping undecodable frame ({} bytes)", self.buf.len()),
                    }
                    self.buf.clear();
                }
            } else {
                self.buf.push(b);
            }
        }
        frames
    }
}

/// Wraps a duplex byte stream in framing workers and returns the link handle.
pub(crate) fn spawn_stream_link<R, W>(read_half: R, write_half: W) -> LinkHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(LINK_CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(LINK_CHANNEL_DEPTH);
    tokio::spawn(tx_worker(write_half, out_rx));
    tokio::spawn(rx_worker(read_half, in_tx));
    LinkHandle {
        tx: out_tx,
        rx: in_rx,
    }
}

async fn tx_worker<W: AsyncWrite + Unpin>(mut io: W, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        let mut encoded = cobs::encode_vec(&frame);
        encoded.push(0);
        if let Err(e) = io.write_all(&encoded).await {
            warn!("link write failed: {e}");
            break;
        }
    }
}

async fn rx_worker<R: AsyncRead + Unpin>(mut io: R, frames: mpsc::Sender<Vec<u8>>) {
    let mut framer = CobsFramer::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match io.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for frame in framer.feed(&chunk[..n]) {
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("link read failed: {e}");
                break;
            }
        }
    }
}
