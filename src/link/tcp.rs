//! COBS-framed link over a TCP stream.
//!
//! Used to reach the simulator, or a hardware bridge exposing the serial bus
//! over the network.

use std::io;

use log::info;
use tokio::net::{TcpStream, ToSocketAddrs};

use super::{spawn_stream_link, LinkHandle};

pub async fn connect<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> io::Result<LinkHandle> {
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    info!("tcp link established to {addr:?}");
    let (read_half, write_half) = stream.into_split();
    Ok(spawn_stream_link(read_half, write_half))
}
