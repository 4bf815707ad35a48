//! COBS-framed link over a serial port.

use std::io;

use log::info;
use tokio_serial::SerialPortBuilderExt;

use super::{spawn_stream_link, LinkHandle};

pub fn connect(port: &str, baud: u32) -> io::Result<LinkHandle> {
    let stream = tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    info!("serial link established on {port} @ {baud}");
    let (read_half, write_half) = tokio::io::split(stream);
    Ok(spawn_stream_link(read_half, write_half))
}
