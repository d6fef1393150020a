use std::path::Path;

use tokio_serial::SerialPort;

/// Open a tty for report output at `baud`, 8N1 with no flow control.
///
/// The port is blocking, so it can be written from the polling thread.
pub fn open(path: &Path, baud: u32) -> tokio_serial::Result<Box<dyn SerialPort>> {
    tokio_serial::new(path.to_string_lossy(), baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open()
}
