//! Linux `/dev/i2c-N` bus backend.
//!
//! Transfers go through the `I2C_RDWR` ioctl so a held write and the
//! following read are issued as one combined message (repeated start).

use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{info, trace};

use crate::bus::{Bus, TransmissionStatus};

const I2C_RDWR: u32 = 0x0707;
const I2C_M_RD: u16 = 0x0001;

/// Transmit buffer size, matching the controller this interface imitates.
const TX_BUFFER_LEN: usize = 32;

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

pub struct I2cDevBus {
    file: File,
    address: Option<u8>,
    tx: Vec<u8>,
    /// Register pointer write held open by `end_transmission(false)`.
    held: Option<(u8, Vec<u8>)>,
    rx: VecDeque<u8>,
}

impl I2cDevBus {
    pub fn open(path: &Path) -> Result<Self, BusOpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BusOpenError { path: path.to_path_buf(), source: e })?;

        Ok(Self {
            file,
            address: None,
            tx: Vec::with_capacity(TX_BUFFER_LEN),
            held: None,
            rx: VecDeque::new(),
        })
    }

    fn transfer(&self, msgs: &mut [I2cMsg]) -> io::Result<()> {
        let mut data = I2cRdwrIoctlData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), I2C_RDWR as _, &mut data as *mut I2cRdwrIoctlData) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn status_for(error: &io::Error) -> TransmissionStatus {
    match error.raw_os_error() {
        Some(libc::ENXIO) | Some(libc::EREMOTEIO) => TransmissionStatus::AddressNack,
        Some(libc::ETIMEDOUT) => TransmissionStatus::Timeout,
        _ => TransmissionStatus::Other,
    }
}

fn write_msg(address: u8, bytes: &mut [u8]) -> I2cMsg {
    I2cMsg {
        addr: u16::from(address),
        flags: 0,
        len: bytes.len() as u16,
        buf: bytes.as_mut_ptr(),
    }
}

impl Bus for I2cDevBus {
    fn begin_transmission(&mut self, address: u8) {
        self.address = Some(address);
        self.tx.clear();
        self.held = None;
    }

    fn write(&mut self, byte: u8) -> bool {
        if self.address.is_none() || self.tx.len() >= TX_BUFFER_LEN {
            return false;
        }
        self.tx.push(byte);
        true
    }

    fn end_transmission(&mut self, send_stop: bool) -> u8 {
        let Some(address) = self.address.take() else {
            return TransmissionStatus::Other.code();
        };
        let mut tx = std::mem::take(&mut self.tx);

        // The kernel always ends a transfer with a stop, so the write goes out
        // now to observe the ACK and is repeated ahead of the next read.
        let mut msgs = [write_msg(address, &mut tx)];
        let status = match self.transfer(&mut msgs) {
            Ok(()) => TransmissionStatus::Success,
            Err(e) => {
                trace!("{:#04x}: write {:02x?} failed: {}", address, tx, e);
                status_for(&e)
            }
        };

        if status == TransmissionStatus::Success && !send_stop {
            self.held = Some((address, tx));
        }
        status.code()
    }

    fn request_from(&mut self, address: u8, count: usize) -> usize {
        self.rx.clear();
        let mut buffer = vec![0u8; count];
        let held = self.held.take().filter(|(held_address, _)| *held_address == address);

        let result = match held {
            Some((_, mut tx)) => {
                let mut msgs = [
                    write_msg(address, &mut tx),
                    I2cMsg {
                        addr: u16::from(address),
                        flags: I2C_M_RD,
                        len: count as u16,
                        buf: buffer.as_mut_ptr(),
                    },
                ];
                self.transfer(&mut msgs)
            }
            None => {
                let mut msgs = [I2cMsg {
                    addr: u16::from(address),
                    flags: I2C_M_RD,
                    len: count as u16,
                    buf: buffer.as_mut_ptr(),
                }];
                self.transfer(&mut msgs)
            }
        };

        match result {
            Ok(()) => {
                self.rx.extend(buffer);
                count
            }
            Err(e) => {
                trace!("{:#04x}: read of {} bytes failed: {}", address, count, e);
                0
            }
        }
    }

    fn read(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn set_clock(&mut self, hz: u32) {
        // The adapter clock is fixed by the kernel driver.
        info!("Requested bus clock {} Hz; the adapter's configured rate applies", hz);
    }
}

#[derive(Debug)]
pub struct BusOpenError {
    path: PathBuf,
    source: io::Error,
}

impl Display for BusOpenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Can't open bus {}: {}. Is the i2c-dev module loaded and do you have access to the device?",
            self.path.display(),
            self.source
        )
    }
}

impl Error for BusOpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_status() {
        let nack = io::Error::from_raw_os_error(libc::ENXIO);
        assert_eq!(status_for(&nack), TransmissionStatus::AddressNack);
        let remote = io::Error::from_raw_os_error(libc::EREMOTEIO);
        assert_eq!(status_for(&remote), TransmissionStatus::AddressNack);
        let timeout = io::Error::from_raw_os_error(libc::ETIMEDOUT);
        assert_eq!(status_for(&timeout), TransmissionStatus::Timeout);
        let other = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(status_for(&other), TransmissionStatus::Other);
    }

    #[test]
    fn open_missing_device_fails() {
        let err = I2cDevBus::open(Path::new("/dev/i2c-does-not-exist")).err().unwrap();
        assert!(err.to_string().contains("/dev/i2c-does-not-exist"));
    }

    #[test]
    fn transfer_on_regular_file_reports_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut bus = I2cDevBus::open(file.path()).unwrap();

        bus.begin_transmission(0x38);
        assert!(bus.write(0x09));
        assert_ne!(bus.end_transmission(false), 0);
        assert_eq!(bus.request_from(0x38, 1), 0);
        assert_eq!(bus.read(), None);
    }
}
