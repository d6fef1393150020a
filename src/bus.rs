use std::fmt::{Display, Formatter};

/// Two-wire register bus, modelled on the begin/write/end/request/read
/// sequence that controller firmware exposes.
///
/// A transaction is opened with [`Bus::begin_transmission`], fed with
/// [`Bus::write`] and closed with [`Bus::end_transmission`]. Passing
/// `send_stop = false` keeps the bus held so the following
/// [`Bus::request_from`] goes out as a repeated start.
pub trait Bus {
    fn begin_transmission(&mut self, address: u8);

    /// Queue one byte for the open transaction. Returns `false` if the byte
    /// could not be queued.
    fn write(&mut self, byte: u8) -> bool;

    /// Flush the queued bytes. Returns a raw status code, 0 on success.
    fn end_transmission(&mut self, send_stop: bool) -> u8;

    /// Read `count` bytes from `address` into the receive buffer. Returns how
    /// many bytes were actually received.
    fn request_from(&mut self, address: u8, count: usize) -> usize;

    /// Pop the next received byte.
    fn read(&mut self) -> Option<u8>;

    fn set_clock(&mut self, hz: u32);
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn begin_transmission(&mut self, address: u8) {
        (**self).begin_transmission(address)
    }

    fn write(&mut self, byte: u8) -> bool {
        (**self).write(byte)
    }

    fn end_transmission(&mut self, send_stop: bool) -> u8 {
        (**self).end_transmission(send_stop)
    }

    fn request_from(&mut self, address: u8, count: usize) -> usize {
        (**self).request_from(address, count)
    }

    fn read(&mut self) -> Option<u8> {
        (**self).read()
    }

    fn set_clock(&mut self, hz: u32) {
        (**self).set_clock(hz)
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn begin_transmission(&mut self, address: u8) {
        (**self).begin_transmission(address)
    }

    fn write(&mut self, byte: u8) -> bool {
        (**self).write(byte)
    }

    fn end_transmission(&mut self, send_stop: bool) -> u8 {
        (**self).end_transmission(send_stop)
    }

    fn request_from(&mut self, address: u8, count: usize) -> usize {
        (**self).request_from(address, count)
    }

    fn read(&mut self) -> Option<u8> {
        (**self).read()
    }

    fn set_clock(&mut self, hz: u32) {
        (**self).set_clock(hz)
    }
}

/// Status codes returned by [`Bus::end_transmission`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransmissionStatus {
    Success = 0,
    DataTooLong = 1,
    AddressNack = 2,
    DataNack = 3,
    Other = 4,
    Timeout = 5,
}

impl TransmissionStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::DataTooLong,
            2 => Self::AddressNack,
            3 => Self::DataNack,
            5 => Self::Timeout,
            _ => Self::Other,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Display for TransmissionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::DataTooLong => "data too long",
            Self::AddressNack => "NACK on address",
            Self::DataNack => "NACK on data",
            Self::Other => "bus error",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", text)
    }
}
