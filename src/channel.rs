use log::trace;

use crate::bus::{Bus, TransmissionStatus};

/// Assemble a 16-bit value from its low and high register bytes.
pub fn compose_word(low: u8, high: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

/// Register-level access to one device on the bus.
///
/// Holding the channel holds the bus exclusively, so a transaction for one
/// device always completes before another device's can start.
pub struct RegisterChannel<'a, B: Bus + ?Sized> {
    bus: &'a mut B,
    address: u8,
}

impl<'a, B: Bus + ?Sized> RegisterChannel<'a, B> {
    pub fn new(bus: &'a mut B, address: u8) -> Self {
        Self { bus, address }
    }

    /// Address the device and set its register pointer without reading.
    /// Succeeds only if the device acknowledged.
    pub fn probe(&mut self, reg: u8) -> bool {
        self.select(reg)
    }

    /// Read one register. `None` means the write phase failed or the device
    /// returned anything other than exactly one byte.
    pub fn read_byte(&mut self, reg: u8) -> Option<u8> {
        if !self.select(reg) {
            return None;
        }

        let received = self.bus.request_from(self.address, 1);
        if received != 1 {
            trace!("{:#04x} reg {:#04x}: requested 1 byte, got {}", self.address, reg, received);
            return None;
        }

        let value = self.bus.read()?;
        trace!("{:#04x} reg {:#04x} -> {:#04x}", self.address, reg, value);
        Some(value)
    }

    /// Read a 16-bit value split across two registers, low byte first.
    pub fn read_word(&mut self, reg_low: u8, reg_high: u8) -> Option<u16> {
        let low = self.read_byte(reg_low)?;
        let high = self.read_byte(reg_high)?;
        Some(compose_word(low, high))
    }

    // Write the register address and keep the bus held for a repeated start.
    fn select(&mut self, reg: u8) -> bool {
        self.bus.begin_transmission(self.address);
        if !self.bus.write(reg) {
            // Close the transaction anyway so the bus is released.
            self.bus.end_transmission(true);
            return false;
        }

        let status = self.bus.end_transmission(false);
        if status != 0 {
            trace!(
                "{:#04x} reg {:#04x}: {}",
                self.address,
                reg,
                TransmissionStatus::from_code(status)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BusEvent, SimulatedBus, SimulatedPsu};

    #[test]
    fn compose_word_places_high_byte_on_top() {
        assert_eq!(compose_word(0x34, 0x01), 0x0134);
        assert_eq!(compose_word(0x34, 0x01), 308);
        assert_eq!(compose_word(0xFF, 0xFF), u16::MAX);
        assert_eq!(compose_word(0x64, 0x00), 100);
    }

    #[test]
    fn read_byte_uses_repeated_start() {
        let mut psu = SimulatedPsu::new();
        psu.set_register(0x09, 45);
        let mut bus = SimulatedBus::new().with_device(0x38, psu);

        let value = RegisterChannel::new(&mut bus, 0x38).read_byte(0x09);
        assert_eq!(value, Some(45));
        assert_eq!(
            bus.events(),
            &[
                BusEvent::Begin(0x38),
                BusEvent::End { address: 0x38, send_stop: false, status: 0 },
                BusEvent::Request { address: 0x38, count: 1, received: 1 },
            ]
        );
    }

    #[test]
    fn read_byte_fails_on_absent_device() {
        let mut bus = SimulatedBus::new();
        assert_eq!(RegisterChannel::new(&mut bus, 0x40).read_byte(0x09), None);
        // No read is attempted after the write phase fails.
        assert!(!bus
            .events()
            .iter()
            .any(|e| matches!(e, BusEvent::Request { .. })));
    }

    #[test]
    fn read_byte_fails_on_short_read() {
        let mut psu = SimulatedPsu::new();
        psu.fail_register(0x0A);
        let mut bus = SimulatedBus::new().with_device(0x38, psu);
        assert_eq!(RegisterChannel::new(&mut bus, 0x38).read_byte(0x0A), None);
    }

    #[test]
    fn read_word_reads_low_then_high() {
        let mut psu = SimulatedPsu::new();
        psu.set_register(0xF5, 0x34);
        psu.set_register(0xF6, 0x01);
        let mut bus = SimulatedBus::new().with_device(0x38, psu);

        assert_eq!(RegisterChannel::new(&mut bus, 0x38).read_word(0xF5, 0xF6), Some(308));
        let selected: Vec<u8> = bus.selected_registers(0x38);
        assert_eq!(selected, vec![0xF5, 0xF6]);
    }

    #[test]
    fn read_word_fails_if_either_half_fails() {
        let mut psu = SimulatedPsu::new();
        psu.set_register(0xF5, 0x34);
        psu.fail_register(0xF6);
        let mut bus = SimulatedBus::new().with_device(0x38, psu.clone());
        assert_eq!(RegisterChannel::new(&mut bus, 0x38).read_word(0xF5, 0xF6), None);

        let mut psu = SimulatedPsu::new();
        psu.fail_register(0xF5);
        psu.set_register(0xF6, 0x01);
        let mut bus = SimulatedBus::new().with_device(0x38, psu);
        assert_eq!(RegisterChannel::new(&mut bus, 0x38).read_word(0xF5, 0xF6), None);
    }

    #[test]
    fn probe_does_not_read() {
        let mut bus = SimulatedBus::new().with_device(0x39, SimulatedPsu::new());
        assert!(RegisterChannel::new(&mut bus, 0x39).probe(0x09));
        assert_eq!(bus.events().len(), 2);
    }
}
