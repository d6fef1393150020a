//! Simulated bus with register-file PSUs.
//!
//! Lets the poller run without hardware attached (`--simulate`) and gives
//! tests a bus whose every transaction can be inspected afterwards.

use std::collections::{BTreeMap, HashSet, VecDeque};

use log::trace;

use crate::bus::{Bus, TransmissionStatus};
use crate::psu::regs;

/// Transmit buffer size of the controller this bus imitates.
const TX_BUFFER_LEN: usize = 32;

/// One observable step on the simulated bus.
#[cfg(test)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    Begin(u8),
    End { address: u8, send_stop: bool, status: u8 },
    Request { address: u8, count: usize, received: usize },
}

#[cfg(test)]
impl BusEvent {
    pub fn address(&self) -> u8 {
        match *self {
            BusEvent::Begin(address) => address,
            BusEvent::End { address, .. } => address,
            BusEvent::Request { address, .. } => address,
        }
    }
}

/// A PSU as seen from the bus: a flat register file with an auto-incrementing
/// pointer.
#[derive(Clone, Debug)]
pub struct SimulatedPsu {
    registers: [u8; 256],
    failing: HashSet<u8>,
    present: bool,
    pointer: u8,
}

impl SimulatedPsu {
    pub fn new() -> Self {
        Self {
            registers: [0; 256],
            failing: HashSet::new(),
            present: true,
            pointer: 0,
        }
    }

    /// A healthy unit drawing `watts` with both fans spinning.
    pub fn healthy(temperature: u8, watts: u16) -> Self {
        let mut psu = Self::new();
        let [low, high] = watts.to_le_bytes();
        psu.set_register(regs::TEMPERATURE, temperature);
        psu.set_register(regs::POWER_STATUS, 0x01);
        psu.set_register(regs::FAN1_SPEED, 60);
        psu.set_register(regs::FAN2_SPEED, 58);
        psu.set_register(regs::INPUT_VOLTAGE, 230);
        // Current register is 1/16 A per LSB.
        let amps = (f32::from(watts) / 230.0 * 16.0).round().min(255.0) as u8;
        psu.set_register(regs::AC_CURRENT, amps);
        psu.set_register(regs::INPUT_POWER_L, low);
        psu.set_register(regs::INPUT_POWER_H, high);
        psu
    }

    pub fn set_register(&mut self, reg: u8, value: u8) {
        self.registers[reg as usize] = value;
    }

    #[cfg(test)]
    pub fn register(&self, reg: u8) -> u8 {
        self.registers[reg as usize]
    }

    /// Reads of `reg` return no data.
    #[cfg(test)]
    pub fn fail_register(&mut self, reg: u8) {
        self.failing.insert(reg);
    }

    #[cfg(test)]
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }
}

impl Default for SimulatedPsu {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimulatedBus {
    devices: BTreeMap<u8, SimulatedPsu>,
    current: Option<u8>,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    #[cfg(test)]
    events: Vec<BusEvent>,
    #[cfg(test)]
    selections: Vec<(u8, u8)>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            current: None,
            tx: Vec::with_capacity(TX_BUFFER_LEN),
            rx: VecDeque::new(),
            #[cfg(test)]
            events: Vec::new(),
            #[cfg(test)]
            selections: Vec::new(),
        }
    }

    pub fn with_device(mut self, address: u8, psu: SimulatedPsu) -> Self {
        self.devices.insert(address, psu);
        self
    }

    #[cfg(test)]
    pub fn device_mut(&mut self, address: u8) -> Option<&mut SimulatedPsu> {
        self.devices.get_mut(&address)
    }

    #[cfg(test)]
    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    /// Register pointers written to `address`, in order.
    #[cfg(test)]
    pub fn selected_registers(&self, address: u8) -> Vec<u8> {
        self.selections
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, reg)| *reg)
            .collect()
    }

    fn responding(&mut self, address: u8) -> Option<&mut SimulatedPsu> {
        self.devices.get_mut(&address).filter(|psu| psu.present)
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for SimulatedBus {
    fn begin_transmission(&mut self, address: u8) {
        self.current = Some(address);
        self.tx.clear();
        #[cfg(test)]
        self.events.push(BusEvent::Begin(address));
    }

    fn write(&mut self, byte: u8) -> bool {
        if self.current.is_none() || self.tx.len() >= TX_BUFFER_LEN {
            return false;
        }
        self.tx.push(byte);
        true
    }

    fn end_transmission(&mut self, send_stop: bool) -> u8 {
        let Some(address) = self.current.take() else {
            return TransmissionStatus::Other.code();
        };
        let tx = std::mem::take(&mut self.tx);

        let status = match self.responding(address) {
            None => TransmissionStatus::AddressNack,
            Some(psu) => {
                // First byte sets the register pointer, the rest are register writes.
                if let Some((&reg, data)) = tx.split_first() {
                    psu.pointer = reg;
                    for &value in data {
                        psu.registers[psu.pointer as usize] = value;
                        psu.pointer = psu.pointer.wrapping_add(1);
                    }
                }
                TransmissionStatus::Success
            }
        };

        #[cfg(test)]
        {
            if status == TransmissionStatus::Success {
                if let Some(&reg) = tx.first() {
                    self.selections.push((address, reg));
                }
            }
            self.events.push(BusEvent::End { address, send_stop, status: status.code() });
        }
        trace!("sim {:#04x}: end transmission {:02x?} (stop: {}): {}", address, tx, send_stop, status);
        status.code()
    }

    fn request_from(&mut self, address: u8, count: usize) -> usize {
        self.rx.clear();
        let mut received = Vec::with_capacity(count);
        if let Some(psu) = self.responding(address) {
            if !psu.failing.contains(&psu.pointer) {
                for _ in 0..count {
                    received.push(psu.registers[psu.pointer as usize]);
                    psu.pointer = psu.pointer.wrapping_add(1);
                }
            }
        }
        self.rx.extend(received.iter().copied());
        #[cfg(test)]
        self.events.push(BusEvent::Request { address, count, received: received.len() });
        received.len()
    }

    fn read(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn set_clock(&mut self, hz: u32) {
        trace!("sim: bus clock {} Hz", hz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_device_nacks_address() {
        let mut bus = SimulatedBus::new();
        bus.begin_transmission(0x38);
        assert!(bus.write(0x09));
        assert_eq!(bus.end_transmission(false), 2);
        assert_eq!(bus.request_from(0x38, 1), 0);
        assert_eq!(bus.read(), None);
    }

    #[test]
    fn removed_device_stops_answering() {
        let mut bus = SimulatedBus::new().with_device(0x38, SimulatedPsu::new());
        bus.device_mut(0x38).unwrap().set_present(false);
        bus.begin_transmission(0x38);
        bus.write(0x09);
        assert_eq!(bus.end_transmission(true), 2);
    }

    #[test]
    fn pointer_auto_increments() {
        let mut psu = SimulatedPsu::new();
        psu.set_register(0xF5, 0xAA);
        psu.set_register(0xF6, 0xBB);
        let mut bus = SimulatedBus::new().with_device(0x38, psu);

        bus.begin_transmission(0x38);
        bus.write(0xF5);
        assert_eq!(bus.end_transmission(false), 0);
        assert_eq!(bus.request_from(0x38, 2), 2);
        assert_eq!(bus.read(), Some(0xAA));
        assert_eq!(bus.read(), Some(0xBB));
        assert_eq!(bus.read(), None);
    }

    #[test]
    fn tx_buffer_overflow_rejects_write() {
        let mut bus = SimulatedBus::new();
        bus.begin_transmission(0x38);
        for _ in 0..TX_BUFFER_LEN {
            assert!(bus.write(0));
        }
        assert!(!bus.write(0));
    }

    #[test]
    fn write_without_transaction_is_rejected() {
        let mut bus = SimulatedBus::new();
        assert!(!bus.write(0x09));
        assert_eq!(bus.end_transmission(true), 4);
    }

    #[test]
    fn healthy_unit_encodes_power_little_endian() {
        let psu = SimulatedPsu::healthy(40, 0x0134);
        assert_eq!(psu.register(regs::INPUT_POWER_L), 0x34);
        assert_eq!(psu.register(regs::INPUT_POWER_H), 0x01);
        assert_eq!(psu.register(regs::POWER_STATUS), 0x01);
    }
}
