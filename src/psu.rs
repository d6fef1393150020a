use std::fmt::{Display, Formatter};
use std::time::Duration;

use log::{debug, info};

use crate::bus::Bus;
use crate::channel::RegisterChannel;
use crate::decode;

/// PSU telemetry register map.
pub mod regs {
    pub const TEMPERATURE: u8 = 0x09;
    pub const FAN1_SPEED: u8 = 0x0A;
    pub const FAN2_SPEED: u8 = 0x0B;
    pub const POWER_STATUS: u8 = 0x0C;
    pub const AC_CURRENT: u8 = 0x14;
    pub const INPUT_VOLTAGE: u8 = 0xF4;
    pub const INPUT_POWER_L: u8 = 0xF5;
    pub const INPUT_POWER_H: u8 = 0xF6;
}

/// Last known readings of one PSU. Fields other than `online` are only
/// meaningful while `online` is set.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub online: bool,
    pub dc_good: bool,
    pub temperature: u8,
    pub fan1_rpm: u16,
    pub fan2_rpm: u16,
    pub input_voltage: f32,
    pub input_current: f32,
    pub input_power: u16,
}

pub struct PsuMonitor {
    index: u8,
    address: u8,
    telemetry: Telemetry,
}

impl PsuMonitor {
    pub fn new(index: u8, address: u8) -> Self {
        Self {
            index,
            address,
            telemetry: Telemetry::default(),
        }
    }

    #[cfg(test)]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[cfg(test)]
    pub fn is_online(&self) -> bool {
        self.telemetry.online
    }

    /// Probe the device and re-read every register.
    ///
    /// Returns `false` only when the device did not answer the probe. Once
    /// it has, each field is refreshed on its own: a failed register read
    /// keeps that field's previous value.
    pub fn refresh<B: Bus + ?Sized>(&mut self, bus: &mut B) -> bool {
        let mut channel = RegisterChannel::new(bus, self.address);
        let was_online = self.telemetry.online;

        if !channel.probe(regs::TEMPERATURE) {
            self.telemetry.online = false;
            if was_online {
                info!("PSU #{} ({:#04x}) went offline", self.index, self.address);
            }
            return false;
        }

        self.telemetry.online = true;
        if !was_online {
            info!("PSU #{} ({:#04x}) is online", self.index, self.address);
        }

        let index = self.index;
        let t = &mut self.telemetry;
        let mut read = |reg: u8| {
            let value = channel.read_byte(reg);
            if value.is_none() {
                debug!("PSU #{}: read of register {:#04x} failed, keeping last value", index, reg);
            }
            value
        };

        if let Some(raw) = read(regs::TEMPERATURE) {
            t.temperature = decode::temperature(raw);
        }
        if let Some(raw) = read(regs::POWER_STATUS) {
            t.dc_good = decode::dc_good(raw);
        }
        if let Some(raw) = read(regs::FAN1_SPEED) {
            t.fan1_rpm = decode::fan_rpm(raw);
        }
        if let Some(raw) = read(regs::FAN2_SPEED) {
            t.fan2_rpm = decode::fan_rpm(raw);
        }
        if let Some(raw) = read(regs::INPUT_VOLTAGE) {
            t.input_voltage = decode::voltage(raw);
        }
        if let Some(raw) = read(regs::AC_CURRENT) {
            t.input_current = decode::current(raw);
        }

        match channel.read_word(regs::INPUT_POWER_L, regs::INPUT_POWER_H) {
            Some(raw) => t.input_power = decode::power(raw),
            None => debug!("PSU #{}: input power read failed, keeping last value", index),
        }

        true
    }

    pub fn report(&self, elapsed: Duration) -> Report {
        let elapsed_secs = elapsed.as_secs();
        if self.telemetry.online {
            Report::Online {
                index: self.index,
                elapsed_secs,
                telemetry: self.telemetry,
            }
        } else {
            Report::Offline {
                index: self.index,
                elapsed_secs,
            }
        }
    }
}

/// One device's report for one polling pass. An offline report carries no
/// readings at all.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Report {
    Offline {
        index: u8,
        elapsed_secs: u64,
    },
    Online {
        index: u8,
        elapsed_secs: u64,
        telemetry: Telemetry,
    },
}

impl Report {
    pub fn index(&self) -> u8 {
        match *self {
            Report::Offline { index, .. } | Report::Online { index, .. } => index,
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        match *self {
            Report::Offline { elapsed_secs, .. } | Report::Online { elapsed_secs, .. } => {
                elapsed_secs
            }
        }
    }

    pub fn telemetry(&self) -> Option<&Telemetry> {
        match self {
            Report::Offline { .. } => None,
            Report::Online { telemetry, .. } => Some(telemetry),
        }
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}s] PSU #{}: ", self.elapsed_secs(), self.index())?;
        match self.telemetry() {
            None => write!(f, "--- OFFLINE ---"),
            Some(t) => write!(
                f,
                "{}C | {}/{} rpm | {} | {:.0}V / {:.2}A / {}W",
                t.temperature,
                t.fan1_rpm,
                t.fan2_rpm,
                if t.dc_good { "DC OK" } else { "FAULT" },
                t.input_voltage,
                t.input_current,
                t.input_power,
            ),
        }
    }
}
