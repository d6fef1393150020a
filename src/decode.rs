//! Raw register values to physical units. Every function is total over its
//! input.

/// Tachometer calibration: RPM = count * 60 / (2 * 0.262).
pub const FAN_RPM_FACTOR: f64 = 60.0 / (2.0 * 0.262);

/// Bit 0 of the power status register: DC output good.
pub const DC_GOOD_BIT: u8 = 0x01;

/// A zero count is a stalled or missing fan and stays zero.
pub fn fan_rpm(count: u8) -> u16 {
    if count == 0 {
        return 0;
    }
    // 255 * FAN_RPM_FACTOR < u16::MAX
    (f64::from(count) * FAN_RPM_FACTOR).round() as u16
}

/// 1 V per LSB.
pub fn voltage(raw: u8) -> f32 {
    f32::from(raw)
}

/// 1/16 A per LSB.
pub fn current(raw: u8) -> f32 {
    f32::from(raw) / 16.0
}

/// 1 W per LSB.
pub fn power(raw: u16) -> u16 {
    raw
}

/// Degrees Celsius, unscaled.
pub fn temperature(raw: u8) -> u8 {
    raw
}

pub fn dc_good(status: u8) -> bool {
    status & DC_GOOD_BIT != 0
}
