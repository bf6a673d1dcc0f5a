//! Conversions from raw register content to physical units.
//!
//! Energy conversions assume the PL constant programmed at boot, i.e. 1000 imp/kWh.

/// Line voltage RMS in volts, from `Urms`.
pub fn voltage(raw: u16) -> f64 {
    raw as f64 / 100.0
}

/// Line current RMS in amperes, from `Irms`.
pub fn current(raw: u16) -> f64 {
    raw as f64 / 1000.0
}

/// Line frequency in hertz, from `Freq`.
pub fn frequency(raw: u16) -> f64 {
    raw as f64 / 100.0
}

/// Signed mean power, from `Pmean`, `Qmean` or `Smean`. The register is two's complement and
/// the sign gives the direction.
pub fn power(raw: u16) -> f64 {
    raw as i16 as f64
}

/// Imported part of the mean active power. Zero while exporting.
pub fn import_power(raw: u16) -> f64 {
    power(raw).max(0.0)
}

/// Exported part of the mean active power, as a positive value. Zero while importing.
pub fn export_power(raw: u16) -> f64 {
    (-power(raw)).max(0.0)
}

/// Power factor from `PowerF`. The register is sign-magnitude: bit 15 is the sign and the
/// remaining bits hold the magnitude in thousandths.
pub fn power_factor(raw: u16) -> f64 {
    sign_magnitude(raw) / 1000.0
}

/// Phase angle in degrees from `Pangle`, sign-magnitude in tenths of a degree.
pub fn phase_angle(raw: u16) -> f64 {
    sign_magnitude(raw) / 10.0
}

/// Energy in kWh from one of the accumulator registers.
pub fn energy(raw: u16) -> f64 {
    raw as f64 / 10_000.0
}

fn sign_magnitude(raw: u16) -> f64 {
    let magnitude = (raw & 0x7FFF) as f64;
    if raw & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}
