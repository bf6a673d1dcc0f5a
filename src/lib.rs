//! Platform-agnostic driver for the ATM90E26 single-phase energy metering IC, using the
//! [`embedded-hal`](https://github.com/rust-embedded/embedded-hal) traits.
//!
//! Besides register access and unit conversion, the crate carries the calibration lifecycle
//! of a board built around the IC: the expected calibration checksums live in a small I²C
//! EEPROM, are programmed into the IC on every boot, and are replaced by the checksums the IC
//! computed itself whenever it rejects them. The firmware then reboots, and the next boot
//! commits cleanly.
//!
//! ```ignore
//! use atm90e26::*;
//!
//! let meter = Atm90e26::new(spi, ncs, delay_us);
//! let mut store = CalibrationStore::new(Eeprom::new(i2c, delay_eeprom));
//! let mut monitor = Monitor::new(meter, publisher, led, Config::default());
//! monitor.start(&mut store, &mut delay_ms, &mut reset)?;
//! loop {
//!     monitor.run_cycle(Auxiliary::default(), &mut delay_ms)?;
//! }
//! ```

#![no_std]

use core::convert::Infallible;

use embedded_hal::spi::{Mode, MODE_3};

pub use atm90e26::{Atm90e26, Diagnostics};
pub use calibration::{Calibration, CalibrationStore, ChecksumStore, Checksums};
pub use eeprom::{Eeprom, EepromError, EepromState};
pub use interface::{Command, SpiInterface};
pub use monitor::{
    Auxiliary, Channel, ChannelMap, Config, FaultIndicator, Monitor, Poll, Publisher, SystemReset,
};
pub use register::{EnStatus, MeteringState, Register, SysStatus};

mod atm90e26;
pub mod calibration;
pub mod convert;
pub mod eeprom;
mod interface;
pub mod monitor;
pub mod register;

/// SPI mode of the metering IC (CPOL = 1, CPHA = 1, MSB first).
pub const MODE: Mode = MODE_3;

/// SPI clock the metering IC is specified for.
pub const SPI_FREQUENCY_HZ: u32 = 200_000;

/// Fault state reported to the fault indicator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    None,
    /// The IC rejected the stored checksums. The checksums it computed have been written to
    /// the EEPROM and the board must be reset before metering can start.
    ChecksumPendingReboot,
}

/// Represents the possible errors. `S` is the SPI error, `P` the chip-select pin error and
/// `E` the error of the checksum store, for operations that touch it.
#[derive(Debug, PartialEq, Eq)]
pub enum Error<S, P, E = Infallible> {
    Spi(S),
    Pin(P),
    Storage(E),
}

impl<S, P> Error<S, P> {
    /// Lifts a bus error into an error that may also come from a checksum store.
    pub fn widen<E>(self) -> Error<S, P, E> {
        match self {
            Error::Spi(e) => Error::Spi(e),
            Error::Pin(e) => Error::Pin(e),
            Error::Storage(never) => match never {},
        }
    }
}
