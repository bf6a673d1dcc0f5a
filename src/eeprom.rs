//! AT24C64 serial EEPROM (8192 × 8, 32-byte pages) on the I²C bus.
//!
//! Offset 0 holds a validation byte that marks the memory as initialized. Offset 1 is a lock
//! byte that, when set, forbids the first-boot erase.

use byteorder::{ByteOrder, LittleEndian};
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use log::{info, warn};

/// 7-bit I²C address with A0..A2 strapped low.
pub const ADDRESS: u8 = 0x50;

pub const SIZE: usize = 8192;

pub const PAGE_SIZE: usize = 32;

/// Validation byte content of an initialized EEPROM.
pub const VALIDATION: u8 = 0x20;

/// Lock byte content that forbids erasing the EEPROM.
pub const LOCKED: u8 = 0x99;

const VALIDATION_OFFSET: u16 = 0x00;
const LOCK_OFFSET: u16 = 0x01;

/// Self-timed write cycle of the AT24C64.
const WRITE_CYCLE_MS: u32 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum EepromError<I> {
    I2c(I),
    OutOfRange,
}

/// Outcome of [`Eeprom::initialize`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EepromState {
    /// The validation byte was already present.
    Ready,
    /// The memory was zeroed and the validation byte written.
    Erased,
    /// The memory is not initialized but the lock byte forbids erasing it.
    Locked,
}

pub struct Eeprom<I2C, D> {
    i2c: I2C,
    delay: D,
}

impl<I2C, D, I> Eeprom<I2C, D>
where
    I2C: Write<Error = I> + WriteRead<Error = I>,
    D: DelayMs<u32>,
{
    pub fn new(i2c: I2C, delay: D) -> Self {
        Eeprom { i2c, delay }
    }

    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    pub fn read8(&mut self, offset: u16) -> Result<u8, EepromError<I>> {
        let mut buffer = [0u8; 1];
        self.read(offset, &mut buffer)?;
        Ok(buffer[0])
    }

    pub fn write8(&mut self, offset: u16, value: u8) -> Result<(), EepromError<I>> {
        self.write_page(offset, &[value])
    }

    /// Reads a 16-bit value stored low byte first.
    pub fn read16(&mut self, offset: u16) -> Result<u16, EepromError<I>> {
        let mut buffer = [0u8; 2];
        self.read(offset, &mut buffer)?;
        Ok(LittleEndian::read_u16(&buffer))
    }

    /// Writes a 16-bit value low byte first.
    pub fn write16(&mut self, offset: u16, value: u16) -> Result<(), EepromError<I>> {
        check_range(offset, 2)?;
        let mut buffer = [0u8; 2];
        LittleEndian::write_u16(&mut buffer, value);
        self.write8(offset, buffer[0])?;
        self.write8(offset + 1, buffer[1])
    }

    /// Sequential read starting at `offset`.
    pub fn read(&mut self, offset: u16, buffer: &mut [u8]) -> Result<(), EepromError<I>> {
        check_range(offset, buffer.len())?;
        self.i2c
            .write_read(ADDRESS, &offset.to_be_bytes(), buffer)
            .map_err(EepromError::I2c)
    }

    /// Writes `data` within a single page, then waits for the write cycle to complete. Writes
    /// that would wrap around the end of the page are rejected.
    pub fn write_page(&mut self, offset: u16, data: &[u8]) -> Result<(), EepromError<I>> {
        check_range(offset, data.len())?;
        let page_offset = offset as usize % PAGE_SIZE;
        if data.is_empty() || page_offset + data.len() > PAGE_SIZE {
            return Err(EepromError::OutOfRange);
        }
        let mut frame = [0u8; 2 + PAGE_SIZE];
        frame[..2].copy_from_slice(&offset.to_be_bytes());
        frame[2..2 + data.len()].copy_from_slice(data);
        self.i2c
            .write(ADDRESS, &frame[..2 + data.len()])
            .map_err(EepromError::I2c)?;
        self.delay.delay_ms(WRITE_CYCLE_MS);
        Ok(())
    }

    /// Prepares the EEPROM for use. Unless the validation byte is present, every byte after it
    /// is zeroed and the validation byte is written, provided the lock byte allows it.
    pub fn initialize(&mut self) -> Result<EepromState, EepromError<I>> {
        if self.read8(VALIDATION_OFFSET)? == VALIDATION {
            return Ok(EepromState::Ready);
        }
        if self.read8(LOCK_OFFSET)? == LOCKED {
            warn!("EEPROM not initialized and locked, leaving it untouched");
            return Ok(EepromState::Locked);
        }
        info!("preparing new EEPROM");
        let zeros = [0u8; PAGE_SIZE];
        let mut offset = LOCK_OFFSET as usize;
        while offset < SIZE {
            let len = PAGE_SIZE - offset % PAGE_SIZE;
            self.write_page(offset as u16, &zeros[..len])?;
            offset += len;
        }
        self.write8(VALIDATION_OFFSET, VALIDATION)?;
        info!("EEPROM ready");
        Ok(EepromState::Erased)
    }
}

fn check_range<I>(offset: u16, len: usize) -> Result<(), EepromError<I>> {
    if offset as usize + len > SIZE {
        Err(EepromError::OutOfRange)
    } else {
        Ok(())
    }
}
