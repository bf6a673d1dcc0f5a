use byteorder::{BigEndian, ByteOrder};
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use log::trace;

use crate::register::Register;
use crate::Error;

/// Dwell after asserting and after releasing chip select.
const CS_DWELL_US: u32 = 10;

/// Time the IC needs after the address byte before data is valid.
const DATA_VALID_US: u32 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
}

/// SPI link to the metering IC. One call to [`SpiInterface::transact`] is one complete frame:
/// an address byte carrying the read/write flag, followed by a 16-bit word sent most
/// significant byte first.
pub struct SpiInterface<SPI, NCS, D> {
    spi: SPI,
    ncs: NCS,
    delay: D,
}

impl<SPI, NCS, D, S, P> SpiInterface<SPI, NCS, D>
where
    SPI: Transfer<u8, Error = S> + Write<u8, Error = S>,
    NCS: OutputPin<Error = P>,
    D: DelayUs<u32>,
{
    pub fn new(spi: SPI, ncs: NCS, delay: D) -> Self {
        SpiInterface { spi, ncs, delay }
    }

    pub fn release(self) -> (SPI, NCS, D) {
        (self.spi, self.ncs, self.delay)
    }

    /// Drives chip select to its idle level.
    pub fn init(&mut self) -> Result<(), Error<S, P>> {
        self.ncs.set_high().map_err(Error::Pin)
    }

    /// Performs one register transaction. On a write `value` is sent and returned unchanged.
    /// On a read `value` is clocked out while the register content is clocked in and returned.
    pub fn transact(&mut self, command: Command, address: u8, value: u16) -> Result<u16, Error<S, P>> {
        debug_assert!(address <= 0x7F, "register address out of range: {:#04x}", address);
        self.ncs.set_low().map_err(Error::Pin)?;
        self.delay.delay_us(CS_DWELL_US);
        let result = self.frame(command, address, value);
        // Release the IC even if the frame failed half-way.
        let released = self.ncs.set_high().map_err(Error::Pin);
        self.delay.delay_us(CS_DWELL_US);
        let value = result?;
        released?;
        trace!("{:?} {:#04x} = {:#06x}", command, address, value);
        Ok(value)
    }

    pub fn read(&mut self, register: Register) -> Result<u16, Error<S, P>> {
        self.transact(Command::Read, register.addr(), 0xFFFF)
    }

    pub fn write(&mut self, register: Register, value: u16) -> Result<(), Error<S, P>> {
        self.transact(Command::Write, register.addr(), value).map(|_| ())
    }

    fn frame(&mut self, command: Command, address: u8, value: u16) -> Result<u16, Error<S, P>> {
        self.spi
            .write(&[get_frame(address, command)])
            .map_err(Error::Spi)?;
        self.delay.delay_us(DATA_VALID_US);
        let mut buffer = [0u8; 2];
        BigEndian::write_u16(&mut buffer, value);
        match command {
            Command::Write => {
                self.spi.write(&buffer).map_err(Error::Spi)?;
                Ok(value)
            }
            Command::Read => {
                let received = self.spi.transfer(&mut buffer).map_err(Error::Spi)?;
                Ok(BigEndian::read_u16(received))
            }
        }
    }
}

fn get_frame(address: u8, command: Command) -> u8 {
    let frame = address & 0x7F;
    match command {
        Command::Write => frame,
        Command::Read => frame | 0b1000_0000,
    }
}
