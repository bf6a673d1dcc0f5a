//! Calibration constants and the persistent checksum pair programmed into the IC at boot.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};

use crate::eeprom::{Eeprom, EepromError, EepromState};
use crate::register::checksum;

/// EEPROM offset of the calibration group checksum (`CSOne`).
pub const CS1_OFFSET: u16 = 0x1C;

/// EEPROM offset of the measurement group checksum (`CSTwo`).
pub const CS2_OFFSET: u16 = 0x1E;

// Fixed content of the metering calibration group.
pub(crate) const PL_CONST_H: u16 = 0x05CD;
pub(crate) const PL_CONST_L: u16 = 0xBB1C;
pub(crate) const L_PHI: u16 = 0x0000;
pub(crate) const P_START_TH: u16 = 0x08BD;
pub(crate) const P_NOL_TH: u16 = 0x0000;
pub(crate) const Q_START_TH: u16 = 0x0AEC;
pub(crate) const Q_NOL_TH: u16 = 0x0000;
pub(crate) const M_MODE: u16 = 0x9422;

// Reset values of the N-line registers, which are never written.
const N_GAIN_RESET: u16 = 0x0000;
const N_PHI_RESET: u16 = 0x0000;
const I_GAIN_N_RESET: u16 = 0x7530;

/// Per-board gains, usually derived with the calibration spreadsheet. Changing any of them
/// invalidates the stored checksums, which the boot sequence then recovers from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Calibration {
    /// L line calibration gain (`Lgain`).
    pub lgain: u16,
    /// Voltage RMS gain (`Ugain`).
    pub ugain: u16,
    /// L line current RMS gain (`IgainL`).
    pub igain: u16,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            lgain: 0x1D39,
            ugain: 0xA028,
            igain: 0x7DFB,
        }
    }
}

impl Calibration {
    /// Predicts the checksums the IC will compute for this calibration. The IC remains the
    /// authority; the prediction is only used for diagnostics.
    pub fn predicted_checksums(&self) -> Checksums {
        let calibration_group = [
            PL_CONST_H,
            PL_CONST_L,
            self.lgain,
            L_PHI,
            N_GAIN_RESET,
            N_PHI_RESET,
            P_START_TH,
            P_NOL_TH,
            Q_START_TH,
            Q_NOL_TH,
            M_MODE,
        ];
        // Ugain, IgainL, IgainN, then the seven offsets which are all zero.
        let measurement_group = [
            self.ugain,
            self.igain,
            I_GAIN_N_RESET,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        Checksums {
            cs1: checksum(&calibration_group),
            cs2: checksum(&measurement_group),
        }
    }
}

/// Checksums of the calibration (`cs1`) and measurement (`cs2`) groups.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub cs1: u16,
    pub cs2: u16,
}

/// Non-volatile home of the expected checksums.
pub trait ChecksumStore {
    type Error;

    /// Makes the store usable. Called once per boot before [`ChecksumStore::load`].
    fn prepare(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn load(&mut self) -> Result<Checksums, Self::Error>;

    fn save(&mut self, checksums: Checksums) -> Result<(), Self::Error>;
}

/// [`ChecksumStore`] kept in the board EEPROM at [`CS1_OFFSET`] and [`CS2_OFFSET`].
pub struct CalibrationStore<I2C, D> {
    eeprom: Eeprom<I2C, D>,
    state: Option<EepromState>,
}

impl<I2C, D, I> CalibrationStore<I2C, D>
where
    I2C: Write<Error = I> + WriteRead<Error = I>,
    D: DelayMs<u32>,
{
    pub fn new(eeprom: Eeprom<I2C, D>) -> Self {
        CalibrationStore { eeprom, state: None }
    }

    pub fn release(self) -> Eeprom<I2C, D> {
        self.eeprom
    }

    /// State reported by the EEPROM initialization, once [`ChecksumStore::prepare`] ran.
    pub fn state(&self) -> Option<EepromState> {
        self.state
    }

    pub fn eeprom(&mut self) -> &mut Eeprom<I2C, D> {
        &mut self.eeprom
    }
}

impl<I2C, D, I> ChecksumStore for CalibrationStore<I2C, D>
where
    I2C: Write<Error = I> + WriteRead<Error = I>,
    D: DelayMs<u32>,
{
    type Error = EepromError<I>;

    fn prepare(&mut self) -> Result<(), Self::Error> {
        self.state = Some(self.eeprom.initialize()?);
        Ok(())
    }

    fn load(&mut self) -> Result<Checksums, Self::Error> {
        Ok(Checksums {
            cs1: self.eeprom.read16(CS1_OFFSET)?,
            cs2: self.eeprom.read16(CS2_OFFSET)?,
        })
    }

    fn save(&mut self, checksums: Checksums) -> Result<(), Self::Error> {
        self.eeprom.write16(CS1_OFFSET, checksums.cs1)?;
        self.eeprom.write16(CS2_OFFSET, checksums.cs2)
    }
}
