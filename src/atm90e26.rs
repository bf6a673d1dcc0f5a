use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use log::{debug, info, warn};

use crate::calibration::{self, Calibration, ChecksumStore, Checksums};
use crate::convert;
use crate::interface::SpiInterface;
use crate::register::*;
use crate::{Error, Fault};

/// Function enables: voltage sag interrupt reported on the WarnOut pin.
const FUNC_EN: u16 = 0x0030;

/// Voltage sag threshold.
const SAG_TH: u16 = 0x17DD;

/// Represents an ATM90E26 energy metering IC on its own SPI chip select.
pub struct Atm90e26<SPI, NCS, D> {
    interface: SpiInterface<SPI, NCS, D>,
    calibration: Calibration,
    expected: Checksums,
    fault: Fault,
}

impl<SPI, NCS, D, S, P> Atm90e26<SPI, NCS, D>
where
    SPI: Transfer<u8, Error = S> + Write<u8, Error = S>,
    NCS: OutputPin<Error = P>,
    D: DelayUs<u32>,
{
    /// Creates a new [`Atm90e26`] with the default [`Calibration`]. The IC is not touched until
    /// [`Self::bootstrap()`] runs.
    /// # Arguments
    /// * `spi` - The SPI interface, configured for [`crate::MODE`] at [`crate::SPI_FREQUENCY_HZ`].
    /// * `ncs` - The chip select output pin.
    /// * `delay` - Microsecond delay source for the chip select timing.
    pub fn new(spi: SPI, ncs: NCS, delay: D) -> Self {
        Self::with_calibration(spi, ncs, delay, Calibration::default())
    }

    pub fn with_calibration(spi: SPI, ncs: NCS, delay: D, calibration: Calibration) -> Self {
        Atm90e26 {
            interface: SpiInterface::new(spi, ncs, delay),
            calibration,
            expected: Checksums::default(),
            fault: Fault::None,
        }
    }

    pub fn release(self) -> (SPI, NCS, D) {
        self.interface.release()
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Replaces the calibration gains. Only effective before [`Self::bootstrap()`].
    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    pub fn set_lgain(&mut self, lgain: u16) {
        self.calibration.lgain = lgain;
    }

    pub fn set_ugain(&mut self, ugain: u16) {
        self.calibration.ugain = ugain;
    }

    pub fn set_igain(&mut self, igain: u16) {
        self.calibration.igain = igain;
    }

    /// Fault raised by the last [`Self::bootstrap()`].
    pub fn fault(&self) -> Fault {
        self.fault
    }

    /// Brings the IC from reset to normal metering, programming the calibration gains together
    /// with the checksums held by `store`.
    ///
    /// If the IC rejects either checksum, the checksums it computed are written back to `store`
    /// and [`Fault::ChecksumPendingReboot`] is returned: the board has to be reset so that the
    /// next boot programs the corrected values. This must run once per boot, before any
    /// reading.
    pub fn bootstrap<ST: ChecksumStore>(&mut self, store: &mut ST) -> Result<Fault, Error<S, P, ST::Error>> {
        self.expected = store.load().map_err(Error::Storage)?;
        info!(
            "starting ATM90E26, stored checksums CS1 {:#06x} CS2 {:#06x}",
            self.expected.cs1, self.expected.cs2
        );
        let predicted = self.calibration.predicted_checksums();
        if predicted != self.expected {
            debug!(
                "stored checksums differ from predicted CS1 {:#06x} CS2 {:#06x}",
                predicted.cs1, predicted.cs2
            );
        }

        let raw_status = self.program().map_err(|e| e.widen())?;
        let status = SysStatus::from_bits_truncate(raw_status);
        if !status.has_checksum_error() {
            info!("ATM90E26 running");
            self.fault = Fault::None;
            return Ok(Fault::None);
        }

        if raw_status == 0xFFFF {
            warn!("system status reads 0xFFFF, the IC may be faulty");
        }
        let calculated = self.calculated_checksums().map_err(|e| e.widen())?;
        warn!(
            "checksum mismatch (status {:#06x}): CS1 {:#06x} -> {:#06x}, CS2 {:#06x} -> {:#06x}",
            raw_status,
            self.expected.cs1,
            calculated.cs1,
            self.expected.cs2,
            calculated.cs2
        );
        store.save(calculated).map_err(Error::Storage)?;
        info!("updated checksums stored, reset required");
        self.fault = Fault::ChecksumPendingReboot;
        Ok(self.fault)
    }

    /// Runs the register programming sequence and returns the resulting raw system status.
    fn program(&mut self) -> Result<u16, Error<S, P>> {
        let expected = self.expected;
        let gains = self.calibration;
        let bus = &mut self.interface;

        bus.init()?;
        bus.write(Register::SoftReset, SOFT_RESET)?;
        bus.write(Register::FuncEn, FUNC_EN)?;
        bus.write(Register::SagTh, SAG_TH)?;

        debug!("programming metering calibration group");
        bus.write(Register::CalStart, START_CALIBRATION)?;
        bus.write(Register::MMode, calibration::M_MODE)?;
        bus.write(Register::PLconstH, calibration::PL_CONST_H)?;
        bus.write(Register::PLconstL, calibration::PL_CONST_L)?;
        bus.write(Register::Lgain, gains.lgain)?;
        bus.write(Register::Lphi, calibration::L_PHI)?;
        bus.write(Register::PStartTh, calibration::P_START_TH)?;
        bus.write(Register::PNolTh, calibration::P_NOL_TH)?;
        bus.write(Register::QStartTh, calibration::Q_START_TH)?;
        bus.write(Register::QNolTh, calibration::Q_NOL_TH)?;
        bus.write(Register::CSOne, expected.cs1)?;

        debug!("programming measurement calibration group");
        bus.write(Register::AdjStart, START_CALIBRATION)?;
        bus.write(Register::Ugain, gains.ugain)?;
        bus.write(Register::IgainL, gains.igain)?;
        bus.write(Register::Uoffset, 0x0000)?;
        bus.write(Register::IoffsetL, 0x0000)?;
        bus.write(Register::PoffsetL, 0x0000)?;
        bus.write(Register::QoffsetL, 0x0000)?;
        bus.write(Register::CSTwo, expected.cs2)?;

        // Each commit checks its group against the checksum written above.
        bus.write(Register::CalStart, COMMIT)?;
        bus.write(Register::AdjStart, COMMIT)?;

        bus.read(Register::SysStatus)
    }

    /// Line voltage RMS in volts.
    pub fn line_voltage(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::voltage(self.interface.read(Register::Urms)?))
    }

    /// Line current RMS in amperes.
    pub fn line_current(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::current(self.interface.read(Register::Irms)?))
    }

    /// Line frequency in hertz.
    pub fn frequency(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::frequency(self.interface.read(Register::Freq)?))
    }

    /// Mean active power in watts, negative while exporting.
    pub fn active_power(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::power(self.active_power_raw()?))
    }

    /// Mean active power drawn from the grid in watts, zero while exporting.
    pub fn import_power(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::import_power(self.active_power_raw()?))
    }

    /// Mean active power fed to the grid in watts, zero while importing.
    pub fn export_power(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::export_power(self.active_power_raw()?))
    }

    /// Raw `Pmean` content, for callers that derive several quantities from one reading.
    pub fn active_power_raw(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::Pmean)
    }

    /// Mean reactive power in var.
    pub fn reactive_power(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::power(self.interface.read(Register::Qmean)?))
    }

    /// Mean apparent power in VA.
    pub fn apparent_power(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::power(self.interface.read(Register::Smean)?))
    }

    pub fn power_factor(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::power_factor(self.interface.read(Register::PowerF)?))
    }

    /// Phase angle between voltage and current in degrees.
    pub fn phase_angle(&mut self) -> Result<f64, Error<S, P>> {
        Ok(convert::phase_angle(self.interface.read(Register::Pangle)?))
    }

    /// Forward active energy in kWh accumulated since the previous read.
    ///
    /// The IC clears the accumulator on every read, so each call consumes the energy it
    /// returns. The same applies to every energy reading below.
    pub fn import_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::APenergy)
    }

    /// Reverse active energy in kWh accumulated since the previous read.
    pub fn export_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::ANenergy)
    }

    pub fn abs_active_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::ATenergy)
    }

    pub fn abs_reactive_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::RTenergy)
    }

    /// Forward (inductive) reactive energy in kvarh.
    pub fn reactive_fwd_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::RPenergy)
    }

    /// Reverse (capacitive) reactive energy in kvarh.
    pub fn reactive_rev_energy(&mut self) -> Result<f64, Error<S, P>> {
        self.energy(Register::RNenergy)
    }

    fn energy(&mut self, register: Register) -> Result<f64, Error<S, P>> {
        Ok(convert::energy(self.interface.read(register)?))
    }

    pub fn sys_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::SysStatus)
    }

    pub fn meter_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::EnStatus)
    }

    pub fn cal_start_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::CalStart)
    }

    pub fn adj_start_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::AdjStart)
    }

    pub fn mmode_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::MMode)
    }

    pub fn lsb_status(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::Lsb)
    }

    pub fn ugain(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::Ugain)
    }

    pub fn lgain(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::Lgain)
    }

    pub fn igain(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.read(Register::IgainL)
    }

    /// Checksum 1 as programmed at boot. Does not access the IC.
    pub fn cs1_expected(&self) -> u16 {
        self.expected.cs1
    }

    /// Checksum 2 as programmed at boot. Does not access the IC.
    pub fn cs2_expected(&self) -> u16 {
        self.expected.cs2
    }

    /// Checksum 1 as currently computed by the IC.
    pub fn cs1_calculated(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.transact(crate::Command::Read, Register::CSOne.addr(), 0x0000)
    }

    /// Checksum 2 as currently computed by the IC.
    pub fn cs2_calculated(&mut self) -> Result<u16, Error<S, P>> {
        self.interface.transact(crate::Command::Read, Register::CSTwo.addr(), 0x0000)
    }

    fn calculated_checksums(&mut self) -> Result<Checksums, Error<S, P>> {
        Ok(Checksums {
            cs1: self.cs1_calculated()?,
            cs2: self.cs2_calculated()?,
        })
    }

    /// Reads a snapshot of the status and configuration registers. None of them is an energy
    /// accumulator, so taking a snapshot does not disturb the readings.
    pub fn diagnostics(&mut self) -> Result<Diagnostics, Error<S, P>> {
        Ok(Diagnostics {
            sys_status: self.sys_status()?,
            meter_status: self.meter_status()?,
            mmode: self.mmode_status()?,
            cal_start: MeteringState::from(self.cal_start_status()?),
            adj_start: MeteringState::from(self.adj_start_status()?),
            ugain: self.ugain()?,
            lgain: self.lgain()?,
            igain: self.igain()?,
            expected: self.expected,
            calculated: self.calculated_checksums()?,
            lsb: self.lsb_status()?,
        })
    }
}

/// Snapshot of the IC state, as returned by [`Atm90e26::diagnostics()`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Raw `SysStatus`.
    pub sys_status: u16,
    /// Raw `EnStatus`.
    pub meter_status: u16,
    /// Raw `MMode`.
    pub mmode: u16,
    pub cal_start: MeteringState,
    pub adj_start: MeteringState,
    pub ugain: u16,
    pub lgain: u16,
    pub igain: u16,
    /// Checksums the driver programmed.
    pub expected: Checksums,
    /// Checksums the IC computed.
    pub calculated: Checksums,
    /// Raw `Lsb`.
    pub lsb: u16,
}

impl Diagnostics {
    pub fn checksums_match(&self) -> bool {
        self.expected == self.calculated
    }

    /// Returns `true` when the status registers hold values only a faulty IC reports.
    pub fn is_meter_stuck(&self) -> bool {
        self.meter_status == 0x0000 || self.sys_status == 0xFFFF
    }

    pub fn is_running(&self) -> bool {
        self.cal_start == MeteringState::Running && self.adj_start == MeteringState::Running
    }

    /// Writes the snapshot to the log.
    pub fn log(&self) {
        let sys = SysStatus::from_bits_truncate(self.sys_status);
        let meter = EnStatus::from_bits_truncate(self.meter_status);
        info!("SysStatus {:#06x} {:?}", self.sys_status, sys);
        info!("EnStatus  {:#06x} {:?}", self.meter_status, meter);
        info!("MMode     {:#06x}", self.mmode);
        info!("CalStart  {:?}, AdjStart {:?}", self.cal_start, self.adj_start);
        info!(
            "Ugain {:#06x}, Lgain {:#06x}, IgainL {:#06x}",
            self.ugain, self.lgain, self.igain
        );
        info!(
            "CS1 {:#06x} (IC {:#06x}), CS2 {:#06x} (IC {:#06x})",
            self.expected.cs1, self.calculated.cs1, self.expected.cs2, self.calculated.cs2
        );
        info!("LSB       {:#06x}", self.lsb);
        if !self.checksums_match() {
            warn!("programmed checksums differ from the ones computed by the IC");
        }
        if self.is_meter_stuck() {
            warn!("status registers indicate a hardware fault on the IC");
        }
    }
}
