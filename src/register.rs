use bitflags::bitflags;

/// Value written to [`Register::SoftReset`] to reset the metering IC.
pub const SOFT_RESET: u16 = 0x789A;

/// `CalStart`/`AdjStart` content after power-on. Metering is disabled.
pub const POWER_ON: u16 = 0x6886;

/// `CalStart`/`AdjStart` sentinel that opens a calibration group for writing.
pub const START_CALIBRATION: u16 = 0x5678;

/// `CalStart`/`AdjStart` sentinel that validates the group checksum and starts
/// normal metering.
pub const COMMIT: u16 = 0x8765;

/// Registers of the ATM90E26.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    SoftReset = 0x00,
    SysStatus = 0x01,
    FuncEn = 0x02,
    SagTh = 0x03,
    SmallPMod = 0x04,
    LastData = 0x06,
    Lsb = 0x08,
    CalStart = 0x20,
    PLconstH = 0x21,
    PLconstL = 0x22,
    Lgain = 0x23,
    Lphi = 0x24,
    Ngain = 0x25,
    Nphi = 0x26,
    PStartTh = 0x27,
    PNolTh = 0x28,
    QStartTh = 0x29,
    QNolTh = 0x2A,
    MMode = 0x2B,
    CSOne = 0x2C,
    AdjStart = 0x30,
    Ugain = 0x31,
    IgainL = 0x32,
    IgainN = 0x33,
    Uoffset = 0x34,
    IoffsetL = 0x35,
    IoffsetN = 0x36,
    PoffsetL = 0x37,
    QoffsetL = 0x38,
    PoffsetN = 0x39,
    QoffsetN = 0x3A,
    CSTwo = 0x3B,
    APenergy = 0x40,
    ANenergy = 0x41,
    ATenergy = 0x42,
    RPenergy = 0x43,
    RNenergy = 0x44,
    RTenergy = 0x45,
    EnStatus = 0x46,
    Irms = 0x48,
    Urms = 0x49,
    Pmean = 0x4A,
    Qmean = 0x4B,
    Freq = 0x4C,
    PowerF = 0x4D,
    Pangle = 0x4E,
    Smean = 0x4F,
    IrmsTwo = 0x68,
    PmeanTwo = 0x6A,
    QmeanTwo = 0x6B,
    PowerFTwo = 0x6D,
    PangleTwo = 0x6E,
    SmeanTwo = 0x6F,
}

impl Register {
    /// Returns the 7-bit address of the register.
    pub fn addr(self) -> u8 {
        self as u8
    }

    /// Returns `true` for the energy accumulators, which the IC clears when they are read.
    pub fn is_clear_on_read(self) -> bool {
        (Register::APenergy.addr()..=Register::RTenergy.addr()).contains(&self.addr())
    }
}

/// Metering calibration group, covered by [`Register::CSOne`].
pub const CALIBRATION_GROUP: core::ops::RangeInclusive<u8> = 0x21..=0x2B;

/// Measurement calibration group, covered by [`Register::CSTwo`].
pub const MEASUREMENT_GROUP: core::ops::RangeInclusive<u8> = 0x31..=0x3A;

bitflags! {
    /// Content of [`Register::SysStatus`].
    pub struct SysStatus: u16 {
        /// Checksum 1 (`CSOne`) does not match the calibration group.
        const CS1_ERROR = 0xC000;
        /// Checksum 2 (`CSTwo`) does not match the measurement group.
        const CS2_ERROR = 0x3000;
        const LN_CHANGE = 0x0080;
        const REVQ_CHANGE = 0x0040;
        const REVP_CHANGE = 0x0020;
        const SAG_WARN = 0x0002;
    }
}

impl SysStatus {
    /// Returns `true` if either checksum error field is raised.
    pub fn has_checksum_error(&self) -> bool {
        self.intersects(SysStatus::CS1_ERROR | SysStatus::CS2_ERROR)
    }
}

bitflags! {
    /// Content of [`Register::EnStatus`].
    pub struct EnStatus: u16 {
        /// Reactive power is in no-load state.
        const Q_NOLOAD = 0x8000;
        /// Active power is in no-load state.
        const P_NOLOAD = 0x4000;
        /// Reactive power is reversed (CF2).
        const REVQ = 0x2000;
        /// Active power is reversed (CF1).
        const REVP = 0x1000;
        /// Metering follows the L line.
        const L_LINE = 0x0800;
        const LN_MODE = 0x0003;
    }
}

/// Gate state decoded from [`Register::CalStart`] or [`Register::AdjStart`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MeteringState {
    PowerOn,
    Calibrating,
    Running,
    Unknown(u16),
}

impl From<u16> for MeteringState {
    fn from(x: u16) -> Self {
        match x {
            POWER_ON => MeteringState::PowerOn,
            START_CALIBRATION => MeteringState::Calibrating,
            COMMIT => MeteringState::Running,
            other => MeteringState::Unknown(other),
        }
    }
}

/// Computes the checksum the metering IC expects for a calibration group, given the register
/// contents in address order. The high byte is the XOR of every register byte, the low byte is
/// their sum modulo 256.
pub fn checksum(words: &[u16]) -> u16 {
    let (xor, sum) = words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .fold((0u8, 0u8), |(xor, sum), b| (xor ^ b, sum.wrapping_add(b)));
    u16::from_be_bytes([xor, sum])
}
