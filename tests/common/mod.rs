#![allow(dead_code)]

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use atm90e26::register::{checksum, Register, CALIBRATION_GROUP, COMMIT, MEASUREMENT_GROUP, POWER_ON, SOFT_RESET};
use atm90e26::{
    Atm90e26, Calibration, CalibrationStore, Eeprom, Fault, FaultIndicator, Monitor, Publisher,
    SystemReset,
};
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::blocking::{i2c, spi};
use embedded_hal::digital::v2::OutputPin;
use embedded_hal_mock::delay::MockNoop;

pub type TestMeter = Atm90e26<FakeSpi, FakeCs, MockNoop>;
pub type TestMonitor = Monitor<FakeSpi, FakeCs, MockNoop, RecordingPublisher, RecordingIndicator>;
pub type TestStore = CalibrationStore<FakeEeprom, MockNoop>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Address,
    Data { address: u8, read: bool },
}

struct MeterState {
    registers: [u16; 128],
    stuck: bool,
    phase: Phase,
    writes: Vec<(u8, u16)>,
    reads: Vec<u8>,
}

impl MeterState {
    fn power_on(&mut self) {
        self.registers = [0; 128];
        self.registers[Register::CalStart as usize] = POWER_ON;
        self.registers[Register::AdjStart as usize] = POWER_ON;
        self.registers[Register::IgainN as usize] = 0x7530;
        self.registers[Register::EnStatus as usize] = 0x0800;
    }

    fn group_checksum(&self, group: core::ops::RangeInclusive<u8>) -> u16 {
        let words: Vec<u16> = group.map(|a| self.registers[a as usize]).collect();
        checksum(&words)
    }

    fn commit(&mut self, group: core::ops::RangeInclusive<u8>, cs: Register, error_bits: u16) {
        let matches = self.group_checksum(group) == self.registers[cs as usize];
        let status = &mut self.registers[Register::SysStatus as usize];
        if matches {
            *status &= !error_bits;
        } else {
            *status |= error_bits;
        }
    }

    fn write(&mut self, address: u8, value: u16) {
        self.writes.push((address, value));
        if self.stuck {
            return;
        }
        match address {
            a if a == Register::SoftReset.addr() => {
                if value == SOFT_RESET {
                    self.power_on();
                }
            }
            a if a == Register::CalStart.addr() => {
                if value == COMMIT {
                    self.commit(CALIBRATION_GROUP, Register::CSOne, 0xC000);
                }
                self.registers[a as usize] = value;
            }
            a if a == Register::AdjStart.addr() => {
                if value == COMMIT {
                    self.commit(MEASUREMENT_GROUP, Register::CSTwo, 0x3000);
                }
                self.registers[a as usize] = value;
            }
            a => self.registers[a as usize] = value,
        }
    }

    fn read(&mut self, address: u8) -> u16 {
        self.reads.push(address);
        if self.stuck {
            return 0xFFFF;
        }
        match address {
            a if a == Register::CSOne.addr() => self.group_checksum(CALIBRATION_GROUP),
            a if a == Register::CSTwo.addr() => self.group_checksum(MEASUREMENT_GROUP),
            a if (0x40..=0x45).contains(&a) => {
                let value = self.registers[a as usize];
                self.registers[a as usize] = 0;
                value
            }
            a => self.registers[a as usize],
        }
    }
}

/// Register-level model of an ATM90E26: soft reset, checksum validation on commit, checksum
/// read-back and clear-on-read energy accumulators. A stuck model answers `0xFFFF` to every
/// read and ignores writes.
#[derive(Clone)]
pub struct FakeMeter {
    state: Rc<RefCell<MeterState>>,
}

impl FakeMeter {
    pub fn new() -> Self {
        let mut state = MeterState {
            registers: [0; 128],
            stuck: false,
            phase: Phase::Idle,
            writes: Vec::new(),
            reads: Vec::new(),
        };
        state.power_on();
        FakeMeter {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn stuck() -> Self {
        let meter = Self::new();
        meter.state.borrow_mut().stuck = true;
        meter
    }

    pub fn bus(&self) -> (FakeSpi, FakeCs) {
        (
            FakeSpi {
                state: self.state.clone(),
            },
            FakeCs {
                state: self.state.clone(),
            },
        )
    }

    pub fn driver(&self, calibration: Calibration) -> TestMeter {
        let (spi, cs) = self.bus();
        Atm90e26::with_calibration(spi, cs, MockNoop::new(), calibration)
    }

    /// Hardware reset of the board.
    pub fn power_cycle(&self) {
        let mut state = self.state.borrow_mut();
        state.power_on();
        state.phase = Phase::Idle;
    }

    pub fn register(&self, register: Register) -> u16 {
        self.state.borrow().registers[register as usize]
    }

    pub fn set(&self, register: Register, value: u16) {
        self.state.borrow_mut().registers[register as usize] = value;
    }

    pub fn writes(&self) -> Vec<(u8, u16)> {
        self.state.borrow().writes.clone()
    }

    pub fn reads(&self) -> Vec<u8> {
        self.state.borrow().reads.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.borrow_mut();
        state.writes.clear();
        state.reads.clear();
    }
}

pub struct FakeSpi {
    state: Rc<RefCell<MeterState>>,
}

impl spi::Write<u8> for FakeSpi {
    type Error = Infallible;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        match state.phase {
            Phase::Address => {
                assert_eq!(words.len(), 1, "address phase carries one byte");
                state.phase = Phase::Data {
                    address: words[0] & 0x7F,
                    read: words[0] & 0x80 != 0,
                };
            }
            Phase::Data { address, read: false } => {
                assert_eq!(words.len(), 2, "data phase carries two bytes");
                state.write(address, u16::from_be_bytes([words[0], words[1]]));
                state.phase = Phase::Idle;
            }
            _ => panic!("unexpected SPI write {:02x?}", words),
        }
        Ok(())
    }
}

impl spi::Transfer<u8> for FakeSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut state = self.state.borrow_mut();
        match state.phase {
            Phase::Data { address, read: true } => {
                assert_eq!(words.len(), 2, "data phase carries two bytes");
                let value = state.read(address);
                words.copy_from_slice(&value.to_be_bytes());
                state.phase = Phase::Idle;
            }
            _ => panic!("unexpected SPI transfer"),
        }
        Ok(words)
    }
}

pub struct FakeCs {
    state: Rc<RefCell<MeterState>>,
}

impl OutputPin for FakeCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().phase = Phase::Address;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        assert!(
            matches!(state.phase, Phase::Idle | Phase::Address),
            "chip select released mid-frame"
        );
        state.phase = Phase::Idle;
        Ok(())
    }
}

struct Memory {
    bytes: Vec<u8>,
    pointer: usize,
    writes: usize,
}

/// AT24C64 model: two-byte word address, page writes that wrap within their 32-byte page and
/// sequential reads.
#[derive(Clone)]
pub struct FakeEeprom {
    memory: Rc<RefCell<Memory>>,
}

impl FakeEeprom {
    /// A never-written part, every byte reads `0xFF`.
    pub fn blank() -> Self {
        FakeEeprom {
            memory: Rc::new(RefCell::new(Memory {
                bytes: vec![0xFF; 8192],
                pointer: 0,
                writes: 0,
            })),
        }
    }

    /// An initialized part holding the given checksums.
    pub fn with_checksums(cs1: u16, cs2: u16) -> Self {
        let eeprom = Self::blank();
        {
            let mut memory = eeprom.memory.borrow_mut();
            memory.bytes.iter_mut().for_each(|b| *b = 0);
            memory.bytes[0] = 0x20;
            memory.bytes[0x1C..0x1E].copy_from_slice(&cs1.to_le_bytes());
            memory.bytes[0x1E..0x20].copy_from_slice(&cs2.to_le_bytes());
        }
        eeprom
    }

    pub fn byte(&self, offset: usize) -> u8 {
        self.memory.borrow().bytes[offset]
    }

    pub fn set_byte(&self, offset: usize, value: u8) {
        self.memory.borrow_mut().bytes[offset] = value;
    }

    pub fn word(&self, offset: usize) -> u16 {
        let memory = self.memory.borrow();
        u16::from_le_bytes([memory.bytes[offset], memory.bytes[offset + 1]])
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.memory.borrow().bytes.clone()
    }

    /// Number of write cycles, i.e. write transactions carrying data.
    pub fn write_count(&self) -> usize {
        self.memory.borrow().writes
    }

    pub fn store(&self) -> TestStore {
        CalibrationStore::new(Eeprom::new(self.clone(), MockNoop::new()))
    }
}

impl i2c::Write for FakeEeprom {
    type Error = Infallible;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        assert_eq!(address, 0x50);
        assert!(bytes.len() >= 2, "missing word address");
        let mut memory = self.memory.borrow_mut();
        let start = u16::from_be_bytes([bytes[0], bytes[1]]) as usize % 8192;
        let page = start - start % 32;
        for (i, b) in bytes[2..].iter().enumerate() {
            memory.bytes[page + (start % 32 + i) % 32] = *b;
        }
        if bytes.len() > 2 {
            memory.writes += 1;
        }
        memory.pointer = start;
        Ok(())
    }
}

impl i2c::WriteRead for FakeEeprom {
    type Error = Infallible;

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), Self::Error> {
        assert_eq!(address, 0x50);
        assert_eq!(bytes.len(), 2, "word address only");
        let mut memory = self.memory.borrow_mut();
        let start = u16::from_be_bytes([bytes[0], bytes[1]]) as usize % 8192;
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = memory.bytes[(start + i) % 8192];
        }
        memory.pointer = (start + buffer.len()) % 8192;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Vec<(u16, f32, String)>,
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, channel_id: u16, value: f32, label: &str) {
        self.published.push((channel_id, value, label.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingIndicator {
    pub signals: Vec<Fault>,
}

impl FaultIndicator for RecordingIndicator {
    fn signal_fault(&mut self, fault: Fault) {
        self.signals.push(fault);
    }
}

#[derive(Default)]
pub struct RecordingReset {
    pub resets: usize,
}

impl SystemReset for RecordingReset {
    fn reset(&mut self) {
        self.resets += 1;
    }
}

#[derive(Default)]
pub struct RecordingDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for RecordingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
    }
}

impl DelayUs<u32> for RecordingDelay {
    fn delay_us(&mut self, _us: u32) {}
}

/// Result of one simulated boot.
pub struct Boot {
    pub monitor: TestMonitor,
    pub fault: Fault,
    pub delay: RecordingDelay,
    pub reset: RecordingReset,
}

/// Boots a board made of `meter` and `eeprom` the way the firmware does after a reset.
pub fn boot(meter: &FakeMeter, eeprom: &FakeEeprom, calibration: Calibration, config: atm90e26::Config) -> Boot {
    meter.power_cycle();
    let mut monitor = Monitor::new(
        meter.driver(calibration),
        RecordingPublisher::default(),
        RecordingIndicator::default(),
        config,
    );
    let mut store = eeprom.store();
    let mut delay = RecordingDelay::default();
    let mut reset = RecordingReset::default();
    let fault = monitor
        .start(&mut store, &mut delay, &mut reset)
        .expect("boot to complete");
    Boot {
        monitor,
        fault,
        delay,
        reset,
    }
}

/// Board programmed with the default calibration and matching checksums.
pub fn running_board(config: atm90e26::Config) -> (FakeMeter, FakeEeprom, Boot) {
    let meter = FakeMeter::new();
    let eeprom = FakeEeprom::with_checksums(0xAE70, 0x4BE5);
    let boot = boot(&meter, &eeprom, Calibration::default(), config);
    assert_eq!(boot.fault, Fault::None);
    meter.clear_log();
    (meter, eeprom, boot)
}
