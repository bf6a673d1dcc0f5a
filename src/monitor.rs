//! Boot sequencing and periodic publishing of the metering readings.
//!
//! [`Monitor`] ties the driver to the two outputs of the board: a [`Publisher`] that forwards
//! readings to the home automation server, and a [`FaultIndicator`] that shows a pending
//! checksum recovery. The transport behind the publisher is not part of this crate.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use log::{debug, info, warn};

use crate::atm90e26::Atm90e26;
use crate::calibration::ChecksumStore;
use crate::convert;
use crate::{Error, Fault};

/// Time left for the logs to flush before the board is reset.
pub const REBOOT_DELAY_MS: u32 = 3_000;

/// Receives every published reading.
pub trait Publisher {
    /// Publishes `value` to the logical channel `channel_id`, which is never zero. Transport
    /// errors are the implementation's business.
    fn publish(&mut self, channel_id: u16, value: f32, label: &str);
}

/// Shows the fault state, typically with an LED pattern.
pub trait FaultIndicator {
    fn signal_fault(&mut self, fault: Fault);
}

/// Full reset of the microcontroller. On hardware this does not return.
pub trait SystemReset {
    fn reset(&mut self);
}

/// Quantities the monitor can publish, in publishing order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Channel {
    LineVoltage,
    LineCurrent,
    ActivePower,
    ImportPower,
    ExportPower,
    LineFrequency,
    PowerFactor,
    ImportEnergy,
    ExportEnergy,
    DcVoltage,
    PcbTemperature,
}

impl Channel {
    pub const ALL: [Channel; 11] = [
        Channel::LineVoltage,
        Channel::LineCurrent,
        Channel::ActivePower,
        Channel::ImportPower,
        Channel::ExportPower,
        Channel::LineFrequency,
        Channel::PowerFactor,
        Channel::ImportEnergy,
        Channel::ExportEnergy,
        Channel::DcVoltage,
        Channel::PcbTemperature,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Channel::LineVoltage => "LineVoltage",
            Channel::LineCurrent => "LineCurrent",
            Channel::ActivePower => "ActivePower",
            Channel::ImportPower => "ImportPower",
            Channel::ExportPower => "ExportPower",
            Channel::LineFrequency => "LineFrequency",
            Channel::PowerFactor => "PowerFactor",
            Channel::ImportEnergy => "ImportEnergy",
            Channel::ExportEnergy => "ExportEnergy",
            Channel::DcVoltage => "DCVoltage",
            Channel::PcbTemperature => "PCBTemperature",
        }
    }
}

/// Logical channel id of every [`Channel`]. Id `0` means the channel is not configured and is
/// neither read nor published.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    ids: [u16; 11],
}

impl ChannelMap {
    pub fn id(&self, channel: Channel) -> u16 {
        self.ids[channel as usize]
    }

    pub fn set(&mut self, channel: Channel, id: u16) {
        self.ids[channel as usize] = id;
    }

    /// Builder form of [`Self::set()`].
    pub fn with(mut self, channel: Channel, id: u16) -> Self {
        self.set(channel, id);
        self
    }

    pub fn is_configured(&self, channel: Channel) -> bool {
        self.id(channel) != 0
    }
}

/// Monitor configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    pub channels: ChannelMap,
    /// Gates publishing entirely. Off by default so a freshly flashed board can be calibrated
    /// before it reports anything.
    pub publish_enabled: bool,
    pub poll_interval_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: ChannelMap::default(),
            publish_enabled: false,
            poll_interval_ms: 1_000,
        }
    }
}

/// Readings from the board sensors outside the metering IC.
#[derive(Default, Debug, Copy, Clone, PartialEq)]
pub struct Auxiliary {
    /// DC input voltage in volts.
    pub dc_voltage: Option<f32>,
    /// PCB temperature in °C.
    pub pcb_temperature: Option<f32>,
}

/// Outcome of one [`Monitor::poll()`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// [`Monitor::start()`] has not run yet.
    NotStarted,
    /// A fault is pending, nothing was read.
    Faulted,
    /// Publishing is disabled, nothing was read.
    Disabled,
    /// Number of readings handed to the publisher.
    Published(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Faulted(Fault),
}

pub struct Monitor<SPI, NCS, D, PUB, FI> {
    meter: Atm90e26<SPI, NCS, D>,
    publisher: PUB,
    indicator: FI,
    config: Config,
    state: State,
}

impl<SPI, NCS, D, S, P, PUB, FI> Monitor<SPI, NCS, D, PUB, FI>
where
    SPI: Transfer<u8, Error = S> + Write<u8, Error = S>,
    NCS: OutputPin<Error = P>,
    D: DelayUs<u32>,
    PUB: Publisher,
    FI: FaultIndicator,
{
    pub fn new(meter: Atm90e26<SPI, NCS, D>, publisher: PUB, indicator: FI, config: Config) -> Self {
        Monitor {
            meter,
            publisher,
            indicator,
            config,
            state: State::Idle,
        }
    }

    pub fn release(self) -> (Atm90e26<SPI, NCS, D>, PUB, FI) {
        (self.meter, self.publisher, self.indicator)
    }

    pub fn meter(&self) -> &Atm90e26<SPI, NCS, D> {
        &self.meter
    }

    pub fn meter_mut(&mut self) -> &mut Atm90e26<SPI, NCS, D> {
        &mut self.meter
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Fault state since the last [`Self::start()`].
    pub fn fault(&self) -> Fault {
        match self.state {
            State::Faulted(fault) => fault,
            _ => Fault::None,
        }
    }

    /// Boots the board: prepares the checksum store, bootstraps the IC and reports the outcome
    /// to the fault indicator. When the IC rejected the stored checksums, waits
    /// [`REBOOT_DELAY_MS`] and requests a reset; if the reset returns, the monitor stays
    /// faulted and never publishes.
    pub fn start<ST, DM, R>(&mut self, store: &mut ST, delay: &mut DM, reset: &mut R) -> Result<Fault, Error<S, P, ST::Error>>
    where
        ST: ChecksumStore,
        DM: DelayMs<u32>,
        R: SystemReset,
    {
        store.prepare().map_err(Error::Storage)?;
        let fault = self.meter.bootstrap(store)?;
        self.indicator.signal_fault(fault);
        match fault {
            Fault::None => {
                info!("metering started");
                self.state = State::Running;
            }
            Fault::ChecksumPendingReboot => {
                self.state = State::Faulted(fault);
                warn!("rebooting in {} ms to apply the new checksums", REBOOT_DELAY_MS);
                delay.delay_ms(REBOOT_DELAY_MS);
                reset.reset();
            }
        }
        Ok(fault)
    }

    /// Runs one polling cycle: every configured channel is read once and published.
    pub fn poll(&mut self, aux: Auxiliary) -> Result<Poll, Error<S, P>> {
        match self.state {
            State::Idle => return Ok(Poll::NotStarted),
            State::Faulted(fault) => {
                self.indicator.signal_fault(fault);
                return Ok(Poll::Faulted);
            }
            State::Running => {}
        }
        if !self.config.publish_enabled {
            return Ok(Poll::Disabled);
        }

        // Pmean feeds three channels but is read once per cycle.
        let mut pmean = None;
        let mut published = 0;
        for channel in Channel::ALL {
            let id = self.config.channels.id(channel);
            if id == 0 {
                continue;
            }
            let value = match channel {
                Channel::LineVoltage => Some(self.meter.line_voltage()?),
                Channel::LineCurrent => Some(self.meter.line_current()?),
                Channel::ActivePower => Some(convert::power(self.pmean(&mut pmean)?)),
                Channel::ImportPower => Some(convert::import_power(self.pmean(&mut pmean)?)),
                Channel::ExportPower => Some(convert::export_power(self.pmean(&mut pmean)?)),
                Channel::LineFrequency => Some(self.meter.frequency()?),
                Channel::PowerFactor => Some(self.meter.power_factor()?),
                Channel::ImportEnergy => Some(self.meter.import_energy()?),
                Channel::ExportEnergy => Some(self.meter.export_energy()?),
                Channel::DcVoltage => aux.dc_voltage.map(f64::from),
                Channel::PcbTemperature => aux.pcb_temperature.map(f64::from),
            };
            if let Some(value) = value {
                debug!("publishing {} = {} to #{}", channel.label(), value, id);
                self.publisher.publish(id, value as f32, channel.label());
                published += 1;
            }
        }
        Ok(Poll::Published(published))
    }

    /// Polls once, then sleeps for the configured interval.
    pub fn run_cycle<DM: DelayMs<u32>>(&mut self, aux: Auxiliary, delay: &mut DM) -> Result<Poll, Error<S, P>> {
        let poll = self.poll(aux)?;
        delay.delay_ms(self.config.poll_interval_ms);
        Ok(poll)
    }

    fn pmean(&mut self, cache: &mut Option<u16>) -> Result<u16, Error<S, P>> {
        match *cache {
            Some(raw) => Ok(raw),
            None => {
                let raw = self.meter.active_power_raw()?;
                *cache = Some(raw);
                Ok(raw)
            }
        }
    }
}
