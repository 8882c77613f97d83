//! Boundary to the controller-specific hardware driver.
//!
//! Everything register-level (clock generation, FIFO/DMA programming,
//! interrupt handling) lives behind [`HostDevice`]; this crate only issues
//! commands and pushes whole [`BusConfig`] snapshots through it.

use bitflags::bitflags;

use crate::err::SdError;
use crate::sd::cmd::{SdCommand, SdResponse};
use crate::sd::constant::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCaps: u32 {
        const BUS_WIDTH_4 = 1 << 0;
        const HIGH_SPEED = 1 << 1;
        const UHS_SDR12 = 1 << 2;
        const UHS_SDR25 = 1 << 3;
        const UHS_SDR50 = 1 << 4;
        const UHS_SDR104 = 1 << 5;
        const UHS_DDR50 = 1 << 6;
        const FULL_POWER_CYCLE = 1 << 7;
    }
}

impl HostCaps {
    pub fn supports_uhs(self) -> bool {
        self.intersects(
            HostCaps::UHS_SDR12
                | HostCaps::UHS_SDR25
                | HostCaps::UHS_SDR50
                | HostCaps::UHS_SDR104
                | HostCaps::UHS_DDR50,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    Width1,
    Width4,
}

impl BusWidth {
    /// ACMD6 argument encoding.
    pub fn bus_width_arg(self) -> u32 {
        match self {
            BusWidth::Width1 => 0,
            BusWidth::Width4 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVoltage {
    Voltage330,
    Voltage180,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStrength {
    TypeB,
    TypeA,
    TypeC,
    TypeD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMode {
    Legacy,
    SdHighSpeed,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
}

impl TimingMode {
    /// Fixed maximum clock rate for the mode.
    pub fn max_clock(self) -> u32 {
        match self {
            TimingMode::Legacy => SD_CLOCK_DEFAULT_SPEED,
            TimingMode::SdHighSpeed => SD_CLOCK_HIGH_SPEED,
            TimingMode::UhsSdr12 => SD_CLOCK_SDR12,
            TimingMode::UhsSdr25 => SD_CLOCK_SDR25,
            TimingMode::UhsSdr50 => SD_CLOCK_SDR50,
            TimingMode::UhsSdr104 => SD_CLOCK_SDR104,
            TimingMode::UhsDdr50 => SD_CLOCK_DDR50,
        }
    }

    /// CMD6 group-0 function value selecting this mode on the card.
    pub fn access_mode(self) -> u8 {
        match self {
            TimingMode::Legacy | TimingMode::UhsSdr12 => SD_ACCESS_MODE_DEFAULT,
            TimingMode::SdHighSpeed | TimingMode::UhsSdr25 => SD_ACCESS_MODE_HIGH_SPEED,
            TimingMode::UhsSdr50 => SD_ACCESS_MODE_SDR50,
            TimingMode::UhsSdr104 => SD_ACCESS_MODE_SDR104,
            TimingMode::UhsDdr50 => SD_ACCESS_MODE_DDR50,
        }
    }

    /// SDR50 and above in the UHS priority ordering (SDR104, DDR50, SDR50).
    /// These modes take a current-limit negotiation and a tuning pass.
    pub fn is_fast_uhs(self) -> bool {
        matches!(
            self,
            TimingMode::UhsSdr50 | TimingMode::UhsSdr104 | TimingMode::UhsDdr50
        )
    }
}

/// Current electrical/timing state of the bus. Mutated only on the protocol
/// domain and always handed to the host as a whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub clock: u32,
    /// Bit index of the selected window in the OCR voltage mask.
    pub voltage_bit: u32,
    pub power_mode: PowerMode,
    pub bus_width: BusWidth,
    pub timing: TimingMode,
    pub signal_voltage: SignalVoltage,
    pub driver_strength: DriverStrength,
}

impl BusConfig {
    pub fn powered_off() -> Self {
        Self {
            clock: 0,
            voltage_bit: 0,
            power_mode: PowerMode::Off,
            bus_width: BusWidth::Width1,
            timing: TimingMode::Legacy,
            signal_voltage: SignalVoltage::Voltage330,
            driver_strength: DriverStrength::TypeB,
        }
    }
}

/// DMA engine limits reported by the host controller.
#[derive(Debug, Clone, Copy)]
pub struct DmaLimits {
    pub max_segments: u32,
    pub max_segment_bytes: u32,
    pub max_request_bytes: u32,
}

impl DmaLimits {
    /// Largest block count a single transaction may carry, bounded by
    /// both the per-request cap and what the segment table can map.
    pub fn max_blocks_per_transaction(&self) -> u32 {
        let segment_bound = self.max_segments.saturating_mul(self.max_segment_bytes);
        self.max_request_bytes.min(segment_bound) / SD_BLOCK_SIZE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClockRange {
    pub min_hz: u32,
    pub max_hz: u32,
}

impl ClockRange {
    pub fn contains(&self, hz: u32) -> bool {
        hz >= self.min_hz && hz <= self.max_hz
    }
}

/// Data phase of a command, borrowed from the request being serviced.
pub enum DataTransfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl DataTransfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataTransfer::Read(buf) => buf.len(),
            DataTransfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Abstract host controller consumed by the protocol layer.
///
/// Implementations own the register-level access; callers guarantee that
/// every method is invoked from a single protocol context at a time.
pub trait HostDevice: Send {
    /// Issue one command round-trip, moving the data phase if present.
    fn send_command(
        &mut self,
        cmd: &SdCommand,
        data: Option<DataTransfer<'_>>,
    ) -> Result<SdResponse, SdError>;

    /// Apply a whole bus-configuration snapshot.
    fn set_bus_config(&mut self, config: &BusConfig) -> Result<(), SdError>;

    /// Drive the signal lines to the voltage in `config.signal_voltage`.
    fn switch_signal_voltage(&mut self, config: &BusConfig) -> Result<(), SdError>;

    /// Run the sampling-clock calibration sequence for the current timing.
    fn execute_tuning(&mut self, config: &BusConfig) -> Result<(), SdError>;

    fn is_card_present(&mut self) -> bool;
    fn is_card_write_protected(&mut self) -> bool;
    fn is_command_line_busy(&mut self) -> bool;
    fn is_data_line_busy(&mut self) -> bool;

    fn capabilities(&self) -> HostCaps;
    fn dma_limits(&self) -> DmaLimits;
    fn clock_range(&self) -> ClockRange;

    /// Host-supported voltage windows, OCR bit positions.
    fn voltage_window(&self) -> u32;

    /// Maximum supply current in mA at the given OCR voltage bit.
    fn max_current(&self, voltage_bit: u32) -> u32;

    fn delay_ms(&mut self, ms: u32);
}
