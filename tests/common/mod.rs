//! Scripted host controller with an emulated card behind it.
//!
//! The mock answers the protocol generically from a small card model, so
//! every suite drives the real bring-up and I/O paths; failure injections
//! flip one knob at a time.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use sdhost::sd::cmd::{SdCommand, SdResponse};
use sdhost::sd::constant::*;
use sdhost::{
    BusConfig, ClockRange, DataTransfer, DmaLimits, DriverConfig, HostCaps, HostDevice,
    PowerMode, SdBlockDriver, SdError, SignalVoltage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub opcode: u8,
    pub arg: u32,
    pub app: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub opcode: u8,
    pub arg: u32,
    pub blocks: u32,
}

/// The card the mock host answers for.
#[derive(Clone)]
pub struct CardModel {
    pub v2: bool,
    pub supports_s18: bool,
    pub ocr_voltage: u32,
    pub cid: [u8; 16],
    pub csd: [u8; 16],
    pub scr: [u8; 8],
    /// CMD6 group-0 support mask.
    pub bus_modes: u16,
    /// CMD6 group-3 support mask.
    pub current_limits: u16,
    pub rca: u16,
}

const CID_BYTES: [u8; 16] = [
    0x03, 0x53, 0x44, b'S', b'U', b'3', b'2', b'G', 0x80, 0x12, 0x34, 0x56, 0x78, 0x00, 0xE2,
    0x8B,
];

// 16 GB class SDHC, CSD v2
const CSD_V2_BYTES: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x76, 0xB2, 0x7F, 0x80, 0x0A, 0x40, 0x40,
    0x01,
];

// 1 GB SDSC, CSD v1, 1024-byte read blocks
const CSD_V1_BYTES: [u8; 16] = [
    0x00, 0x26, 0x00, 0x32, 0x5B, 0x5A, 0x81, 0xFF, 0xC0, 0x03, 0xC0, 0x00, 0x0A, 0x80, 0x00,
    0x01,
];

// SD spec 3.0x, 1-bit and 4-bit bus
const SCR_V3_BYTES: [u8; 8] = [0x02, 0xB5, 0x80, 0x02, 0x00, 0x00, 0x00, 0x00];

// SD spec 1.0, predates the switch function
const SCR_V1_BYTES: [u8; 8] = [0x00, 0x15, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

impl CardModel {
    /// UHS-I capable SDHC card.
    pub fn uhs() -> Self {
        Self {
            v2: true,
            supports_s18: true,
            ocr_voltage: 0x00FF_8000,
            cid: CID_BYTES,
            csd: CSD_V2_BYTES,
            scr: SCR_V3_BYTES,
            bus_modes: SD_BUS_MODE_SDR12
                | SD_BUS_MODE_HIGH_SPEED
                | SD_BUS_MODE_SDR50
                | SD_BUS_MODE_SDR104
                | SD_BUS_MODE_DDR50,
            current_limits: 0xF,
            rca: 0xB368,
        }
    }

    /// 3.3V-only card that still switches to high speed.
    pub fn high_speed() -> Self {
        Self {
            supports_s18: false,
            bus_modes: SD_BUS_MODE_SDR12 | SD_BUS_MODE_HIGH_SPEED,
            current_limits: 0,
            ..Self::uhs()
        }
    }

    /// Byte-addressed SDSC card.
    pub fn sdsc() -> Self {
        Self {
            v2: false,
            supports_s18: false,
            csd: CSD_V1_BYTES,
            bus_modes: SD_BUS_MODE_SDR12 | SD_BUS_MODE_HIGH_SPEED,
            current_limits: 0,
            ..Self::uhs()
        }
    }

    /// Spec 1.0 card, no switch function at all.
    pub fn legacy() -> Self {
        Self {
            supports_s18: false,
            scr: SCR_V1_BYTES,
            bus_modes: 0,
            current_limits: 0,
            ..Self::uhs()
        }
    }
}

pub struct MockState {
    pub caps: HostCaps,
    pub voltage_window: u32,
    pub clock_range: ClockRange,
    pub dma: DmaLimits,
    pub host_max_current: u32,
    pub write_protected: bool,

    pub card: Option<CardModel>,

    pub powered: bool,
    pub signal_voltage: SignalVoltage,
    app_armed: bool,
    pub calls: Vec<Call>,
    pub bus_configs: Vec<BusConfig>,
    pub transactions: Vec<Transaction>,
    pub tuning_runs: u32,
    pub delays_ms: u64,

    // Failure injections
    pub tuning_result: Result<(), SdError>,
    pub fail_signal_switch: bool,
    pub acmd41_busy_forever: bool,
    pub cmd6_group0_echo: Option<u8>,
    pub fail_transaction_index: Option<usize>,
}

impl MockState {
    fn handle_command(
        &mut self,
        cmd: &SdCommand,
        data: Option<DataTransfer<'_>>,
    ) -> Result<SdResponse, SdError> {
        let armed = std::mem::take(&mut self.app_armed);
        self.calls.push(Call {
            opcode: cmd.opcode,
            arg: cmd.arg,
            app: armed,
        });

        if !self.powered {
            return Err(SdError::Timeout);
        }
        let Some(card) = self.card.clone() else {
            return Err(SdError::Timeout);
        };

        if cmd.opcode == SD_APP_CMD && !armed {
            self.app_armed = true;
            return Ok(SdResponse::short(R1_APP_CMD | R1_STATE_TRAN | R1_READY_FOR_DATA));
        }

        let ok = SdResponse::short(R1_STATE_TRAN | R1_READY_FOR_DATA);
        match (cmd.opcode, armed) {
            (SD_GO_IDLE_STATE, _) => Ok(SdResponse::none()),
            (SD_SEND_IF_COND, _) => {
                if card.v2 {
                    Ok(SdResponse::short(cmd.arg & 0x1FF))
                } else {
                    Err(SdError::Timeout)
                }
            }
            (SD_APP_SEND_OP_COND, true) => {
                if cmd.arg == 0 || self.acmd41_busy_forever {
                    // OCR report without the ready bit
                    return Ok(SdResponse::short(card.ocr_voltage | OCR_HCS));
                }
                let mut ocr = OCR_BUSY | card.ocr_voltage;
                if card.v2 && cmd.arg & OCR_HCS != 0 {
                    ocr |= OCR_HCS;
                }
                if card.supports_s18 && cmd.arg & OCR_S18 != 0 {
                    ocr |= OCR_S18;
                }
                Ok(SdResponse::short(ocr))
            }
            (SD_VOLTAGE_SWITCH, _) => Ok(ok),
            (SD_ALL_SEND_CID, _) => Ok(SdResponse::long(card.cid)),
            (SD_SEND_RELATIVE_ADDR, _) => {
                Ok(SdResponse::short(((card.rca as u32) << 16) | 0x0500))
            }
            (SD_SEND_CSD, _) => Ok(SdResponse::long(card.csd)),
            (SD_SELECT_CARD, _) => Ok(ok),
            (SD_APP_SEND_SCR, true) => {
                if let Some(DataTransfer::Read(buf)) = data {
                    buf[..8].copy_from_slice(&card.scr);
                }
                Ok(ok)
            }
            (SD_APP_SD_STATUS, true) => {
                if let Some(DataTransfer::Read(buf)) = data {
                    buf.fill(0);
                    buf[8] = 4;
                    buf[14] = 0x30;
                    buf[15] = 0x01;
                }
                Ok(ok)
            }
            (SD_SEND_STATUS, false) => Ok(ok),
            (SD_APP_SET_BUS_WIDTH, true) => Ok(ok),
            (SD_APP_SET_WR_BLK_ERASE_COUNT, true) => Ok(ok),
            (SD_SWITCH_FUNC, false) => self.handle_switch(cmd, data, &card),
            (SD_SEND_TUNING_BLOCK, _) => {
                if let Some(DataTransfer::Read(buf)) = data {
                    buf.fill(0xAA);
                }
                Ok(ok)
            }
            (SD_STOP_TRANSMISSION, _) => Ok(ok),
            (
                SD_READ_SINGLE_BLOCK | SD_READ_MULTIPLE_BLOCK | SD_WRITE_BLOCK
                | SD_WRITE_MULTIPLE_BLOCK,
                false,
            ) => self.handle_data(cmd, data),
            _ => Err(SdError::InvalidResponse),
        }
    }

    fn handle_switch(
        &mut self,
        cmd: &SdCommand,
        data: Option<DataTransfer<'_>>,
        card: &CardModel,
    ) -> Result<SdResponse, SdError> {
        let mut status = [0u8; 64];
        status[0..2].copy_from_slice(&400u16.to_be_bytes());
        status[12..14].copy_from_slice(&card.bus_modes.to_be_bytes());
        status[10..12].copy_from_slice(&1u16.to_be_bytes());
        status[8..10].copy_from_slice(&1u16.to_be_bytes());
        status[6..8].copy_from_slice(&card.current_limits.to_be_bytes());

        if cmd.arg & SD_SWITCH_MODE_SET != 0 {
            // Exactly one group nibble differs from "no change"
            for group in 0..6u32 {
                let value = ((cmd.arg >> (4 * group)) & 0xF) as u8;
                if value == 0xF {
                    continue;
                }
                let echoed = if group == SD_SWITCH_GROUP_ACCESS_MODE {
                    self.cmd6_group0_echo.unwrap_or(value)
                } else {
                    value
                };
                let byte = (16 - group / 2) as usize;
                if group % 2 == 0 {
                    status[byte] = (status[byte] & 0xF0) | echoed;
                } else {
                    status[byte] = (status[byte] & 0x0F) | (echoed << 4);
                }
            }
        }

        if let Some(DataTransfer::Read(buf)) = data {
            buf[..64].copy_from_slice(&status);
        }
        Ok(SdResponse::short(R1_STATE_TRAN | R1_READY_FOR_DATA))
    }

    fn handle_data(
        &mut self,
        cmd: &SdCommand,
        data: Option<DataTransfer<'_>>,
    ) -> Result<SdResponse, SdError> {
        let index = self.transactions.len();
        self.transactions.push(Transaction {
            opcode: cmd.opcode,
            arg: cmd.arg,
            blocks: cmd.block_count,
        });
        if self.fail_transaction_index == Some(index) {
            return Err(SdError::Crc);
        }
        if let Some(DataTransfer::Read(buf)) = data {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (cmd.arg as usize).wrapping_add(i) as u8;
            }
        }
        Ok(SdResponse::short(R1_STATE_TRAN | R1_READY_FOR_DATA))
    }
}

/// Handle on the shared state plus the `HostDevice` face of it.
#[derive(Clone)]
pub struct MockHost {
    pub state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new(card: Option<CardModel>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                caps: HostCaps::BUS_WIDTH_4
                    | HostCaps::HIGH_SPEED
                    | HostCaps::UHS_SDR12
                    | HostCaps::UHS_SDR25
                    | HostCaps::UHS_SDR50
                    | HostCaps::UHS_SDR104
                    | HostCaps::UHS_DDR50,
                voltage_window: 0x00FF_8000,
                clock_range: ClockRange {
                    min_hz: 100_000,
                    max_hz: 208_000_000,
                },
                dma: DmaLimits {
                    max_segments: 64,
                    max_segment_bytes: 512 * 1024,
                    max_request_bytes: 1024 * 512,
                },
                host_max_current: 800,
                write_protected: false,
                card,
                powered: false,
                signal_voltage: SignalVoltage::Voltage330,
                app_armed: false,
                calls: Vec::new(),
                bus_configs: Vec::new(),
                transactions: Vec::new(),
                tuning_runs: 0,
                delays_ms: 0,
                tuning_result: Ok(()),
                fail_signal_switch: false,
                acmd41_busy_forever: false,
                cmd6_group0_echo: None,
                fail_transaction_index: None,
            })),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    pub fn bus_configs(&self) -> Vec<BusConfig> {
        self.state.lock().unwrap().bus_configs.clone()
    }

    pub fn last_bus_config(&self) -> BusConfig {
        self.state.lock().unwrap().bus_configs.last().cloned().unwrap()
    }

    pub fn tuning_runs(&self) -> u32 {
        self.state.lock().unwrap().tuning_runs
    }
}

impl HostDevice for MockHost {
    fn send_command(
        &mut self,
        cmd: &SdCommand,
        data: Option<DataTransfer<'_>>,
    ) -> Result<SdResponse, SdError> {
        self.state.lock().unwrap().handle_command(cmd, data)
    }

    fn set_bus_config(&mut self, config: &BusConfig) -> Result<(), SdError> {
        let mut st = self.state.lock().unwrap();
        st.powered = config.power_mode == PowerMode::On;
        st.signal_voltage = config.signal_voltage;
        st.bus_configs.push(config.clone());
        Ok(())
    }

    fn switch_signal_voltage(&mut self, config: &BusConfig) -> Result<(), SdError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_signal_switch {
            return Err(SdError::NotResponding);
        }
        st.signal_voltage = config.signal_voltage;
        Ok(())
    }

    fn execute_tuning(&mut self, _config: &BusConfig) -> Result<(), SdError> {
        let mut st = self.state.lock().unwrap();
        st.tuning_runs += 1;
        st.tuning_result
    }

    fn is_card_present(&mut self) -> bool {
        self.state.lock().unwrap().card.is_some()
    }

    fn is_card_write_protected(&mut self) -> bool {
        self.state.lock().unwrap().write_protected
    }

    fn is_command_line_busy(&mut self) -> bool {
        false
    }

    fn is_data_line_busy(&mut self) -> bool {
        false
    }

    fn capabilities(&self) -> HostCaps {
        self.state.lock().unwrap().caps
    }

    fn dma_limits(&self) -> DmaLimits {
        self.state.lock().unwrap().dma
    }

    fn clock_range(&self) -> ClockRange {
        self.state.lock().unwrap().clock_range
    }

    fn voltage_window(&self) -> u32 {
        self.state.lock().unwrap().voltage_window
    }

    fn max_current(&self, _voltage_bit: u32) -> u32 {
        self.state.lock().unwrap().host_max_current
    }

    fn delay_ms(&mut self, ms: u32) {
        self.state.lock().unwrap().delays_ms += ms as u64;
    }
}

/// Build a driver around the mock and run the attach to completion.
pub fn attach_driver(host: MockHost, config: DriverConfig) -> SdBlockDriver<MockHost> {
    let driver = SdBlockDriver::new(host, config);
    driver.card_inserted();
    driver.process_events();
    driver
}

/// A completion that records its one invocation.
pub type Probe = Arc<Mutex<Option<(Result<u64, SdError>, Vec<u8>)>>>;

pub fn completion_probe() -> (sdhost::Completion, Probe) {
    let probe: Probe = Arc::new(Mutex::new(None));
    let recorder = probe.clone();
    let completion = Box::new(move |result, buffer| {
        let previous = recorder.lock().unwrap().replace((result, buffer));
        assert!(previous.is_none(), "completion fired twice");
    });
    (completion, probe)
}
