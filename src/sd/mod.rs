//! Card bring-up and speed negotiation.
//!
//! [`CardInitializer`] drives one freshly powered card from idle to a
//! ready, speed-negotiated session against the abstract host interface.
//! The orchestrator owns the retry ladder around it; a `NotResponding`
//! return means "try again one speed mode lower".

pub mod cmd;
pub mod constant;
pub mod reg;

use core::fmt::Display;

use log::{debug, info, warn};

use crate::config::DriverConfig;
use crate::err::SdError;
use crate::host::{
    BusConfig, BusWidth, DataTransfer, HostCaps, HostDevice, PowerMode, SignalVoltage, TimingMode,
};
use cmd::SdCommand;
use constant::*;
use reg::{Cid, Csd, Scr, SpecVersion, Ssr, SwitchCaps, SwitchStatus};

/// Requested speed tier, walked downwards by the orchestrator on
/// recoverable bring-up failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Default,
    High,
    Ultra,
}

impl SpeedMode {
    pub fn lower(self) -> Option<SpeedMode> {
        match self {
            SpeedMode::Ultra => Some(SpeedMode::High),
            SpeedMode::High => Some(SpeedMode::Default),
            SpeedMode::Default => None,
        }
    }

    /// Highest tier the configuration allows as the ladder entry point.
    pub fn highest_allowed(config: &DriverConfig) -> SpeedMode {
        if config.force_default_speed {
            SpeedMode::Default
        } else if config.force_high_speed {
            SpeedMode::High
        } else {
            SpeedMode::Ultra
        }
    }
}

/// Identity and negotiated state of one attached card. Created whole by
/// [`CardInitializer::bring_up`]; immutable afterwards.
#[derive(Debug, Clone)]
pub struct CardSession {
    pub cid: Cid,
    pub csd: Csd,
    pub scr: Scr,
    pub ssr: Ssr,
    pub rca: u16,
    pub ocr: u32,
    pub switch_caps: SwitchCaps,
    pub timing: TimingMode,
    pub bus_width: BusWidth,
}

impl CardSession {
    /// Device size in 512-byte storage blocks.
    pub fn block_count(&self) -> u64 {
        self.csd.storage_blocks()
    }

    pub fn is_block_addressed(&self) -> bool {
        self.csd.block_addressed
    }
}

impl Display for CardSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SD card {} rev {}.{} serial {:#010x}, {} MiB, {:?} {:?}",
            self.cid.product_name_str(),
            self.cid.hw_revision,
            self.cid.fw_revision,
            self.cid.serial_number,
            self.block_count() * SD_BLOCK_SIZE as u64 / (1024 * 1024),
            self.timing,
            self.bus_width,
        )
    }
}

/// Send one application command: CMD55 with the rca, then the command
/// itself, retried as a pair up to `retries` times. A CMD55 response
/// without the app-command status bit fails that attempt outright.
pub(crate) fn send_app_command<H: HostDevice>(
    host: &mut H,
    rca: u16,
    retries: u32,
    cmd: &SdCommand,
    mut read_buf: Option<&mut [u8]>,
) -> Result<cmd::SdResponse, SdError> {
    let mut last = SdError::NotResponding;
    for _ in 0..retries.max(1) {
        match host.send_command(&SdCommand::app_cmd(rca), None) {
            Ok(resp) if resp.as_r1() & R1_APP_CMD != 0 => {
                let data = read_buf.as_deref_mut().map(DataTransfer::Read);
                match host.send_command(cmd, data) {
                    Ok(resp) => return Ok(resp),
                    Err(e) => last = e,
                }
            }
            Ok(_) => last = SdError::InvalidResponse,
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Poll the data lines until the card leaves busy, bounded.
pub(crate) fn wait_while_data_busy<H: HostDevice>(
    host: &mut H,
    limit_ms: u32,
) -> Result<(), SdError> {
    for _ in 0..limit_ms {
        if !host.is_data_line_busy() {
            return Ok(());
        }
        host.delay_ms(1);
    }
    Err(SdError::Timeout)
}

/// Poll the command line until the card releases it, bounded.
pub(crate) fn wait_while_command_busy<H: HostDevice>(
    host: &mut H,
    limit_ms: u32,
) -> Result<(), SdError> {
    for _ in 0..limit_ms {
        if !host.is_command_line_busy() {
            return Ok(());
        }
        host.delay_ms(1);
    }
    Err(SdError::Timeout)
}

/// One bring-up attempt at a requested speed tier.
pub(crate) struct CardInitializer<'a, H: HostDevice> {
    host: &'a mut H,
    bus: &'a mut BusConfig,
    config: &'a DriverConfig,
}

impl<'a, H: HostDevice> CardInitializer<'a, H> {
    pub fn new(host: &'a mut H, bus: &'a mut BusConfig, config: &'a DriverConfig) -> Self {
        Self { host, bus, config }
    }

    /// Run the whole state machine: idle, probe, voltage resolution,
    /// identification, configuration fetch, speed branch.
    pub fn bring_up(mut self, requested: SpeedMode) -> Result<CardSession, SdError> {
        debug!("card bring-up, requested mode {:?}", requested);

        wait_while_command_busy(self.host, SD_PROGRAMMING_POLL_LIMIT_MS)?;
        self.go_idle()?;
        let mut is_v2 = self.probe_interface()?;

        // First ACMD41 round-trip only reads the card's OCR
        let card_ocr = self.inquiry_ocr()?;
        let (ocr_window, power_cycled) = self.resolve_voltage(card_ocr)?;
        if power_cycled {
            // The card fell back to idle with the narrowed supply window
            self.go_idle()?;
            is_v2 = self.probe_interface()?;
        }

        let want_18v = requested == SpeedMode::Ultra
            && is_v2
            && !self.config.force_330v
            && self.host.capabilities().supports_uhs();

        let mut arg = ocr_window;
        if is_v2 {
            arg |= OCR_HCS;
        }
        if want_18v {
            arg |= OCR_S18;
        }

        let ocr = self.wait_ready(arg)?;
        let accepted_18v = want_18v && (ocr & OCR_S18) != 0;
        if accepted_18v {
            self.switch_signal_voltage_18v(ocr_window)?;
        }

        // Identification commands have no fallback
        let cid_raw = self
            .host
            .send_command(&SdCommand::all_send_cid(), None)
            .map_err(|_| SdError::Aborted)?
            .as_r2();
        let cid = Cid::decode(&cid_raw);

        let (rca, _) = self
            .host
            .send_command(&SdCommand::send_relative_addr(), None)
            .map_err(|_| SdError::Aborted)?
            .as_r6();

        let csd_raw = self
            .host
            .send_command(&SdCommand::send_csd(rca), None)
            .map_err(|_| SdError::Aborted)?
            .as_r2();
        let csd = Csd::decode(&csd_raw)?;

        self.host
            .send_command(&SdCommand::select_card(rca), None)
            .map_err(|_| SdError::Aborted)?;
        wait_while_data_busy(self.host, SD_PROGRAMMING_POLL_LIMIT_MS)?;

        let scr = self.fetch_scr(rca)?;
        let ssr = self.fetch_ssr(rca)?;
        let switch_caps = self.probe_switch_capabilities(&csd, &scr)?;

        debug!(
            "card config: spec {:?}, bus widths {:#x}, switch caps {:?}",
            scr.spec_version, scr.bus_widths, switch_caps
        );

        let timing = self.select_speed(requested, &csd, &scr, &switch_caps, accepted_18v, rca)?;

        let session = CardSession {
            cid,
            csd,
            scr,
            ssr,
            rca,
            ocr,
            switch_caps,
            timing,
            bus_width: self.bus.bus_width,
        };
        info!("{}", session);
        Ok(session)
    }

    fn go_idle(&mut self) -> Result<(), SdError> {
        self.host
            .send_command(&SdCommand::go_idle(), None)
            .map_err(|_| SdError::Aborted)?;
        self.host.delay_ms(SD_VOLTAGE_SWITCH_DELAY_MS);
        Ok(())
    }

    /// CMD8 is optional: a card that stays silent is a 1.x card. A card
    /// that answers with the wrong check pattern is broken.
    fn probe_interface(&mut self) -> Result<bool, SdError> {
        match self.host.send_command(&SdCommand::send_if_cond(), None) {
            Ok(resp) => {
                let echoed = resp.as_r7();
                if echoed & 0xFF != SD_IF_COND_CHECK_PATTERN {
                    return Err(SdError::InvalidResponse);
                }
                Ok(true)
            }
            Err(SdError::Timeout) | Err(SdError::NotResponding) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// ACMD41 with a zero argument: the card reports its OCR without
    /// starting initialization.
    fn inquiry_ocr(&mut self) -> Result<u32, SdError> {
        let resp = send_app_command(
            self.host,
            0,
            self.config.app_cmd_retries,
            &SdCommand::app_send_op_cond(0),
            None,
        )?;
        Ok(resp.as_r3())
    }

    /// Intersect the card's voltage window with the host's. Returns the
    /// usable window and whether power was restarted around it.
    fn resolve_voltage(&mut self, card_ocr: u32) -> Result<(u32, bool), SdError> {
        let common = card_ocr & self.host.voltage_window() & OCR_VOLTAGE_MASK;
        debug!(
            "voltage windows: card {:#010x}, host {:#010x}, common {:#010x}",
            card_ocr,
            self.host.voltage_window(),
            common
        );
        if common == 0 {
            return Err(SdError::UnsupportedCard);
        }

        if self.host.capabilities().contains(HostCaps::FULL_POWER_CYCLE) {
            // Narrow to the lowest supported 2-bit window and restart
            // power on it
            let low_bit = common.trailing_zeros();
            let window = common & (0b11 << low_bit);

            self.bus.power_mode = PowerMode::Off;
            self.host.set_bus_config(self.bus)?;
            self.host.delay_ms(SD_POWER_OFF_DELAY_MS);

            self.bus.power_mode = PowerMode::On;
            self.bus.voltage_bit = low_bit;
            self.host.set_bus_config(self.bus)?;
            self.host.delay_ms(SD_POWER_ON_DELAY_MS);

            Ok((window, true))
        } else {
            if common & (1 << self.bus.voltage_bit) == 0 {
                return Err(SdError::UnsupportedCard);
            }
            Ok((common, false))
        }
    }

    /// ACMD41 loop: poll until the card reports power-up complete.
    fn wait_ready(&mut self, arg: u32) -> Result<u32, SdError> {
        for _ in 0..SD_OCR_POLL_ATTEMPTS {
            let resp = send_app_command(
                self.host,
                0,
                self.config.app_cmd_retries,
                &SdCommand::app_send_op_cond(arg),
                None,
            )?;
            let ocr = resp.as_r3();
            if ocr & OCR_BUSY != 0 {
                debug!("card ready, OCR {:#010x}", ocr);
                return Ok(ocr);
            }
            self.host.delay_ms(SD_OCR_POLL_INTERVAL_MS);
        }
        warn!("card never left busy in ACMD41");
        Err(SdError::Timeout)
    }

    /// 1.8V switch protocol. Any failure power-cycles the card back to
    /// 3.3V so the caller can retry one speed tier lower.
    fn switch_signal_voltage_18v(&mut self, ocr_window: u32) -> Result<(), SdError> {
        let result = (|| -> Result<(), SdError> {
            self.host.send_command(&SdCommand::voltage_switch(), None)?;
            self.host.delay_ms(SD_VOLTAGE_SWITCH_DELAY_MS);

            self.bus.signal_voltage = SignalVoltage::Voltage180;
            self.host.switch_signal_voltage(self.bus)?;
            self.host.delay_ms(SD_VOLTAGE_SWITCH_DELAY_MS);

            // The card signals a failed switch by holding the data lines low
            if self.host.is_data_line_busy() {
                return Err(SdError::NotResponding);
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!("1.8V switch failed ({}), power cycling", e);
            self.power_cycle(ocr_window)?;
            return Err(SdError::NotResponding);
        }
        info!("signal voltage switched to 1.8V");
        Ok(())
    }

    fn power_cycle(&mut self, ocr_window: u32) -> Result<(), SdError> {
        self.bus.power_mode = PowerMode::Off;
        self.bus.signal_voltage = SignalVoltage::Voltage330;
        self.host.set_bus_config(self.bus)?;
        self.host.delay_ms(SD_POWER_OFF_DELAY_MS);

        self.bus.power_mode = PowerMode::On;
        self.bus.voltage_bit = if ocr_window != 0 {
            ocr_window.trailing_zeros()
        } else {
            self.bus.voltage_bit
        };
        self.host.set_bus_config(self.bus)?;
        self.host.delay_ms(SD_POWER_ON_DELAY_MS);
        Ok(())
    }

    fn fetch_scr(&mut self, rca: u16) -> Result<Scr, SdError> {
        let mut raw = [0u8; 8];
        send_app_command(
            self.host,
            rca,
            self.config.app_cmd_retries,
            &SdCommand::app_send_scr(),
            Some(&mut raw[..]),
        )?;
        Ok(Scr::decode(&raw))
    }

    fn fetch_ssr(&mut self, rca: u16) -> Result<Ssr, SdError> {
        let mut raw = [0u8; 64];
        send_app_command(
            self.host,
            rca,
            self.config.app_cmd_retries,
            &SdCommand::app_sd_status(),
            Some(&mut raw[..]),
        )?;
        Ok(Ssr::decode(&raw))
    }

    /// CMD6 mode-0 probe. Cards below spec 1.10 or without the switch
    /// command class report empty capabilities instead of an error.
    fn probe_switch_capabilities(&mut self, csd: &Csd, scr: &Scr) -> Result<SwitchCaps, SdError> {
        if scr.spec_version < SpecVersion::V1_10
            || !csd.command_classes.contains(reg::CommandClasses::SWITCH)
        {
            return Ok(SwitchCaps::default());
        }

        let mut raw = [0u8; SD_SWITCH_STATUS_LEN];
        self.host.send_command(
            &SdCommand::check_functions(),
            Some(DataTransfer::Read(&mut raw)),
        )?;
        let status = SwitchStatus::new(raw);
        let bus_modes = status.group_support(SD_SWITCH_GROUP_ACCESS_MODE);

        Ok(SwitchCaps {
            max_current_ma: status.max_current_ma(),
            high_speed_max_clock: if bus_modes & SD_BUS_MODE_HIGH_SPEED != 0 {
                SD_CLOCK_HIGH_SPEED
            } else {
                0
            },
            bus_modes,
            driver_types: status.group_support(SD_SWITCH_GROUP_DRIVER_STRENGTH),
            current_limits: status.group_support(SD_SWITCH_GROUP_CURRENT_LIMIT),
        })
    }

    /// Speed-mode branch of the state machine.
    fn select_speed(
        &mut self,
        requested: SpeedMode,
        csd: &Csd,
        scr: &Scr,
        caps: &SwitchCaps,
        accepted_18v: bool,
        rca: u16,
    ) -> Result<TimingMode, SdError> {
        let host_caps = self.host.capabilities();

        let default_only = scr.spec_version < SpecVersion::V1_10
            || !csd.command_classes.contains(reg::CommandClasses::SWITCH)
            || !host_caps.contains(HostCaps::HIGH_SPEED)
            || caps.high_speed_max_clock == 0
            || self.config.force_default_speed;

        if default_only || requested == SpeedMode::Default {
            return self.bring_up_default_speed(csd, scr, rca);
        }

        let uhs_eligible = accepted_18v && host_caps.supports_uhs();
        if requested == SpeedMode::Ultra && uhs_eligible && !self.config.force_high_speed {
            return self.bring_up_ultra_high_speed(scr, caps, rca);
        }

        self.bring_up_high_speed(csd, scr, caps, rca)
    }

    fn switch_bus_width_4bit(&mut self, rca: u16) -> Result<(), SdError> {
        send_app_command(
            self.host,
            rca,
            self.config.app_cmd_retries,
            &SdCommand::app_set_bus_width(BusWidth::Width4.bus_width_arg()),
            None,
        )?;
        self.bus.bus_width = BusWidth::Width4;
        self.host.set_bus_config(self.bus)?;
        debug!("bus width set to 4");
        Ok(())
    }

    fn bring_up_default_speed(
        &mut self,
        csd: &Csd,
        scr: &Scr,
        rca: u16,
    ) -> Result<TimingMode, SdError> {
        // Card/host width disagreement is not an error; the bus just
        // stays 1-bit
        if scr.supports_4bit_bus() && self.host.capabilities().contains(HostCaps::BUS_WIDTH_4) {
            self.switch_bus_width_4bit(rca)?;
        }

        self.bus.timing = TimingMode::Legacy;
        self.bus.clock = csd.max_transfer_rate;
        self.host.set_bus_config(self.bus)?;
        info!("default speed, clock {} Hz", self.bus.clock);
        Ok(TimingMode::Legacy)
    }

    fn bring_up_high_speed(
        &mut self,
        csd: &Csd,
        scr: &Scr,
        caps: &SwitchCaps,
        rca: u16,
    ) -> Result<TimingMode, SdError> {
        let echoed = self.switch_access_mode(SD_ACCESS_MODE_HIGH_SPEED)?;
        if echoed != SD_ACCESS_MODE_HIGH_SPEED {
            // The card refused the function; stay at default speed
            warn!("card declined high speed (echoed {:#x})", echoed);
            return self.bring_up_default_speed(csd, scr, rca);
        }

        if scr.supports_4bit_bus() && self.host.capabilities().contains(HostCaps::BUS_WIDTH_4) {
            self.switch_bus_width_4bit(rca)?;
        }

        self.bus.timing = TimingMode::SdHighSpeed;
        self.host.set_bus_config(self.bus)?;
        self.bus.clock = caps.high_speed_max_clock;
        self.host.set_bus_config(self.bus)?;
        info!("high speed, clock {} Hz", self.bus.clock);
        Ok(TimingMode::SdHighSpeed)
    }

    fn bring_up_ultra_high_speed(
        &mut self,
        scr: &Scr,
        caps: &SwitchCaps,
        rca: u16,
    ) -> Result<TimingMode, SdError> {
        // UHS-I transfers exist only on the 4-bit bus
        if !scr.supports_4bit_bus() || !self.host.capabilities().contains(HostCaps::BUS_WIDTH_4) {
            return Err(SdError::NotResponding);
        }
        self.switch_bus_width_4bit(rca)?;

        let timing = self.pick_uhs_mode(caps).ok_or(SdError::Aborted)?;
        debug!("UHS mode selected: {:?}", timing);

        self.select_driver_strength();

        if timing.is_fast_uhs() {
            self.set_current_limit(caps)?;
        }

        let echoed = self.switch_access_mode(timing.access_mode())?;
        if echoed != timing.access_mode() {
            warn!(
                "card echoed access mode {:#x}, wanted {:#x}",
                echoed,
                timing.access_mode()
            );
            return Err(SdError::NotResponding);
        }

        self.bus.timing = timing;
        self.host.set_bus_config(self.bus)?;
        self.bus.clock = timing.max_clock();
        self.host.set_bus_config(self.bus)?;

        if timing.is_fast_uhs() {
            if let Err(e) = self.host.execute_tuning(self.bus) {
                // DDR50 samples on both edges and tolerates a failed
                // tuning pass; the SDR modes do not
                if timing == TimingMode::UhsDdr50 {
                    warn!("tuning failed on DDR50, continuing ({})", e);
                } else {
                    warn!("tuning failed on {:?}", timing);
                    return Err(SdError::NotResponding);
                }
            }
        }

        info!("ultra high speed {:?}, clock {} Hz", timing, self.bus.clock);
        Ok(timing)
    }

    /// Highest mode present in both the host capability mask and the
    /// card's bus-mode mask, fixed priority.
    fn pick_uhs_mode(&self, caps: &SwitchCaps) -> Option<TimingMode> {
        const LADDER: [(TimingMode, HostCaps, u16); 5] = [
            (TimingMode::UhsSdr104, HostCaps::UHS_SDR104, SD_BUS_MODE_SDR104),
            (TimingMode::UhsDdr50, HostCaps::UHS_DDR50, SD_BUS_MODE_DDR50),
            (TimingMode::UhsSdr50, HostCaps::UHS_SDR50, SD_BUS_MODE_SDR50),
            (TimingMode::UhsSdr25, HostCaps::UHS_SDR25, SD_BUS_MODE_HIGH_SPEED),
            (TimingMode::UhsSdr12, HostCaps::UHS_SDR12, SD_BUS_MODE_SDR12),
        ];
        let host_caps = self.host.capabilities();
        LADDER
            .iter()
            .find(|(_, host_bit, card_bit)| {
                host_caps.contains(*host_bit) && caps.bus_modes & card_bit != 0
            })
            .map(|(timing, _, _)| *timing)
    }

    /// The host chip drives all UHS-I modes with its default output
    /// strength; nothing to negotiate with the card.
    fn select_driver_strength(&mut self) {
        self.bus.driver_strength = crate::host::DriverStrength::TypeB;
    }

    /// Highest current limit the host can supply and the card advertises,
    /// for the modes that draw it.
    fn set_current_limit(&mut self, caps: &SwitchCaps) -> Result<(), SdError> {
        const LIMITS: [(u32, u8); 4] = [
            (800, SD_CURRENT_LIMIT_800),
            (600, SD_CURRENT_LIMIT_600),
            (400, SD_CURRENT_LIMIT_400),
            (200, SD_CURRENT_LIMIT_200),
        ];
        let host_max = self.host.max_current(self.bus.voltage_bit);

        let Some(&(ma, value)) = LIMITS
            .iter()
            .find(|(ma, value)| *ma <= host_max && caps.current_limits & (1 << value) != 0)
        else {
            return Ok(());
        };

        let mut raw = [0u8; SD_SWITCH_STATUS_LEN];
        self.host.send_command(
            &SdCommand::switch_function(true, SD_SWITCH_GROUP_CURRENT_LIMIT, value),
            Some(DataTransfer::Read(&mut raw)),
        )?;
        let echoed = SwitchStatus::new(raw).group_selection(SD_SWITCH_GROUP_CURRENT_LIMIT);
        if echoed != value {
            warn!("card echoed current limit {:#x}, wanted {:#x}", echoed, value);
            return Err(SdError::NotResponding);
        }
        debug!("current limit {} mA", ma);
        Ok(())
    }

    /// Switch the group-0 access mode and return what the card selected.
    fn switch_access_mode(&mut self, value: u8) -> Result<u8, SdError> {
        let mut raw = [0u8; SD_SWITCH_STATUS_LEN];
        self.host.send_command(
            &SdCommand::switch_function(true, SD_SWITCH_GROUP_ACCESS_MODE, value),
            Some(DataTransfer::Read(&mut raw)),
        )?;
        Ok(SwitchStatus::new(raw).group_selection(SD_SWITCH_GROUP_ACCESS_MODE))
    }
}
