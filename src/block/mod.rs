//! Top-level driver: card lifecycle, request admission and the protocol
//! event loop.
//!
//! Two serialization domains, never shared: the pool/queue lock inside
//! [`pool::RequestPool`], and the protocol lock in here. Only the protocol
//! domain ever talks to the host device. Hardware callbacks and submitting
//! threads communicate with it through one bounded event channel.

pub mod pool;
pub mod request;

use core::fmt::Display;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{debug, info, warn};
use spin::Mutex;

use crate::config::DriverConfig;
use crate::err::SdError;
use crate::host::{
    BusConfig, BusWidth, DataTransfer, HostDevice, PowerMode, SignalVoltage, TimingMode,
};
use crate::sd::cmd::SdCommand;
use crate::sd::constant::*;
use crate::sd::{self, CardInitializer, CardSession, SpeedMode};
use pool::RequestPool;
use request::{Completion, Direction, RequestAttrs, RequestKind};

const EVENT_QUEUE_DEPTH: usize = 8;

/// Trigger sources serviced by the protocol domain, one at a time.
/// Attach and detach displace each other; a pending-request notification
/// is level-triggered and never queued twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverEvent {
    CardAttached,
    CardDetached,
    RequestPending,
}

/// Everything only the protocol domain touches.
struct ProtocolState<H: HostDevice> {
    host: H,
    bus: BusConfig,
    card: Option<CardSession>,
}

/// Media parameters mirrored out of the protocol domain at attach time so
/// admission checks never wait behind a bring-up in progress.
#[derive(Clone, Copy)]
struct MediaState {
    present: bool,
    block_count: u64,
    write_protected: bool,
}

impl MediaState {
    const ABSENT: MediaState = MediaState {
        present: false,
        block_count: 0,
        write_protected: false,
    };
}

/// Aggregated card identity for inventory queries.
#[derive(Debug, Clone)]
pub struct CardInfo {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 5],
    pub hw_revision: u8,
    pub fw_revision: u8,
    pub serial_number: u32,
    pub manufacture_month: u8,
    pub manufacture_year: u16,
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub speed_class: u8,
    pub uhs_speed_grade: u8,
    pub video_speed_class: u8,
}

/// The driver orchestrator.
pub struct SdBlockDriver<H: HostDevice> {
    protocol: Mutex<ProtocolState<H>>,
    pool: RequestPool,
    events: Mutex<VecDeque<DriverEvent>>,
    media: Mutex<MediaState>,
    config: DriverConfig,
    max_transaction_blocks: u32,
}

impl<H: HostDevice> Display for SdBlockDriver<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let media = self.media.lock();
        write!(
            f,
            "SD block driver {{ present: {}, blocks: {}, write_protected: {}, max_txn_blocks: {} }}",
            media.present, media.block_count, media.write_protected, self.max_transaction_blocks
        )
    }
}

impl<H: HostDevice> SdBlockDriver<H> {
    pub fn new(host: H, config: DriverConfig) -> Self {
        let max_transaction_blocks = host.dma_limits().max_blocks_per_transaction().max(1);
        let pool = RequestPool::new(config.simple_pool_capacity, config.complex_pool_capacity);

        Self {
            protocol: Mutex::new(ProtocolState {
                host,
                bus: BusConfig::powered_off(),
                card: None,
            }),
            pool,
            events: Mutex::new(VecDeque::new()),
            media: Mutex::new(MediaState::ABSENT),
            config,
            max_transaction_blocks,
        }
    }

    // ===== Hardware-event side =====

    /// Card-insert callback; safe from any context.
    pub fn card_inserted(&self) {
        self.push_event(DriverEvent::CardAttached);
    }

    /// Card-remove callback; safe from any context.
    pub fn card_removed(&self) {
        self.push_event(DriverEvent::CardDetached);
    }

    fn push_event(&self, event: DriverEvent) {
        let mut queue = self.events.lock();
        match event {
            DriverEvent::CardAttached => queue.retain(|e| *e != DriverEvent::CardDetached),
            DriverEvent::CardDetached => queue.retain(|e| *e != DriverEvent::CardAttached),
            DriverEvent::RequestPending => {}
        }
        if !queue.contains(&event) {
            queue.push_back(event);
        }
        while queue.len() > EVENT_QUEUE_DEPTH {
            queue.pop_front();
        }
    }

    // ===== Protocol domain =====

    /// Service one queued event. The single protocol thread calls this
    /// (or [`Self::process_events`]) whenever it wakes; nothing else may.
    pub fn service_event(&self) -> bool {
        let event = self.events.lock().pop_front();
        let Some(event) = event else {
            return false;
        };
        match event {
            DriverEvent::CardAttached => self.handle_attach(),
            DriverEvent::CardDetached => self.handle_detach(),
            DriverEvent::RequestPending => self.service_pending(),
        }
        true
    }

    /// Drain the event channel.
    pub fn process_events(&self) {
        while self.service_event() {}
    }

    fn handle_attach(&self) {
        let mut st = self.protocol.lock();
        if st.card.is_some() {
            debug!("attach event with a card already attached, ignoring");
            return;
        }
        if !st.host.is_card_present() {
            debug!("attach event without a card in the slot");
            return;
        }

        match self.attach_card(&mut st) {
            Ok(session) => {
                let write_protected = st.host.is_card_write_protected();
                *self.media.lock() = MediaState {
                    present: true,
                    block_count: session.block_count(),
                    write_protected,
                };
                info!("card attached: {}", session);
                st.card = Some(session);
                drop(st);

                // Anything still queued belongs to the previous card
                self.fail_pending(SdError::NoMedia);
                self.pool.enable_queue();
            }
            Err(e) => {
                warn!("card attach failed: {}", e);
                Self::power_off(&mut st);
            }
        }
    }

    /// Walk the initial-frequency list, and within each frequency the
    /// speed-mode ladder, until a bring-up attempt returns a ready card.
    fn attach_card(&self, st: &mut ProtocolState<H>) -> Result<CardSession, SdError> {
        let entry_mode = SpeedMode::highest_allowed(&self.config);
        let mut last = SdError::Timeout;

        for &freq in SD_INITIAL_CLOCKS.iter() {
            if !st.host.clock_range().contains(freq) {
                debug!("skipping unsupported initial clock {} Hz", freq);
                continue;
            }

            let mut mode = Some(entry_mode);
            while let Some(requested) = mode {
                Self::power_up(st, freq)?;

                let attempt = CardInitializer::new(&mut st.host, &mut st.bus, &self.config)
                    .bring_up(requested);
                match attempt {
                    Ok(session) => return Ok(session),
                    Err(e) => {
                        Self::power_off(st);
                        last = e;
                        match e {
                            SdError::NotResponding => {
                                debug!("bring-up at {:?} failed, stepping down", requested);
                                mode = requested.lower();
                            }
                            // No voltage overlap or a dead identification
                            // command will not improve at another clock
                            SdError::Aborted | SdError::UnsupportedCard => return Err(e),
                            _ => {
                                debug!("bring-up failed ({}), next initial clock", e);
                                mode = None;
                            }
                        }
                    }
                }
            }
        }
        Err(last)
    }

    fn power_up(st: &mut ProtocolState<H>, clock: u32) -> Result<(), SdError> {
        let window = st.host.voltage_window() & OCR_VOLTAGE_MASK;
        let voltage_bit = if window != 0 { 31 - window.leading_zeros() } else { 0 };

        st.bus = BusConfig {
            clock,
            voltage_bit,
            power_mode: PowerMode::On,
            bus_width: BusWidth::Width1,
            timing: TimingMode::Legacy,
            signal_voltage: SignalVoltage::Voltage330,
            driver_strength: crate::host::DriverStrength::TypeB,
        };
        st.host.set_bus_config(&st.bus)?;
        st.host.delay_ms(SD_POWER_ON_DELAY_MS);
        Ok(())
    }

    fn power_off(st: &mut ProtocolState<H>) {
        st.bus.power_mode = PowerMode::Off;
        st.bus.clock = 0;
        if let Err(e) = st.host.set_bus_config(&st.bus) {
            warn!("bus power-off failed: {}", e);
        }
        // Give the rail time to discharge before any re-attach
        st.host.delay_ms(SD_POWER_OFF_DELAY_MS);
    }

    fn handle_detach(&self) {
        let was_enabled = self.pool.disable_queue();
        self.fail_pending(SdError::NoMedia);

        let mut st = self.protocol.lock();
        *self.media.lock() = MediaState::ABSENT;
        if st.card.take().is_some() {
            info!("card detached (queue was {})", if was_enabled { "enabled" } else { "disabled" });
        }
        Self::power_off(&mut st);
    }

    /// Complete every still-queued request and hand its slot back.
    fn fail_pending(&self, error: SdError) {
        for handle in self.pool.drain_pending() {
            let mut request = self.pool.take(handle);
            request.complete(Err(error));
            self.pool.recycle(handle, request);
        }
    }

    fn service_pending(&self) {
        loop {
            // The pending trigger is dead while no card is attached
            if !self.media.lock().present {
                return;
            }
            let Some(handle) = self.pool.pop_pending() else {
                return;
            };
            let mut request = self.pool.take(handle);

            let result = {
                let mut st = self.protocol.lock();
                if st.card.is_some() {
                    let max_blocks = self.max_transaction_blocks;
                    let config = &self.config;
                    let st = &mut *st;
                    request.service(max_blocks, |direction, block, count, buf| {
                        Self::process_transaction(st, config, direction, block, count, buf)
                    })
                } else {
                    Err(SdError::NoMedia)
                }
            };

            // Completions run outside the protocol lock
            request.complete(result);
            self.pool.recycle(handle, request);
        }
    }

    /// Issue one DMA-bounded transaction.
    fn process_transaction(
        st: &mut ProtocolState<H>,
        config: &DriverConfig,
        direction: Direction,
        block: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), SdError> {
        if config.split_multiblock && count > 1 {
            for i in 0..count {
                let offset = i as usize * SD_BLOCK_SIZE as usize;
                Self::process_transaction(
                    st,
                    config,
                    direction,
                    block + i as u64,
                    1,
                    &mut buf[offset..offset + SD_BLOCK_SIZE as usize],
                )?;
            }
            return Ok(());
        }

        let session = st.card.as_ref().ok_or(SdError::NoMedia)?;
        let rca = session.rca;
        let addr = Self::command_address(session, block)?;

        match direction {
            Direction::Read if count == 1 => {
                let resp = st
                    .host
                    .send_command(&SdCommand::read_single_block(addr), Some(DataTransfer::Read(buf)))?;
                Self::check_r1(resp.as_r1())?;
            }
            Direction::Read => {
                let resp = st.host.send_command(
                    &SdCommand::read_multiple_block(addr, count),
                    Some(DataTransfer::Read(buf)),
                )?;
                Self::check_r1(resp.as_r1())?;
                st.host.send_command(&SdCommand::stop_transmission(), None)?;
            }
            Direction::Write if count == 1 => {
                let resp = st
                    .host
                    .send_command(&SdCommand::write_block(addr), Some(DataTransfer::Write(buf)))?;
                Self::check_r1(resp.as_r1())?;
                Self::wait_programming_done(st, rca)?;
            }
            Direction::Write => {
                if !config.disable_pre_erase {
                    sd::send_app_command(
                        &mut st.host,
                        rca,
                        config.app_cmd_retries,
                        &SdCommand::app_set_wr_blk_erase_count(count),
                        None,
                    )?;
                }
                let resp = st.host.send_command(
                    &SdCommand::write_multiple_block(addr, count),
                    Some(DataTransfer::Write(buf)),
                )?;
                Self::check_r1(resp.as_r1())?;
                st.host.send_command(&SdCommand::stop_transmission(), None)?;
                Self::wait_programming_done(st, rca)?;
            }
        }
        Ok(())
    }

    /// Byte-addressed cards take the offset, block-addressed cards the
    /// index.
    fn command_address(session: &CardSession, block: u64) -> Result<u32, SdError> {
        let addr = if session.is_block_addressed() {
            block
        } else {
            block * SD_BLOCK_SIZE as u64
        };
        addr.try_into().map_err(|_| SdError::OutOfRange)
    }

    fn check_r1(status: u32) -> Result<(), SdError> {
        const FATAL: u32 = R1_OUT_OF_RANGE
            | R1_ADDRESS_ERROR
            | R1_BLOCK_LEN_ERROR
            | R1_COM_CRC_ERROR
            | R1_ILLEGAL_COMMAND
            | R1_ERROR;
        if status & FATAL != 0 {
            return Err(SdError::CardError(status, "card reported transfer error"));
        }
        Ok(())
    }

    /// Wait until the card leaves the programming state after a write.
    fn wait_programming_done(st: &mut ProtocolState<H>, rca: u16) -> Result<(), SdError> {
        sd::wait_while_data_busy(&mut st.host, SD_PROGRAMMING_POLL_LIMIT_MS)?;
        for _ in 0..SD_PROGRAMMING_POLL_LIMIT_MS {
            let status = st
                .host
                .send_command(&SdCommand::send_status(rca), None)?
                .as_r1();
            if status & R1_READY_FOR_DATA != 0 && status & R1_CURRENT_STATE_MASK != R1_STATE_PRG {
                return Ok(());
            }
            st.host.delay_ms(1);
        }
        Err(SdError::Timeout)
    }

    // ===== Submission side =====

    pub fn submit_read(
        &self,
        buffer: Vec<u8>,
        start_block: u64,
        block_count: u32,
        attrs: RequestAttrs,
        completion: Completion,
    ) {
        self.submit_io(Direction::Read, buffer, start_block, block_count, attrs, completion);
    }

    pub fn submit_write(
        &self,
        buffer: Vec<u8>,
        start_block: u64,
        block_count: u32,
        attrs: RequestAttrs,
        completion: Completion,
    ) {
        self.submit_io(Direction::Write, buffer, start_block, block_count, attrs, completion);
    }

    fn submit_io(
        &self,
        direction: Direction,
        buffer: Vec<u8>,
        start_block: u64,
        block_count: u32,
        attrs: RequestAttrs,
        completion: Completion,
    ) {
        let media = *self.media.lock();

        // Policy checks run before any hardware is involved
        if !media.present || !self.pool.is_queue_enabled() {
            completion(Err(SdError::NoMedia), buffer);
            return;
        }
        if block_count == 0 || buffer.len() != block_count as usize * SD_BLOCK_SIZE as usize {
            completion(Err(SdError::InvalidArgument), buffer);
            return;
        }
        let end_block = start_block.checked_add(block_count as u64);
        if end_block.is_none_or(|end| end > media.block_count) {
            completion(Err(SdError::OutOfRange), buffer);
            return;
        }
        if direction == Direction::Write && media.write_protected {
            completion(Err(SdError::WriteProtected), buffer);
            return;
        }

        let kind = if block_count <= self.max_transaction_blocks {
            RequestKind::Simple
        } else {
            RequestKind::Complex
        };

        // Blocks until a slot frees; submitting callers tolerate this
        let handle = self.pool.acquire(kind);
        match self
            .pool
            .admit(handle, direction, start_block, block_count, attrs, buffer, completion)
        {
            Ok(()) => self.push_event(DriverEvent::RequestPending),
            Err((buffer, completion)) => completion(Err(SdError::NoMedia), buffer),
        }
    }

    // ===== Queries =====

    pub fn is_present(&self) -> bool {
        self.media.lock().present
    }

    pub fn is_write_protected(&self) -> bool {
        self.media.lock().write_protected
    }

    pub fn block_size(&self) -> u32 {
        SD_BLOCK_SIZE
    }

    /// Device size in storage blocks. Gated through the protocol lock so
    /// it cannot race an attach or detach in flight.
    pub fn capacity_blocks(&self) -> Result<u64, SdError> {
        let st = self.protocol.lock();
        st.card.as_ref().map(|c| c.block_count()).ok_or(SdError::NoMedia)
    }

    pub fn max_block_index(&self) -> Result<u64, SdError> {
        Ok(self.capacity_blocks()?.saturating_sub(1))
    }

    /// Identity snapshot for inventory queries; same gate as capacity.
    pub fn card_info(&self) -> Result<CardInfo, SdError> {
        let st = self.protocol.lock();
        let session = st.card.as_ref().ok_or(SdError::NoMedia)?;
        Ok(CardInfo {
            manufacturer_id: session.cid.manufacturer_id,
            oem_id: session.cid.oem_id,
            product_name: session.cid.product_name,
            hw_revision: session.cid.hw_revision,
            fw_revision: session.cid.fw_revision,
            serial_number: session.cid.serial_number,
            manufacture_month: session.cid.manufacture_month,
            manufacture_year: session.cid.manufacture_year,
            capacity_bytes: session.block_count() * SD_BLOCK_SIZE as u64,
            block_size: SD_BLOCK_SIZE,
            speed_class: session.ssr.speed_class,
            uhs_speed_grade: session.ssr.uhs_speed_grade,
            video_speed_class: session.ssr.video_speed_class,
        })
    }

    /// Request an orderly detach; processed on the protocol domain like a
    /// removal event.
    pub fn eject(&self) -> Result<(), SdError> {
        if !self.is_present() {
            return Err(SdError::NoMedia);
        }
        self.push_event(DriverEvent::CardDetached);
        Ok(())
    }
}
