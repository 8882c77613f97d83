//! Decoders for the fixed-format card registers (CID, CSD, SCR, SSR) and
//! the CMD6 switch-function status block.
//!
//! Registers arrive big-endian and bit-packed; all field access goes
//! through [`extract_bits`], which numbers bits the way the SD spec does
//! (highest bit lives in the most significant bit of byte 0).

use bitflags::bitflags;

use super::constant::*;
use crate::err::SdError;

/// Pull bits `hi..=lo` out of a big-endian register image.
fn extract_bits(raw: &[u8], hi: u32, lo: u32) -> u32 {
    let total = raw.len() as u32 * 8;
    debug_assert!(hi >= lo && hi < total && hi - lo < 32);
    let mut value = 0u32;
    for bit in (lo..=hi).rev() {
        let byte = raw[((total - 1 - bit) / 8) as usize];
        value = (value << 1) | ((byte >> (bit % 8)) & 1) as u32;
    }
    value
}

// ===== CID =====

/// Card identification register, 16 bytes on the wire. Decoded once per
/// card session and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 5],
    pub hw_revision: u8,
    pub fw_revision: u8,
    pub serial_number: u32,
    pub manufacture_year: u16,
    pub manufacture_month: u8,
}

impl Cid {
    pub fn decode(raw: &[u8; 16]) -> Self {
        let mut product_name = [0u8; 5];
        product_name.copy_from_slice(&raw[3..8]);

        Self {
            manufacturer_id: raw[0],
            oem_id: u16::from_be_bytes([raw[1], raw[2]]),
            product_name,
            hw_revision: raw[8] >> 4,
            fw_revision: raw[8] & 0xF,
            serial_number: u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]),
            manufacture_year: 2000 + extract_bits(raw, 19, 12) as u16,
            manufacture_month: extract_bits(raw, 11, 8) as u8,
        }
    }

    /// Product name as printable ASCII, trailing padding stripped.
    pub fn product_name_str(&self) -> &str {
        let end = self
            .product_name
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(self.product_name.len());
        core::str::from_utf8(&self.product_name[..end]).unwrap_or("?")
    }
}

// ===== CSD =====

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandClasses: u16 {
        const BASIC = 1 << 0;
        const BLOCK_READ = 1 << 2;
        const BLOCK_WRITE = 1 << 4;
        const ERASE = 1 << 5;
        const WRITE_PROTECT = 1 << 6;
        const LOCK_CARD = 1 << 7;
        const APP_SPECIFIC = 1 << 8;
        const IO_MODE = 1 << 9;
        const SWITCH = 1 << 10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CsdFlags: u16 {
        const READ_BL_PARTIAL = 1 << 0;
        const WRITE_BLK_MISALIGN = 1 << 1;
        const READ_BLK_MISALIGN = 1 << 2;
        const DSR_IMP = 1 << 3;
        const ERASE_BLK_EN = 1 << 4;
        const WP_GRP_ENABLE = 1 << 5;
        const WRITE_BL_PARTIAL = 1 << 6;
        const COPY = 1 << 7;
        const PERM_WRITE_PROTECT = 1 << 8;
        const TMP_WRITE_PROTECT = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdVersion {
    V1,
    V2,
}

/// Card-specific data, decoded into a version-independent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csd {
    pub version: CsdVersion,
    /// Asynchronous access time, rounded up to whole nanoseconds.
    pub taac_ns: u32,
    /// Clock-relative access time in clock cycles.
    pub nsac_clocks: u32,
    /// Maximum transfer rate in bit/s.
    pub max_transfer_rate: u32,
    pub command_classes: CommandClasses,
    pub read_block_len: u32,
    pub write_block_len: u32,
    /// Device size in read-block-length units (V1) or fixed 512-byte
    /// blocks (V2), straight from the version-specific formula.
    pub capacity_blocks: u64,
    pub flags: CsdFlags,
    /// V2 cards address by block index; V1 cards by byte offset.
    pub block_addressed: bool,
    /// V2 DEVICE_SIZE at or beyond the SDXC threshold.
    pub extended_capacity: bool,
}

impl Csd {
    pub fn decode(raw: &[u8; 16]) -> Result<Self, SdError> {
        let version = match extract_bits(raw, 127, 126) {
            0 => CsdVersion::V1,
            1 => CsdVersion::V2,
            // Version 3 (SDUC) and reserved encodings
            _ => return Err(SdError::UnsupportedCard),
        };

        let taac = extract_bits(raw, 119, 112);
        let taac_unit = CSD_TAAC_UNIT_NS[(taac & 0x7) as usize];
        let taac_value = CSD_TAAC_VALUE_X10[((taac >> 3) & 0xF) as usize];
        let taac_ns = (taac_unit * taac_value + 9) / 10;

        let nsac_clocks = extract_bits(raw, 111, 104) * 100;

        let tran = extract_bits(raw, 103, 96);
        let max_transfer_rate =
            CSD_RATE_UNIT_X10[(tran & 0x7) as usize] * CSD_TAAC_VALUE_X10[((tran >> 3) & 0xF) as usize];

        let command_classes = CommandClasses::from_bits_truncate(extract_bits(raw, 95, 84) as u16);

        let mut flags = CsdFlags::empty();
        let mut set = |bit: u32, flag: CsdFlags| {
            if extract_bits(raw, bit, bit) != 0 {
                flags |= flag;
            }
        };
        set(79, CsdFlags::READ_BL_PARTIAL);
        set(78, CsdFlags::WRITE_BLK_MISALIGN);
        set(77, CsdFlags::READ_BLK_MISALIGN);
        set(76, CsdFlags::DSR_IMP);
        set(46, CsdFlags::ERASE_BLK_EN);
        set(31, CsdFlags::WP_GRP_ENABLE);
        set(21, CsdFlags::WRITE_BL_PARTIAL);
        set(14, CsdFlags::COPY);
        set(13, CsdFlags::PERM_WRITE_PROTECT);
        set(12, CsdFlags::TMP_WRITE_PROTECT);

        let write_block_len = 1u32 << extract_bits(raw, 25, 22);

        match version {
            CsdVersion::V1 => {
                let read_block_len = 1u32 << extract_bits(raw, 83, 80);
                let c_size = extract_bits(raw, 73, 62) as u64;
                let c_size_mult = extract_bits(raw, 49, 47);
                Ok(Self {
                    version,
                    taac_ns,
                    nsac_clocks,
                    max_transfer_rate,
                    command_classes,
                    read_block_len,
                    write_block_len,
                    capacity_blocks: (1 + c_size) << (c_size_mult + 2),
                    flags,
                    block_addressed: false,
                    extended_capacity: false,
                })
            }
            CsdVersion::V2 => {
                let device_size = extract_bits(raw, 69, 48) as u64;
                Ok(Self {
                    version,
                    taac_ns,
                    nsac_clocks,
                    max_transfer_rate,
                    command_classes,
                    read_block_len: SD_BLOCK_SIZE,
                    write_block_len,
                    capacity_blocks: (1 + device_size) << 10,
                    flags,
                    block_addressed: true,
                    extended_capacity: device_size >= 0xFFFF,
                })
            }
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_blocks * self.read_block_len as u64
    }

    /// Device size in 512-byte storage blocks, independent of version.
    pub fn storage_blocks(&self) -> u64 {
        self.capacity_bytes() / SD_BLOCK_SIZE as u64
    }
}

// ===== SCR =====

/// Physical-layer specification version, folded from the four version
/// fields into one totally-ordered value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecVersion {
    V1_0,
    V1_10,
    V2_00,
    V3,
    V4,
    V5,
    V6OrLater,
}

/// SD configuration register, 8 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scr {
    pub spec_version: SpecVersion,
    pub bus_widths: u8,
    pub data_status_after_erase: bool,
    pub supports_cmd23: bool,
    pub supports_cmd20: bool,
}

impl Scr {
    pub fn decode(raw: &[u8; 8]) -> Self {
        let sd_spec = extract_bits(raw, 59, 56);
        let sd_spec3 = extract_bits(raw, 47, 47);
        let sd_spec4 = extract_bits(raw, 42, 42);
        let sd_specx = extract_bits(raw, 41, 38);

        // The version bits only ever accumulate upwards; the highest one
        // set wins.
        let spec_version = if sd_specx >= 2 {
            SpecVersion::V6OrLater
        } else if sd_specx == 1 {
            SpecVersion::V5
        } else if sd_spec4 != 0 {
            SpecVersion::V4
        } else if sd_spec3 != 0 {
            SpecVersion::V3
        } else {
            match sd_spec {
                0 => SpecVersion::V1_0,
                1 => SpecVersion::V1_10,
                _ => SpecVersion::V2_00,
            }
        };

        Self {
            spec_version,
            bus_widths: extract_bits(raw, 51, 48) as u8,
            data_status_after_erase: extract_bits(raw, 55, 55) != 0,
            supports_cmd23: extract_bits(raw, 33, 33) != 0,
            supports_cmd20: extract_bits(raw, 32, 32) != 0,
        }
    }

    pub fn supports_4bit_bus(&self) -> bool {
        self.bus_widths & (1 << 2) != 0
    }
}

// ===== SSR =====

/// The three fields of the 64-byte SD status this driver consumes.
/// Re-fetched on demand rather than held for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ssr {
    pub speed_class: u8,
    pub uhs_speed_grade: u8,
    pub video_speed_class: u8,
}

impl Ssr {
    pub fn decode(raw: &[u8; 64]) -> Self {
        Self {
            speed_class: raw[8],
            uhs_speed_grade: raw[14] >> 4,
            video_speed_class: raw[15],
        }
    }
}

// ===== CMD6 switch status =====

/// 64-byte status block returned by every switch-function transfer.
pub struct SwitchStatus {
    raw: [u8; 64],
}

impl SwitchStatus {
    pub fn new(raw: [u8; 64]) -> Self {
        Self { raw }
    }

    /// Maximum current consumption in mA (zero means the query failed).
    pub fn max_current_ma(&self) -> u32 {
        u16::from_be_bytes([self.raw[0], self.raw[1]]) as u32
    }

    /// 16-bit support mask for a zero-indexed function group.
    pub fn group_support(&self, group: u32) -> u16 {
        let msb = (12 - 2 * group) as usize;
        u16::from_be_bytes([self.raw[msb], self.raw[msb + 1]])
    }

    /// Function the card selected for a zero-indexed group; 0xF reports a
    /// switch error.
    pub fn group_selection(&self, group: u32) -> u8 {
        let byte = self.raw[(16 - group / 2) as usize];
        if group % 2 == 0 {
            byte & 0xF
        } else {
            byte >> 4
        }
    }
}

/// Switch capabilities accumulated during bring-up from CMD6 mode-0
/// probes. Mutable while the engine runs, frozen once the card is ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchCaps {
    pub max_current_ma: u32,
    /// Zero when the card never reported the high-speed function.
    pub high_speed_max_clock: u32,
    /// Group-0 support mask; UHS bits are meaningful at 1.8V signaling.
    pub bus_modes: u16,
    /// Group-2 support mask.
    pub driver_types: u16,
    /// Group-3 support mask.
    pub current_limits: u16,
}
