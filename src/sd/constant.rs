#![allow(unused)]

// SD memory card command set (class 0/2/4/8/10)
pub const SD_GO_IDLE_STATE: u8 = 0; // CMD0
pub const SD_ALL_SEND_CID: u8 = 2; // CMD2
pub const SD_SEND_RELATIVE_ADDR: u8 = 3; // CMD3
pub const SD_SWITCH_FUNC: u8 = 6; // CMD6
pub const SD_SELECT_CARD: u8 = 7; // CMD7
pub const SD_SEND_IF_COND: u8 = 8; // CMD8
pub const SD_SEND_CSD: u8 = 9; // CMD9
pub const SD_VOLTAGE_SWITCH: u8 = 11; // CMD11
pub const SD_STOP_TRANSMISSION: u8 = 12; // CMD12
pub const SD_SEND_STATUS: u8 = 13; // CMD13
pub const SD_READ_SINGLE_BLOCK: u8 = 17; // CMD17
pub const SD_READ_MULTIPLE_BLOCK: u8 = 18; // CMD18
pub const SD_SEND_TUNING_BLOCK: u8 = 19; // CMD19
pub const SD_WRITE_BLOCK: u8 = 24; // CMD24
pub const SD_WRITE_MULTIPLE_BLOCK: u8 = 25; // CMD25
pub const SD_APP_CMD: u8 = 55; // CMD55

// Application-specific commands, always preceded by CMD55
pub const SD_APP_SET_BUS_WIDTH: u8 = 6; // ACMD6
pub const SD_APP_SD_STATUS: u8 = 13; // ACMD13
pub const SD_APP_SET_WR_BLK_ERASE_COUNT: u8 = 23; // ACMD23
pub const SD_APP_SEND_OP_COND: u8 = 41; // ACMD41
pub const SD_APP_SEND_SCR: u8 = 51; // ACMD51

// Response types
pub const MMC_RSP_PRESENT: u32 = 1 << 0;
pub const MMC_RSP_136: u32 = 1 << 1; // 136-bit response
pub const MMC_RSP_CRC: u32 = 1 << 2; // Expect valid CRC
pub const MMC_RSP_BUSY: u32 = 1 << 3; // Card may send busy
pub const MMC_RSP_OPCODE: u32 = 1 << 4; // Response contains opcode

pub const MMC_RSP_NONE: u32 = 0;
pub const MMC_RSP_R1: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R1B: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE | MMC_RSP_BUSY;
pub const MMC_RSP_R2: u32 = MMC_RSP_PRESENT | MMC_RSP_136 | MMC_RSP_CRC;
pub const MMC_RSP_R3: u32 = MMC_RSP_PRESENT;
pub const MMC_RSP_R6: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R7: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;

// OCR bits
pub const OCR_BUSY: u32 = 1 << 31; // Power-up routine finished
pub const OCR_HCS: u32 = 1 << 30; // Host/card capacity status
pub const OCR_XPC: u32 = 1 << 28; // SDXC power control
pub const OCR_S18: u32 = 1 << 24; // S18R on request, S18A on response
pub const OCR_VOLTAGE_MASK: u32 = 0x00FF_8000; // 2.7V - 3.6V window bits

// Card status (R1) bits
pub const R1_OUT_OF_RANGE: u32 = 1 << 31;
pub const R1_ADDRESS_ERROR: u32 = 1 << 30;
pub const R1_BLOCK_LEN_ERROR: u32 = 1 << 29;
pub const R1_CARD_IS_LOCKED: u32 = 1 << 25;
pub const R1_COM_CRC_ERROR: u32 = 1 << 23;
pub const R1_ILLEGAL_COMMAND: u32 = 1 << 22;
pub const R1_ERROR: u32 = 1 << 19;
pub const R1_READY_FOR_DATA: u32 = 1 << 8;
pub const R1_APP_CMD: u32 = 1 << 5; // Card expects an application command

pub const R1_CURRENT_STATE_MASK: u32 = 0xF << 9;
pub const R1_STATE_TRAN: u32 = 4 << 9;
pub const R1_STATE_DATA: u32 = 5 << 9;
pub const R1_STATE_RCV: u32 = 6 << 9;
pub const R1_STATE_PRG: u32 = 7 << 9;

// CMD8 argument fields
pub const SD_IF_COND_VHS_27_36: u32 = 0x100;
pub const SD_IF_COND_CHECK_PATTERN: u32 = 0xAA;

// CMD6 switch-function encoding. Groups are zero-indexed; each group
// occupies one nibble of the argument, 0xF leaves the group untouched.
pub const SD_SWITCH_MODE_CHECK: u32 = 0;
pub const SD_SWITCH_MODE_SET: u32 = 1 << 31;
pub const SD_SWITCH_GROUP_ACCESS_MODE: u32 = 0;
pub const SD_SWITCH_GROUP_COMMAND_SYSTEM: u32 = 1;
pub const SD_SWITCH_GROUP_DRIVER_STRENGTH: u32 = 2;
pub const SD_SWITCH_GROUP_CURRENT_LIMIT: u32 = 3;
pub const SD_SWITCH_NO_CHANGE: u32 = 0xF;

// Group 0 (access mode) function values
pub const SD_ACCESS_MODE_DEFAULT: u8 = 0; // SDR12 at 1.8V signaling
pub const SD_ACCESS_MODE_HIGH_SPEED: u8 = 1; // SDR25 at 1.8V signaling
pub const SD_ACCESS_MODE_SDR50: u8 = 2;
pub const SD_ACCESS_MODE_SDR104: u8 = 3;
pub const SD_ACCESS_MODE_DDR50: u8 = 4;

// Group 3 (current limit) function values
pub const SD_CURRENT_LIMIT_200: u8 = 0;
pub const SD_CURRENT_LIMIT_400: u8 = 1;
pub const SD_CURRENT_LIMIT_600: u8 = 2;
pub const SD_CURRENT_LIMIT_800: u8 = 3;

// Group 0 support-mask bits reported by a CMD6 mode-0 probe
pub const SD_BUS_MODE_SDR12: u16 = 1 << 0;
pub const SD_BUS_MODE_HIGH_SPEED: u16 = 1 << 1; // also SDR25
pub const SD_BUS_MODE_SDR50: u16 = 1 << 2;
pub const SD_BUS_MODE_SDR104: u16 = 1 << 3;
pub const SD_BUS_MODE_DDR50: u16 = 1 << 4;

pub const SD_SWITCH_STATUS_LEN: usize = 64;

// Fixed per-mode maximum clock rates
pub const SD_CLOCK_DEFAULT_SPEED: u32 = 25_000_000;
pub const SD_CLOCK_HIGH_SPEED: u32 = 50_000_000;
pub const SD_CLOCK_SDR12: u32 = 25_000_000;
pub const SD_CLOCK_SDR25: u32 = 50_000_000;
pub const SD_CLOCK_SDR50: u32 = 100_000_000;
pub const SD_CLOCK_SDR104: u32 = 208_000_000;
pub const SD_CLOCK_DDR50: u32 = 50_000_000;

pub const SD_BLOCK_SIZE: u32 = 512;

// Bring-up timing
pub const SD_INITIAL_CLOCKS: [u32; 4] = [400_000, 300_000, 200_000, 100_000];
pub const SD_OCR_POLL_ATTEMPTS: u32 = 100;
pub const SD_OCR_POLL_INTERVAL_MS: u32 = 20;
pub const SD_VOLTAGE_SWITCH_DELAY_MS: u32 = 1;
pub const SD_POWER_OFF_DELAY_MS: u32 = 1;
pub const SD_POWER_ON_DELAY_MS: u32 = 10;
pub const SD_PROGRAMMING_POLL_LIMIT_MS: u32 = 250;

// CSD TAAC: time unit in nanoseconds indexed by TAAC[2:0], value
// indexed by TAAC[6:3] and scaled by 10
pub const CSD_TAAC_UNIT_NS: [u32; 8] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
];
pub const CSD_TAAC_VALUE_X10: [u32; 16] =
    [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

// CSD TRAN_SPEED: rate unit in bit/s divided by 10, times the same
// value table as TAAC
pub const CSD_RATE_UNIT_X10: [u32; 8] = [
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    0,
    0,
    0,
    0,
];
