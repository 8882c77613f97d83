use super::constant::*;

/// One protocol command: opcode, argument and the expected response shape,
/// plus the data-phase descriptor when a transfer rides along.
#[derive(Debug, Clone)]
pub struct SdCommand {
    pub opcode: u8,
    pub arg: u32,
    pub resp_type: u32,
    pub data_present: bool,
    pub data_dir_read: bool,
    pub block_size: u32,
    pub block_count: u32,
}

impl SdCommand {
    pub fn new(opcode: u8, arg: u32, resp_type: u32) -> Self {
        Self {
            opcode,
            arg,
            resp_type,
            data_present: false,
            data_dir_read: true,
            block_size: 0,
            block_count: 0,
        }
    }

    pub fn with_data(mut self, block_size: u32, block_count: u32, is_read: bool) -> Self {
        self.data_present = true;
        self.data_dir_read = is_read;
        self.block_size = block_size;
        self.block_count = block_count;
        self
    }

    // CMD0
    pub fn go_idle() -> Self {
        Self::new(SD_GO_IDLE_STATE, 0, MMC_RSP_NONE)
    }

    // CMD2
    pub fn all_send_cid() -> Self {
        Self::new(SD_ALL_SEND_CID, 0, MMC_RSP_R2)
    }

    // CMD3
    pub fn send_relative_addr() -> Self {
        Self::new(SD_SEND_RELATIVE_ADDR, 0, MMC_RSP_R6)
    }

    // CMD6; `value` selects the function within the zero-indexed `group`,
    // every other group nibble is left untouched
    pub fn switch_function(set: bool, group: u32, value: u8) -> Self {
        let mut arg = 0x00FF_FFFF;
        arg &= !(0xF << (4 * group));
        arg |= (value as u32 & 0xF) << (4 * group);
        if set {
            arg |= SD_SWITCH_MODE_SET;
        }
        Self::new(SD_SWITCH_FUNC, arg, MMC_RSP_R1).with_data(SD_SWITCH_STATUS_LEN as u32, 1, true)
    }

    // CMD6 mode 0, no group touched: pure capability query
    pub fn check_functions() -> Self {
        Self::new(SD_SWITCH_FUNC, 0x00FF_FFFF, MMC_RSP_R1).with_data(
            SD_SWITCH_STATUS_LEN as u32,
            1,
            true,
        )
    }

    // CMD7
    pub fn select_card(rca: u16) -> Self {
        Self::new(SD_SELECT_CARD, (rca as u32) << 16, MMC_RSP_R1B)
    }

    // CMD8
    pub fn send_if_cond() -> Self {
        Self::new(
            SD_SEND_IF_COND,
            SD_IF_COND_VHS_27_36 | SD_IF_COND_CHECK_PATTERN,
            MMC_RSP_R7,
        )
    }

    // CMD9
    pub fn send_csd(rca: u16) -> Self {
        Self::new(SD_SEND_CSD, (rca as u32) << 16, MMC_RSP_R2)
    }

    // CMD11
    pub fn voltage_switch() -> Self {
        Self::new(SD_VOLTAGE_SWITCH, 0, MMC_RSP_R1)
    }

    // CMD12
    pub fn stop_transmission() -> Self {
        Self::new(SD_STOP_TRANSMISSION, 0, MMC_RSP_R1B)
    }

    // CMD13
    pub fn send_status(rca: u16) -> Self {
        Self::new(SD_SEND_STATUS, (rca as u32) << 16, MMC_RSP_R1)
    }

    // CMD17
    pub fn read_single_block(addr: u32) -> Self {
        Self::new(SD_READ_SINGLE_BLOCK, addr, MMC_RSP_R1).with_data(SD_BLOCK_SIZE, 1, true)
    }

    // CMD18
    pub fn read_multiple_block(addr: u32, blocks: u32) -> Self {
        Self::new(SD_READ_MULTIPLE_BLOCK, addr, MMC_RSP_R1).with_data(SD_BLOCK_SIZE, blocks, true)
    }

    // CMD19
    pub fn send_tuning_block() -> Self {
        Self::new(SD_SEND_TUNING_BLOCK, 0, MMC_RSP_R1).with_data(64, 1, true)
    }

    // CMD24
    pub fn write_block(addr: u32) -> Self {
        Self::new(SD_WRITE_BLOCK, addr, MMC_RSP_R1).with_data(SD_BLOCK_SIZE, 1, false)
    }

    // CMD25
    pub fn write_multiple_block(addr: u32, blocks: u32) -> Self {
        Self::new(SD_WRITE_MULTIPLE_BLOCK, addr, MMC_RSP_R1).with_data(SD_BLOCK_SIZE, blocks, false)
    }

    // CMD55
    pub fn app_cmd(rca: u16) -> Self {
        Self::new(SD_APP_CMD, (rca as u32) << 16, MMC_RSP_R1)
    }

    // ACMD6
    pub fn app_set_bus_width(arg: u32) -> Self {
        Self::new(SD_APP_SET_BUS_WIDTH, arg, MMC_RSP_R1)
    }

    // ACMD13
    pub fn app_sd_status() -> Self {
        Self::new(SD_APP_SD_STATUS, 0, MMC_RSP_R1).with_data(64, 1, true)
    }

    // ACMD23
    pub fn app_set_wr_blk_erase_count(blocks: u32) -> Self {
        Self::new(SD_APP_SET_WR_BLK_ERASE_COUNT, blocks & 0x007F_FFFF, MMC_RSP_R1)
    }

    // ACMD41
    pub fn app_send_op_cond(ocr: u32) -> Self {
        Self::new(SD_APP_SEND_OP_COND, ocr, MMC_RSP_R3)
    }

    // ACMD51
    pub fn app_send_scr() -> Self {
        Self::new(SD_APP_SEND_SCR, 0, MMC_RSP_R1).with_data(8, 1, true)
    }
}

/// Raw response bytes as received on the command line. Short responses
/// occupy 6 bytes (index, 32-bit payload, CRC); R2 occupies 17 (reserved
/// index byte plus the 128-bit register payload).
#[derive(Debug, Clone)]
pub struct SdResponse {
    raw: [u8; 17],
}

impl SdResponse {
    pub fn none() -> Self {
        Self { raw: [0; 17] }
    }

    /// Build a short (48-bit) response around the 32-bit payload.
    pub fn short(payload: u32) -> Self {
        let mut raw = [0u8; 17];
        raw[1..5].copy_from_slice(&payload.to_be_bytes());
        Self { raw }
    }

    /// Build a long (136-bit) response around the 128-bit register payload.
    pub fn long(register: [u8; 16]) -> Self {
        let mut raw = [0u8; 17];
        raw[0] = 0x3F;
        raw[1..17].copy_from_slice(&register);
        Self { raw }
    }

    fn payload32(&self) -> u32 {
        u32::from_be_bytes([self.raw[1], self.raw[2], self.raw[3], self.raw[4]])
    }

    /// Card status.
    pub fn as_r1(&self) -> u32 {
        self.payload32()
    }

    /// 128-bit register payload (CID or CSD).
    pub fn as_r2(&self) -> [u8; 16] {
        let mut reg = [0u8; 16];
        reg.copy_from_slice(&self.raw[1..17]);
        reg
    }

    /// OCR.
    pub fn as_r3(&self) -> u32 {
        self.payload32()
    }

    /// Published RCA and the truncated status bits.
    pub fn as_r6(&self) -> (u16, u16) {
        let v = self.payload32();
        ((v >> 16) as u16, (v & 0xFFFF) as u16)
    }

    /// Echoed voltage window and check pattern.
    pub fn as_r7(&self) -> u32 {
        self.payload32()
    }
}
