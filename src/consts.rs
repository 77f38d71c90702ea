/// Data block length in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Data block length as `u64`, for capacity arithmetic.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;
/// Trailing CRC bytes after a data block, clocked and discarded.
pub const CRC_LEN: usize = 2;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - reset the card into SPI mode while CS is low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// SD_SEND_OP_COND - sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;
}

pub mod checksums {
    /// Fixed checksum for CMD0 with a zero argument.
    pub const CMD0: u8 = 0x95;
    /// Fixed checksum for CMD8 with the interface-condition argument.
    pub const CMD8: u8 = 0x87;
    /// Placeholder checksum; SPI mode does not check it on other commands.
    pub const DUMMY: u8 = 0xFF;
}

pub mod arguments {
    /// CMD8: 2.7-3.6 V supply range plus the check pattern in the low byte.
    pub const CMD8_IF_COND: u32 = 0x0000_01AA;
    /// Check pattern the card must echo in the R7 trailer.
    pub const CMD8_PATTERN: u8 = 0xAA;
    /// ACMD41: host supports high-capacity cards.
    pub const ACMD41_HIGH_CAPACITY: u32 = 0x4000_0000;
}

pub mod tokens {
    /// Idle bus level; also what a busy or absent card shifts out.
    pub const IDLE: u8 = 0xFF;
    /// Start token for a single-block data transfer.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// OCR bits marking a powered-up high-capacity card.
    pub const OCR_HIGH_CAPACITY: u8 = 0xC0;
}
