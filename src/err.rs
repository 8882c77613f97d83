// ===== Types and Structures =====

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// A command round-trip or mode switch failed in a way that a retry at
    /// a lower speed mode may recover from.
    NotResponding,
    /// An identification/addressing command failed; no fallback is
    /// meaningful and bring-up stops.
    Aborted,
    Timeout,
    Crc,
    InvalidResponse,
    UnsupportedCard,
    /// No card attached, or the request queue is disabled.
    NoMedia,
    NoMemory,
    InvalidArgument,
    OutOfRange,
    WriteProtected,
    TransferError,
    CardError(u32, &'static str),
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::NotResponding => write!(f, "Card not responding"),
            SdError::Aborted => write!(f, "Bring-up aborted"),
            SdError::Timeout => write!(f, "Command timeout error"),
            SdError::Crc => write!(f, "Command CRC error"),
            SdError::InvalidResponse => write!(f, "Invalid response"),
            SdError::UnsupportedCard => write!(f, "Unsupported card"),
            SdError::NoMedia => write!(f, "No media present"),
            SdError::NoMemory => write!(f, "Out of memory"),
            SdError::InvalidArgument => write!(f, "Invalid argument"),
            SdError::OutOfRange => write!(f, "Block address out of range"),
            SdError::WriteProtected => write!(f, "Card is write protected"),
            SdError::TransferError => write!(f, "Transfer error"),
            SdError::CardError(status, desc) => write!(f, "Card error: 0x{:X} ({})", status, desc),
        }
    }
}

impl SdError {
    /// Whether the speed-fallback ladder should retry at a lower mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SdError::NotResponding)
    }
}
