use core::fmt;

use crate::resp::R1Status;

pub type Result<T = ()> = core::result::Result<T, Error>;

/// Raw transport failure reported by the bus host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No response arrived within the effective command timeout.
    Timeout,
    /// Response or data CRC check failed.
    Crc,
    /// Controller-level fault (FIFO underrun, DMA abort, ...).
    HardwareFault,
    /// The host or card lacks the requested capability.
    NotSupported,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "command timeout"),
            BusError::Crc => write!(f, "CRC error"),
            BusError::HardwareFault => write!(f, "host controller fault"),
            BusError::NotSupported => write!(f, "not supported by host or card"),
        }
    }
}

/// The card responded, but the content violates the handshake contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// SEND_IF_COND echo-back did not match the pattern we sent.
    EchoMismatch { expected: u8, actual: u8 },
    /// A SWITCH command completed but the card flagged SWITCH_ERROR.
    SwitchRejected,
    /// Card status carried error bits after a command.
    CardStatus(R1Status),
    /// SPI-mode status poll returned error flags.
    SpiStatus(u16),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::EchoMismatch { expected, actual } => {
                write!(f, "IF_COND echo mismatch: sent {expected:#x}, got {actual:#x}")
            }
            ProtocolError::SwitchRejected => write!(f, "card rejected switch"),
            ProtocolError::CardStatus(status) => {
                write!(f, "card status error: {:#010x}", status.bits())
            }
            ProtocolError::SpiStatus(status) => write!(f, "SPI status error: {status:#06x}"),
        }
    }
}

/// Well-formed response bytes that do not match an expected structural
/// invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The register names a layout revision this crate does not know, or the
    /// revision needed to pick a layout is missing.
    UnsupportedVersion,
    /// Fields are individually valid but mutually contradictory.
    Inconsistent,
    /// The raw buffer is shorter than the register it should hold.
    Truncated,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnsupportedVersion => write!(f, "unsupported register layout version"),
            DecodeError::Inconsistent => write!(f, "inconsistent register contents"),
            DecodeError::Truncated => write!(f, "register buffer too short"),
        }
    }
}

/// Aligned allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aligned allocation failed")
    }
}

/// Umbrella error for every fallible operation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Bus(BusError),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Alloc(AllocError),
    /// A block range exceeds the card capacity or the supplied buffer.
    OutOfRange,
    /// The operation is not supported by this card's advertised features.
    NotSupported,
    /// A bounded retry or polling loop exhausted its budget.
    Timeout,
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        Error::Bus(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<AllocError> for Error {
    fn from(err: AllocError) -> Self {
        Error::Alloc(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(err) => write!(f, "bus: {err}"),
            Error::Protocol(err) => write!(f, "protocol: {err}"),
            Error::Decode(err) => write!(f, "decode: {err}"),
            Error::Alloc(err) => write!(f, "{err}"),
            Error::OutOfRange => write!(f, "block range out of range"),
            Error::NotSupported => write!(f, "not supported by card"),
            Error::Timeout => write!(f, "retry budget exhausted"),
        }
    }
}
