pub mod notification;
pub mod rejection;

use thiserror::Error;

/// Malformed wire data on encode or decode. Fatal to the single operation,
/// never to the connection it was read from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected command byte {actual:#04x}, expected {expected:#04x}")]
    UnexpectedCommand { expected: u8, actual: u8 },

    #[error("buffer too short for a complete frame")]
    Truncated,

    #[error("frame {frame:#04x} has invalid length {len}")]
    BadFrameLength { frame: u8, len: usize },

    #[error("mandatory {0} frame is missing")]
    MissingFrame(&'static str),
}
