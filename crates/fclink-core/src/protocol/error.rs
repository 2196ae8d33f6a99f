//! Protocol errors

use thiserror::Error;

use super::function::Function;

/// Errors that can occur while framing, queueing or correlating MSP traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Port could not be opened, cloned or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Payload over the configured or wire limit
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Typed view of a payload with the wrong length
    #[error("Payload size mismatch: record needs {expected} bytes, payload has {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    /// Frame does not start with `$`
    #[error("Bad frame marker: {0:#04x}")]
    BadMarker(u8),

    /// Format byte is neither `M` nor `X`
    #[error("Unknown wire format byte: {0:#04x}")]
    BadFormat(u8),

    /// Direction byte is not `<`, `>` or `!`
    #[error("Unknown direction byte: {0:#04x}")]
    BadDirection(u8),

    /// Buffer ends before the frame does
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Stored checksum disagrees with the content
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Function or payload too wide for MSP v1
    #[error("{function} cannot be encoded as MSP v1 (function > 255 or payload > 255 bytes)")]
    Unencodable { function: Function },

    /// Every line busy and no room in the queue
    #[error("Outbound queue full ({capacity} messages), dropped {function}")]
    QueueFull { capacity: usize, function: Function },

    /// Line index out of range
    #[error("Invalid serial line {line} (have {lines})")]
    InvalidLine { line: usize, lines: usize },

    /// Part of a read found no room in the line's ring
    #[error("Receive buffer overflow on line {line}: {dropped} bytes dropped")]
    BufferOverflow { line: usize, dropped: usize },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No reply within the reply timeout
    #[error("Request {function} timed out")]
    Timeout { function: Function },

    /// The flight controller answered with `!`
    #[error("Flight controller returned an error reply for {function}")]
    ErrorReply { function: Function },

    /// Client detached before the reply arrived
    #[error("Reply channel closed before {function} completed")]
    ReplyDropped { function: Function },

    /// Config file is not valid JSON for `EngineConfig`
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// I/O error from a file or port
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
