//! Error handling.
use crate::pdu::MessageEncoding;
use std::io;
use thiserror::Error;

/// Error `enum` for everything this library can fail with.
///
/// Exhaustive matching is NOT guaranteed by the library API (!).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was malformed. Raised before any I/O
    /// happens.
    #[error("invalid argument: {0}")]
    Validation(String),
    /// An operation was attempted while the serial port is not open, or the
    /// background IO task is gone.
    #[error("the serial port is not open")]
    PortClosed,
    /// Another command is still in flight. Commands are never queued;
    /// callers serialize.
    #[error("another command is already in flight")]
    Busy,
    /// No response terminator was seen within the deadline. The port stays
    /// open; only the in-flight slot is released.
    #[error("command {command:?} timed out waiting for a response (terminator 0x{terminator:02X})")]
    Timeout { command: String, terminator: u8 },
    /// Some random I/O error from the underlying port.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] io::Error),
    /// The modem failed a command during the initialization sequence.
    #[error("modem initialization failed at {command:?}: {response}")]
    InitFailure { command: String, response: String },
    /// The transport resolved cleanly, but the modem did not report `OK`
    /// where the operation required it. Carries the verbatim response,
    /// including any `+CME ERROR:`/`+CMS ERROR:` line.
    #[error("error from modem: {0}")]
    Modem(String),
    /// The response shape did not match the grammar for the command family
    /// (missing header line, non-hex PDU body, short field list, ...).
    #[error("unexpected response shape: {0}")]
    Protocol(String),
    /// An error occurred parsing a PDU.
    #[error("invalid PDU: {0}")]
    InvalidPdu(&'static str),
    /// Unsupported user data encoding. The raw bytes are provided for your
    /// edification.
    #[error("data of unknown encoding {0:?}: {1:?}")]
    UnsupportedEncoding(MessageEncoding, Vec<u8>),
    /// The cell geolocation HTTP request failed.
    #[error("geolocation request failed: {0}")]
    Geolocation(#[from] reqwest::Error),
}

/// Bog-standard result type alias.
pub type Result<T> = std::result::Result<T, Error>;
