//! Error types for the store, the wire codec and the message bus.

use thiserror::Error;

/// Failures raised by the backing store and its connection supervisor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The supervisor has no usable connection (degraded or closed)
    #[error("No active connection to the backing store")]
    NoActiveConnection,
    /// Opening a connection failed
    #[error("Connection failed: {0}")]
    Connect(String),
    /// A statement failed to execute
    #[error("Query failed: {0}")]
    Query(String),
    /// A row could not be turned back into a value
    #[error("Row decoding failed: {0}")]
    Decode(String),
    /// A unit of work failed inside a transaction and was rolled back
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

/// Failures raised while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("Payload truncated: needed {needed} byte(s) at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Invalid modified UTF-8 in string field at offset {0}")]
    InvalidUtf8(usize),
    #[error("String of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),
    #[error("Invalid boolean byte {value:#04x} at offset {offset}")]
    InvalidBool { offset: usize, value: u8 },
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failures raised by the message bus and its handlers.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Send to node '{node}' failed: {reason}")]
    Send { node: String, reason: String },
    #[error("Channel not registered: {0}")]
    ChannelNotRegistered(String),
}
