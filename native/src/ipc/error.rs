// Error type shared by the transports and both channel ends.

use super::protocol::WireError;
use super::shared_memory::Slot;
use crate::config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed shared memory slot: {0}")]
    MalformedSlot(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0:?} slot still holds an unconsumed message")]
    SlotBusy(Slot),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("No usable transport (shared memory: {shared_memory}; pipe: {pipe})")]
    NoTransport { shared_memory: String, pipe: String },

    #[error("All transports failed (shared memory: {shared_memory}; pipe: {pipe})")]
    AllTransportsFailed { shared_memory: String, pipe: String },

    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Command queue full ({0} entries)")]
    QueueFull(usize),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ChannelError {
    /// Timeouts are a normal outcome; callers may retry or fall back.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
