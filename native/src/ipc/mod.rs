// Cross-process render channel: shared memory with a named-pipe fallback.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod pipe;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod shared_memory;
pub mod stats;
mod transports;

use serde::{Deserialize, Serialize};

pub use client::OrchestratorChannel;
pub use coordinator::{
    ChannelCoordinator, ChannelState, CommandHandler, CommandStream, HandlerError,
};
pub use error::{ChannelError, ChannelResult};
pub use protocol::{
    ContentParameters, ContentSourceType, PayloadKind, RenderBackendType, RenderCommand,
    RenderCommandType, RenderProperties, RenderRect, RenderResult, RenderResultStatus, WireError,
    MAX_PAYLOAD_SIZE,
};
pub use stats::{ChannelStatsSnapshot, TransportStatsSnapshot};

/// Physical path a message travelled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    SharedMemory,
    NamedPipe,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::SharedMemory => write!(f, "shared memory"),
            TransportKind::NamedPipe => write!(f, "named pipe"),
        }
    }
}
