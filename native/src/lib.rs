pub mod config;
pub mod ipc;
pub mod logging;

pub use config::{ChannelConfig, ConfigError, TransportMode};
pub use ipc::{
    ChannelCoordinator, ChannelError, ChannelResult, ChannelState, ChannelStatsSnapshot,
    CommandHandler, HandlerError, OrchestratorChannel, RenderCommand, RenderCommandType,
    RenderResult, RenderResultStatus, TransportKind,
};

/// Crate version string.
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        assert_eq!(get_version(), env!("CARGO_PKG_VERSION"));
    }
}
