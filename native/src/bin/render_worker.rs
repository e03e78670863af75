// Render worker host: attaches to the orchestrator's channel and serves widget commands.

extern crate render_channel;
use log::{error, info, warn};

#[path = "worker_modules/handler.rs"]
mod handler;

use handler::WidgetHost;
use render_channel::logging;
use render_channel::{ChannelConfig, ChannelCoordinator};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Set once a Destroy for widget 0 arrives.
static SHUTDOWN_REQUESTED: Mutex<bool> = Mutex::new(false);
static SHUTDOWN_CONDVAR: Condvar = Condvar::new();

fn request_shutdown() {
    let mut requested = SHUTDOWN_REQUESTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    *requested = true;
    SHUTDOWN_CONDVAR.notify_all();
}

fn wait_for_shutdown() {
    let mut requested = SHUTDOWN_REQUESTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    while !*requested {
        requested = SHUTDOWN_CONDVAR
            .wait(requested)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

fn load_config() -> Result<ChannelConfig, String> {
    let path = ChannelConfig::default_path();
    let mut config = ChannelConfig::load_or_default(path.as_deref())
        .map_err(|e| format!("Failed to load configuration: {}", e))?;
    config
        .apply_env()
        .map_err(|e| format!("Invalid environment configuration: {}", e))?;
    config.apply_args(std::env::args().skip(1));
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn fail(context: &str, message: &str) -> ! {
    error!("[WORKER] {}: {}", context, message);
    logging::capture_critical_error(context, message);
    logging::log_critical_error(context, message);
    logging::shutdown_sentry();
    std::process::exit(1);
}

fn main() {
    let _ = dotenvy::dotenv();

    logging::init_logger();
    logging::init_crash_logger();
    if logging::init_sentry_from_env() {
        info!("[WORKER] Sentry monitoring enabled");
    }

    info!("[WORKER] Render worker {}", render_channel::get_version());

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => fail("Configuration", &e),
    };
    info!(
        "[WORKER] Shared memory '{}', pipe '{}', mode {:?}",
        config.shared_memory_name, config.pipe_name, config.mode
    );

    let coordinator = Arc::new(ChannelCoordinator::new(config));
    if let Err(e) = coordinator.initialize() {
        fail("Channel Initialization", &e.to_string());
    }
    info!(
        "[WORKER] Connected over {:?}",
        coordinator.active_transports()
    );

    let host = Arc::new(WidgetHost::new(request_shutdown));
    host.attach(&coordinator);

    let dispatcher = Arc::clone(&host);
    if let Err(e) = coordinator.start_with(move |command| dispatcher.handle_command(command)) {
        fail("Channel Start", &e.to_string());
    }
    info!("[WORKER] Serving render commands");

    wait_for_shutdown();

    info!("[WORKER] Shutting down");
    coordinator.stop();
    let stats = coordinator.stats();
    info!(
        "[WORKER] Dispatched {} command(s), {} handler fault(s), {} widget(s) left",
        stats.commands_dispatched,
        stats.handler_faults,
        host.widget_count()
    );
    if stats.commands_rejected > 0 {
        warn!("[WORKER] {} command(s) rejected", stats.commands_rejected);
    }

    logging::shutdown_sentry();
}
