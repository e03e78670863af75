// Widget command handler invoked by the coordinator's dispatch loop.

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use render_channel::ipc::protocol::{
    ContentParameters, ContentSourceType, PayloadKind, RenderBackendType, RenderProperties,
    RenderRect,
};
use render_channel::{
    ChannelCoordinator, ChannelStatsSnapshot, HandlerError, RenderCommand, RenderCommandType,
    RenderResult, RenderResultStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Widget id that turns a Destroy into a worker shutdown request.
pub const SHUTDOWN_WIDGET_ID: u32 = 0;

/// Bookkeeping for one widget surface.
#[derive(Debug, Clone)]
struct WidgetSurface {
    window_handle: u64,
    bounds: RenderRect,
    backend: RenderBackendType,
    content: ContentParameters,
    properties: RenderProperties,
    frame_count: u32,
    created_at: Instant,
}

impl WidgetSurface {
    fn from_command(command: &RenderCommand) -> Self {
        Self {
            window_handle: command.window_handle,
            bounds: command.bounds,
            backend: command.backend_type,
            content: command.content.clone(),
            properties: command.properties.clone(),
            frame_count: 0,
            created_at: Instant::now(),
        }
    }

    fn average_fps(&self) -> f32 {
        let elapsed = self.created_at.elapsed().as_secs_f32();
        if elapsed <= f32::EPSILON {
            return 0.0;
        }
        self.frame_count as f32 / elapsed
    }

    /// RGBA backing store estimate.
    fn memory_bytes(&self) -> u64 {
        let width = self.bounds.width.max(0) as u64;
        let height = self.bounds.height.max(0) as u64;
        width * height * 4
    }
}

#[derive(Serialize)]
struct SystemSnapshot {
    version: String,
    uptime_ms: u64,
    widget_count: usize,
    total_frames: u64,
    memory_usage_mb: u64,
    channel: Option<ChannelStatsSnapshot>,
}

#[derive(Serialize)]
struct WidgetSnapshot {
    widget_id: u32,
    window_handle: u64,
    backend: String,
    content_source: String,
    bounds: [i32; 4],
    frame_count: u32,
    visible: bool,
    age_ms: u64,
}

#[derive(Serialize)]
struct ProcessSnapshot {
    pid: u32,
    uptime_ms: u64,
    widgets: Vec<WidgetSnapshot>,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn rejected(command: &RenderCommand, status: RenderResultStatus, message: String) -> RenderResult {
    warn!(
        "[WORKER] {:?} for widget {} rejected: {}",
        command.command_type, command.widget_id, message
    );
    RenderResult::with_status(command.command_id, command.widget_id, status, message)
}

fn unknown_widget(command: &RenderCommand) -> RenderResult {
    rejected(
        command,
        RenderResultStatus::InvalidParameters,
        format!("unknown widget {}", command.widget_id),
    )
}

fn check_content(content: &ContentParameters) -> Result<(), String> {
    let needs_url = matches!(
        content.source_type,
        ContentSourceType::Web | ContentSourceType::Api
    );
    if needs_url && content.source_url.trim().is_empty() {
        return Err(format!("{:?} content requires a source URL", content.source_type));
    }
    Ok(())
}

fn check_properties(properties: &RenderProperties) -> Result<(), String> {
    if !(0.0..=1.0).contains(&properties.opacity) {
        return Err(format!("opacity {} is outside 0..=1", properties.opacity));
    }
    if properties.target_fps < 0 {
        return Err(format!("target fps {} is negative", properties.target_fps));
    }
    Ok(())
}

fn check_bounds(bounds: &RenderRect) -> Result<(), String> {
    if bounds.width <= 0 || bounds.height <= 0 {
        return Err(format!(
            "bounds {}x{} must be positive",
            bounds.width, bounds.height
        ));
    }
    Ok(())
}

/// Registry of widget surfaces plus the hooks the worker main loop needs.
pub struct WidgetHost {
    widgets: Mutex<HashMap<u32, WidgetSurface>>,
    started_at: Instant,
    coordinator: OnceCell<Weak<ChannelCoordinator>>,
    on_shutdown: Box<dyn Fn() + Send + Sync>,
}

impl WidgetHost {
    pub fn new<F>(on_shutdown: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            widgets: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            coordinator: OnceCell::new(),
            on_shutdown: Box::new(on_shutdown),
        }
    }

    /// Source of channel statistics for system snapshots.
    pub fn attach(&self, coordinator: &Arc<ChannelCoordinator>) {
        let _ = self.coordinator.set(Arc::downgrade(coordinator));
    }

    fn widgets(&self) -> MutexGuard<'_, HashMap<u32, WidgetSurface>> {
        self.widgets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn widget_count(&self) -> usize {
        self.widgets().len()
    }

    pub fn handle_command(&self, command: RenderCommand) -> Result<RenderResult, HandlerError> {
        debug!(
            "[WORKER] {:?} for widget {} (command {})",
            command.command_type, command.widget_id, command.command_id
        );

        let result = match command.command_type {
            RenderCommandType::Initialize => {
                let mut result = RenderResult::success(&command);
                result.payload_kind = PayloadKind::Text;
                result.payload = format!("render-worker {}", render_channel::get_version())
                    .into_bytes();
                result
            }
            RenderCommandType::Render => self.render(&command),
            RenderCommandType::Resize => {
                if let Err(message) = check_bounds(&command.bounds) {
                    let status = RenderResultStatus::InvalidParameters;
                    return Ok(rejected(&command, status, message));
                }
                self.update(&command, |surface| surface.bounds = command.bounds)
            }
            RenderCommandType::SwitchBackend => {
                self.update(&command, |surface| surface.backend = command.backend_type)
            }
            RenderCommandType::UpdateContent | RenderCommandType::LoadContent => {
                if let Err(message) = check_content(&command.content) {
                    let status = RenderResultStatus::ContentLoadError;
                    return Ok(rejected(&command, status, message));
                }
                self.update(&command, |surface| surface.content = command.content.clone())
            }
            RenderCommandType::SetProperty => {
                if let Err(message) = check_properties(&command.properties) {
                    let status = RenderResultStatus::InvalidParameters;
                    return Ok(rejected(&command, status, message));
                }
                self.update(&command, |surface| {
                    surface.properties = command.properties.clone()
                })
            }
            RenderCommandType::Destroy => self.destroy(&command),
            RenderCommandType::GetSystemSnapshot => {
                RenderResult::success(&command).with_json_payload(&self.system_snapshot())?
            }
            RenderCommandType::GetProcessSnapshot => {
                RenderResult::success(&command).with_json_payload(&self.process_snapshot())?
            }
        };
        Ok(result)
    }

    fn render(&self, command: &RenderCommand) -> RenderResult {
        let started = Instant::now();
        let mut widgets = self.widgets();
        let surface = widgets.entry(command.widget_id).or_insert_with(|| {
            info!("[WORKER] Created surface for widget {}", command.widget_id);
            WidgetSurface::from_command(command)
        });

        if command.bounds.width > 0 && command.bounds.height > 0 {
            surface.bounds = command.bounds;
        }
        if command.window_handle != 0 {
            surface.window_handle = command.window_handle;
        }
        surface.frame_count = surface.frame_count.saturating_add(1);

        let mut result = RenderResult::success(command);
        result.frame_count = surface.frame_count;
        result.average_fps = surface.average_fps();
        result.memory_usage_mb = surface.memory_bytes() / (1024 * 1024);
        result.render_time_ms = millis(started.elapsed());
        result
    }

    fn update<F>(&self, command: &RenderCommand, apply: F) -> RenderResult
    where
        F: FnOnce(&mut WidgetSurface),
    {
        let mut widgets = self.widgets();
        match widgets.get_mut(&command.widget_id) {
            Some(surface) => {
                apply(surface);
                let mut result = RenderResult::success(command);
                result.frame_count = surface.frame_count;
                result
            }
            None => unknown_widget(command),
        }
    }

    fn destroy(&self, command: &RenderCommand) -> RenderResult {
        if command.widget_id == SHUTDOWN_WIDGET_ID {
            info!("[WORKER] Shutdown requested by command {}", command.command_id);
            (self.on_shutdown)();
            return RenderResult::success(command);
        }

        match self.widgets().remove(&command.widget_id) {
            Some(surface) => {
                info!(
                    "[WORKER] Destroyed widget {} after {} frame(s)",
                    command.widget_id, surface.frame_count
                );
                let mut result = RenderResult::success(command);
                result.frame_count = surface.frame_count;
                result
            }
            None => unknown_widget(command),
        }
    }

    fn channel_stats(&self) -> Option<ChannelStatsSnapshot> {
        self.coordinator
            .get()
            .and_then(Weak::upgrade)
            .map(|coordinator| coordinator.stats())
    }

    fn system_snapshot(&self) -> SystemSnapshot {
        let widgets = self.widgets();
        let memory = widgets
            .values()
            .map(WidgetSurface::memory_bytes)
            .fold(0u64, u64::saturating_add);
        SystemSnapshot {
            version: render_channel::get_version(),
            uptime_ms: millis(self.started_at.elapsed()),
            widget_count: widgets.len(),
            total_frames: widgets.values().map(|w| w.frame_count as u64).sum(),
            memory_usage_mb: memory / (1024 * 1024),
            channel: self.channel_stats(),
        }
    }

    fn process_snapshot(&self) -> ProcessSnapshot {
        let widgets = self.widgets();
        let mut entries: Vec<WidgetSnapshot> = widgets
            .iter()
            .map(|(id, surface)| WidgetSnapshot {
                widget_id: *id,
                window_handle: surface.window_handle,
                backend: format!("{:?}", surface.backend),
                content_source: format!("{:?}", surface.content.source_type),
                bounds: [
                    surface.bounds.x,
                    surface.bounds.y,
                    surface.bounds.width,
                    surface.bounds.height,
                ],
                frame_count: surface.frame_count,
                visible: surface.properties.visible,
                age_ms: millis(surface.created_at.elapsed()),
            })
            .collect();
        entries.sort_by_key(|w| w.widget_id);

        ProcessSnapshot {
            pid: std::process::id(),
            uptime_ms: millis(self.started_at.elapsed()),
            widgets: entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn host() -> WidgetHost {
        WidgetHost::new(|| {})
    }

    fn command(id: u64, command_type: RenderCommandType, widget_id: u32) -> RenderCommand {
        RenderCommand::new(id, command_type, widget_id)
            .with_bounds(RenderRect::new(0, 0, 200, 100))
    }

    fn run(host: &WidgetHost, command: RenderCommand) -> RenderResult {
        host.handle_command(command).unwrap()
    }

    #[test]
    fn initialize_is_a_handshake() {
        let result = run(&host(), command(1, RenderCommandType::Initialize, 0));
        assert!(result.is_success());
        assert_eq!(result.payload_kind, PayloadKind::Text);
        assert!(String::from_utf8(result.payload).unwrap().starts_with("render-worker"));
    }

    #[test]
    fn render_creates_surface_and_counts_frames() {
        let host = host();
        let first = run(&host, command(1, RenderCommandType::Render, 7));
        let second = run(&host, command(2, RenderCommandType::Render, 7));

        assert!(first.is_success());
        assert_eq!(first.command_id, 1);
        assert_eq!(first.frame_count, 1);
        assert_eq!(second.frame_count, 2);
        assert_eq!(host.widget_count(), 1);
    }

    #[test]
    fn updates_require_known_widget() {
        let host = host();
        for command_type in [
            RenderCommandType::Resize,
            RenderCommandType::SwitchBackend,
            RenderCommandType::UpdateContent,
            RenderCommandType::SetProperty,
            RenderCommandType::Destroy,
        ] {
            let result = run(&host, command(1, command_type, 42));
            assert_eq!(result.status, RenderResultStatus::InvalidParameters);
            assert!(result.error_message.contains("42"));
        }
    }

    #[test]
    fn invalid_parameters_are_reported() {
        let host = host();
        run(&host, command(1, RenderCommandType::Render, 3));

        let mut resize = command(2, RenderCommandType::Resize, 3);
        resize.bounds = RenderRect::new(0, 0, 0, 50);
        assert_eq!(run(&host, resize).status, RenderResultStatus::InvalidParameters);

        let mut fade = command(3, RenderCommandType::SetProperty, 3);
        fade.properties.opacity = 1.5;
        assert_eq!(run(&host, fade).status, RenderResultStatus::InvalidParameters);

        let mut web = command(4, RenderCommandType::LoadContent, 3);
        web.content.source_type = ContentSourceType::Web;
        assert_eq!(run(&host, web).status, RenderResultStatus::ContentLoadError);

        let mut valid = command(5, RenderCommandType::UpdateContent, 3);
        valid.content.source_type = ContentSourceType::Api;
        valid.content.source_url = "https://example.invalid/feed".to_string();
        assert!(run(&host, valid).is_success());
    }

    #[test]
    fn destroy_removes_widget_and_zero_requests_shutdown() {
        let requested = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&requested);
        let host = WidgetHost::new(move || flag.store(true, Ordering::SeqCst));

        run(&host, command(1, RenderCommandType::Render, 9));
        assert!(run(&host, command(2, RenderCommandType::Destroy, 9)).is_success());
        assert_eq!(host.widget_count(), 0);
        assert!(!requested.load(Ordering::SeqCst));

        let shutdown = command(3, RenderCommandType::Destroy, SHUTDOWN_WIDGET_ID);
        assert!(run(&host, shutdown).is_success());
        assert!(requested.load(Ordering::SeqCst));
    }

    #[test]
    fn snapshots_carry_json_payloads() {
        let host = host();
        run(&host, command(1, RenderCommandType::Render, 2));
        run(&host, command(2, RenderCommandType::Render, 1));

        let system = run(&host, command(3, RenderCommandType::GetSystemSnapshot, 0));
        assert_eq!(system.payload_kind, PayloadKind::Json);
        assert!(system.error_message.is_empty());
        let value: serde_json::Value = system.json_payload().unwrap().unwrap();
        assert_eq!(value["widget_count"], 2);
        assert_eq!(value["total_frames"], 2);
        assert!(value["channel"].is_null());

        let process = run(&host, command(4, RenderCommandType::GetProcessSnapshot, 0));
        let value: serde_json::Value = process.json_payload().unwrap().unwrap();
        assert_eq!(value["pid"], std::process::id());
        assert_eq!(value["widgets"][0]["widget_id"], 1);
        assert_eq!(value["widgets"][1]["widget_id"], 2);
    }

    #[test]
    fn memory_total_saturates_for_huge_surfaces() {
        let host = host();
        for widget_id in 1..=3 {
            let huge = RenderCommand::new(widget_id as u64, RenderCommandType::Render, widget_id)
                .with_bounds(RenderRect::new(0, 0, i32::MAX, i32::MAX));
            assert!(run(&host, huge).is_success());
        }

        let system = run(&host, command(9, RenderCommandType::GetSystemSnapshot, 0));
        assert!(system.is_success());
        let value: serde_json::Value = system.json_payload().unwrap().unwrap();
        assert_eq!(value["memory_usage_mb"], u64::MAX / (1024 * 1024));
    }
}
