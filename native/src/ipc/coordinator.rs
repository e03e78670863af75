// Worker end of the channel: owns both transports, the listener loops and the dispatch loop.

use super::error::{ChannelError, ChannelResult};
use super::frame::{Frame, MessageType};
use super::pipe::{self, PipeConnector, PipeReader, PipeTransport, ReaderOptions};
use super::protocol::{peek_command_id, RenderCommand, RenderResult};
use super::queue::{CommandQueue, QueuedCommand};
use super::runtime::{
    cancelled, is_cancelled, lock_unpoisoned, sleep_or_cancel, ChannelRuntime,
};
use super::shared_memory::{SharedMemoryTransport, Slot};
use super::stats::{ChannelCounters, ChannelStatsSnapshot};
use super::transports::Transports;
use super::TransportKind;
use crate::config::ChannelConfig;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

const SHUTDOWN_REASON: &str = "channel shutting down";
const QUEUE_FULL_REASON: &str = "command queue full";

/// Connection lifecycle shared by both channel ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Initializing = 1,
    Connected = 2,
    Listening = 3,
    Stopping = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Initializing,
            2 => ChannelState::Connected,
            3 => ChannelState::Listening,
            4 => ChannelState::Stopping,
            _ => ChannelState::Disconnected,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Disconnected as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ChannelState, to: ChannelState) -> ChannelResult<()> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                ChannelError::InvalidState(format!(
                    "expected {}, found {}",
                    from,
                    ChannelState::from_u8(actual)
                ))
            })
    }

    /// Move to Stopping and return the previous state. Disconnected and
    /// Stopping are left untouched, which makes repeated stops no-ops.
    pub(crate) fn begin_stop(&self) -> ChannelState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ChannelState::from_u8(current);
            if matches!(state, ChannelState::Disconnected | ChannelState::Stopping) {
                return state;
            }
            match self.0.compare_exchange(
                current,
                ChannelState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return state,
                Err(actual) => current = actual,
            }
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business logic invoked for every command. Runs on a blocking thread;
/// an `Err` or a panic becomes a Failure result.
pub type CommandHandler =
    Arc<dyn Fn(RenderCommand) -> Result<RenderResult, HandlerError> + Send + Sync>;

/// Pull-based alternative to a [`CommandHandler`]. The consumer answers each
/// command with [`ChannelCoordinator::send_result`].
pub struct CommandStream {
    receiver: Receiver<RenderCommand>,
}

impl CommandStream {
    /// `None` on timeout or once the channel has stopped.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RenderCommand> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<RenderCommand> {
        self.receiver.try_recv().ok()
    }
}

impl Iterator for CommandStream {
    type Item = RenderCommand;

    /// Blocks until a command arrives; ends when the channel stops.
    fn next(&mut self) -> Option<RenderCommand> {
        self.receiver.recv().ok()
    }
}

/// Where the dispatch loop hands commands.
enum Consumer {
    Handler(CommandHandler),
    Stream(SyncSender<RenderCommand>),
}

/// State shared between the public API and the background loops.
struct WorkerShared {
    config: ChannelConfig,
    transports: Transports,
    queue: CommandQueue,
    counters: ChannelCounters,
}

impl WorkerShared {
    async fn send_result(&self, result: &RenderResult) -> ChannelResult<()> {
        let bytes = result.to_bytes()?;
        self.transports
            .deliver(Slot::Result, result.command_id, &bytes, &self.counters)
            .await
            .map(|_| ())
    }

    async fn refuse(&self, command_id: u64, widget_id: u32, reason: &str) {
        let result = RenderResult::failure(command_id, widget_id, reason);
        if let Err(e) = self.send_result(&result).await {
            error!(
                "[COORD] Could not answer refused command {}: {}",
                command_id, e
            );
        }
    }

    /// Decode inbound bytes and queue the command, answering anything that
    /// cannot be queued with a Failure result.
    async fn admit(&self, bytes: &[u8], source: TransportKind, frame_id: Option<u64>) {
        match RenderCommand::from_bytes(bytes) {
            Ok(command) => {
                let command_id = command.command_id;
                let widget_id = command.widget_id;
                if let Some(frame_id) = frame_id.filter(|id| *id != command_id) {
                    warn!(
                        "[COORD] Frame id {} does not match command id {}",
                        frame_id, command_id
                    );
                }

                match self.queue.push(QueuedCommand::new(command, source)) {
                    Ok(()) => debug!("[COORD] Queued command {} from {}", command_id, source),
                    Err(e) => {
                        ChannelCounters::bump(&self.counters.commands_rejected);
                        warn!("[COORD] Rejecting command {}: {}", command_id, e);
                        self.refuse(command_id, widget_id, QUEUE_FULL_REASON).await;
                    }
                }
            }
            Err(e) => {
                ChannelCounters::bump(&self.counters.commands_rejected);
                error!("[COORD] Undecodable command from {}: {}", source, e);
                if let Some(command_id) = frame_id.or_else(|| peek_command_id(bytes)) {
                    self.refuse(command_id, 0, &format!("malformed command: {}", e))
                        .await;
                }
            }
        }
    }

    async fn dispatch(&self, consumer: &Consumer, item: QueuedCommand) {
        match consumer {
            Consumer::Handler(handler) => self.run_handler(handler, item).await,
            Consumer::Stream(sender) => self.forward(sender, item).await,
        }
    }

    async fn forward(&self, sender: &SyncSender<RenderCommand>, item: QueuedCommand) {
        let command_id = item.command.command_id;
        let widget_id = item.command.widget_id;
        match sender.try_send(item.command) {
            Ok(()) => ChannelCounters::bump(&self.counters.commands_dispatched),
            Err(TrySendError::Full(_)) => {
                ChannelCounters::bump(&self.counters.commands_rejected);
                warn!("[DISPATCH] Consumer is behind; rejecting command {}", command_id);
                self.refuse(command_id, widget_id, QUEUE_FULL_REASON).await;
            }
            Err(TrySendError::Disconnected(_)) => {
                ChannelCounters::bump(&self.counters.commands_rejected);
                warn!("[DISPATCH] Command stream dropped; rejecting command {}", command_id);
                self.refuse(command_id, widget_id, "no command consumer").await;
            }
        }
    }

    async fn run_handler(&self, handler: &CommandHandler, item: QueuedCommand) {
        let command_id = item.command.command_id;
        let widget_id = item.command.widget_id;
        debug!(
            "[DISPATCH] Command {} ({:?}) from {} waited {:?}",
            command_id,
            item.command.command_type,
            item.source,
            item.received_at.elapsed()
        );

        let handler = Arc::clone(handler);
        let command = item.command;
        let outcome = tokio::task::spawn_blocking(move || handler(command)).await;

        let result = match outcome {
            Ok(Ok(mut result)) => {
                if result.command_id != command_id {
                    warn!(
                        "[DISPATCH] Handler answered command {} with id {}; correcting",
                        command_id, result.command_id
                    );
                    result.command_id = command_id;
                }
                result
            }
            Ok(Err(e)) => {
                ChannelCounters::bump(&self.counters.handler_faults);
                let mut message = e.to_string();
                if message.is_empty() {
                    message = "handler failed without a message".to_string();
                }
                warn!("[DISPATCH] Handler failed for command {}: {}", command_id, message);
                RenderResult::failure(command_id, widget_id, message)
            }
            Err(join_error) => {
                ChannelCounters::bump(&self.counters.handler_faults);
                let message = panic_message(join_error);
                error!("[DISPATCH] Handler fault on command {}: {}", command_id, message);
                RenderResult::failure(command_id, widget_id, message)
            }
        };

        ChannelCounters::bump(&self.counters.commands_dispatched);
        if let Err(e) = self.send_result(&result).await {
            error!(
                "[DISPATCH] Could not deliver result for command {}: {}",
                command_id, e
            );
        }
    }

    async fn refuse_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = QueuedCommand>,
    {
        for item in items {
            debug!(
                "[DISPATCH] Refusing command {} during shutdown",
                item.command.command_id
            );
            self.refuse(item.command.command_id, item.command.widget_id, SHUTDOWN_REASON)
                .await;
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {}", detail)
}

async fn dispatch_loop(
    shared: Arc<WorkerShared>,
    consumer: Consumer,
    mut cancel: watch::Receiver<bool>,
) {
    info!("[DISPATCH] Dispatch loop started");
    let wait = shared.config.dispatch_wait();

    'outer: loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = shared.queue.wait(wait) => {}
        }

        let mut batch = shared.queue.drain().into_iter();
        while let Some(item) = batch.next() {
            if is_cancelled(&cancel) {
                shared.refuse_all(std::iter::once(item).chain(batch)).await;
                break 'outer;
            }
            shared.dispatch(&consumer, item).await;
        }
    }

    shared.refuse_all(shared.queue.drain()).await;
    info!("[DISPATCH] Dispatch loop stopped");
}

async fn shm_listener(
    shared: Arc<WorkerShared>,
    shm: Arc<SharedMemoryTransport>,
    mut cancel: watch::Receiver<bool>,
) {
    info!("[COORD] Shared memory listener started on '{}'", shm.name());
    let wait = shared.config.listen_wait();

    while !is_cancelled(&cancel) {
        let transport = Arc::clone(&shm);
        let taken =
            tokio::task::spawn_blocking(move || transport.wait_and_take(Slot::Command, wait))
                .await;

        match taken {
            Ok(Ok(Some(bytes))) => {
                shared
                    .admit(&bytes, TransportKind::SharedMemory, None)
                    .await
            }
            Ok(Ok(None)) => {}
            // Already logged and discarded by the transport.
            Ok(Err(ChannelError::MalformedSlot(_))) => {}
            Ok(Err(e)) if e.is_timeout() => debug!("[COORD] Listener: {}", e),
            Ok(Err(e)) => {
                error!("[COORD] Shared memory listener error: {}", e);
                sleep_or_cancel(&mut cancel, shared.config.error_backoff()).await;
            }
            Err(e) => {
                error!("[COORD] Shared memory listener task failed: {}", e);
                sleep_or_cancel(&mut cancel, shared.config.error_backoff()).await;
            }
        }
    }

    info!("[COORD] Shared memory listener stopped");
}

async fn pipe_intake(
    shared: Arc<WorkerShared>,
    mut frames: mpsc::Receiver<Frame>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Some(frame) => {
                shared
                    .admit(
                        &frame.payload,
                        TransportKind::NamedPipe,
                        Some(frame.header.correlation_id),
                    )
                    .await
            }
            None => break,
        }
    }
    debug!("[COORD] Pipe intake stopped");
}

/// Worker-side channel. Attaches to the orchestrator's shared memory and
/// pipe, queues inbound commands and answers each with a result.
///
/// The methods block on an internal runtime and must not be called from
/// async code.
pub struct ChannelCoordinator {
    config: ChannelConfig,
    state: StateCell,
    runtime: ChannelRuntime,
    shared: Mutex<Option<Arc<WorkerShared>>>,
    pipe_reader: Mutex<Option<PipeReader>>,
}

impl ChannelCoordinator {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            runtime: ChannelRuntime::new("COORD"),
            shared: Mutex::new(None),
            pipe_reader: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Open both transports. Succeeds when at least one is usable.
    pub fn initialize(&self) -> ChannelResult<()> {
        self.state
            .transition(ChannelState::Disconnected, ChannelState::Initializing)?;
        info!(
            "[COORD] Initializing (mode {:?}, shared memory '{}', pipe '{}')",
            self.config.mode, self.config.shared_memory_name, self.config.pipe_name
        );

        match self.open_transports() {
            Ok(shared) => {
                *lock_unpoisoned(&self.shared) = Some(Arc::new(shared));
                self.state.set(ChannelState::Connected);
                info!("[COORD] Channel connected");
                Ok(())
            }
            Err(e) => {
                error!("[COORD] Initialization failed: {}", e);
                lock_unpoisoned(&self.pipe_reader).take();
                self.runtime.shutdown(Duration::from_millis(100));
                self.state.set(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    fn open_transports(&self) -> ChannelResult<WorkerShared> {
        let config = &self.config;
        config.validate()?;
        self.runtime.start()?;

        let shm = if config.mode.uses_shared_memory() {
            SharedMemoryTransport::open(&config.shared_memory_name, config.lock_timeout())
                .map(Arc::new)
                .map_err(|e| {
                    warn!("[COORD] Shared memory unavailable: {}", e);
                    e.to_string()
                })
        } else {
            Err("disabled by transport mode".to_string())
        };

        let (pipe, pipe_status) = if config.mode.uses_pipe() {
            let transport = Arc::new(PipeTransport::new(
                &config.pipe_name,
                config.connect_timeout(),
            ));
            let connected = self
                .runtime
                .block_on(pipe::connect(&config.pipe_name, config.connect_timeout()))?;
            match connected {
                Ok(stream) => {
                    let reader = self
                        .runtime
                        .block_on(transport.install(stream, MessageType::Command))?;
                    *lock_unpoisoned(&self.pipe_reader) = Some(reader);
                    (Some(transport), Ok(()))
                }
                Err(e) => {
                    warn!("[COORD] Pipe unavailable: {}", e);
                    (Some(transport), Err(e.to_string()))
                }
            }
        } else {
            (None, Err("disabled by transport mode".to_string()))
        };

        if let (Err(shm_error), Err(pipe_error)) = (&shm, &pipe_status) {
            return Err(ChannelError::NoTransport {
                shared_memory: shm_error.clone(),
                pipe: pipe_error.clone(),
            });
        }

        if shm.is_err() {
            warn!("[COORD] Continuing with the pipe transport only");
        } else if pipe_status.is_err() && pipe.is_some() {
            warn!("[COORD] Continuing with shared memory; the pipe will keep reconnecting");
        }

        Ok(WorkerShared {
            config: config.clone(),
            transports: Transports::new(shm.ok(), pipe, config.lock_timeout()),
            queue: CommandQueue::new(config.queue_capacity),
            counters: ChannelCounters::default(),
        })
    }

    fn shared(&self) -> ChannelResult<Arc<WorkerShared>> {
        lock_unpoisoned(&self.shared)
            .as_ref()
            .cloned()
            .ok_or_else(|| ChannelError::InvalidState(format!("channel is {}", self.state())))
    }

    /// Start the listener and dispatch loops with `handler`.
    pub fn start(&self, handler: CommandHandler) -> ChannelResult<()> {
        self.begin_listening(Consumer::Handler(handler))
    }

    /// Start the loops and hand commands out through a [`CommandStream`]
    /// holding at most `queue_capacity` unconsumed commands.
    pub fn start_stream(&self) -> ChannelResult<CommandStream> {
        let (sender, receiver) = sync_channel(self.config.queue_capacity);
        self.begin_listening(Consumer::Stream(sender))?;
        Ok(CommandStream { receiver })
    }

    fn begin_listening(&self, consumer: Consumer) -> ChannelResult<()> {
        self.state
            .transition(ChannelState::Connected, ChannelState::Listening)?;

        if let Err(e) = self.spawn_loops(consumer) {
            error!("[COORD] Failed to start loops: {}", e);
            self.state.set(ChannelState::Connected);
            return Err(e);
        }

        info!("[COORD] Listening for commands");
        Ok(())
    }

    /// Convenience for closures.
    pub fn start_with<F>(&self, handler: F) -> ChannelResult<()>
    where
        F: Fn(RenderCommand) -> Result<RenderResult, HandlerError> + Send + Sync + 'static,
    {
        self.start(Arc::new(handler))
    }

    fn spawn_loops(&self, consumer: Consumer) -> ChannelResult<()> {
        let shared = self.shared()?;
        let cancel = self.runtime.cancel_token();

        self.runtime.spawn(dispatch_loop(
            Arc::clone(&shared),
            consumer,
            cancel.clone(),
        ))?;

        if let Some(shm) = shared.transports.shm.clone() {
            self.runtime
                .spawn(shm_listener(Arc::clone(&shared), shm, cancel.clone()))?;
        }

        if let Some(pipe) = shared.transports.pipe.clone() {
            let (frames_tx, frames_rx) = mpsc::channel(shared.config.queue_capacity);
            let initial = lock_unpoisoned(&self.pipe_reader).take();
            self.runtime.spawn(pipe::run_reader(
                pipe,
                PipeConnector::Client {
                    name: shared.config.pipe_name.clone(),
                },
                initial,
                frames_tx,
                cancel.clone(),
                ReaderOptions {
                    expect: MessageType::Command,
                    connect_timeout: shared.config.connect_timeout(),
                    reconnect_backoff: shared.config.reconnect_backoff(),
                },
            ))?;
            self.runtime
                .spawn(pipe_intake(Arc::clone(&shared), frames_rx, cancel))?;
        }
        Ok(())
    }

    /// Deliver a result outside the dispatch loop.
    pub fn send_result(&self, result: &RenderResult) -> ChannelResult<()> {
        match self.state() {
            ChannelState::Connected | ChannelState::Listening => {}
            other => {
                return Err(ChannelError::InvalidState(format!("channel is {}", other)));
            }
        }
        let shared = self.shared()?;
        self.runtime.block_on(shared.send_result(result))?
    }

    /// True while shared memory looks valid or the pipe is connected.
    pub fn test_connection(&self) -> bool {
        lock_unpoisoned(&self.shared)
            .as_ref()
            .is_some_and(|shared| shared.transports.test_connection())
    }

    /// Transports that came up during initialization.
    pub fn active_transports(&self) -> Vec<TransportKind> {
        lock_unpoisoned(&self.shared)
            .as_ref()
            .map(|shared| shared.transports.active())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        let state = self.state().to_string();
        match lock_unpoisoned(&self.shared).as_ref() {
            Some(shared) => ChannelStatsSnapshot::from_counters(
                state,
                &shared.counters,
                shared.transports.shm_stats(),
                shared.transports.pipe_stats(),
                shared.queue.len(),
            ),
            None => ChannelStatsSnapshot {
                state,
                ..Default::default()
            },
        }
    }

    /// Cancel both loops, wait up to `stop_timeout` for them, then release every
    /// handle. Safe to call repeatedly and from `Drop`.
    pub fn stop(&self) {
        let previous = self.state.begin_stop();
        if matches!(
            previous,
            ChannelState::Disconnected | ChannelState::Stopping
        ) {
            return;
        }

        info!("[COORD] Stopping channel (was {})", previous);
        let clean = self.runtime.shutdown(self.config.stop_timeout());

        if let Some(shared) = lock_unpoisoned(&self.shared).take() {
            shared.queue.close();
        }
        lock_unpoisoned(&self.pipe_reader).take();
        self.state.set(ChannelState::Disconnected);

        if clean {
            info!("[COORD] Channel stopped");
        } else {
            warn!("[COORD] Channel stopped after forcing outstanding tasks");
        }
    }
}

impl Drop for ChannelCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
