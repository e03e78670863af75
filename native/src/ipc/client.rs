// Orchestrator end of the channel: creates both transports, sends commands
// and matches results back to their callers by command id.

use super::coordinator::{ChannelState, StateCell};
use super::error::{ChannelError, ChannelResult};
use super::frame::{Frame, MessageType};
use super::pipe::{self, PipeConnector, PipeListener, PipeReader, PipeTransport, ReaderOptions};
use super::protocol::{RenderCommand, RenderResult};
use super::runtime::{cancelled, is_cancelled, lock_unpoisoned, sleep_or_cancel, ChannelRuntime};
use super::shared_memory::{SharedMemoryTransport, Slot};
use super::stats::{ChannelCounters, ChannelStatsSnapshot};
use super::transports::Transports;
use super::TransportKind;
use crate::config::ChannelConfig;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const SHUTDOWN_MESSAGE: &str = "IPC shutdown";

struct PendingRequest {
    widget_id: u32,
    reply: oneshot::Sender<RenderResult>,
}

struct OrchestratorShared {
    config: ChannelConfig,
    transports: Transports,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    unsolicited: mpsc::Sender<RenderResult>,
    counters: ChannelCounters,
}

impl OrchestratorShared {
    fn register(&self, command: &RenderCommand) -> ChannelResult<oneshot::Receiver<RenderResult>> {
        let mut pending = lock_unpoisoned(&self.pending);
        if pending.contains_key(&command.command_id) {
            return Err(ChannelError::InvalidState(format!(
                "command {} is already awaiting a result",
                command.command_id
            )));
        }
        let (reply, receiver) = oneshot::channel();
        pending.insert(
            command.command_id,
            PendingRequest {
                widget_id: command.widget_id,
                reply,
            },
        );
        Ok(receiver)
    }

    fn forget(&self, command_id: u64) {
        lock_unpoisoned(&self.pending).remove(&command_id);
    }

    /// Complete every outstanding request with a Failure result.
    fn fail_pending(&self, message: &str) -> usize {
        let drained: Vec<(u64, PendingRequest)> =
            lock_unpoisoned(&self.pending).drain().collect();
        let count = drained.len();
        for (command_id, request) in drained {
            let _ = request
                .reply
                .send(RenderResult::failure(command_id, request.widget_id, message));
        }
        count
    }

    /// Hand a decoded result to its waiting caller, or to the unsolicited
    /// stream when nobody is waiting for that id.
    fn route(&self, bytes: &[u8], source: TransportKind) {
        let result = match RenderResult::from_bytes(bytes) {
            Ok(result) => result,
            Err(e) => {
                ChannelCounters::bump(&self.counters.commands_rejected);
                error!("[CLIENT] Undecodable result from {}: {}", source, e);
                return;
            }
        };

        let waiting = lock_unpoisoned(&self.pending).remove(&result.command_id);
        match waiting {
            Some(request) => {
                debug!(
                    "[CLIENT] Result for command {} arrived over {}",
                    result.command_id, source
                );
                if request.reply.send(result).is_err() {
                    debug!("[CLIENT] Caller stopped waiting before its result arrived");
                }
            }
            None => {
                let command_id = result.command_id;
                if self.unsolicited.try_send(result).is_err() {
                    warn!(
                        "[CLIENT] Dropping result for command {}: nobody is reading results",
                        command_id
                    );
                }
            }
        }
    }
}

async fn shm_result_listener(
    shared: Arc<OrchestratorShared>,
    shm: Arc<SharedMemoryTransport>,
    mut cancel: watch::Receiver<bool>,
) {
    info!("[CLIENT] Result listener started on '{}'", shm.name());
    let wait = shared.config.listen_wait();

    while !is_cancelled(&cancel) {
        let transport = Arc::clone(&shm);
        let taken =
            tokio::task::spawn_blocking(move || transport.wait_and_take(Slot::Result, wait)).await;

        match taken {
            Ok(Ok(Some(bytes))) => shared.route(&bytes, TransportKind::SharedMemory),
            Ok(Ok(None)) | Ok(Err(ChannelError::MalformedSlot(_))) => {}
            Ok(Err(e)) if e.is_timeout() => debug!("[CLIENT] Result listener: {}", e),
            Ok(Err(e)) => {
                error!("[CLIENT] Result listener error: {}", e);
                sleep_or_cancel(&mut cancel, shared.config.error_backoff()).await;
            }
            Err(e) => {
                error!("[CLIENT] Result listener task failed: {}", e);
                sleep_or_cancel(&mut cancel, shared.config.error_backoff()).await;
            }
        }
    }

    info!("[CLIENT] Result listener stopped");
}

async fn pipe_result_intake(
    shared: Arc<OrchestratorShared>,
    mut frames: mpsc::Receiver<Frame>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        shared.route(&frame.payload, TransportKind::NamedPipe);
    }
    debug!("[CLIENT] Pipe intake stopped");
}

/// Orchestrator-side channel. Owns the shared memory region and the pipe
/// endpoint; a worker attaches to both with [`super::ChannelCoordinator`].
///
/// All methods block on an internal runtime and must not be called from
/// async code.
pub struct OrchestratorChannel {
    config: ChannelConfig,
    state: StateCell,
    runtime: ChannelRuntime,
    shared: Arc<OrchestratorShared>,
    listener: Mutex<Option<PipeListener>>,
    results: Mutex<Option<mpsc::Receiver<RenderResult>>>,
    next_id: AtomicU64,
}

impl OrchestratorChannel {
    /// Create the shared memory region and bind the pipe endpoint.
    /// Fails only if neither transport could be set up.
    pub fn create(config: ChannelConfig) -> ChannelResult<Self> {
        config.validate()?;
        let runtime = ChannelRuntime::new("CLIENT");
        runtime.start()?;

        let shm = if config.mode.uses_shared_memory() {
            SharedMemoryTransport::create(&config.shared_memory_name, config.lock_timeout())
                .map(Arc::new)
                .map_err(|e| {
                    warn!("[CLIENT] Shared memory unavailable: {}", e);
                    e.to_string()
                })
        } else {
            Err("disabled by transport mode".to_string())
        };

        let listener = if config.mode.uses_pipe() {
            let name = config.pipe_name.clone();
            // Binding registers with the reactor, so it runs on the runtime.
            runtime
                .block_on(async move { PipeListener::bind(&name) })?
                .map_err(|e| {
                    warn!("[CLIENT] Pipe unavailable: {}", e);
                    e.to_string()
                })
        } else {
            Err("disabled by transport mode".to_string())
        };

        let (shm, listener, pipe) = match (shm, listener) {
            (Err(shm_error), Err(pipe_error)) => {
                runtime.shutdown(Duration::from_millis(100));
                return Err(ChannelError::NoTransport {
                    shared_memory: shm_error,
                    pipe: pipe_error,
                });
            }
            (shm, listener) => {
                let pipe = listener.as_ref().ok().map(|_| {
                    Arc::new(PipeTransport::new(
                        &config.pipe_name,
                        config.connect_timeout(),
                    ))
                });
                (shm.ok(), listener.ok(), pipe)
            }
        };

        let (unsolicited, results) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(OrchestratorShared {
            transports: Transports::new(shm, pipe, config.lock_timeout()),
            config: config.clone(),
            pending: Mutex::new(HashMap::new()),
            unsolicited,
            counters: ChannelCounters::default(),
        });

        let state = StateCell::new();
        state.set(ChannelState::Connected);
        info!(
            "[CLIENT] Channel created (shared memory '{}', pipe '{}')",
            config.shared_memory_name, config.pipe_name
        );

        Ok(Self {
            config,
            state,
            runtime,
            shared,
            listener: Mutex::new(listener),
            results: Mutex::new(Some(results)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Wait up to `connect_timeout` for the worker's pipe connection, then
    /// start the result listeners.
    pub fn start(&self) -> ChannelResult<()> {
        self.state
            .transition(ChannelState::Connected, ChannelState::Listening)?;

        if let Err(e) = self.spawn_listeners() {
            error!("[CLIENT] Failed to start: {}", e);
            self.state.set(ChannelState::Connected);
            return Err(e);
        }

        info!("[CLIENT] Listening for results");
        Ok(())
    }

    fn accept_worker(
        &self,
        mut listener: PipeListener,
    ) -> ChannelResult<(PipeListener, Option<PipeReader>)> {
        let pipe = match &self.shared.transports.pipe {
            Some(pipe) => Arc::clone(pipe),
            None => return Ok((listener, None)),
        };

        let accepted = self
            .runtime
            .block_on(listener.accept(self.config.connect_timeout()))?;
        match accepted {
            Ok(stream) => {
                let reader = self
                    .runtime
                    .block_on(pipe.install(stream, MessageType::Result))?;
                info!("[CLIENT] Worker connected on '{}'", listener.path());
                Ok((listener, Some(reader)))
            }
            Err(e) if self.shared.transports.shm.is_some() => {
                warn!(
                    "[CLIENT] Worker did not connect to the pipe ({}); continuing on shared memory",
                    e
                );
                Ok((listener, None))
            }
            Err(e) => {
                *lock_unpoisoned(&self.listener) = Some(listener);
                Err(e)
            }
        }
    }

    fn spawn_listeners(&self) -> ChannelResult<()> {
        let shared = Arc::clone(&self.shared);
        let cancel = self.runtime.cancel_token();

        let listener = lock_unpoisoned(&self.listener).take();
        if let (Some(listener), Some(pipe)) = (listener, shared.transports.pipe.clone()) {
            let (listener, initial) = self.accept_worker(listener)?;
            let (frames_tx, frames_rx) = mpsc::channel(shared.config.queue_capacity);
            self.runtime.spawn(pipe::run_reader(
                pipe,
                PipeConnector::Server { listener },
                initial,
                frames_tx,
                cancel.clone(),
                ReaderOptions {
                    expect: MessageType::Result,
                    connect_timeout: shared.config.connect_timeout(),
                    reconnect_backoff: shared.config.reconnect_backoff(),
                },
            ))?;
            self.runtime.spawn(pipe_result_intake(
                Arc::clone(&shared),
                frames_rx,
                cancel.clone(),
            ))?;
        }

        if let Some(shm) = shared.transports.shm.clone() {
            self.runtime
                .spawn(shm_result_listener(Arc::clone(&shared), shm, cancel))?;
        }
        Ok(())
    }

    /// Monotonic ids starting at 1.
    pub fn next_command_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn require_listening(&self) -> ChannelResult<()> {
        match self.state() {
            ChannelState::Listening => Ok(()),
            other => Err(ChannelError::InvalidState(format!("channel is {}", other))),
        }
    }

    /// Send `command` and wait up to `timeout` for the result with the same id.
    ///
    /// The command is encoded before anything is sent, so an oversized
    /// command fails without touching either transport.
    pub fn send_command(
        &self,
        command: RenderCommand,
        timeout: Duration,
    ) -> ChannelResult<RenderResult> {
        self.require_listening()?;
        let bytes = command.to_bytes()?;
        let command_id = command.command_id;
        let receiver = self.shared.register(&command)?;

        let shared = Arc::clone(&self.shared);
        let outcome = self.runtime.block_on(async move {
            if let Err(e) = shared
                .transports
                .deliver(Slot::Command, command_id, &bytes, &shared.counters)
                .await
            {
                shared.forget(command_id);
                return Err(e);
            }
            ChannelCounters::bump(&shared.counters.commands_dispatched);

            match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Err(ChannelError::Cancelled),
                Err(_) => {
                    shared.forget(command_id);
                    Err(ChannelError::Timeout("Command timed out".to_string()))
                }
            }
        });

        match outcome {
            Ok(result) => result,
            Err(e) => {
                self.shared.forget(command_id);
                Err(e)
            }
        }
    }

    /// Send with the configured `command_timeout`.
    pub fn send_command_default(&self, command: RenderCommand) -> ChannelResult<RenderResult> {
        self.send_command(command, self.config.command_timeout())
    }

    /// Send without waiting. The result, when it comes, is delivered on
    /// [`Self::results`].
    pub fn send_command_fire_and_forget(&self, command: RenderCommand) -> ChannelResult<()> {
        self.require_listening()?;
        let bytes = command.to_bytes()?;
        let shared = Arc::clone(&self.shared);
        self.runtime.block_on(async move {
            shared
                .transports
                .deliver(Slot::Command, command.command_id, &bytes, &shared.counters)
                .await
                .map(|_| ChannelCounters::bump(&shared.counters.commands_dispatched))
        })?
    }

    /// Results nobody is waiting for. Can be taken once.
    pub fn results(&self) -> Option<mpsc::Receiver<RenderResult>> {
        lock_unpoisoned(&self.results).take()
    }

    pub fn test_connection(&self) -> bool {
        self.shared.transports.test_connection()
    }

    pub fn active_transports(&self) -> Vec<TransportKind> {
        self.shared.transports.active()
    }

    pub fn pending_requests(&self) -> usize {
        lock_unpoisoned(&self.shared.pending).len()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot::from_counters(
            self.state().to_string(),
            &self.shared.counters,
            self.shared.transports.shm_stats(),
            self.shared.transports.pipe_stats(),
            self.pending_requests(),
        )
    }

    /// Fail outstanding requests, stop the listeners and release the
    /// transports. Safe to call repeatedly and from `Drop`.
    pub fn stop(&self) {
        let previous = self.state.begin_stop();
        if matches!(
            previous,
            ChannelState::Disconnected | ChannelState::Stopping
        ) {
            return;
        }

        info!("[CLIENT] Stopping channel (was {})", previous);
        let failed = self.shared.fail_pending(SHUTDOWN_MESSAGE);
        if failed > 0 {
            warn!("[CLIENT] Failed {} pending request(s) on shutdown", failed);
        }

        if !self.runtime.shutdown(self.config.stop_timeout()) {
            warn!("[CLIENT] Listeners forced to stop");
        }
        lock_unpoisoned(&self.listener).take();
        self.state.set(ChannelState::Disconnected);
        info!("[CLIENT] Channel stopped");
    }
}

impl Drop for OrchestratorChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use crate::ipc::coordinator::{ChannelCoordinator, HandlerError};
    use crate::ipc::protocol::{RenderCommandType, RenderResultStatus, WireError};
    use crate::ipc::MAX_PAYLOAD_SIZE;
    use std::thread;
    use std::time::Instant;

    fn test_config() -> ChannelConfig {
        let mut config = ChannelConfig::unique("Orch");
        config.lock_timeout_ms = 500;
        config.listen_wait_ms = 50;
        config.dispatch_wait_ms = 50;
        config.connect_timeout_ms = 1000;
        config.stop_timeout_ms = 2000;
        config.command_timeout_ms = 3000;
        config.error_backoff_ms = 10;
        config.reconnect_backoff_ms = 50;
        config
    }

    fn command(id: u64) -> RenderCommand {
        RenderCommand::new(id, RenderCommandType::UpdateContent, 3)
    }

    /// Orchestrator started against shared memory only, with no worker attached.
    fn lonely_orchestrator() -> OrchestratorChannel {
        let mut config = test_config();
        config.mode = TransportMode::SharedMemory;
        let orchestrator = OrchestratorChannel::create(config).unwrap();
        orchestrator.start().unwrap();
        orchestrator
    }

    #[test]
    fn command_ids_are_monotonic_from_one() {
        let orchestrator = lonely_orchestrator();
        assert_eq!(orchestrator.next_command_id(), 1);
        assert_eq!(orchestrator.next_command_id(), 2);
        assert_eq!(orchestrator.next_command_id(), 3);
    }

    #[test]
    fn unanswered_command_times_out() {
        let orchestrator = lonely_orchestrator();
        let started = Instant::now();
        let err = orchestrator
            .send_command(command(1), Duration::from_millis(200))
            .unwrap_err();

        assert!(matches!(err, ChannelError::Timeout(ref m) if m == "Command timed out"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(orchestrator.pending_requests(), 0);
    }

    #[test]
    fn duplicate_pending_id_is_rejected() {
        let orchestrator = lonely_orchestrator();
        thread::scope(|s| {
            let first =
                s.spawn(|| orchestrator.send_command(command(5), Duration::from_millis(800)));
            let deadline = Instant::now() + Duration::from_secs(2);
            while orchestrator.pending_requests() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            let second = orchestrator.send_command(command(5), Duration::from_millis(100));
            assert!(matches!(second, Err(ChannelError::InvalidState(_))));
            assert!(first.join().unwrap().unwrap_err().is_timeout());
        });
    }

    #[test]
    fn stop_completes_pending_requests() {
        let orchestrator = lonely_orchestrator();
        thread::scope(|s| {
            let waiting =
                s.spawn(|| orchestrator.send_command(command(8), Duration::from_secs(10)));
            let deadline = Instant::now() + Duration::from_secs(2);
            while orchestrator.pending_requests() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            let started = Instant::now();
            orchestrator.stop();
            let result = waiting.join().unwrap().unwrap();
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(result.command_id, 8);
            assert_eq!(result.status, RenderResultStatus::Failure);
            assert_eq!(result.error_message, "IPC shutdown");
        });
        assert!(orchestrator.send_command(command(9), Duration::from_millis(10)).is_err());
    }

    #[test]
    fn create_fails_without_any_transport() {
        let mut config = test_config();
        config.shared_memory_name = "s".repeat(400);
        config.pipe_name = "p".repeat(400);
        assert!(matches!(
            OrchestratorChannel::create(config),
            Err(ChannelError::NoTransport { .. })
        ));
    }

    #[test]
    fn start_fails_when_pipe_is_the_only_transport_and_nobody_connects() {
        let mut config = test_config();
        config.mode = TransportMode::NamedPipe;
        config.connect_timeout_ms = 100;
        let orchestrator = OrchestratorChannel::create(config).unwrap();

        assert!(orchestrator.start().unwrap_err().is_timeout());
        assert_eq!(orchestrator.state(), ChannelState::Connected);
    }

    #[test]
    fn send_requires_started_channel() {
        let orchestrator = OrchestratorChannel::create(test_config()).unwrap();
        assert!(matches!(
            orchestrator.send_command(command(1), Duration::from_millis(10)),
            Err(ChannelError::InvalidState(_))
        ));
    }

    #[test]
    fn oversized_command_sends_nothing() {
        let orchestrator = lonely_orchestrator();
        let mut big = command(1);
        big.content.template_data = "x".repeat(MAX_PAYLOAD_SIZE + 1);

        let err = orchestrator.send_command(big, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ChannelError::Wire(WireError::PayloadTooLarge { .. })));
        assert_eq!(orchestrator.stats().shared_memory.unwrap().messages_sent, 0);
        assert_eq!(orchestrator.pending_requests(), 0);
    }

    #[test]
    fn fire_and_forget_results_arrive_on_results_stream() {
        let config = test_config();
        let orchestrator = OrchestratorChannel::create(config.clone()).unwrap();
        let worker = ChannelCoordinator::new(config);
        worker.initialize().unwrap();
        worker
            .start_with(|command: RenderCommand| -> Result<RenderResult, HandlerError> {
                Ok(RenderResult::success(&command))
            })
            .unwrap();
        orchestrator.start().unwrap();

        let mut results = orchestrator.results().unwrap();
        assert!(orchestrator.results().is_none());

        let id = orchestrator.next_command_id();
        orchestrator.send_command_fire_and_forget(command(id)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let result = loop {
            match results.try_recv() {
                Ok(result) => break result,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("no result: {:?}", e),
            }
        };
        assert_eq!(result.command_id, id);
        assert!(result.is_success());
    }
}
