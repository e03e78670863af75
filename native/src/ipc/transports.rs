// The two transports of one channel end and the order they are tried in.

use super::error::{ChannelError, ChannelResult};
use super::frame::MessageType;
use super::pipe::PipeTransport;
use super::shared_memory::{SharedMemoryTransport, Slot};
use super::stats::{ChannelCounters, TransportStatsSnapshot};
use super::TransportKind;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Transports {
    pub shm: Option<Arc<SharedMemoryTransport>>,
    pub pipe: Option<Arc<PipeTransport>>,
    lock_timeout: Duration,
}

impl Transports {
    pub fn new(
        shm: Option<Arc<SharedMemoryTransport>>,
        pipe: Option<Arc<PipeTransport>>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            shm,
            pipe,
            lock_timeout,
        }
    }

    pub fn pipe_connected(&self) -> bool {
        self.pipe.as_ref().is_some_and(|p| p.is_connected())
    }

    /// Shared memory looks valid or the pipe is connected.
    pub fn test_connection(&self) -> bool {
        self.shm.as_ref().is_some_and(|s| s.test_connection()) || self.pipe_connected()
    }

    pub fn active(&self) -> Vec<TransportKind> {
        let mut active = Vec::new();
        if self.shm.is_some() {
            active.push(TransportKind::SharedMemory);
        }
        if self.pipe_connected() {
            active.push(TransportKind::NamedPipe);
        }
        active
    }

    pub fn shm_stats(&self) -> Option<TransportStatsSnapshot> {
        self.shm.as_ref().map(|s| s.stats())
    }

    pub fn pipe_stats(&self) -> Option<TransportStatsSnapshot> {
        self.pipe.as_ref().map(|p| p.stats())
    }

    /// Deliver an encoded record into `slot`, or as the matching pipe frame when
    /// shared memory cannot take it. Commands bypass a region no worker has
    /// attached to while the pipe is up. Fails only when neither transport delivered.
    pub async fn deliver(
        &self,
        slot: Slot,
        correlation_id: u64,
        bytes: &[u8],
        counters: &ChannelCounters,
    ) -> ChannelResult<TransportKind> {
        let pipe_ready = self.pipe_connected();

        let shm_failure = match &self.shm {
            // A command written before any worker attached would sit unread.
            Some(shm) if slot == Slot::Command && pipe_ready && !shm.peer_attached() => {
                "no worker attached".to_string()
            }
            Some(shm) => {
                let shm = Arc::clone(shm);
                let payload = bytes.to_vec();
                // With a live pipe, a busy slot falls back at once instead of waiting.
                let wait = if pipe_ready {
                    Duration::ZERO
                } else {
                    self.lock_timeout
                };
                let outcome = tokio::task::spawn_blocking(move || {
                    shm.send_encoded_within(slot, &payload, wait)
                })
                .await
                .unwrap_or_else(|e| Err(ChannelError::Runtime(e.to_string())));

                match outcome {
                    Ok(()) => return Ok(TransportKind::SharedMemory),
                    Err(e) => e.to_string(),
                }
            }
            None => "not available".to_string(),
        };

        let message_type = match slot {
            Slot::Command => MessageType::Command,
            Slot::Result => MessageType::Result,
        };

        let pipe_failure = match &self.pipe {
            Some(pipe) => match pipe.send(message_type, correlation_id, bytes).await {
                Ok(()) => {
                    if self.shm.is_some() {
                        ChannelCounters::bump(&counters.transport_fallbacks);
                        debug!(
                            "[IPC] {:?} {} went over the pipe; shared memory: {}",
                            message_type, correlation_id, shm_failure
                        );
                    }
                    return Ok(TransportKind::NamedPipe);
                }
                Err(e) => e.to_string(),
            },
            None => "not available".to_string(),
        };

        Err(ChannelError::AllTransportsFailed {
            shared_memory: shm_failure,
            pipe: pipe_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::frame::read_frame;
    use std::sync::atomic::Ordering;
    use tokio::io::{duplex, DuplexStream};

    const LOCK: Duration = Duration::from_millis(200);

    fn region() -> Arc<SharedMemoryTransport> {
        let name = format!("tptest{}", uuid::Uuid::new_v4().simple());
        Arc::new(SharedMemoryTransport::create(&name, LOCK).unwrap())
    }

    async fn connected_pipe() -> (Arc<PipeTransport>, DuplexStream) {
        let pipe = Arc::new(PipeTransport::new("transports-test", Duration::from_secs(1)));
        let (near, far) = duplex(64 * 1024);
        let _reader = pipe.install(Box::new(near), MessageType::Result).await;
        (pipe, far)
    }

    fn fallbacks(counters: &ChannelCounters) -> u64 {
        counters.transport_fallbacks.load(Ordering::Relaxed)
    }

    #[tokio::test]
    async fn busy_command_slot_falls_back_to_pipe() {
        let shm = region();
        let worker = SharedMemoryTransport::open(shm.name(), LOCK).unwrap();
        let (pipe, mut far) = connected_pipe().await;
        let transports = Transports::new(Some(Arc::clone(&shm)), Some(pipe), LOCK);
        let counters = ChannelCounters::default();

        let first = transports.deliver(Slot::Command, 1, b"first", &counters).await;
        assert_eq!(first.unwrap(), TransportKind::SharedMemory);
        assert!(shm.slot_ready(Slot::Command));
        assert_eq!(fallbacks(&counters), 0);

        let second = transports.deliver(Slot::Command, 2, b"second", &counters).await;
        assert_eq!(second.unwrap(), TransportKind::NamedPipe);
        assert_eq!(fallbacks(&counters), 1);

        let frame = read_frame(&mut far).await.unwrap();
        assert_eq!(frame.header.message_type, MessageType::Command);
        assert_eq!(frame.header.correlation_id, 2);
        assert_eq!(frame.payload, b"second");
        drop(worker);
    }

    #[tokio::test]
    async fn commands_skip_region_without_worker() {
        let shm = region();
        let (pipe, mut far) = connected_pipe().await;
        let transports = Transports::new(Some(Arc::clone(&shm)), Some(pipe), LOCK);
        let counters = ChannelCounters::default();

        let sent = transports.deliver(Slot::Command, 7, b"render", &counters).await;
        assert_eq!(sent.unwrap(), TransportKind::NamedPipe);
        assert!(!shm.slot_ready(Slot::Command));
        assert_eq!(read_frame(&mut far).await.unwrap().header.correlation_id, 7);

        let worker = SharedMemoryTransport::open(shm.name(), LOCK).unwrap();
        let sent = transports.deliver(Slot::Command, 8, b"render", &counters).await;
        assert_eq!(sent.unwrap(), TransportKind::SharedMemory);
        assert!(worker.slot_ready(Slot::Command));
    }

    #[tokio::test]
    async fn region_without_pipe_still_takes_commands() {
        let shm = region();
        let transports = Transports::new(Some(Arc::clone(&shm)), None, LOCK);
        let counters = ChannelCounters::default();

        let sent = transports.deliver(Slot::Command, 3, b"early", &counters).await;
        assert_eq!(sent.unwrap(), TransportKind::SharedMemory);
        assert!(shm.slot_ready(Slot::Command));
    }

    #[tokio::test]
    async fn nothing_usable_fails_with_both_reasons() {
        let pipe = Arc::new(PipeTransport::new("transports-idle", Duration::from_secs(1)));
        let transports = Transports::new(None, Some(pipe), LOCK);
        let counters = ChannelCounters::default();

        match transports.deliver(Slot::Result, 4, b"done", &counters).await {
            Err(ChannelError::AllTransportsFailed {
                shared_memory,
                pipe,
            }) => {
                assert_eq!(shared_memory, "not available");
                assert!(!pipe.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(transports.active().is_empty());
        assert_eq!(fallbacks(&counters), 0);
    }
}
