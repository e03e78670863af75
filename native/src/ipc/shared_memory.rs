// Shared-memory transport: one command slot and one result slot behind a named mutex.

use super::error::{ChannelError, ChannelResult};
use super::platform::{
    command_event_name, mutex_name, result_event_name, NamedEvent, NamedMutex, NamedMutexGuard,
    SharedRegion,
};
use super::protocol::{check_payload_size, RenderCommand, RenderResult, MAX_PAYLOAD_SIZE};
use super::stats::{TransportStats, TransportStatsSnapshot};
use log::{debug, error, info, warn};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// "RMSH"
pub const REGION_MAGIC: u32 = 0x524D_5348;
pub const LAYOUT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 48;
pub const SLOT_CAPACITY: usize = MAX_PAYLOAD_SIZE;
pub const REGION_SIZE: usize = HEADER_SIZE + 2 * SLOT_CAPACITY;

const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Control block at the start of the region. Every field is accessed atomically.
#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    command_ready: AtomicU32,
    result_ready: AtomicU32,
    command_len: AtomicU32,
    result_len: AtomicU32,
    command_seq: AtomicU64,
    result_seq: AtomicU64,
    slot_capacity: AtomicU32,
    attached_peers: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Command,
    Result,
}

impl Slot {
    fn offset(self) -> usize {
        match self {
            Slot::Command => HEADER_SIZE,
            Slot::Result => HEADER_SIZE + SLOT_CAPACITY,
        }
    }
}

impl RegionHeader {
    fn ready(&self, slot: Slot) -> &AtomicU32 {
        match slot {
            Slot::Command => &self.command_ready,
            Slot::Result => &self.result_ready,
        }
    }

    fn len(&self, slot: Slot) -> &AtomicU32 {
        match slot {
            Slot::Command => &self.command_len,
            Slot::Result => &self.result_len,
        }
    }

    fn seq(&self, slot: Slot) -> &AtomicU64 {
        match slot {
            Slot::Command => &self.command_seq,
            Slot::Result => &self.result_seq,
        }
    }
}

/// Both ends map the same region. The orchestrator creates it, the worker opens it.
pub struct SharedMemoryTransport {
    name: String,
    region: SharedRegion,
    mutex: NamedMutex,
    command_event: NamedEvent,
    result_event: NamedEvent,
    lock_timeout: Duration,
    stats: TransportStats,
    attached: bool,
}

impl SharedMemoryTransport {
    /// Create the region and its synchronization objects.
    pub fn create(name: &str, lock_timeout: Duration) -> ChannelResult<Self> {
        let unavailable = |what: &str, e: std::io::Error| {
            ChannelError::Unavailable(format!("create {} for '{}': {}", what, name, e))
        };

        let region =
            SharedRegion::create(name, REGION_SIZE).map_err(|e| unavailable("region", e))?;
        let mutex = NamedMutex::create(&mutex_name(name)).map_err(|e| unavailable("mutex", e))?;
        let command_event = NamedEvent::create(&command_event_name(name))
            .map_err(|e| unavailable("command event", e))?;
        let result_event = NamedEvent::create(&result_event_name(name))
            .map_err(|e| unavailable("result event", e))?;

        let transport = Self {
            name: name.to_string(),
            region,
            mutex,
            command_event,
            result_event,
            lock_timeout,
            stats: TransportStats::default(),
            attached: false,
        };

        let header = transport.header();
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.slot_capacity.store(SLOT_CAPACITY as u32, Ordering::Relaxed);
        header.attached_peers.store(0, Ordering::Relaxed);
        for slot in [Slot::Command, Slot::Result] {
            header.ready(slot).store(0, Ordering::Relaxed);
            header.len(slot).store(0, Ordering::Relaxed);
            header.seq(slot).store(0, Ordering::Relaxed);
        }
        // Publishing the magic marks the region as valid.
        header.magic.store(REGION_MAGIC, Ordering::Release);

        info!("[SHM] Created region '{}' ({} bytes)", name, REGION_SIZE);
        Ok(transport)
    }

    /// Attach to a region created by the other end.
    pub fn open(name: &str, lock_timeout: Duration) -> ChannelResult<Self> {
        let unavailable = |what: &str, e: std::io::Error| {
            ChannelError::Unavailable(format!("open {} for '{}': {}", what, name, e))
        };

        let region =
            SharedRegion::open(name, REGION_SIZE).map_err(|e| unavailable("region", e))?;
        let mutex = NamedMutex::open(&mutex_name(name)).map_err(|e| unavailable("mutex", e))?;
        let command_event = NamedEvent::open(&command_event_name(name))
            .map_err(|e| unavailable("command event", e))?;
        let result_event = NamedEvent::open(&result_event_name(name))
            .map_err(|e| unavailable("result event", e))?;

        let mut transport = Self {
            name: name.to_string(),
            region,
            mutex,
            command_event,
            result_event,
            lock_timeout,
            stats: TransportStats::default(),
            attached: false,
        };

        let header = transport.header();
        let magic = header.magic.load(Ordering::Acquire);
        let version = header.version.load(Ordering::Relaxed);
        let capacity = header.slot_capacity.load(Ordering::Relaxed) as usize;
        if magic != REGION_MAGIC || version != LAYOUT_VERSION || capacity != SLOT_CAPACITY {
            return Err(ChannelError::Unavailable(format!(
                "region '{}' has magic 0x{:08X}, version {}, capacity {}",
                name, magic, version, capacity
            )));
        }

        header.attached_peers.fetch_add(1, Ordering::AcqRel);
        transport.attached = true;

        info!("[SHM] Attached to region '{}'", name);
        Ok(transport)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &RegionHeader {
        // The mapping is page aligned and at least HEADER_SIZE bytes long.
        unsafe { &*(self.region.as_ptr() as *const RegionHeader) }
    }

    fn event(&self, slot: Slot) -> &NamedEvent {
        match slot {
            Slot::Command => &self.command_event,
            Slot::Result => &self.result_event,
        }
    }

    /// Lock-free health check on the region magic.
    pub fn test_connection(&self) -> bool {
        self.header().magic.load(Ordering::Acquire) == REGION_MAGIC
    }

    /// Whether a worker currently holds an opened handle to the region.
    pub fn peer_attached(&self) -> bool {
        self.header().attached_peers.load(Ordering::Acquire) > 0
    }

    /// Whether `slot` holds an unconsumed message.
    pub fn slot_ready(&self, slot: Slot) -> bool {
        self.header().ready(slot).load(Ordering::Acquire) != 0
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn lock(&self) -> ChannelResult<NamedMutexGuard<'_>> {
        match self.mutex.lock(self.lock_timeout) {
            Ok(Some(guard)) => Ok(guard),
            Ok(None) => {
                self.stats.record_timeout();
                warn!(
                    "[SHM] Mutex acquisition timed out after {:?} on '{}'",
                    self.lock_timeout, self.name
                );
                Err(ChannelError::Timeout(format!(
                    "shared memory mutex after {:?}",
                    self.lock_timeout
                )))
            }
            Err(e) => {
                self.stats.record_error();
                Err(ChannelError::Io(e))
            }
        }
    }

    /// Place `bytes` in `slot` unless it is still occupied, then signal the peer.
    fn write_slot(&self, slot: Slot, bytes: &[u8]) -> ChannelResult<()> {
        check_payload_size(bytes.len())?;
        if bytes.is_empty() {
            return Err(ChannelError::MalformedSlot("empty payload".to_string()));
        }

        {
            let _guard = self.lock()?;
            let header = self.header();

            if header.ready(slot).load(Ordering::Acquire) != 0 {
                return Err(ChannelError::SlotBusy(slot));
            }

            unsafe {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.region.as_ptr().add(slot.offset()),
                    bytes.len(),
                );
            }
            header.len(slot).store(bytes.len() as u32, Ordering::Relaxed);
            header.seq(slot).fetch_add(1, Ordering::Relaxed);
            header.ready(slot).store(1, Ordering::Release);
        }

        self.stats.record_sent(bytes.len());

        // The peer's listener also polls the slot, so a failed signal only adds latency.
        if let Err(e) = self.event(slot).set() {
            warn!("[SHM] Failed to signal {:?} event: {}", slot, e);
        }
        Ok(())
    }

    /// Take the bytes out of `slot` if it is ready. The slot is free again on return.
    fn read_slot(&self, slot: Slot) -> ChannelResult<Option<Vec<u8>>> {
        let bytes = {
            let _guard = self.lock()?;
            let header = self.header();

            if header.ready(slot).load(Ordering::Acquire) == 0 {
                return Ok(None);
            }

            let len = header.len(slot).load(Ordering::Relaxed) as usize;
            if len == 0 || len > SLOT_CAPACITY {
                header.len(slot).store(0, Ordering::Relaxed);
                header.ready(slot).store(0, Ordering::Release);
                self.stats.record_malformed();
                error!(
                    "[SHM] Discarding {:?} slot with invalid length {} on '{}'",
                    slot, len, self.name
                );
                return Err(ChannelError::MalformedSlot(format!(
                    "{:?} slot length {} outside 1..={}",
                    slot, len, SLOT_CAPACITY
                )));
            }

            let mut bytes = vec![0u8; len];
            unsafe {
                ptr::copy_nonoverlapping(
                    self.region.as_ptr().add(slot.offset()),
                    bytes.as_mut_ptr(),
                    len,
                );
            }
            header.len(slot).store(0, Ordering::Relaxed);
            header.ready(slot).store(0, Ordering::Release);
            bytes
        };

        self.stats.record_received(bytes.len());
        debug!("[SHM] Read {} bytes from {:?} slot", bytes.len(), slot);
        Ok(Some(bytes))
    }

    pub fn try_read_command(&self) -> ChannelResult<Option<RenderCommand>> {
        match self.read_slot(Slot::Command)? {
            Some(bytes) => self.decode(&bytes, RenderCommand::from_bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn try_read_result(&self) -> ChannelResult<Option<RenderResult>> {
        match self.read_slot(Slot::Result)? {
            Some(bytes) => self.decode(&bytes, RenderResult::from_bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Encode outside the lock, then write. Fails with `SlotBusy` if the previous
    /// command has not been consumed.
    pub fn try_send_command(&self, command: &RenderCommand) -> ChannelResult<()> {
        let bytes = command.to_bytes()?;
        self.write_slot(Slot::Command, &bytes)
    }

    pub fn try_send_result(&self, result: &RenderResult) -> ChannelResult<()> {
        let bytes = result.to_bytes()?;
        self.write_slot(Slot::Result, &bytes)
    }

    pub fn send_result_within(&self, result: &RenderResult, wait: Duration) -> ChannelResult<()> {
        let bytes = result.to_bytes()?;
        self.send_encoded_within(Slot::Result, &bytes, wait)
    }

    /// Send an already encoded record, retrying a busy slot for up to `wait`.
    pub fn send_encoded_within(
        &self,
        slot: Slot,
        bytes: &[u8],
        wait: Duration,
    ) -> ChannelResult<()> {
        let deadline = Instant::now() + wait;
        loop {
            match self.write_slot(slot, bytes) {
                Err(ChannelError::SlotBusy(_)) if Instant::now() < deadline => {
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                outcome => return outcome,
            }
        }
    }

    /// Wait up to `wait` for `slot`'s event, then take whatever the slot holds.
    /// The slot is checked even without a signal, so a missed wake only costs latency.
    pub fn wait_and_take(&self, slot: Slot, wait: Duration) -> ChannelResult<Option<Vec<u8>>> {
        if let Err(e) = self.event(slot).wait(wait) {
            self.stats.record_error();
            return Err(ChannelError::Io(e));
        }
        self.read_slot(slot)
    }

    /// Wait for the command-available event. `Ok(false)` on timeout.
    pub fn wait_for_command(&self, timeout: Duration) -> ChannelResult<bool> {
        self.event(Slot::Command).wait(timeout).map_err(ChannelError::Io)
    }

    pub fn wait_for_result(&self, timeout: Duration) -> ChannelResult<bool> {
        self.event(Slot::Result).wait(timeout).map_err(ChannelError::Io)
    }

    fn decode<T>(
        &self,
        bytes: &[u8],
        decode: fn(&[u8]) -> Result<T, super::protocol::WireError>,
    ) -> ChannelResult<T> {
        decode(bytes).map_err(|e| {
            self.stats.record_malformed();
            error!("[SHM] Failed to decode slot contents: {}", e);
            ChannelError::Wire(e)
        })
    }
}

impl Drop for SharedMemoryTransport {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let _ = self.header().attached_peers.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |peers| peers.checked_sub(1),
        );
        debug!("[SHM] Detached from region '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{RenderCommandType, RenderRect, WireError};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    const LOCK: Duration = Duration::from_millis(500);

    fn unique_name() -> String {
        format!("shmtest{}", uuid::Uuid::new_v4().simple())
    }

    fn pair() -> (SharedMemoryTransport, SharedMemoryTransport) {
        let name = unique_name();
        let owner = SharedMemoryTransport::create(&name, LOCK).unwrap();
        let peer = SharedMemoryTransport::open(&name, LOCK).unwrap();
        (owner, peer)
    }

    fn render_command(id: u64) -> RenderCommand {
        RenderCommand::new(id, RenderCommandType::Render, 7)
            .with_bounds(RenderRect::new(0, 0, 200, 100))
    }

    #[test]
    fn command_and_result_cross_the_region() {
        let (orchestrator, worker) = pair();
        assert!(worker.test_connection());

        let sent = render_command(1);
        orchestrator.try_send_command(&sent).unwrap();
        assert!(worker.wait_for_command(Duration::from_millis(200)).unwrap());
        let command = worker.try_read_command().unwrap().unwrap();
        assert_eq!(command, sent);
        assert!(!worker.slot_ready(Slot::Command));

        worker.try_send_result(&RenderResult::success(&command)).unwrap();
        assert!(orchestrator.wait_for_result(Duration::from_millis(200)).unwrap());
        let result = orchestrator.try_read_result().unwrap().unwrap();
        assert_eq!(result.command_id, 1);
        assert!(result.is_success());

        assert_eq!(orchestrator.stats().messages_sent, 1);
        assert_eq!(worker.stats().messages_received, 1);
    }

    #[test]
    fn empty_slot_reads_nothing() {
        let (_orchestrator, worker) = pair();
        assert!(worker.try_read_command().unwrap().is_none());
        assert!(!worker.wait_for_command(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn occupied_command_slot_is_not_overwritten() {
        let (orchestrator, worker) = pair();
        orchestrator.try_send_command(&render_command(1)).unwrap();

        let err = orchestrator.try_send_command(&render_command(2)).unwrap_err();
        assert!(matches!(err, ChannelError::SlotBusy(Slot::Command)));

        let first = worker.try_read_command().unwrap().unwrap();
        assert_eq!(first.command_id, 1);
        orchestrator.try_send_command(&render_command(2)).unwrap();
        assert_eq!(worker.try_read_command().unwrap().unwrap().command_id, 2);
    }

    #[test]
    fn busy_slot_send_waits_for_consumer() {
        let (orchestrator, worker) = pair();
        let first = RenderResult::failure(1, 7, "first");
        let second = RenderResult::failure(2, 7, "second");
        worker.try_send_result(&first).unwrap();

        assert!(matches!(
            worker.send_result_within(&second, Duration::from_millis(20)),
            Err(ChannelError::SlotBusy(Slot::Result))
        ));

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                let taken = orchestrator
                    .wait_and_take(Slot::Result, Duration::from_millis(100))
                    .unwrap()
                    .unwrap();
                assert_eq!(RenderResult::from_bytes(&taken).unwrap(), first);
            });
            worker.send_result_within(&second, Duration::from_secs(2)).unwrap();
        });

        assert_eq!(orchestrator.try_read_result().unwrap().unwrap(), second);
    }

    #[test]
    fn payload_size_boundary() {
        let (orchestrator, worker) = pair();

        let mut command = render_command(3);
        let base = command.to_bytes().unwrap().len();
        command.content.template_data = "a".repeat(MAX_PAYLOAD_SIZE - base);
        assert_eq!(command.to_bytes().unwrap().len(), MAX_PAYLOAD_SIZE);

        orchestrator.try_send_command(&command).unwrap();
        assert_eq!(worker.try_read_command().unwrap().unwrap(), command);

        command.content.template_data.push('a');
        let err = orchestrator.try_send_command(&command).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Wire(WireError::PayloadTooLarge { size }) if size == MAX_PAYLOAD_SIZE + 1
        ));
        let err = orchestrator
            .write_slot(Slot::Command, &vec![1u8; MAX_PAYLOAD_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, ChannelError::Wire(_)));
        assert!(!orchestrator.slot_ready(Slot::Command));
    }

    #[test]
    fn invalid_length_discards_slot() {
        let (orchestrator, worker) = pair();
        let header = orchestrator.header();
        header.command_len.store((SLOT_CAPACITY + 1) as u32, Ordering::Relaxed);
        header.command_ready.store(1, Ordering::Release);

        assert!(matches!(
            worker.try_read_command(),
            Err(ChannelError::MalformedSlot(_))
        ));
        assert!(!worker.slot_ready(Slot::Command));
        assert_eq!(worker.stats().malformed, 1);

        header.command_len.store(0, Ordering::Relaxed);
        header.command_ready.store(1, Ordering::Release);
        assert!(matches!(
            worker.try_read_command(),
            Err(ChannelError::MalformedSlot(_))
        ));
    }

    #[test]
    fn undecodable_slot_is_cleared() {
        let (orchestrator, worker) = pair();
        orchestrator.write_slot(Slot::Command, &[1, 2, 3]).unwrap();
        assert!(matches!(worker.try_read_command(), Err(ChannelError::Wire(_))));
        assert!(!worker.slot_ready(Slot::Command));
    }

    #[test]
    fn open_rejects_foreign_layout() {
        let name = unique_name();
        let owner = SharedMemoryTransport::create(&name, LOCK).unwrap();
        owner.header().version.store(LAYOUT_VERSION + 1, Ordering::Release);
        assert!(matches!(
            SharedMemoryTransport::open(&name, LOCK),
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[test]
    fn attached_workers_are_counted() {
        let name = unique_name();
        let owner = SharedMemoryTransport::create(&name, LOCK).unwrap();
        assert!(!owner.peer_attached());

        let first = SharedMemoryTransport::open(&name, LOCK).unwrap();
        let second = SharedMemoryTransport::open(&name, LOCK).unwrap();
        assert!(owner.peer_attached());
        assert_eq!(owner.header().attached_peers.load(Ordering::Acquire), 2);

        drop(first);
        assert!(owner.peer_attached());
        drop(second);
        assert!(!owner.peer_attached());
    }

    #[test]
    fn rejected_open_does_not_count_as_attached() {
        let name = unique_name();
        let owner = SharedMemoryTransport::create(&name, LOCK).unwrap();
        owner.header().version.store(LAYOUT_VERSION + 1, Ordering::Release);
        assert!(SharedMemoryTransport::open(&name, LOCK).is_err());
        assert!(!owner.peer_attached());
    }

    #[test]
    fn open_without_creator_is_unavailable() {
        assert!(matches!(
            SharedMemoryTransport::open(&unique_name(), LOCK),
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[test]
    fn held_mutex_times_out_operations() {
        let (orchestrator, worker) = pair();
        let short =
            SharedMemoryTransport::open(orchestrator.name(), Duration::from_millis(50)).unwrap();

        thread::scope(|s| {
            let (locked_tx, locked_rx) = std::sync::mpsc::channel();
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            s.spawn(move || {
                let _guard = worker.mutex.lock(LOCK).unwrap().unwrap();
                locked_tx.send(()).unwrap();
                let _ = release_rx.recv();
            });
            locked_rx.recv().unwrap();

            let err = short.try_send_command(&render_command(1)).unwrap_err();
            assert!(err.is_timeout());
            assert_eq!(short.stats().timeouts, 1);
            release_tx.send(()).unwrap();
        });
    }

    #[test]
    fn concurrent_senders_never_interleave() {
        const SENDERS: u64 = 4;
        const PER_SENDER: u64 = 25;

        let name = unique_name();
        let _orchestrator = SharedMemoryTransport::create(&name, LOCK).unwrap();
        let worker = SharedMemoryTransport::open(&name, LOCK).unwrap();

        let senders: Vec<_> = (0..SENDERS)
            .map(|sender| {
                let transport = SharedMemoryTransport::open(&name, LOCK).unwrap();
                thread::spawn(move || {
                    for n in 0..PER_SENDER {
                        let mut command = render_command(sender * 1000 + n);
                        // Sizes differ per sender so a torn write cannot decode cleanly.
                        command.content.template_data = "x".repeat((sender as usize + 1) * 513);
                        loop {
                            match transport.try_send_command(&command) {
                                Ok(()) => break,
                                Err(ChannelError::SlotBusy(_)) => thread::yield_now(),
                                Err(e) => panic!("send failed: {}", e),
                            }
                        }
                    }
                })
            })
            .collect();

        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        let mut seen = 0;
        while seen < SENDERS * PER_SENDER {
            assert!(std::time::Instant::now() < deadline, "senders stalled");
            let _ = worker.wait_for_command(Duration::from_millis(10));
            if let Some(command) = worker.try_read_command().unwrap() {
                let sender = command.command_id / 1000;
                assert_eq!(command.content.template_data.len(), (sender as usize + 1) * 513);
                seen += 1;
            }
        }

        for sender in senders {
            sender.join().unwrap();
        }
    }

    #[test]
    fn mutex_admits_one_holder_at_a_time() {
        let (orchestrator, _worker) = pair();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..6)
            .map(|_| {
                let transport = SharedMemoryTransport::open(orchestrator.name(), LOCK).unwrap();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = transport.lock().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
