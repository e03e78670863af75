// Bounded command queue with a counting wake signal.

use super::error::{ChannelError, ChannelResult};
use super::protocol::RenderCommand;
use super::runtime::lock_unpoisoned;
use super::TransportKind;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: RenderCommand,
    pub source: TransportKind,
    pub received_at: Instant,
}

impl QueuedCommand {
    pub fn new(command: RenderCommand, source: TransportKind) -> Self {
        Self {
            command,
            source,
            received_at: Instant::now(),
        }
    }
}

/// Producer side pushes and releases one permit per item; the dispatcher
/// waits on the permits and drains everything queued.
pub struct CommandQueue {
    items: Mutex<VecDeque<QueuedCommand>>,
    signal: Semaphore,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            signal: Semaphore::new(0),
            capacity,
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedCommand>> {
        lock_unpoisoned(&self.items)
    }

    /// Enqueue and wake the dispatcher. Fails when the queue is at capacity.
    pub fn push(&self, item: QueuedCommand) -> ChannelResult<()> {
        {
            let mut items = self.items();
            if items.len() >= self.capacity {
                return Err(ChannelError::QueueFull(self.capacity));
            }
            items.push_back(item);
        }
        self.signal.add_permits(1);
        Ok(())
    }

    /// Wait for a wake-up. `false` on timeout or once the queue is closed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.signal.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            Ok(Err(_closed)) => false,
            Err(_elapsed) => false,
        }
    }

    /// Take every queued command in arrival order.
    pub fn drain(&self) -> Vec<QueuedCommand> {
        // Absorb pending permits first so a push racing with this drain keeps its own.
        while let Ok(permit) = self.signal.try_acquire() {
            permit.forget();
        }
        self.items().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Release any waiter for good.
    pub fn close(&self) {
        self.signal.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::RenderCommandType;
    use std::sync::Arc;

    fn item(id: u64) -> QueuedCommand {
        QueuedCommand::new(
            RenderCommand::new(id, RenderCommandType::Render, 1),
            TransportKind::NamedPipe,
        )
    }

    #[tokio::test]
    async fn drains_in_arrival_order() {
        let queue = CommandQueue::new(8);
        for id in 1..=3 {
            queue.push(item(id)).unwrap();
        }
        assert!(queue.wait(Duration::from_millis(10)).await);
        let ids: Vec<u64> = queue.drain().iter().map(|q| q.command.command_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
        // Extra permits were absorbed by the drain.
        assert!(!queue.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let queue = CommandQueue::new(2);
        queue.push(item(1)).unwrap();
        queue.push(item(2)).unwrap();
        assert!(matches!(queue.push(item(3)), Err(ChannelError::QueueFull(2))));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn wait_times_out_when_empty() {
        let queue = CommandQueue::new(2);
        let started = Instant::now();
        assert!(!queue.wait(Duration::from_millis(30)).await);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn push_wakes_waiting_dispatcher() {
        let queue = Arc::new(CommandQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(item(9)).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(CommandQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(!waiter.await.unwrap());
    }
}
