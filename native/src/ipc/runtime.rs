// Tokio runtime, cancellation signal and task ownership for one channel end.

use super::error::{ChannelError, ChannelResult};
use log::{debug, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the cancel flag is set or its sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Sleep for `delay`. Returns true if cancelled meanwhile.
pub async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = cancelled(cancel) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// The public API is blocking; its methods must not be called from inside an async context.
pub struct ChannelRuntime {
    label: &'static str,
    runtime: Mutex<Option<Arc<Runtime>>>,
    cancel: Mutex<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelRuntime {
    pub fn new(label: &'static str) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            label,
            runtime: Mutex::new(None),
            cancel: Mutex::new(cancel),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the runtime if needed and arm a fresh cancel signal.
    pub fn start(&self) -> ChannelResult<Arc<Runtime>> {
        let mut guard = lock_unpoisoned(&self.runtime);
        if let Some(runtime) = guard.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("{}-io", self.label))
            .enable_all()
            .build()
            .map_err(|e| ChannelError::Runtime(format!("Failed to create Tokio runtime: {}", e)))?;
        let runtime = Arc::new(runtime);

        let (cancel, _) = watch::channel(false);
        *lock_unpoisoned(&self.cancel) = cancel;
        *guard = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    fn current(&self) -> ChannelResult<Arc<Runtime>> {
        lock_unpoisoned(&self.runtime)
            .as_ref()
            .cloned()
            .ok_or_else(|| ChannelError::InvalidState("runtime not running".to_string()))
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.runtime).is_some()
    }

    /// Drive `future` to completion on the channel runtime.
    pub fn block_on<F: Future>(&self, future: F) -> ChannelResult<F::Output> {
        let runtime = self.current()?;
        Ok(runtime.block_on(future))
    }

    /// Spawn a long-running task that shutdown will join.
    pub fn spawn<F>(&self, future: F) -> ChannelResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.current()?;
        let handle = runtime.spawn(future);
        lock_unpoisoned(&self.tasks).push(handle);
        Ok(())
    }

    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        lock_unpoisoned(&self.cancel).subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *lock_unpoisoned(&self.cancel).borrow()
    }

    pub fn cancel(&self) {
        lock_unpoisoned(&self.cancel).send_replace(true);
    }

    /// Cancel, join tasks until `timeout`, then tear the runtime down regardless.
    /// Returns false if some task had to be aborted.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel();

        let runtime = match lock_unpoisoned(&self.runtime).take() {
            Some(runtime) => runtime,
            None => return true,
        };

        let tasks: Vec<JoinHandle<()>> = lock_unpoisoned(&self.tasks).drain(..).collect();
        let label = self.label;
        let clean = runtime.block_on(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut clean = true;
            for mut task in tasks {
                match tokio::time::timeout_at(deadline, &mut task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_panic() => {
                        warn!("[{}] Task panicked during shutdown", label);
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        task.abort();
                        clean = false;
                    }
                }
            }
            clean
        });

        if !clean {
            warn!(
                "[{}] Tasks did not exit within {:?}; aborted",
                self.label, timeout
            );
        }

        match Arc::try_unwrap(runtime) {
            Ok(runtime) => runtime.shutdown_timeout(Duration::from_millis(100)),
            // A caller still inside block_on; its Arc drops the runtime when it returns.
            Err(_shared) => debug!("[{}] Runtime still referenced at shutdown", self.label),
        }
        clean
    }
}
