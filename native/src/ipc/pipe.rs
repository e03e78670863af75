// Named-pipe transport: framed byte stream with a shared writer and a reconnecting reader task.

use super::error::{ChannelError, ChannelResult};
use super::frame::{read_frame, write_frame, Frame, MessageType};
use super::protocol::{check_payload_size, RenderCommand, RenderResult};
use super::runtime::{cancelled, sleep_or_cancel};
use super::stats::{TransportStats, TransportStatsSnapshot};
use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Any duplex byte stream the transport can frame.
pub trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PipeStream for T {}

pub type BoxedStream = Box<dyn PipeStream>;

/// OS path of the pipe endpoint for `name`.
#[cfg(unix)]
pub fn endpoint_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("{}.sock", name))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
pub fn endpoint_path(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

/// Errors worth retrying while the other end is still starting up.
fn is_transient_connect_error(err: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_PIPE_BUSY
        if err.raw_os_error() == Some(231) {
            return true;
        }
    }
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(unix)]
async fn open_client(path: &str) -> io::Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn open_client(path: &str) -> io::Result<BoxedStream> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(client))
}

/// Connect to a listening endpoint, retrying until `timeout` expires.
pub async fn connect(name: &str, timeout: Duration) -> ChannelResult<BoxedStream> {
    let path = endpoint_path(name);
    let deadline = Instant::now() + timeout;

    loop {
        match open_client(&path).await {
            Ok(stream) => {
                info!("[PIPE] Connected to {}", path);
                return Ok(stream);
            }
            Err(e) if is_transient_connect_error(&e) => {
                if Instant::now() >= deadline {
                    return Err(ChannelError::Timeout(format!(
                        "no listener on {} after {:?}",
                        path, timeout
                    )));
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(ChannelError::Unavailable(format!(
                    "connect to {}: {}",
                    path, e
                )))
            }
        }
    }
}

/// Server side of the endpoint. Must be created inside a Tokio runtime.
pub struct PipeListener {
    path: String,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl PipeListener {
    #[cfg(unix)]
    pub fn bind(name: &str) -> ChannelResult<Self> {
        let path = endpoint_path(name);
        // A stale socket file from a crashed run would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| ChannelError::Unavailable(format!("bind {}: {}", path, e)))?;
        info!("[PIPE] Listening on {}", path);
        Ok(Self { path, listener })
    }

    #[cfg(windows)]
    pub fn bind(name: &str) -> ChannelResult<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let path = endpoint_path(name);
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)
            .map_err(|e| ChannelError::Unavailable(format!("create {}: {}", path, e)))?;
        info!("[PIPE] Listening on {}", path);
        Ok(Self {
            path,
            server: Some(server),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(unix)]
    pub async fn accept(&mut self, timeout: Duration) -> ChannelResult<BoxedStream> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, _addr))) => {
                info!("[PIPE] Peer connected on {}", self.path);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Err(_) => Err(ChannelError::Timeout(format!(
                "no peer connected to {} within {:?}",
                self.path, timeout
            ))),
        }
    }

    #[cfg(windows)]
    pub async fn accept(&mut self, timeout: Duration) -> ChannelResult<BoxedStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = match self.server.take() {
            Some(server) => server,
            None => ServerOptions::new().create(&self.path)?,
        };

        match tokio::time::timeout(timeout, server.connect()).await {
            Ok(Ok(())) => {
                info!("[PIPE] Peer connected on {}", self.path);
                // Keep an instance ready for a reconnecting peer.
                self.server = ServerOptions::new().create(&self.path).ok();
                Ok(Box::new(server))
            }
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Err(_) => {
                self.server = Some(server);
                Err(ChannelError::Timeout(format!(
                    "no peer connected to {} within {:?}",
                    self.path, timeout
                )))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// How a lost connection gets re-established.
pub enum PipeConnector {
    Client { name: String },
    Server { listener: PipeListener },
}

impl PipeConnector {
    pub async fn establish(&mut self, timeout: Duration) -> ChannelResult<BoxedStream> {
        match self {
            PipeConnector::Client { name } => connect(name, timeout).await,
            PipeConnector::Server { listener } => listener.accept(timeout).await,
        }
    }
}

/// Read half of an installed connection.
pub struct PipeReader {
    inner: ReadHalf<BoxedStream>,
    expect: MessageType,
}

impl PipeReader {
    /// Next frame of the expected type. Any error means the stream is unusable.
    pub async fn next_frame(&mut self) -> ChannelResult<Frame> {
        let frame = read_frame(&mut self.inner).await?;
        if frame.header.message_type != self.expect {
            return Err(ChannelError::MalformedFrame(format!(
                "expected {:?} frame, got {:?}",
                self.expect, frame.header.message_type
            )));
        }
        Ok(frame)
    }
}

/// Write side shared by every sender; reads happen on a [`PipeReader`].
pub struct PipeTransport {
    name: String,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    connected: AtomicBool,
    write_timeout: Duration,
    stats: TransportStats,
}

impl PipeTransport {
    pub fn new(name: &str, write_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            writer: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
            write_timeout,
            stats: TransportStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adopt a fresh connection, replacing any previous one.
    pub async fn install(&self, stream: BoxedStream, expect: MessageType) -> PipeReader {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::Release);
        PipeReader {
            inner: read_half,
            expect,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if self.writer.lock().await.take().is_some() {
            debug!("[PIPE] Connection on '{}' released", self.name);
        }
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.stats.record_received(bytes);
    }

    pub(crate) fn record_malformed(&self) {
        self.stats.record_malformed();
    }

    /// Write one frame. A failed or timed out write tears the connection down.
    pub async fn send(
        &self,
        message_type: MessageType,
        correlation_id: u64,
        payload: &[u8],
    ) -> ChannelResult<()> {
        check_payload_size(payload.len())?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Disconnected)?;

        let outcome = match tokio::time::timeout(
            self.write_timeout,
            write_frame(writer, message_type, correlation_id, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_timeout();
                Err(ChannelError::Timeout(format!(
                    "pipe write after {:?}",
                    self.write_timeout
                )))
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.record_sent(payload.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                warn!("[PIPE] Write failed on '{}': {}", self.name, e);
                // A partial frame cannot be resynchronized.
                guard.take();
                self.connected.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub async fn send_command(&self, command: &RenderCommand) -> ChannelResult<()> {
        let bytes = command.to_bytes()?;
        self.send(MessageType::Command, command.command_id, &bytes).await
    }

    pub async fn send_result(&self, result: &RenderResult) -> ChannelResult<()> {
        let bytes = result.to_bytes()?;
        self.send(MessageType::Result, result.command_id, &bytes).await
    }
}

/// Settings for [`run_reader`].
pub struct ReaderOptions {
    pub expect: MessageType,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
}

/// Forward inbound frames to `frames`, re-establishing the connection when it drops.
/// Returns once `cancel` flips or the frame receiver is gone.
pub async fn run_reader(
    transport: Arc<PipeTransport>,
    mut connector: PipeConnector,
    initial: Option<PipeReader>,
    frames: mpsc::Sender<Frame>,
    mut cancel: watch::Receiver<bool>,
    options: ReaderOptions,
) {
    let mut reader = initial;

    loop {
        if *cancel.borrow() {
            break;
        }

        let mut active = match reader.take() {
            Some(active) => active,
            None => {
                let established = tokio::select! {
                    _ = cancelled(&mut cancel) => break,
                    res = connector.establish(options.connect_timeout) => res,
                };
                match established {
                    Ok(stream) => transport.install(stream, options.expect).await,
                    Err(e) => {
                        debug!("[PIPE] Reconnect on '{}' failed: {}", transport.name(), e);
                        if sleep_or_cancel(&mut cancel, options.reconnect_backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancelled(&mut cancel) => return,
                next = active.next_frame() => next,
            };

            match next {
                Ok(frame) => {
                    transport.record_received(frame.payload.len());
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    match &e {
                        ChannelError::Disconnected => {
                            info!("[PIPE] Peer closed '{}'", transport.name())
                        }
                        ChannelError::MalformedFrame(_) => {
                            transport.record_malformed();
                            error!(
                                "[PIPE] Malformed frame on '{}', dropping connection: {}",
                                transport.name(),
                                e
                            );
                        }
                        _ => warn!("[PIPE] Read failed on '{}': {}", transport.name(), e),
                    }
                    transport.disconnect().await;
                    break;
                }
            }
        }

        if sleep_or_cancel(&mut cancel, options.reconnect_backoff).await {
            break;
        }
    }

    debug!("[PIPE] Reader for '{}' exited", transport.name());
}
