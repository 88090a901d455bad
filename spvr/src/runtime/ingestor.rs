//! UDP pose receiver.
//!
//! [`PoseIngestor`] owns one background thread, `spvr-pose-rx`, which binds a
//! non-blocking socket, waits for readiness with a bounded poll timeout and
//! drains every queued datagram:
//!
//! ```text
//! datagram ──► PosePacket::decode ──► SequenceGate::admit ──► normalize ──► set_rotation
//!                    │                        │                    │
//!                    └──── rejected (counted, dropped silently) ───┘
//! ```
//!
//! Transport failures (bind, poll, receive) drop the socket, log once into the
//! control channel and retry after an exponential backoff. When the retry
//! budget is spent the thread exits with [`IngestorHealth::Failed`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──► Listening ◄──► Recovering
//!                     │               │
//!                 shutdown        retries spent
//!                     ▼               ▼
//!                  Stopped          Failed
//! ```

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::backoff::{Backoff, BackoffConfig};
use crate::channel::ControlPlane;
use crate::net::{Endpoint, UdpSocket};
use crate::pose::{DEFAULT_RESTART_THRESHOLD, PosePacket, SequenceGate};
use crate::trace::{debug, error, info, trace, warn};

const RX_TOKEN: Token = Token(0);

/// Larger than a pose packet so oversized datagrams show up as a length
/// mismatch instead of being silently cut to size.
const RECV_BUF_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestorConfig {
    /// Address the receiver binds to.
    pub bind_addr: Endpoint,
    /// Upper bound on how long the thread waits before re-checking for
    /// shutdown.
    pub poll_interval: Duration,
    /// Sequence numbers below this are accepted as a sender restart.
    pub restart_threshold: i32,
    /// `SO_RCVBUF` request. `None` keeps the kernel default.
    pub recv_buffer_size: Option<usize>,
    pub backoff: BackoffConfig,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            bind_addr: Endpoint::default(),
            poll_interval: Duration::from_millis(100),
            restart_threshold: DEFAULT_RESTART_THRESHOLD,
            recv_buffer_size: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Where the receiver thread is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IngestorHealth {
    /// Not started yet.
    Idle = 0,
    /// Socket bound, packets flowing in.
    Listening = 1,
    /// A transport error occurred; waiting to rebind.
    Recovering = 2,
    /// Shut down on request.
    Stopped = 3,
    /// Gave up after the retry budget was spent.
    Failed = 4,
}

impl IngestorHealth {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Listening,
            2 => Self::Recovering,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Whether the receiver thread has exited or will never run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for IngestorHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recovering => "recovering",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Packet counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestorStats {
    /// Packets whose rotation reached the channel.
    pub accepted: u64,
    /// Packets dropped for length, staleness or a degenerate quaternion.
    pub rejected: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestorError {
    #[error("failed to bind pose socket on {addr}: {source}")]
    Bind {
        addr: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("failed to poll pose socket: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to receive pose datagram: {0}")]
    Recv(#[source] io::Error),
    #[error("failed to spawn pose receiver thread: {0}")]
    Spawn(#[source] io::Error),
}

/// State shared between the handle and the receiver thread.
struct Shared {
    shutdown: AtomicBool,
    connected: AtomicBool,
    health: AtomicU8,
    local_addr: Mutex<Option<Endpoint>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            health: AtomicU8::new(IngestorHealth::Idle as u8),
            local_addr: Mutex::new(None),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn set_health(&self, health: IngestorHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    fn health(&self) -> IngestorHealth {
        IngestorHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Handle to the pose receiver.
///
/// The receiver writes every accepted rotation into its [`ControlPlane`].
/// Dropping the handle shuts the thread down and joins it.
pub struct PoseIngestor {
    config: IngestorConfig,
    channel: Arc<dyn ControlPlane>,
    shared: Arc<Shared>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoseIngestor {
    #[must_use]
    pub fn new(config: IngestorConfig, channel: Arc<dyn ControlPlane>) -> Self {
        Self {
            config,
            channel,
            shared: Arc::new(Shared::new()),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the receiver thread. Only the first call spawns; later calls,
    /// including calls after [`PoseIngestor::shutdown`], return `Ok` and do
    /// nothing.
    ///
    /// Binding happens on the thread, so bind failures surface through
    /// [`PoseIngestor::health`] and the channel log rather than here.
    ///
    /// # Errors
    ///
    /// [`IngestorError::Spawn`] if the OS refuses to create the thread.
    pub fn start(&self) -> Result<(), IngestorError> {
        // Held until the handle is stored so a racing shutdown always joins.
        let mut slot = self.handle.lock();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(
            bind_addr = %self.config.bind_addr,
            restart_threshold = self.config.restart_threshold,
            "pose ingestor starting"
        );
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_health(IngestorHealth::Listening);

        let mut rx = RxLoop::new(
            self.config.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.shared),
        );
        let handle = thread::Builder::new()
            .name("spvr-pose-rx".into())
            .spawn(move || {
                debug!("pose receiver thread started");
                rx.run();
                debug!("pose receiver thread exiting");
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn pose receiver thread");
                self.shared.set_health(IngestorHealth::Failed);
                IngestorError::Spawn(e)
            })?;

        *slot = Some(handle);
        Ok(())
    }

    /// Stops the receiver and waits for its thread to exit. The wait is bounded
    /// by the poll interval. Safe to call repeatedly and before `start`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        let mut slot = self.handle.lock();
        // A never-started ingestor can no longer be started.
        self.started.store(true, Ordering::Release);
        let Some(handle) = slot.take() else {
            let _ = self.shared.health.compare_exchange(
                IngestorHealth::Idle as u8,
                IngestorHealth::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        };
        drop(slot);

        debug!("waiting for pose receiver thread to exit");
        if handle.join().is_err() {
            error!("pose receiver thread panicked");
            self.shared.set_health(IngestorHealth::Failed);
        }
        info!(health = %self.shared.health(), "pose ingestor shut down");
    }

    /// Whether at least one pose packet has been accepted since `start`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn health(&self) -> IngestorHealth {
        self.shared.health()
    }

    #[must_use]
    pub fn stats(&self) -> IngestorStats {
        IngestorStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Address the socket is bound to, once the thread has bound it.
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        *self.shared.local_addr.lock()
    }

    #[must_use]
    pub fn config(&self) -> &IngestorConfig {
        &self.config
    }
}

impl Drop for PoseIngestor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PoseIngestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoseIngestor")
            .field("bind_addr", &self.config.bind_addr)
            .field("health", &self.health())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// The receiver thread's state and event loop.
struct RxLoop {
    config: IngestorConfig,
    channel: Arc<dyn ControlPlane>,
    shared: Arc<Shared>,
    gate: SequenceGate,
    recv_buf: [u8; RECV_BUF_LEN],
}

impl RxLoop {
    fn new(config: IngestorConfig, channel: Arc<dyn ControlPlane>, shared: Arc<Shared>) -> Self {
        let gate = SequenceGate::new(config.restart_threshold);
        Self {
            config,
            channel,
            shared,
            gate,
            recv_buf: [0; RECV_BUF_LEN],
        }
    }

    /// Listens until shutdown, rebinding after transport errors.
    fn run(&mut self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        while !self.shared.stopping() {
            let Err(err) = self.listen(&mut backoff) else {
                break;
            };
            *self.shared.local_addr.lock() = None;

            warn!(error = %err, failures = backoff.failures() + 1, "pose receiver error");
            self.channel.log(&format!("pose receiver: {err}"));

            let Some(delay) = backoff.next_delay() else {
                error!(failures = backoff.failures(), "pose receiver giving up");
                self.channel
                    .log("pose receiver: giving up after repeated failures");
                self.shared.set_health(IngestorHealth::Failed);
                return;
            };

            self.shared.set_health(IngestorHealth::Recovering);
            debug!(delay_ms = delay.as_millis() as u64, "pose receiver backing off");
            self.sleep_unless_stopped(delay);
        }

        *self.shared.local_addr.lock() = None;
        self.shared.set_health(IngestorHealth::Stopped);
    }

    /// Binds a fresh socket and receives until shutdown (`Ok`) or a transport
    /// error (`Err`).
    fn listen(&mut self, backoff: &mut Backoff) -> Result<(), IngestorError> {
        let addr = self.config.bind_addr;
        let bind_err = |source: io::Error| IngestorError::Bind { addr, source };

        let mut socket = UdpSocket::bind(addr).map_err(bind_err)?;
        if let Some(size) = self.config.recv_buffer_size
            && let Err(_e) = socket.set_recv_buffer_size(size)
        {
            warn!(size, error = %_e, "could not set pose socket receive buffer");
        }

        let mut poll = Poll::new().map_err(IngestorError::Poll)?;
        poll.registry()
            .register(&mut socket, RX_TOKEN, Interest::READABLE)
            .map_err(IngestorError::Poll)?;

        let local = socket.local_addr().map_err(bind_err)?;
        *self.shared.local_addr.lock() = Some(local);
        backoff.reset();
        self.shared.set_health(IngestorHealth::Listening);
        info!(local_addr = %local, "pose receiver listening");

        let mut events = Events::with_capacity(4);
        while !self.shared.stopping() {
            match poll.poll(&mut events, Some(self.config.poll_interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestorError::Poll(e)),
            }
            if events.is_empty() {
                continue;
            }
            self.drain(&socket)?;
        }
        Ok(())
    }

    /// Reads datagrams until the socket would block.
    fn drain(&mut self, socket: &UdpSocket) -> Result<(), IngestorError> {
        while let Some((len, from)) = socket
            .try_recv_from(&mut self.recv_buf)
            .map_err(IngestorError::Recv)?
        {
            self.handle_datagram(len, from);
        }
        Ok(())
    }

    fn handle_datagram(&mut self, len: usize, _from: Endpoint) {
        let packet = match PosePacket::decode(&self.recv_buf[..len]) {
            Ok(packet) => packet,
            Err(_e) => {
                trace!(from = %_from, error = %_e, "dropping malformed pose datagram");
                self.reject();
                return;
            }
        };

        if !self.gate.admit(packet.seq) {
            trace!(
                from = %_from,
                seq = packet.seq,
                last = ?self.gate.last(),
                "dropping stale pose packet"
            );
            self.reject();
            return;
        }

        match packet.rotation() {
            Ok(rotation) => {
                self.channel.set_rotation(rotation);
                self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                if !self.shared.connected.swap(true, Ordering::AcqRel) {
                    info!(from = %_from, seq = packet.seq, "first pose packet received");
                }
            }
            Err(_e) => {
                trace!(from = %_from, seq = packet.seq, error = %_e, "dropping pose packet");
                self.reject();
            }
        }
    }

    fn reject(&self) {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Sleeps for `delay` in slices of the poll interval so shutdown is
    /// noticed promptly.
    fn sleep_unless_stopped(&self, delay: Duration) {
        let slice = self.config.poll_interval.max(Duration::from_millis(1));
        let mut remaining = delay;
        while !remaining.is_zero() && !self.shared.stopping() {
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}
