//! Capture tunnel traffic to a trace file
//!
//! [`Capture`] drives one capture session. Starting a capture opens the trace file (writing its global header) on the
//! calling thread, then starts one new thread that reads packets from the [`Tunnel`] and appends them to the trace in
//! the order they were read.
//!
//! The reading thread stops when it sees the running flag cleared, when the tunnel is closed, or on the first read or
//! write error. A read blocked on an idle tunnel never gets to look at the flag, so ending a capture clears the flag
//! *and* closes the tunnel. Either way the thread closes the trace file and the tunnel before it exits, and whatever
//! it ended with is returned by [`Capture::end`].
//!
//! [`Capturer`] sits in front of that for callers that only have start and stop buttons: it keeps at most one
//! session alive and treats a second start as a no-op.

use crate::config::CaptureConfig;
use crate::trace::{Timestamp, TraceWriter, SNAPLEN};
use crate::tunnel::{Tunnel, TunnelError};

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur during a capture session
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Failed to join the reading thread
    #[error("Failed to join the capture thread")]
    JoinError,
    /// No usable tunnel was handed over
    #[error("Tunnel is not available")]
    Provisioning(#[from] TunnelError),
    /// Failed to create the trace file or write its header
    #[error("Failed to open trace file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Failed to write the global header to a caller supplied writer
    #[error("Failed to write the trace header: {0}")]
    Header(#[source] io::Error),
    /// The configured read buffer can't hold a packet or is larger than the trace snaplen
    #[error("Read buffer of {0} bytes is outside 1..=65535")]
    ReadBuffer(usize),
    /// Failed to start the reading thread
    #[error("Failed to start the capture thread: {0}")]
    Spawn(#[source] io::Error),
    /// Reading from the tunnel failed mid session
    #[error("Failed to read from the tunnel: {0}")]
    Read(#[source] io::Error),
    /// Writing to the trace failed mid session
    #[error("Failed to write to the trace file: {0}")]
    Write(#[source] io::Error),
}

/// Source of packet timestamps
///
/// Called once for every packet, right after the packet was read.
pub trait Clock: Send {
    fn now(&mut self) -> Timestamp;
}

/// Pre-made clock that stamps packets with the wall clock
///
/// Seconds and microseconds come from the same reading of the clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> Timestamp {
        Timestamp::from(SystemTime::now())
    }
}

impl<F> Clock for F
where
    F: FnMut() -> Timestamp + Send,
{
    fn now(&mut self) -> Timestamp {
        self()
    }
}

/// Where a capture session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Nothing open
    Idle,
    /// Opening the trace file
    Starting,
    /// Reading packets
    Running,
    /// Closing the trace file and the tunnel
    Stopping,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: CaptureState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> CaptureState {
        match self.0.load(Ordering::Acquire) {
            x if x == CaptureState::Starting as u8 => CaptureState::Starting,
            x if x == CaptureState::Running as u8 => CaptureState::Running,
            x if x == CaptureState::Stopping as u8 => CaptureState::Stopping,
            _ => CaptureState::Idle,
        }
    }

    fn store(&self, state: CaptureState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Why a session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The capture was asked to stop
    Requested,
    /// The tunnel was closed by whoever provided it
    TunnelClosed,
}

/// Summary of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Number of records written after the global header
    pub packets: u64,
    /// Payload bytes written, not counting record headers
    pub bytes: u64,
    pub reason: StopReason,
}

type Sink = Box<dyn Write + Send>;

/// Session state struct for before the capture has started
///
/// Has all of the data needed to start a capture: the tunnel, where the trace goes and how to stamp packets.
pub struct Ready {
    tunnel: Arc<dyn Tunnel>,
    target: Target,
    clock: Box<dyn Clock>,
    config: CaptureConfig,
}

enum Target {
    Path(PathBuf),
    Writer(Sink),
}

/// Session state struct for an active capture
///
/// Has all of the data needed to stop a capture: the handle of the reading thread, the tunnel to close and the flag
/// the thread watches.
pub struct Capturing {
    reader: JoinHandle<Result<CaptureStats, CaptureError>>,
    tunnel: Arc<dyn Tunnel>,
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
    path: Option<PathBuf>,
}

/// Capture the packets of a tunnel into a trace
pub struct Capture<T> {
    state: T,
}

impl Capture<Ready> {
    /// Create a capture of `tunnel` into the trace file at `path`
    ///
    /// This simply sets up a struct without touching the file or the tunnel.
    #[must_use]
    pub fn new(tunnel: impl Tunnel + 'static, path: impl Into<PathBuf>) -> Self {
        Self::with_target(Arc::new(tunnel), Target::Path(path.into()))
    }

    /// Create a capture of a tunnel that is shared with other code
    #[must_use]
    pub fn shared(tunnel: Arc<dyn Tunnel>, path: impl Into<PathBuf>) -> Self {
        Self::with_target(tunnel, Target::Path(path.into()))
    }

    /// Create a capture that writes the trace to an arbitrary writer instead of a file
    ///
    /// Each record is handed to the writer in one `write_all` call, so wrapping it in a `BufWriter` trades durability
    /// for fewer syscalls.
    #[must_use]
    pub fn to_writer(tunnel: impl Tunnel + 'static, out: impl Write + Send + 'static) -> Self {
        Self::with_target(Arc::new(tunnel), Target::Writer(Box::new(out)))
    }

    fn with_target(tunnel: Arc<dyn Tunnel>, target: Target) -> Self {
        Self {
            state: Ready {
                tunnel,
                target,
                clock: Box::new(SystemClock),
                config: CaptureConfig::default(),
            },
        }
    }

    /// Stamp packets with `clock` instead of the wall clock
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.state.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.state.config = config;
        self
    }

    /// Start capturing packets
    ///
    /// This method will consume the object and return a new one. The trace header has been written by the time this
    /// returns.
    ///
    /// # Errors
    /// If the read buffer size is out of range, the trace can't be opened or the thread can't be started, the tunnel
    /// is closed and the error is returned. No session is left behind.
    pub fn start(self) -> Result<Capture<Capturing>, CaptureError> {
        let Ready {
            tunnel,
            target,
            clock,
            config,
        } = self.state;
        if config.read_buffer == 0 || config.read_buffer > SNAPLEN as usize {
            close_tunnel(tunnel.as_ref());
            return Err(CaptureError::ReadBuffer(config.read_buffer));
        }
        let state = Arc::new(StateCell::new(CaptureState::Starting));

        let (opened, path) = match target {
            Target::Path(path) => {
                let opened = TraceWriter::open(&path)
                    .map(TraceWriter::boxed)
                    .map_err(|source| CaptureError::Open {
                        path: path.clone(),
                        source,
                    });
                (opened, Some(path))
            }
            Target::Writer(out) => (TraceWriter::new(out).map_err(CaptureError::Header), None),
        };
        let writer = match opened {
            Ok(w) => w,
            Err(e) => {
                close_tunnel(tunnel.as_ref());
                return Err(e);
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let reader = Reader {
            tunnel: Arc::clone(&tunnel),
            writer,
            clock,
            running: Arc::clone(&running),
            state: Arc::clone(&state),
            buffer: vec![0; config.read_buffer],
        };
        state.store(CaptureState::Running);
        let handle = match Builder::new().name(config.thread_name).spawn(move || reader.run()) {
            Ok(h) => h,
            Err(e) => {
                // The closure was dropped with the reader inside, which released the trace file
                state.store(CaptureState::Idle);
                close_tunnel(tunnel.as_ref());
                return Err(CaptureError::Spawn(e));
            }
        };

        match &path {
            Some(p) => info!(path = %p.display(), "capture started"),
            None => info!("capture started"),
        }
        Ok(Capture {
            state: Capturing {
                reader: handle,
                tunnel,
                running,
                state,
                path,
            },
        })
    }
}

impl Capture<Capturing> {
    /// Stop capturing and wait for the reading thread to wrap up
    ///
    /// Clears the running flag and closes the tunnel so a read blocked on an idle tunnel returns. When this returns
    /// the trace file and the tunnel are closed.
    ///
    /// # Errors
    /// Returns the error that ended the session early, if any, or [`CaptureError::JoinError`] if the reading thread
    /// panicked.
    pub fn end(self) -> Result<CaptureStats, CaptureError> {
        let Capturing {
            reader,
            tunnel,
            running,
            ..
        } = self.state;
        running.store(false, Ordering::Release);
        close_tunnel(tunnel.as_ref());
        reader.join().map_err(|_| CaptureError::JoinError)?
    }

    /// Whether the reading thread is still capturing packets
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire) && !self.state.reader.is_finished()
    }

    /// Whether the reading thread has exited, on its own or because it was asked to
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.reader.is_finished()
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state.state.load()
    }

    /// Trace file being written, if the capture writes to a file
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.state.path.as_deref()
    }
}

fn close_tunnel(tunnel: &dyn Tunnel) {
    if let Err(e) = tunnel.close() {
        warn!(error = %e, "failed to close tunnel");
    }
}

struct Reader {
    tunnel: Arc<dyn Tunnel>,
    writer: TraceWriter<Sink>,
    clock: Box<dyn Clock>,
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
    buffer: Vec<u8>,
}

impl Reader {
    fn run(mut self) -> Result<CaptureStats, CaptureError> {
        let outcome = self.pump();

        self.running.store(false, Ordering::Release);
        self.state.store(CaptureState::Stopping);
        let Reader {
            tunnel,
            writer,
            state,
            ..
        } = self;
        if let Err(e) = writer.close() {
            warn!(error = %e, "failed to close trace file");
        }
        close_tunnel(tunnel.as_ref());
        state.store(CaptureState::Idle);

        match &outcome {
            Ok(stats) => info!(
                packets = stats.packets,
                bytes = stats.bytes,
                reason = ?stats.reason,
                "capture stopped"
            ),
            Err(e) => error!(error = %e, "capture failed"),
        }
        outcome
    }

    fn pump(&mut self) -> Result<CaptureStats, CaptureError> {
        let mut packets = 0_u64;
        let mut bytes = 0_u64;
        let reason = 'recv_loop: loop {
            if !self.running.load(Ordering::Acquire) {
                break 'recv_loop StopReason::Requested;
            }
            let n = match self.tunnel.read_packet(&mut self.buffer) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                    continue 'recv_loop;
                }
                // Closing the tunnel is how a stop gets a blocked read to return
                Err(_) if !self.running.load(Ordering::Acquire) => break 'recv_loop StopReason::Requested,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => break 'recv_loop StopReason::TunnelClosed,
                Err(e) => return Err(CaptureError::Read(e)),
            };
            if n == 0 {
                continue 'recv_loop;
            }
            let timestamp = self.clock.now();
            self.writer
                .write_captured(timestamp, &self.buffer[..n])
                .map_err(CaptureError::Write)?;
            packets += 1;
            bytes += n as u64;
            trace!(len = n, "packet captured");
        };
        debug!(records = self.writer.records(), "capture loop exited");
        Ok(CaptureStats {
            packets,
            bytes,
            reason,
        })
    }
}

/// Result of asking a [`Capturer`] to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session is running
    Started,
    /// A session was already running and was left alone
    AlreadyRunning,
}

/// Keeps at most one capture session alive
///
/// This is the start/stop surface: [`Capturer::start`] while a session is running does nothing, so two readers can
/// never interleave records in one trace. A session whose thread ended on its own (tunnel closed, I/O error) is
/// collected by [`Capturer::reap`] or by the next start. Dropping the capturer stops the running session.
#[derive(Default)]
pub struct Capturer {
    config: CaptureConfig,
    session: Option<Capture<Capturing>>,
}

impl Capturer {
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Start capturing `tunnel` into the trace file at `path`
    ///
    /// # Errors
    /// See [`Capture::start`]. Nothing is running after an error.
    pub fn start(
        &mut self,
        tunnel: impl Tunnel + 'static,
        path: impl Into<PathBuf>,
    ) -> Result<StartOutcome, CaptureError> {
        let capture = Capture::new(tunnel, path).with_config(self.config.clone());
        self.start_session(capture)
    }

    /// Start a session that was set up by hand
    ///
    /// # Errors
    /// See [`Capture::start`]. Nothing is running after an error.
    pub fn start_session(&mut self, capture: Capture<Ready>) -> Result<StartOutcome, CaptureError> {
        // A cleared flag means the reading thread is on its way out, wait for it instead of refusing the start
        if self.session.as_ref().is_some_and(|s| !s.is_running()) {
            if let Some(outcome) = self.stop() {
                // Already logged by the reading thread when it exited
                debug!(ok = outcome.is_ok(), "collected finished capture session");
            }
        }
        if let Some(session) = &self.session {
            debug!(path = ?session.path(), "capture already running, ignoring start");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.session = Some(capture.start()?);
        Ok(StartOutcome::Started)
    }

    /// Stop the running session
    ///
    /// Returns `None` if nothing was running, otherwise how the session ended.
    pub fn stop(&mut self) -> Option<Result<CaptureStats, CaptureError>> {
        self.session.take().map(Capture::end)
    }

    /// Collect a session whose reading thread already exited
    ///
    /// Returns `None` if there is no session or it is still capturing.
    pub fn reap(&mut self) -> Option<Result<CaptureStats, CaptureError>> {
        if self.session.as_ref().is_some_and(Capture::is_finished) {
            self.stop()
        } else {
            None
        }
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.session.as_ref().map_or(CaptureState::Idle, Capture::state)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(Capture::is_running)
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.stop() {
            warn!(error = %e, "capture ended with an error while shutting down");
        }
    }
}
