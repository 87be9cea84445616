//! Capture tunnel traffic into pcap traces
//!
//! Hand a [`tunnel::Tunnel`] and an output path to the [`capture`] module and every packet routed through the tunnel
//! lands in a trace file that wireshark or tcpdump can open. The tunnel has to be set up already: creating the
//! interface and routing traffic into it is up to the caller.
//!
//! The [`trace`] module writes the trace format and can read it back.
//!
//! Reading tunnels goes through `poll(2)` on unix descriptors, so the capture side is only built on unix targets.

#[cfg(unix)]
pub mod capture;
pub mod config;
pub mod logging;
pub mod trace;
#[cfg(unix)]
pub mod tunnel;

#[cfg(unix)]
pub use capture::{Capture, CaptureError, CaptureState, CaptureStats, Capturer, StartOutcome, StopReason};
pub use config::CaptureConfig;
pub use trace::{Timestamp, TraceWriter};
#[cfg(unix)]
pub use tunnel::{FdTunnel, MemoryTunnel, Tunnel};
