//! Capture settings

use std::path::{Path, PathBuf};

use crate::trace::SNAPLEN;

/// File name used when the caller only picks a directory
pub const DEFAULT_TRACE_NAME: &str = "network_log.pcap";

/// Settings for a capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Size of the buffer each packet is read into, between 1 and the trace snaplen. With the default of 65535 no IP
    /// packet is cut short, so the captured length and the original length of every record are the same. A smaller
    /// buffer truncates longer packets and their records then understate the original length.
    pub read_buffer: usize,
    /// Name given to the thread that reads the tunnel
    pub thread_name: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_buffer: SNAPLEN as usize,
            thread_name: String::from("tun-capture"),
        }
    }
}

/// Path of the default trace file inside `dir`
#[must_use]
pub fn default_trace_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(DEFAULT_TRACE_NAME)
}
