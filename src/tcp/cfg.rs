//! Per-connection configuration.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables of a connection and its reliability engine.
///
/// The clock is injectable so tests drive timers without sleeping; outside
/// of tests it is [`Instant::now`].
#[derive(Clone)]
pub struct Config {
    /// Largest payload framed into a single segment.
    pub mss: u16,
    /// Capacity of the receive buffer; the advertised window is this minus
    /// the current occupancy.
    pub recv_buffer_cap: usize,
    /// Local bound on unacknowledged bytes, the sender-side half of the
    /// effective window.
    pub send_window_cap: u32,
    /// Retransmissions per segment before the connection is abandoned.
    pub max_retransmits: u8,
    /// Retransmission timeout before the first round-trip sample.
    pub initial_rto: Duration,
    /// How long TIME_WAIT is held before the record closes.
    pub time_wait: Duration,
    /// How long `connect` waits for the three-way handshake.
    pub handshake_timeout: Duration,
    /// How long `close` waits for the four-way teardown to finish.
    pub linger: Duration,
    /// Answer SYNs that reach no listener with a RST instead of ignoring
    /// them.
    pub rst_on_syn: bool,
    /// Fixed initial send sequence; `None` draws a uniform random one.
    pub iss: Option<u32>,
    pub ttl: u8,

    pub clock: Arc<dyn Fn() -> Instant + Send + Sync>,
}

impl Config {
    pub(crate) fn now(&self) -> Instant {
        (self.clock)()
    }

    pub(crate) fn initial_seq_no(&self) -> u32 {
        self.iss.unwrap_or_else(rand::random)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1024,
            recv_buffer_cap: 65535,
            send_window_cap: 65535,
            max_retransmits: 3,
            initial_rto: Duration::from_millis(1000),
            time_wait: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            linger: Duration::from_secs(3),
            rst_on_syn: false,
            iss: None,
            ttl: 64,
            clock: Arc::new(Instant::now),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("mss", &self.mss)
            .field("recv_buffer_cap", &self.recv_buffer_cap)
            .field("send_window_cap", &self.send_window_cap)
            .field("max_retransmits", &self.max_retransmits)
            .field("initial_rto", &self.initial_rto)
            .field("time_wait", &self.time_wait)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("linger", &self.linger)
            .field("rst_on_syn", &self.rst_on_syn)
            .field("iss", &self.iss)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
