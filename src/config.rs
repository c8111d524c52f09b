//! Tuning constants and per-connection channel configuration.

use core::time::Duration;

/// Initial local receive window advertised for a new channel.
pub const DEFAULT_WINDOW: u32 = 2 * 1024 * 1024;

/// Largest channel data payload we ask the peer to send in one packet.
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Hard limit on any max packet value, local or advertised by the peer.
// Larger than anything OpenSSH sends (32kB) with room for tuned peers.
pub const MAX_PACKET_CEILING: u32 = 256 * 1024;

/// Default bound for blocking waits on window credit or write completion.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful close waits for the peer's CLOSE before forcing it.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Replenish the local window once it drops below `max / DEFAULT_ADJUST_DIVISOR`.
pub const DEFAULT_ADJUST_DIVISOR: u32 = 2;

// Channel numbers are found by a linear scan of the table.
pub const MAX_CHANNELS: usize = 64;

// Enough for longest 23 of "screen.konsole-256color" on my system
// Unsure if this is specified somewhere
pub const MAX_TERM: usize = 32;

/// Per-connection channel settings.
///
/// Shared by every channel created through a [`Channels`](crate::Channels).
#[derive(Debug, Clone)]
pub struct ChanConfig {
    /// Local receive window size, also the replenishment target.
    pub window: u32,
    /// Largest data packet the peer may send us.
    pub max_packet: u32,
    /// Upper limit on any packet size, ours or the peer's.
    pub packet_ceiling: u32,
    /// Bound for blocking waits on window credit and write completion.
    pub wait_timeout: Duration,
    /// Bound for a graceful close waiting on the peer.
    pub close_timeout: Duration,
    /// The local window is topped up once it falls below `window / adjust_divisor`.
    pub adjust_divisor: u32,
    pub max_channels: usize,
}

impl Default for ChanConfig {
    fn default() -> Self {
        ChanConfig {
            window: DEFAULT_WINDOW,
            max_packet: DEFAULT_MAX_PACKET,
            packet_ceiling: MAX_PACKET_CEILING,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            adjust_divisor: DEFAULT_ADJUST_DIVISOR,
            max_channels: MAX_CHANNELS,
        }
    }
}
