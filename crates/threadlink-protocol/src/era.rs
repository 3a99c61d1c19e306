//! Protocol eras -- versioned timing parameters shared by every client.
//!
//! An era fixes the cadences that interact with shared infrastructure
//! (directory refresh, swarm polling). Node-local overrides live in the
//! node config; the era only supplies the defaults.

/// A named, versioned set of timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEra {
    /// Era identifier. Monotonically increasing.
    pub id: u16,

    // -- Device links --
    /// Seconds a resolved device-link set stays fresh before the directory is asked again.
    pub device_link_refresh_secs: u64,

    // -- Handshakes --
    /// Seconds an unanswered auto-generated handshake stays outstanding.
    pub handshake_expiry_secs: u64,

    // -- Closed group polling --
    /// Poll interval for a group that has just seen a message.
    pub poll_min_interval_secs: u64,
    /// Poll interval for a group idle for `poll_idle_limit_secs` or longer.
    pub poll_max_interval_secs: u64,
    /// Idle duration at which the poll interval saturates at the maximum.
    pub poll_idle_limit_secs: u64,

    // -- Payloads --
    /// Maximum raw swarm payload accepted for decoding.
    pub max_envelope_bytes: usize,
}

/// Era 0: Genesis parameters.
pub const ERA_0: ProtocolEra = ProtocolEra {
    id: 0,

    device_link_refresh_secs: 20,

    handshake_expiry_secs: 72 * 3600,

    poll_min_interval_secs: 2,
    poll_max_interval_secs: 30,
    poll_idle_limit_secs: 12 * 3600,

    max_envelope_bytes: 256 * 1024,
};

/// The current active era.
pub const CURRENT_ERA: &ProtocolEra = &ERA_0;
