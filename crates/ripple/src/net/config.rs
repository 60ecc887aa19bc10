use std::time::Duration;

use super::protocol::{
    ACK_KEEPALIVE_INTERVAL, CRITICAL_PACKET_MAX_TRIES, DEFAULT_ACK_COUNT, KEEPALIVE_INTERVAL,
    PACKET_LOST_AFTER, PACKET_LOST_AFTER_RECEIVED_NEWER,
};

/// Timers and limits for the transport. Shared by every connection of a handler.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub keepalive_interval: Duration,
    pub ack_keepalive_interval: Duration,
    pub packet_lost_after: Duration,
    pub packet_lost_after_received_newer: u32,
    pub critical_packet_max_tries: u32,
    pub ack_count: u8,
    /// Length of the recently received sequence ring used for duplicate rejection.
    pub duplicate_history: usize,
    pub max_connections: usize,
    pub full_sync_start_delay: Duration,
    pub full_sync_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            ack_keepalive_interval: ACK_KEEPALIVE_INTERVAL,
            packet_lost_after: PACKET_LOST_AFTER,
            packet_lost_after_received_newer: PACKET_LOST_AFTER_RECEIVED_NEWER,
            critical_packet_max_tries: CRITICAL_PACKET_MAX_TRIES,
            ack_count: DEFAULT_ACK_COUNT,
            duplicate_history: 128,
            max_connections: 32,
            full_sync_start_delay: Duration::from_millis(50),
            full_sync_interval: Duration::from_millis(10),
        }
    }
}

impl NetConfig {
    /// A connection that heard nothing for this long is considered dead.
    pub fn timeout(&self) -> Duration {
        self.keepalive_interval.mul_f32(1.5)
    }
}
