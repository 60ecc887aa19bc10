use std::time::Duration;

use ripple::{NetConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Drifting props spawned at startup so clients have something to replicate.
    pub demo_entities: usize,
    /// How often the host bumps the synced score.
    pub score_interval: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
    pub net: NetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_clients: 32,
            demo_entities: 4,
            score_interval: Duration::from_secs(5),
            packet_loss: None,
            net: NetConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ping_packets: u32,
    pub ping_allowed_fails: u32,
    pub sync_timeout: Duration,
    /// How long to stay connected after syncing, `None` for until interrupted.
    pub stay_for: Option<Duration>,
    pub packet_loss: Option<PacketLossSimulation>,
    pub net: NetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_packets: 10,
            ping_allowed_fails: 2,
            sync_timeout: Duration::from_secs(10),
            stay_for: None,
            packet_loss: None,
            net: NetConfig::default(),
        }
    }
}
