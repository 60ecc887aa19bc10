mod ack_field;
mod config;
mod connection;
mod error;
mod handler;
mod interface;
mod ping;
mod protocol;
mod sent;
mod socket;
mod stats;

pub use ack_field::{AckField, ReceivedPacketField, ReceivedState, SentAcks};
pub use config::NetConfig;
pub use connection::{
    CloseReason, Connection, ConnectionState, RestrictionMode, UpdateOutcome, parse_address,
};
pub use error::NetError;
pub use handler::{ConnectionManager, NetworkHandler, NetworkRole};
pub use interface::{
    DefaultInterface, GAME_NAME, GAME_VERSION, NetworkInterface, ResponseHandling,
    handle_default_request, handle_default_response_only,
};
pub use ping::{PingFailure, PingResult};
pub use protocol::{
    ACK_KEEPALIVE_INTERVAL, CRITICAL_PACKET_MAX_TRIES, DEFAULT_ACK_COUNT, DEFAULT_PORT,
    EntityState, Guarantee, KEEPALIVE_INTERVAL, MAX_PACKET_SIZE, PACKET_LOST_AFTER,
    PACKET_LOST_AFTER_RECEIVED_NEWER, PROTOCOL_VERSION, PacketError, Payload, Request,
    RequestKind, Response, ResponseKind, ServerAllowKind,
};
pub use sent::SentThing;
pub use socket::{DatagramSocket, MemoryNetwork, MemorySocket, UdpEndpoint};
pub use stats::{NetworkStats, PacketLossSimulation};
