use std::io;

use super::protocol::PacketError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection is closed")]
    Closed,
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("unhandled request {0}")]
    UnhandledRequest(String),
    #[error("server full")]
    ServerFull,
    #[error("only the host may do this")]
    NotHost,
    #[error("unknown variable {0}")]
    UnknownVariable(String),
}
