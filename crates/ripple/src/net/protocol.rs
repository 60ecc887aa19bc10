use std::time::Duration;

use bytes::{Buf, BufMut};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::ack_field::AckField;
use crate::sync::NamedVariable;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 27015;

/// Upper bound of the framing in front of the payload: sequence number, ack
/// start, ack byte count, 255 ack bytes and the request flag.
pub const MAX_HEADER_SIZE: usize = 4 + 4 + 1 + 255 + 1;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
pub const ACK_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(50);
pub const PACKET_LOST_AFTER: Duration = Duration::from_millis(1000);
pub const PACKET_LOST_AFTER_RECEIVED_NEWER: u32 = 4;
pub const CRITICAL_PACKET_MAX_TRIES: u32 = 8;
pub const DEFAULT_ACK_COUNT: u8 = 32;

/// Delivery tier of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guarantee {
    /// Fire and forget. Failed on the first detected loss.
    None,
    /// Resent once after a loss, then failed.
    ResendOnce,
    /// Resent until `critical_packet_max_tries`; exhaustion closes the connection.
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ServerAllowKind {
    RequestQueued,
    RemoteConsoleAccepted,
    Generic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityState {
    pub entity_id: u32,
    pub kind: u8,
    pub position: [f32; 3],
    pub velocity: [i16; 3],
    pub orientation: [i16; 4],
    pub flags: u16,
}

impl EntityState {
    pub const MAX_VELOCITY: f32 = 327.67;

    pub fn new(entity_id: u32, kind: u8) -> Self {
        Self {
            entity_id,
            kind,
            position: [0.0; 3],
            velocity: [0; 3],
            orientation: [0, 0, 0, 32767],
            flags: 0,
        }
    }

    pub fn encode_velocity(&mut self, vel: [f32; 3]) {
        self.velocity =
            vel.map(|v| (v.clamp(-Self::MAX_VELOCITY, Self::MAX_VELOCITY) * 100.0) as i16);
    }

    pub fn decode_velocity(&self) -> [f32; 3] {
        self.velocity.map(|v| v as f32 / 100.0)
    }

    pub fn encode_orientation(&mut self, quat: [f32; 4]) {
        self.orientation = quat.map(|q| (q.clamp(-1.0, 1.0) * 32767.0) as i16);
    }

    pub fn decode_orientation(&self) -> [f32; 4] {
        self.orientation.map(|q| q as f32 / 32767.0)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum RequestKind {
    Echo,
    Identification,
    GetAllSyncValues,
    GetSingleSyncValue { name: String },
    RemoteConsoleOpen { token: u64 },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo => "Echo",
            Self::Identification => "Identification",
            Self::GetAllSyncValues => "GetAllSyncValues",
            Self::GetSingleSyncValue { .. } => "GetSingleSyncValue",
            Self::RemoteConsoleOpen { .. } => "RemoteConsoleOpen",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = realign(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

/// An inbound request. `id` is the sender's packet number, echoed back as the
/// `response_id` of any reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u32,
    pub kind: RequestKind,
}

impl Request {
    pub fn respond(&self, kind: ResponseKind) -> Response {
        Response::new(self.id, kind)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ResponseKind {
    None,
    Keepalive,
    CloseConnection,
    Echo,
    Identification {
        game_name: String,
        game_version: String,
        protocol_version: u32,
    },
    ServerAllow {
        allow: ServerAllowKind,
        detail: String,
    },
    SyncValData(NamedVariable),
    SyncResourceData {
        name: String,
        data: Vec<u8>,
    },
    SyncDataEnd {
        succeeded: bool,
    },
    EntityCreation(EntityState),
    EntityUpdate(EntityState),
    EntityDestruction {
        entity_id: u32,
    },
}

impl ResponseKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Keepalive => "Keepalive",
            Self::CloseConnection => "CloseConnection",
            Self::Echo => "Echo",
            Self::Identification { .. } => "Identification",
            Self::ServerAllow { .. } => "ServerAllow",
            Self::SyncValData(_) => "SyncValData",
            Self::SyncResourceData { .. } => "SyncResourceData",
            Self::SyncDataEnd { .. } => "SyncDataEnd",
            Self::EntityCreation(_) => "EntityCreation",
            Self::EntityUpdate(_) => "EntityUpdate",
            Self::EntityDestruction { .. } => "EntityDestruction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Response {
    /// Packet number of the request this answers, 0 when unsolicited.
    pub response_id: u32,
    pub kind: ResponseKind,
}

impl Response {
    pub fn new(response_id: u32, kind: ResponseKind) -> Self {
        Self { response_id, kind }
    }

    pub fn without_data(kind: ResponseKind) -> Self {
        Self::new(0, kind)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = realign(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

/// Decoded payload of a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid request flag {0}")]
    InvalidFlag(u8),
    #[error("packet sequence number 0 is reserved")]
    ReservedSequence,
    #[error("ack window starting at {0} runs past the last packet number")]
    AckOutOfRange(u32),
    #[error("packet exceeds MTU ({0} bytes)")]
    TooLarge(usize),
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

/// Frames one datagram: sequence number, ack field, request flag, payload.
pub fn encode_packet(sequence: u32, acks: &AckField, is_request: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + acks.acks.len() + payload.len());
    buf.put_u32(sequence);
    acks.write(&mut buf);
    buf.put_u8(is_request as u8);
    buf.put_slice(payload);
    buf
}

pub fn read_sequence(buf: &mut impl Buf) -> Result<u32, PacketError> {
    let sequence = buf
        .try_get_u32()
        .map_err(|_| PacketError::Truncated("sequence number"))?;
    if sequence == 0 {
        return Err(PacketError::ReservedSequence);
    }
    Ok(sequence)
}

pub fn read_request_flag(buf: &mut impl Buf) -> Result<bool, PacketError> {
    match buf
        .try_get_u8()
        .map_err(|_| PacketError::Truncated("request flag"))?
    {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(PacketError::InvalidFlag(other)),
    }
}

/// Decodes the payload that follows the request flag. `sequence` becomes the
/// id of an inbound request.
pub fn decode_payload(sequence: u32, is_request: bool, data: &[u8]) -> Result<Payload, PacketError> {
    if is_request {
        let kind = RequestKind::decode(data)?;
        Ok(Payload::Request(Request { id: sequence, kind }))
    } else {
        Response::decode(data).map(Payload::Response)
    }
}

// Payloads sit behind a variable length header, so they are copied into an
// aligned buffer before validation.
fn realign(data: &[u8]) -> AlignedVec {
    let mut aligned = AlignedVec::with_capacity(data.len());
    aligned.extend_from_slice(data);
    aligned
}
