//! Message envelope module
//!
//! This module defines the wire envelope the proxy routes by, and the
//! typed payloads of the two message families the proxy itself speaks:
//! the Identify handshake and the TunnelEstablished notification.
//!
//! The proxy interprets only the header fields needed for routing; all
//! other payloads are carried opaquely, and unrecognized message types
//! are forwarded unchanged.

pub mod codec;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::error::{ProxyError, Result};
use crate::common::types::{HubId, Rank};

/// Size of the fixed wire header in bytes
pub const HEADER_LEN: usize = 22;

/// Upper bound on accepted payload sizes
///
/// Frames claiming more than this are rejected as protocol violations
/// rather than allocated.
pub const MAX_PAYLOAD_LEN: u32 = 512 * 1024 * 1024;

const TAG_IDENTIFY: u16 = 1;
const TAG_SEND_OBJECT: u16 = 2;
const TAG_REQUEST_OBJECT: u16 = 3;
const TAG_ADD_OBJECT_COMPLETED: u16 = 4;
const TAG_TUNNEL_ESTABLISHED: u16 = 5;

/// Decoded view of a message's wire type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Connection-role handshake
    Identify,
    /// Bulk object payload transfer
    SendObject,
    /// Request for a remote object
    RequestObject,
    /// Completion notice for an object transfer
    AddObjectCompleted,
    /// Rendezvous pairing notification
    TunnelEstablished,
    /// Anything else; forwarded unchanged
    Unknown(u16),
}

impl MessageKind {
    /// Wire tag for this kind
    pub fn tag(&self) -> u16 {
        match self {
            Self::Identify => TAG_IDENTIFY,
            Self::SendObject => TAG_SEND_OBJECT,
            Self::RequestObject => TAG_REQUEST_OBJECT,
            Self::AddObjectCompleted => TAG_ADD_OBJECT_COMPLETED,
            Self::TunnelEstablished => TAG_TUNNEL_ESTABLISHED,
            Self::Unknown(tag) => *tag,
        }
    }
}

impl From<u16> for MessageKind {
    fn from(tag: u16) -> Self {
        match tag {
            TAG_IDENTIFY => Self::Identify,
            TAG_SEND_OBJECT => Self::SendObject,
            TAG_REQUEST_OBJECT => Self::RequestObject,
            TAG_ADD_OBJECT_COMPLETED => Self::AddObjectCompleted,
            TAG_TUNNEL_ESTABLISHED => Self::TunnelEstablished,
            other => Self::Unknown(other),
        }
    }
}

/// Fixed wire header
///
/// Only these fields are interpreted for routing; everything behind
/// them is opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Wire type tag
    pub msg_type: u16,
    /// Sender id (hub or module)
    pub src_id: i32,
    /// Destination id (hub or module)
    pub dest_id: i32,
    /// Sender rank
    pub src_rank: Rank,
    /// Destination rank
    pub dest_rank: Rank,
    /// Payload length in bytes
    pub payload_len: u32,
}

/// A complete wire message: header plus opaque payload
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Routing header
    pub header: Header,
    /// Opaque payload bytes
    pub payload: Bytes,
}

/// Role of a rendezvous tunnel peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelRole {
    /// Listening-side peer
    Server,
    /// Connecting-side peer
    Client,
}

impl std::fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Connection identity established by the Identify handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// Ask the peer to identify itself
    Request,
    /// Bulk-data connection of a local rank
    LocalBulkData {
        /// Rank within the local hub
        rank: Rank,
    },
    /// Bulk-data connection of (or to) a remote hub
    RemoteBulkData {
        /// Peer hub id
        hub_id: HubId,
    },
    /// Listening-side peer of a rendezvous tunnel stream
    TunnelServer {
        /// Tunnel the stream belongs to
        tunnel_id: u32,
        /// Stream number within the tunnel
        stream_nr: u32,
    },
    /// Connecting-side peer of a rendezvous tunnel stream
    TunnelClient {
        /// Tunnel the stream belongs to
        tunnel_id: u32,
        /// Stream number within the tunnel
        stream_nr: u32,
    },
}

/// Body of an Identify message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    /// Declared connection role
    pub identity: Identity,
    /// Serialization-format version of the sender
    pub protocol_version: u32,
}

/// Body of a TunnelEstablished message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEstablishedPayload {
    /// Role the receiving peer plays in the bridged stream
    pub role: TunnelRole,
}

impl Envelope {
    /// Build an envelope with an opaque payload
    pub fn with_payload(
        kind: MessageKind,
        src_id: i32,
        dest_id: i32,
        src_rank: Rank,
        dest_rank: Rank,
        payload: Bytes,
    ) -> Self {
        Self {
            header: Header {
                msg_type: kind.tag(),
                src_id,
                dest_id,
                src_rank,
                dest_rank,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }

    /// Build an Identify message
    pub fn identify(identity: Identity, protocol_version: u32) -> Result<Self> {
        let body = IdentifyPayload {
            identity,
            protocol_version,
        };
        let payload = bincode::serialize(&body)
            .map_err(|e| ProxyError::Protocol(format!("Failed to encode Identify: {}", e)))?;

        Ok(Self::with_payload(
            MessageKind::Identify,
            0,
            0,
            -1,
            -1,
            Bytes::from(payload),
        ))
    }

    /// Build a TunnelEstablished message for one rendezvous peer
    pub fn tunnel_established(role: TunnelRole) -> Result<Self> {
        let body = TunnelEstablishedPayload { role };
        let payload = bincode::serialize(&body).map_err(|e| {
            ProxyError::Protocol(format!("Failed to encode TunnelEstablished: {}", e))
        })?;

        Ok(Self::with_payload(
            MessageKind::TunnelEstablished,
            0,
            0,
            -1,
            -1,
            Bytes::from(payload),
        ))
    }

    /// Wire type of this message
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self.header.msg_type)
    }

    /// Decode the body of an Identify message
    pub fn decode_identify(&self) -> Result<IdentifyPayload> {
        if self.kind() != MessageKind::Identify {
            return Err(ProxyError::Protocol(format!(
                "Expected Identify, got type {}",
                self.header.msg_type
            )));
        }

        bincode::deserialize(&self.payload)
            .map_err(|e| ProxyError::Protocol(format!("Malformed Identify body: {}", e)))
    }

    /// Decode the body of a TunnelEstablished message
    pub fn decode_tunnel_established(&self) -> Result<TunnelEstablishedPayload> {
        if self.kind() != MessageKind::TunnelEstablished {
            return Err(ProxyError::Protocol(format!(
                "Expected TunnelEstablished, got type {}",
                self.header.msg_type
            )));
        }

        bincode::deserialize(&self.payload)
            .map_err(|e| ProxyError::Protocol(format!("Malformed TunnelEstablished body: {}", e)))
    }
}
