//! Wire messages and framing.
//!
//! # Frame Layout
//!
//! ```text
//! +----------------+--------+---------------------+
//! | len: u32 (BE)  | code   | bincode payload     |
//! +----------------+--------+---------------------+
//!                  |<-------- len bytes --------->|
//! ```
//!
//! The payload is the bincode encoding of the variant's body alone, so the
//! code byte is the only discriminant on the wire.

use std::collections::BTreeSet;

use hexchain_core::{Hash, HexBlock, HexCoordinate, HexHeader, HexaProof};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, Result};

/// Numeric message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    Block = 0x10,
    Header = 0x11,
    BlockRequest = 0x12,
    HeaderRequest = 0x13,
    Proof = 0x14,
    Status = 0x15,
    NeighborUpdate = 0x16,
    MeshState = 0x17,
    BlockResponse = 0x18,
    HeaderResponse = 0x19,
}

impl TryFrom<u8> for MessageCode {
    type Error = NetworkError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x10 => MessageCode::Block,
            0x11 => MessageCode::Header,
            0x12 => MessageCode::BlockRequest,
            0x13 => MessageCode::HeaderRequest,
            0x14 => MessageCode::Proof,
            0x15 => MessageCode::Status,
            0x16 => MessageCode::NeighborUpdate,
            0x17 => MessageCode::MeshState,
            0x18 => MessageCode::BlockResponse,
            0x19 => MessageCode::HeaderResponse,
            other => return Err(NetworkError::UnknownMessageCode(other)),
        })
    }
}

/// Handshake payload. Both sides send one before anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    pub head: Hash,
    pub genesis: Hash,
    pub position: HexCoordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborUpdate {
    pub position: HexCoordinate,
    pub head: Hash,
}

/// Hashes a node knows about, exchanged for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStateSummary {
    pub known_blocks: BTreeSet<Hash>,
    pub known_headers: BTreeSet<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub id: u64,
    pub block: Option<HexBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderResponse {
    pub id: u64,
    pub header: Option<HexHeader>,
}

/// A neighbor's proof for a block, gossiped ahead of the block itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofAnnouncement {
    pub block: Hash,
    pub proof: HexaProof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    Block(HexBlock),
    Header(HexHeader),
    BlockRequest(Request),
    HeaderRequest(Request),
    Proof(ProofAnnouncement),
    Status(Status),
    NeighborUpdate(NeighborUpdate),
    MeshState(MeshStateSummary),
    BlockResponse(BlockResponse),
    HeaderResponse(HeaderResponse),
}

impl MeshMessage {
    pub fn code(&self) -> MessageCode {
        match self {
            MeshMessage::Block(_) => MessageCode::Block,
            MeshMessage::Header(_) => MessageCode::Header,
            MeshMessage::BlockRequest(_) => MessageCode::BlockRequest,
            MeshMessage::HeaderRequest(_) => MessageCode::HeaderRequest,
            MeshMessage::Proof(_) => MessageCode::Proof,
            MeshMessage::Status(_) => MessageCode::Status,
            MeshMessage::NeighborUpdate(_) => MessageCode::NeighborUpdate,
            MeshMessage::MeshState(_) => MessageCode::MeshState,
            MeshMessage::BlockResponse(_) => MessageCode::BlockResponse,
            MeshMessage::HeaderResponse(_) => MessageCode::HeaderResponse,
        }
    }

    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            MeshMessage::Block(_) => "block",
            MeshMessage::Header(_) => "header",
            MeshMessage::BlockRequest(_) => "block-request",
            MeshMessage::HeaderRequest(_) => "header-request",
            MeshMessage::Proof(_) => "proof",
            MeshMessage::Status(_) => "status",
            MeshMessage::NeighborUpdate(_) => "neighbor-update",
            MeshMessage::MeshState(_) => "mesh-state",
            MeshMessage::BlockResponse(_) => "block-response",
            MeshMessage::HeaderResponse(_) => "header-response",
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            MeshMessage::Block(b) => bincode::serialize(b)?,
            MeshMessage::Header(h) => bincode::serialize(h)?,
            MeshMessage::BlockRequest(r) | MeshMessage::HeaderRequest(r) => bincode::serialize(r)?,
            MeshMessage::Proof(p) => bincode::serialize(p)?,
            MeshMessage::Status(s) => bincode::serialize(s)?,
            MeshMessage::NeighborUpdate(u) => bincode::serialize(u)?,
            MeshMessage::MeshState(m) => bincode::serialize(m)?,
            MeshMessage::BlockResponse(r) => bincode::serialize(r)?,
            MeshMessage::HeaderResponse(r) => bincode::serialize(r)?,
        };
        Ok(bytes)
    }

    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let len = payload.len() as u64 + 1;
        let len = u32::try_from(len).map_err(|_| NetworkError::FrameTooLarge {
            len,
            max: u32::MAX,
        })?;

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(self.code() as u8);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a frame body (code byte plus payload).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (&code, payload) = body.split_first().ok_or(NetworkError::EmptyFrame)?;
        Ok(match MessageCode::try_from(code)? {
            MessageCode::Block => MeshMessage::Block(bincode::deserialize(payload)?),
            MessageCode::Header => MeshMessage::Header(bincode::deserialize(payload)?),
            MessageCode::BlockRequest => MeshMessage::BlockRequest(bincode::deserialize(payload)?),
            MessageCode::HeaderRequest => MeshMessage::HeaderRequest(bincode::deserialize(payload)?),
            MessageCode::Proof => MeshMessage::Proof(bincode::deserialize(payload)?),
            MessageCode::Status => MeshMessage::Status(bincode::deserialize(payload)?),
            MessageCode::NeighborUpdate => MeshMessage::NeighborUpdate(bincode::deserialize(payload)?),
            MessageCode::MeshState => MeshMessage::MeshState(bincode::deserialize(payload)?),
            MessageCode::BlockResponse => MeshMessage::BlockResponse(bincode::deserialize(payload)?),
            MessageCode::HeaderResponse => {
                MeshMessage::HeaderResponse(bincode::deserialize(payload)?)
            }
        })
    }
}

/// Read one frame. A clean EOF before the length prefix is
/// [`NetworkError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<MeshMessage>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        return Err(NetworkError::EmptyFrame);
    }
    if len > max_len {
        return Err(NetworkError::FrameTooLarge {
            len: len as u64,
            max: max_len,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    MeshMessage::decode(&body)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, msg: &MeshMessage, max_len: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.encode()?;
    let len = frame.len() as u64 - 4;
    if len > max_len as u64 {
        return Err(NetworkError::FrameTooLarge { len, max: max_len });
    }
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
