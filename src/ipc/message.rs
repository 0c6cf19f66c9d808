//! Wire protocol for the IPC message server (§6): a length-prefixed frame
//! `{u32 length, u32 message_id, bytes payload}` carrying one of three schematic payloads.

use std::io::{self, Read, Write};

use crate::{id::ResourceId, request::RequestStatus};

pub const MESSAGE_ID_REQUEST_RESOURCE: u32 = 1;
pub const MESSAGE_ID_RESOURCE_REQUEST_COMPLETE: u32 = 2;
pub const MESSAGE_ID_RESOURCE_UPDATED: u32 = 3;

/// A terminal request status as it travels over the wire: a single byte, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireStatus {
    Succeeded = 0,
    SucceededWithWarnings = 1,
    SucceededUpToDate = 2,
    Failed = 3,
}

impl WireStatus {
    pub fn from_request_status(status: RequestStatus) -> Option<Self> {
        match status {
            RequestStatus::Succeeded => Some(Self::Succeeded),
            RequestStatus::SucceededWithWarnings => Some(Self::SucceededWithWarnings),
            RequestStatus::SucceededUpToDate => Some(Self::SucceededUpToDate),
            RequestStatus::Failed => Some(Self::Failed),
            RequestStatus::Pending | RequestStatus::Compiling => None,
        }
    }

    fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            0 => Ok(Self::Succeeded),
            1 => Ok(Self::SucceededWithWarnings),
            2 => Ok(Self::SucceededUpToDate),
            3 => Ok(Self::Failed),
            other => Err(bad_data(format!("unknown wire status {other}"))),
        }
    }
}

/// The three message kinds the server and its clients exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// client -> server: "compile this for me".
    RequestResource(ResourceId),
    /// server -> client: the terminal outcome of a previously requested compile.
    ResourceRequestComplete { resource_id: ResourceId, status: WireStatus, compiled_path: String },
    /// server -> all clients: a resource was recompiled as a result of a source edit.
    ResourceUpdated(ResourceId),
}

impl Message {
    fn message_id(&self) -> u32 {
        match self {
            Message::RequestResource(_) => MESSAGE_ID_REQUEST_RESOURCE,
            Message::ResourceRequestComplete { .. } => MESSAGE_ID_RESOURCE_REQUEST_COMPLETE,
            Message::ResourceUpdated(_) => MESSAGE_ID_RESOURCE_UPDATED,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::RequestResource(id) => write_resource_id(&mut payload, id),
            Message::ResourceRequestComplete { resource_id, status, compiled_path } => {
                write_resource_id(&mut payload, resource_id);
                payload.push(*status as u8);
                write_len_prefixed_bytes(&mut payload, compiled_path.as_bytes());
            }
            Message::ResourceUpdated(id) => write_resource_id(&mut payload, id),
        }
        payload
    }

    /// Encodes the full frame: `u32 length | u32 message_id | payload`. `length` covers the
    /// message id and payload, matching the framing a reader peels off in one read.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut frame = Vec::with_capacity(8 + payload.len());
        let body_len = (4 + payload.len()) as u32;
        frame.extend_from_slice(&body_len.to_le_bytes());
        frame.extend_from_slice(&self.message_id().to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Reads exactly one frame from `reader`, blocking until it is fully available (or the
    /// connection closes, in which case `Ok(None)` is returned to signal a clean EOF at a
    /// frame boundary).
    pub fn read_from(mut reader: impl Read) -> io::Result<Option<Self>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error),
        }
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if body_len < 4 {
            return Err(bad_data("frame shorter than a message id"));
        }
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        let message_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let mut payload = &body[4..];
        let message = match message_id {
            MESSAGE_ID_REQUEST_RESOURCE => Message::RequestResource(read_resource_id(&mut payload)?),
            MESSAGE_ID_RESOURCE_REQUEST_COMPLETE => {
                let resource_id = read_resource_id(&mut payload)?;
                let status = WireStatus::from_byte(read_u8(&mut payload)?)?;
                let compiled_path = String::from_utf8(read_len_prefixed_bytes(&mut payload)?)
                    .map_err(|e| bad_data(e.to_string()))?;
                Message::ResourceRequestComplete { resource_id, status, compiled_path }
            }
            MESSAGE_ID_RESOURCE_UPDATED => Message::ResourceUpdated(read_resource_id(&mut payload)?),
            other => return Err(bad_data(format!("unknown message id {other}"))),
        };
        Ok(Some(message))
    }

    pub fn write_to(&self, mut writer: impl Write) -> io::Result<()> {
        writer.write_all(&self.encode())
    }
}

fn bad_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn write_len_prefixed_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_resource_id(out: &mut Vec<u8>, id: &ResourceId) {
    out.extend_from_slice(&u32::from_le_bytes(type_tag_bytes(id)));
    write_len_prefixed_bytes(out, id.path().as_str().as_bytes());
}

fn type_tag_bytes(id: &ResourceId) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    let tag = id.resource_type().as_str();
    let tag_bytes = tag.as_bytes();
    bytes[..tag_bytes.len().min(4)].copy_from_slice(&tag_bytes[..tag_bytes.len().min(4)]);
    bytes
}

fn read_u8(payload: &mut &[u8]) -> io::Result<u8> {
    if payload.is_empty() {
        return Err(bad_data("truncated payload reading a byte"));
    }
    let value = payload[0];
    *payload = &payload[1..];
    Ok(value)
}

fn read_len_prefixed_bytes(payload: &mut &[u8]) -> io::Result<Vec<u8>> {
    if payload.len() < 4 {
        return Err(bad_data("truncated payload reading a length"));
    }
    let len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    *payload = &payload[4..];
    if payload.len() < len {
        return Err(bad_data("truncated payload reading bytes"));
    }
    let bytes = payload[..len].to_vec();
    *payload = &payload[len..];
    Ok(bytes)
}

fn read_resource_id(payload: &mut &[u8]) -> io::Result<ResourceId> {
    if payload.len() < 4 {
        return Err(bad_data("truncated payload reading a type tag"));
    }
    let type_tag = &payload[0..4];
    let tag_len = type_tag.iter().position(|&b| b == 0).unwrap_or(4);
    let type_str = std::str::from_utf8(&type_tag[..tag_len]).map_err(|e| bad_data(e.to_string()))?;
    *payload = &payload[4..];
    let path_bytes = read_len_prefixed_bytes(payload)?;
    let path_str = String::from_utf8(path_bytes).map_err(|e| bad_data(e.to_string()))?;
    let id_str = format!("{type_str}:{path_str}");
    id_str.parse().map_err(|e: crate::error::ServerError| bad_data(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ResourcePath, ResourceTypeId};

    fn id() -> ResourceId {
        ResourceId::new(ResourceTypeId::new(b"msh"), ResourcePath::new("data://a.msh").unwrap())
    }

    #[test]
    fn request_resource_round_trips() {
        let message = Message::RequestResource(id());
        let encoded = message.encode();
        let decoded = Message::read_from(&encoded[..]).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn resource_request_complete_round_trips() {
        let message = Message::ResourceRequestComplete {
            resource_id: id(),
            status: WireStatus::SucceededWithWarnings,
            compiled_path: "/compiled/a.msh".to_string(),
        };
        let encoded = message.encode();
        let decoded = Message::read_from(&encoded[..]).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn resource_updated_round_trips() {
        let message = Message::ResourceUpdated(id());
        let encoded = message.encode();
        let decoded = Message::read_from(&encoded[..]).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn read_from_reports_clean_eof_as_none() {
        let empty: &[u8] = &[];
        assert!(Message::read_from(empty).unwrap().is_none());
    }

    #[test]
    fn two_frames_back_to_back_both_decode() {
        let mut buf = Vec::new();
        buf.extend(Message::RequestResource(id()).encode());
        buf.extend(Message::ResourceUpdated(id()).encode());
        let mut cursor = &buf[..];
        let first = Message::read_from(&mut cursor).unwrap().unwrap();
        let second = Message::read_from(&mut cursor).unwrap().unwrap();
        assert_eq!(first, Message::RequestResource(id()));
        assert_eq!(second, Message::ResourceUpdated(id()));
    }
}
