//! Wire envelope contract shared by the server and test clients.
//!
//! A connected datagram is `[flags: u8][tag: u32 LE][body]`. The tag selects a
//! handler; the body is an opaque range until that handler decodes it against
//! a statically known maximum size. Out-of-band datagrams start with four
//! `0xFF` bytes followed by plain newline-delimited text.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const OOB_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const FLAG_RELIABLE: u8 = 0x01;
pub const ENVELOPE_HEADER_SIZE: usize = 5;
pub const MAX_DATAGRAM_SIZE: usize = 1300 * 128;

/// Network id used on the wire when no client is referenced (e.g. no host).
pub const NO_NET_ID: u16 = 0xFFFF;

pub const MAX_CONNECT_TOKEN_SIZE: usize = 128;
pub const MAX_ROUTE_PAYLOAD_SIZE: usize = 16 * 1024;
pub const MAX_QUIT_REASON_SIZE: usize = 1024;
pub const MAX_SERVER_COMMAND_SIZE: usize = 4096;
pub const MAX_SERVER_EVENT_SIZE: usize = 128 * 1024;
pub const MAX_STATE_BAG_SIZE: usize = 128 * 1024;

pub const OBJECT_ID_BATCH: usize = 32;
pub const OBJECT_ID_BATCH_BIG: usize = 6;

/// Case-insensitive one-at-a-time hash used to derive message tags.
pub const fn hash_name(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        hash = hash.wrapping_add(bytes[i].to_ascii_lowercase() as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
        i += 1;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

pub const MSG_CONNECT: u32 = hash_name("msgConnect");
pub const MSG_CONNECT_OK: u32 = hash_name("msgConnectOK");
pub const MSG_CONNECT_ACK: u32 = hash_name("msgConnectAck");
pub const MSG_ROUTE: u32 = hash_name("msgRoute");
pub const MSG_TIME_SYNC_REQ: u32 = hash_name("msgTimeSyncReq");
pub const MSG_TIME_SYNC: u32 = hash_name("msgTimeSync");
pub const MSG_IQUIT: u32 = hash_name("msgIQuit");
pub const MSG_HE_HOST: u32 = hash_name("msgHeHost");
pub const MSG_I_HOST: u32 = hash_name("msgIHost");
pub const MSG_SERVER_COMMAND: u32 = hash_name("msgServerCommand");
pub const MSG_SERVER_EVENT: u32 = hash_name("msgServerEvent");
pub const MSG_NET_EVENT: u32 = hash_name("msgNetEvent");
pub const MSG_STATE_BAG: u32 = hash_name("msgStateBag");
pub const MSG_REQUEST_OBJECT_IDS: u32 = hash_name("msgRequestObjectIds");
pub const MSG_OBJECT_IDS: u32 = hash_name("msgObjectIds");
pub const MSG_DROPPED: u32 = hash_name("msgDropped");

/// A connected-peer datagram split into its envelope parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub reliable: bool,
    pub tag: u32,
    pub body: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE || data.len() > MAX_DATAGRAM_SIZE {
            return None;
        }

        let flags = data[0];
        let tag = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);

        Some(Self {
            reliable: flags & FLAG_RELIABLE != 0,
            tag,
            body: &data[ENVELOPE_HEADER_SIZE..],
        })
    }
}

pub fn encode_envelope(tag: u32, body: &[u8], reliable: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    data.push(if reliable { FLAG_RELIABLE } else { 0 });
    data.extend_from_slice(&tag.to_le_bytes());
    data.extend_from_slice(body);
    data
}

pub fn encode_out_of_band(text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(OOB_PREFIX.len() + text.len());
    data.extend_from_slice(&OOB_PREFIX);
    data.extend_from_slice(text.as_bytes());
    data
}

/// Returns the text of an out-of-band datagram, or `None` for connected traffic.
pub fn parse_out_of_band(data: &[u8]) -> Option<&str> {
    let text = data.strip_prefix(&OOB_PREFIX[..])?;
    std::str::from_utf8(text).ok()
}

/// Fixed-layout payloads decoded with little-endian fixed-width integers.
///
/// Decoding is bounded by `MAX_SIZE` before any allocation and rejects
/// trailing bytes, so a malformed body simply yields `None`.
pub trait FixedPayload: Serialize + DeserializeOwned {
    const MAX_SIZE: usize;

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() > Self::MAX_SIZE {
            return None;
        }

        wire_options(Self::MAX_SIZE).deserialize(body).ok()
    }

    fn encode(&self) -> Option<Vec<u8>> {
        wire_options(Self::MAX_SIZE).serialize(self).ok()
    }
}

fn wire_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(limit as u64)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOk {
    pub net_id: u16,
    pub slot_id: u16,
    pub host_net_id: u16,
    pub authoritative: bool,
    pub big_mode: bool,
}

impl FixedPayload for ConnectOk {
    const MAX_SIZE: usize = 8;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RouteHeader {
    pub net_id: u16,
    pub length: u16,
}

impl FixedPayload for RouteHeader {
    const MAX_SIZE: usize = 4;
}

/// A routed blob; `net_id` is the target inbound and the sender outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePacket<'a> {
    pub net_id: u16,
    pub payload: &'a [u8],
}

impl<'a> RoutePacket<'a> {
    pub fn decode(body: &'a [u8]) -> Option<Self> {
        if body.len() < RouteHeader::MAX_SIZE
            || body.len() > RouteHeader::MAX_SIZE + MAX_ROUTE_PAYLOAD_SIZE
        {
            return None;
        }

        let header = RouteHeader::decode(&body[..RouteHeader::MAX_SIZE])?;
        let payload = &body[RouteHeader::MAX_SIZE..];

        if payload.len() != header.length as usize || payload.is_empty() {
            return None;
        }

        Some(Self {
            net_id: header.net_id,
            payload,
        })
    }

    pub fn encode(&self) -> Option<Vec<u8>> {
        if self.payload.len() > MAX_ROUTE_PAYLOAD_SIZE {
            return None;
        }

        let header = RouteHeader {
            net_id: self.net_id,
            length: self.payload.len() as u16,
        };
        let mut data = header.encode()?;
        data.extend_from_slice(self.payload);
        Some(data)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncRequest {
    pub request_time: u32,
    pub request_seq: u32,
}

impl FixedPayload for TimeSyncRequest {
    const MAX_SIZE: usize = 8;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResponse {
    pub request_time: u32,
    pub request_seq: u32,
    pub server_time: u64,
}

impl FixedPayload for TimeSyncResponse {
    const MAX_SIZE: usize = 16;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct HostVote {
    pub candidate_net_id: u16,
    pub network_base: u32,
}

impl FixedPayload for HostVote {
    const MAX_SIZE: usize = 6;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct HostAnnounce {
    pub network_base: u32,
}

impl FixedPayload for HostAnnounce {
    const MAX_SIZE: usize = 4;
}

/// Broadcast to every client when a host is elected or announced.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub net_id: u16,
    pub network_base: u32,
}

impl FixedPayload for HostInfo {
    const MAX_SIZE: usize = 6;
}

/// Decodes a text body of at most `max` bytes, accepting one trailing NUL.
pub fn decode_text(body: &[u8], max: usize) -> Option<String> {
    if body.len() > max {
        return None;
    }

    let text = body.strip_suffix(&[0u8]).unwrap_or(body);
    String::from_utf8(text.to_vec()).ok()
}

/// A named event with an opaque argument blob.
///
/// Layout: `[name_len: u16 LE][name][payload]`; outbound events are prefixed
/// with the source network id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEvent {
    pub name: String,
    pub payload: Vec<u8>,
}

impl NetEvent {
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 2 || body.len() > MAX_SERVER_EVENT_SIZE {
            return None;
        }

        let name_len = u16::from_le_bytes([body[0], body[1]]) as usize;
        let rest = &body[2..];
        if name_len == 0 || name_len > rest.len() {
            return None;
        }

        let name = std::str::from_utf8(&rest[..name_len]).ok()?;

        Some(Self {
            name: name.trim_end_matches('\0').to_string(),
            payload: rest[name_len..].to_vec(),
        })
    }

    pub fn encode(&self) -> Option<Vec<u8>> {
        let name_len = u16::try_from(self.name.len()).ok()?;
        if 2 + self.name.len() + self.payload.len() > MAX_SERVER_EVENT_SIZE {
            return None;
        }

        let mut data = Vec::with_capacity(2 + self.name.len() + self.payload.len());
        data.extend_from_slice(&name_len.to_le_bytes());
        data.extend_from_slice(self.name.as_bytes());
        data.extend_from_slice(&self.payload);
        Some(data)
    }

    pub fn encode_from(&self, source_net_id: u16) -> Option<Vec<u8>> {
        let mut data = source_net_id.to_le_bytes().to_vec();
        data.extend(self.encode()?);
        Some(data)
    }

    pub fn decode_from(body: &[u8]) -> Option<(u16, Self)> {
        if body.len() < 2 {
            return None;
        }

        let source = u16::from_le_bytes([body[0], body[1]]);
        Some((source, Self::decode(&body[2..])?))
    }
}

/// Compact object-id encoding: `[runs: u16]` then `[start: u16][extra: u16]`
/// per run of consecutive ids. Order is preserved exactly.
pub fn encode_object_ids(ids: &[u16]) -> Vec<u8> {
    let mut runs: Vec<(u16, u16)> = Vec::new();

    for &id in ids {
        match runs.last_mut() {
            Some((start, extra))
                if start.checked_add(*extra).and_then(|last| last.checked_add(1)) == Some(id) =>
            {
                *extra += 1;
            }
            _ => runs.push((id, 0)),
        }
    }

    let mut data = Vec::with_capacity(2 + runs.len() * 4);
    data.extend_from_slice(&(runs.len() as u16).to_le_bytes());
    for (start, extra) in runs {
        data.extend_from_slice(&start.to_le_bytes());
        data.extend_from_slice(&extra.to_le_bytes());
    }
    data
}

pub fn decode_object_ids(body: &[u8]) -> Option<Vec<u16>> {
    if body.len() < 2 {
        return None;
    }

    let runs = u16::from_le_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if rest.len() != runs * 4 {
        return None;
    }

    let mut ids = Vec::new();
    for run in rest.chunks_exact(4) {
        let start = u16::from_le_bytes([run[0], run[1]]);
        let extra = u16::from_le_bytes([run[2], run[3]]);
        for offset in 0..=extra {
            ids.push(start.checked_add(offset)?);
        }
    }
    Some(ids)
}
