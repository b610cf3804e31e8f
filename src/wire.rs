//! # Wire formats
//!
//! Everything that crosses the socket after the key exchange is a frame:
//!
//! ```text
//! checksum:3 | flags:1 | payload | zero pad
//! ```
//!
//! - `flags` bits 0-2 carry the pad length (0-7), bits 3-7 the message type.
//! - The plaintext is zero-padded to a multiple of 8 bytes so the block
//!   cipher never needs its own padding layer.
//! - `checksum` is the low 24 bits of a CRC-32 over payload plus pad,
//!   verified before any handler runs.
//!
//! Payloads decode into a typed [`Message`] before dispatch; no handler
//! does offset arithmetic on raw buffers. Endpoints on the wire are IPv4
//! (`ip:4 | port:2`), matching the route-reply record layout.
//!
//! The reliable stream's sub-frames ([`StreamFrame`]) ride inside `Data`
//! message payloads and have their own single-byte kind tag.

use std::net::SocketAddrV4;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::identity::{NodeId, ID_LEN};
use crate::seq::Seq;

/// Frames are padded to a multiple of this many bytes (the cipher block).
pub const FRAME_ALIGN: usize = 8;

/// checksum:3 + flags:1.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted plaintext frame. Keeps a frame plus IV inside a
/// conservative UDP payload budget.
pub const MAX_FRAME_LEN: usize = 1400;

/// Largest payload of a single reliable-stream data fragment.
pub const MAX_FRAGMENT_LEN: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Data = 0,
    Auth = 1,
    AuthResponse = 2,
    RouteLookup = 3,
    RouteReply = 4,
    Close = 5,
    UpdateRank = 6,
    RequestReverseConnect = 7,
    RequestConnect = 8,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MsgType::Data),
            1 => Ok(MsgType::Auth),
            2 => Ok(MsgType::AuthResponse),
            3 => Ok(MsgType::RouteLookup),
            4 => Ok(MsgType::RouteReply),
            5 => Ok(MsgType::Close),
            6 => Ok(MsgType::UpdateRank),
            7 => Ok(MsgType::RequestReverseConnect),
            8 => Ok(MsgType::RequestConnect),
            _ => Err(Error::Frame),
        }
    }
}

fn checksum24(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) & 0x00ff_ffff
}

/// Build a plaintext frame: header, payload, zero pad to the block size.
pub fn encode_frame(msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
    let pad = (FRAME_ALIGN - (FRAME_HEADER_LEN + payload.len()) % FRAME_ALIGN) % FRAME_ALIGN;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + pad);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(payload);
    out.resize(FRAME_HEADER_LEN + payload.len() + pad, 0);

    let chk = checksum24(&out[FRAME_HEADER_LEN..]);
    out[0] = (chk >> 16) as u8;
    out[1] = (chk >> 8) as u8;
    out[2] = chk as u8;
    out[3] = (pad as u8 & 0x07) | ((msg_type as u8) << 3);
    out
}

/// Parse and validate a plaintext frame, returning the type and payload.
pub fn decode_frame(plaintext: &[u8]) -> Result<(MsgType, &[u8])> {
    if plaintext.len() < FRAME_HEADER_LEN
        || plaintext.len() % FRAME_ALIGN != 0
        || plaintext.len() > MAX_FRAME_LEN
    {
        return Err(Error::Frame);
    }
    let chk = (u32::from(plaintext[0]) << 16) | (u32::from(plaintext[1]) << 8) | u32::from(plaintext[2]);
    let flags = plaintext[3];
    let pad = usize::from(flags & 0x07);
    let msg_type = MsgType::try_from(flags >> 3)?;

    let body = &plaintext[FRAME_HEADER_LEN..];
    if pad > body.len() {
        return Err(Error::Frame);
    }
    if checksum24(body) != chk {
        return Err(Error::Checksum);
    }
    Ok((msg_type, &body[..body.len() - pad]))
}

// ============================================================================
// Typed messages
// ============================================================================

/// Authentication payload: proves possession of the long-term key over the
/// freshly derived shared secret.
///
/// `signature` is Ed25519 over `SHA-1(shared_secret || timestamp_ms_be)`.
/// `asserted` is the endpoint the sender believes it is reachable at; the
/// receiver compares it with the datagram source to spot NAT.
#[derive(Debug, Clone)]
pub struct AuthPayload {
    pub signature: [u8; 64],
    pub public_key: [u8; 32],
    pub timestamp_ms: u64,
    pub nonce: [u64; 2],
    pub asserted: SocketAddrV4,
}

/// One host record in a route reply. `needs_relay` marks a NAT-restricted
/// peer best reached through the replying node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub needs_relay: bool,
}

#[derive(Debug, Clone)]
pub enum Message {
    /// Channel-multiplexed opaque bytes.
    Data {
        src_channel: u16,
        dst_channel: u16,
        payload: Bytes,
    },
    Auth(AuthPayload),
    AuthResponse {
        ok: bool,
    },
    /// Ask for up to `n` hosts near `target`, optionally no farther from
    /// the target than `limit` is.
    RouteLookup {
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
    },
    RouteReply {
        target: NodeId,
        hosts: Vec<HostEntry>,
    },
    /// Empty channel pair closes the connection; a specific pair closes
    /// one channel.
    Close {
        channel: Option<(u16, u16)>,
    },
    UpdateRank {
        nonce: [u64; 2],
    },
    /// Sent to a relay: ask `endpoint` to connect back to us.
    RequestReverseConnect {
        endpoint: SocketAddrV4,
    },
    /// Sent by a relay: `endpoint` wants us to connect to it.
    RequestConnect {
        endpoint: SocketAddrV4,
    },
}

fn put_addr(buf: &mut BytesMut, addr: SocketAddrV4) {
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn get_addr(buf: &mut impl Buf) -> Result<SocketAddrV4> {
    if buf.remaining() < 6 {
        return Err(Error::Frame);
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16();
    Ok(SocketAddrV4::new(octets.into(), port))
}

fn get_id(buf: &mut impl Buf) -> Result<NodeId> {
    if buf.remaining() < ID_LEN {
        return Err(Error::Frame);
    }
    let mut bytes = [0u8; ID_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(NodeId::from_bytes(bytes))
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Data { .. } => MsgType::Data,
            Message::Auth(_) => MsgType::Auth,
            Message::AuthResponse { .. } => MsgType::AuthResponse,
            Message::RouteLookup { .. } => MsgType::RouteLookup,
            Message::RouteReply { .. } => MsgType::RouteReply,
            Message::Close { .. } => MsgType::Close,
            Message::UpdateRank { .. } => MsgType::UpdateRank,
            Message::RequestReverseConnect { .. } => MsgType::RequestReverseConnect,
            Message::RequestConnect { .. } => MsgType::RequestConnect,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Data {
                src_channel,
                dst_channel,
                payload,
            } => {
                buf.put_u16(*src_channel);
                buf.put_u16(*dst_channel);
                buf.put_slice(payload);
            }
            Message::Auth(auth) => {
                buf.put_slice(&auth.signature);
                buf.put_slice(&auth.public_key);
                buf.put_u64(auth.timestamp_ms);
                buf.put_u64(auth.nonce[0]);
                buf.put_u64(auth.nonce[1]);
                put_addr(&mut buf, auth.asserted);
            }
            Message::AuthResponse { ok } => {
                buf.put_u8(u8::from(*ok));
            }
            Message::RouteLookup { target, n, limit } => {
                buf.put_slice(target.as_bytes());
                buf.put_u32(*n);
                match limit {
                    Some(limit) => {
                        buf.put_u8(1);
                        buf.put_slice(limit.as_bytes());
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::RouteReply { target, hosts } => {
                buf.put_slice(target.as_bytes());
                buf.put_u32(hosts.len() as u32);
                for host in hosts {
                    buf.put_slice(host.id.as_bytes());
                    put_addr(&mut buf, host.addr);
                    buf.put_u8(u8::from(host.needs_relay));
                }
            }
            Message::Close { channel } => {
                if let Some((src, dst)) = channel {
                    buf.put_u16(*src);
                    buf.put_u16(*dst);
                }
            }
            Message::UpdateRank { nonce } => {
                buf.put_u64(nonce[0]);
                buf.put_u64(nonce[1]);
            }
            Message::RequestReverseConnect { endpoint } | Message::RequestConnect { endpoint } => {
                put_addr(&mut buf, *endpoint);
            }
        }
        buf.freeze()
    }

    pub fn decode(msg_type: MsgType, payload: &[u8]) -> Result<Message> {
        let mut buf = payload;
        match msg_type {
            MsgType::Data => {
                if buf.remaining() < 4 {
                    return Err(Error::Frame);
                }
                let src_channel = buf.get_u16();
                let dst_channel = buf.get_u16();
                Ok(Message::Data {
                    src_channel,
                    dst_channel,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            MsgType::Auth => {
                if buf.remaining() != 64 + 32 + 8 + 16 + 6 {
                    return Err(Error::Frame);
                }
                let mut signature = [0u8; 64];
                buf.copy_to_slice(&mut signature);
                let mut public_key = [0u8; 32];
                buf.copy_to_slice(&mut public_key);
                let timestamp_ms = buf.get_u64();
                let nonce = [buf.get_u64(), buf.get_u64()];
                let asserted = get_addr(&mut buf)?;
                Ok(Message::Auth(AuthPayload {
                    signature,
                    public_key,
                    timestamp_ms,
                    nonce,
                    asserted,
                }))
            }
            MsgType::AuthResponse => {
                if buf.remaining() != 1 {
                    return Err(Error::Frame);
                }
                Ok(Message::AuthResponse {
                    ok: buf.get_u8() != 0,
                })
            }
            MsgType::RouteLookup => {
                let target = get_id(&mut buf)?;
                if buf.remaining() < 5 {
                    return Err(Error::Frame);
                }
                let n = buf.get_u32();
                let limit = match buf.get_u8() {
                    0 => None,
                    1 => Some(get_id(&mut buf)?),
                    _ => return Err(Error::Frame),
                };
                Ok(Message::RouteLookup { target, n, limit })
            }
            MsgType::RouteReply => {
                let target = get_id(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(Error::Frame);
                }
                let count = buf.get_u32() as usize;
                // Reject counts the buffer cannot possibly hold.
                if count > buf.remaining() / (ID_LEN + 7) {
                    return Err(Error::Frame);
                }
                let mut hosts = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = get_id(&mut buf)?;
                    let addr = get_addr(&mut buf)?;
                    if buf.remaining() < 1 {
                        return Err(Error::Frame);
                    }
                    let needs_relay = buf.get_u8() != 0;
                    hosts.push(HostEntry {
                        id,
                        addr,
                        needs_relay,
                    });
                }
                Ok(Message::RouteReply { target, hosts })
            }
            MsgType::Close => match buf.remaining() {
                0 => Ok(Message::Close { channel: None }),
                4 => {
                    let src = buf.get_u16();
                    let dst = buf.get_u16();
                    Ok(Message::Close {
                        channel: Some((src, dst)),
                    })
                }
                _ => Err(Error::Frame),
            },
            MsgType::UpdateRank => {
                if buf.remaining() != 16 {
                    return Err(Error::Frame);
                }
                Ok(Message::UpdateRank {
                    nonce: [buf.get_u64(), buf.get_u64()],
                })
            }
            MsgType::RequestReverseConnect => {
                let endpoint = get_addr(&mut buf)?;
                if buf.has_remaining() {
                    return Err(Error::Frame);
                }
                Ok(Message::RequestReverseConnect { endpoint })
            }
            MsgType::RequestConnect => {
                let endpoint = get_addr(&mut buf)?;
                if buf.has_remaining() {
                    return Err(Error::Frame);
                }
                Ok(Message::RequestConnect { endpoint })
            }
        }
    }
}

// ============================================================================
// Reliable-stream sub-frames
// ============================================================================

const STREAM_DATA: u8 = 0;
const STREAM_ACK: u8 = 1;
const STREAM_ACK_ACK: u8 = 2;
const STREAM_NACK: u8 = 3;
const STREAM_CLOSE: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// One sequenced fragment, carrying the sender's receive-window start
    /// as piggy-backed flow control.
    Data {
        rx_win_start: Seq,
        seq: Seq,
        payload: Bytes,
    },
    /// Periodic acknowledgement of everything received so far.
    Ack {
        rx_win_start: Seq,
        rx_win_size: u16,
        rx_win_end: Seq,
        ack_seq: Seq,
        timestamp_ms: u64,
        gaps: Vec<(Seq, Seq)>,
    },
    /// Confirms an ack so the peer's heartbeat can stop; echoes the ack
    /// timestamp for RTT measurement.
    AckAck {
        timestamp_ms: u64,
    },
    /// Immediate report of one newly observed missing range.
    Nack {
        rx_win_start: Seq,
        range: (Seq, Seq),
    },
    Close,
}

impl StreamFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            StreamFrame::Data {
                rx_win_start,
                seq,
                payload,
            } => {
                buf.put_u8(STREAM_DATA);
                buf.put_u16(rx_win_start.raw());
                buf.put_u16(seq.raw());
                buf.put_slice(payload);
            }
            StreamFrame::Ack {
                rx_win_start,
                rx_win_size,
                rx_win_end,
                ack_seq,
                timestamp_ms,
                gaps,
            } => {
                buf.put_u8(STREAM_ACK);
                buf.put_u16(rx_win_start.raw());
                buf.put_u16(*rx_win_size);
                buf.put_u16(rx_win_end.raw());
                buf.put_u16(ack_seq.raw());
                buf.put_u64(*timestamp_ms);
                buf.put_u16(gaps.len() as u16);
                for (start, end) in gaps {
                    buf.put_u16(start.raw());
                    buf.put_u16(end.raw());
                }
            }
            StreamFrame::AckAck { timestamp_ms } => {
                buf.put_u8(STREAM_ACK_ACK);
                buf.put_u64(*timestamp_ms);
            }
            StreamFrame::Nack {
                rx_win_start,
                range,
            } => {
                buf.put_u8(STREAM_NACK);
                buf.put_u16(rx_win_start.raw());
                buf.put_u16(range.0.raw());
                buf.put_u16(range.1.raw());
            }
            StreamFrame::Close => {
                buf.put_u8(STREAM_CLOSE);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<StreamFrame> {
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(Error::Frame);
        }
        match buf.get_u8() {
            STREAM_DATA => {
                if buf.remaining() < 4 || buf.remaining() - 4 > MAX_FRAGMENT_LEN {
                    return Err(Error::Frame);
                }
                let rx_win_start = Seq(buf.get_u16());
                let seq = Seq(buf.get_u16());
                Ok(StreamFrame::Data {
                    rx_win_start,
                    seq,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            STREAM_ACK => {
                if buf.remaining() < 18 {
                    return Err(Error::Frame);
                }
                let rx_win_start = Seq(buf.get_u16());
                let rx_win_size = buf.get_u16();
                let rx_win_end = Seq(buf.get_u16());
                let ack_seq = Seq(buf.get_u16());
                let timestamp_ms = buf.get_u64();
                let count = usize::from(buf.get_u16());
                if buf.remaining() != count * 4 {
                    return Err(Error::Frame);
                }
                let mut gaps = Vec::with_capacity(count);
                for _ in 0..count {
                    gaps.push((Seq(buf.get_u16()), Seq(buf.get_u16())));
                }
                Ok(StreamFrame::Ack {
                    rx_win_start,
                    rx_win_size,
                    rx_win_end,
                    ack_seq,
                    timestamp_ms,
                    gaps,
                })
            }
            STREAM_ACK_ACK => {
                if buf.remaining() != 8 {
                    return Err(Error::Frame);
                }
                Ok(StreamFrame::AckAck {
                    timestamp_ms: buf.get_u64(),
                })
            }
            STREAM_NACK => {
                if buf.remaining() != 6 {
                    return Err(Error::Frame);
                }
                let rx_win_start = Seq(buf.get_u16());
                let range = (Seq(buf.get_u16()), Seq(buf.get_u16()));
                Ok(StreamFrame::Nack {
                    rx_win_start,
                    range,
                })
            }
            STREAM_CLOSE => {
                if buf.has_remaining() {
                    return Err(Error::Frame);
                }
                Ok(StreamFrame::Close)
            }
            _ => Err(Error::Frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), port)
    }

    #[test]
    fn frame_round_trip_all_pad_lengths() {
        for payload_len in 0..32usize {
            let payload: Vec<u8> = (0..payload_len as u8).collect();
            let frame = encode_frame(MsgType::Data, &payload);
            assert_eq!(frame.len() % FRAME_ALIGN, 0);
            let (msg_type, decoded) = decode_frame(&frame).expect("round trip");
            assert_eq!(msg_type, MsgType::Data);
            assert_eq!(decoded, &payload[..]);
        }
    }

    #[test]
    fn frame_checksum_mismatch_detected() {
        let mut frame = encode_frame(MsgType::Auth, b"payload!");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(decode_frame(&frame), Err(Error::Checksum)));
    }

    #[test]
    fn frame_rejects_bad_length() {
        assert!(matches!(decode_frame(&[0u8; 3]), Err(Error::Frame)));
        assert!(matches!(decode_frame(&[0u8; 13]), Err(Error::Frame)));
    }

    #[test]
    fn frame_rejects_unknown_type() {
        let mut frame = encode_frame(MsgType::Data, b"abcd");
        // Type bits 3-7: 31 is unassigned.
        frame[3] = (frame[3] & 0x07) | (31 << 3);
        assert!(matches!(decode_frame(&frame), Err(Error::Frame)));
    }

    #[test]
    fn message_round_trips() {
        let target = NodeId::from_bytes([9u8; ID_LEN]);
        let limit = NodeId::from_bytes([4u8; ID_LEN]);
        let messages = vec![
            Message::Data {
                src_channel: 7,
                dst_channel: 42,
                payload: Bytes::from_static(b"hello"),
            },
            Message::AuthResponse { ok: true },
            Message::AuthResponse { ok: false },
            Message::RouteLookup {
                target,
                n: 20,
                limit: Some(limit),
            },
            Message::RouteLookup {
                target,
                n: 1,
                limit: None,
            },
            Message::RouteReply {
                target,
                hosts: vec![
                    HostEntry {
                        id: limit,
                        addr: addr(9001),
                        needs_relay: false,
                    },
                    HostEntry {
                        id: target,
                        addr: addr(9002),
                        needs_relay: true,
                    },
                ],
            },
            Message::Close { channel: None },
            Message::Close {
                channel: Some((3, 4)),
            },
            Message::UpdateRank {
                nonce: [u64::MAX, 1],
            },
            Message::RequestReverseConnect { endpoint: addr(5) },
            Message::RequestConnect { endpoint: addr(6) },
        ];
        for message in messages {
            let payload = message.encode_payload();
            let decoded = Message::decode(message.msg_type(), &payload).expect("decode");
            // Compare via re-encoding; Message holds Bytes and is not Eq.
            assert_eq!(decoded.encode_payload(), payload);
            assert_eq!(decoded.msg_type(), message.msg_type());
        }
    }

    #[test]
    fn auth_payload_round_trip() {
        let auth = AuthPayload {
            signature: [0xab; 64],
            public_key: [0xcd; 32],
            timestamp_ms: 1_712_345_678_901,
            nonce: [5, u64::MAX],
            asserted: addr(4000),
        };
        let payload = Message::Auth(auth.clone()).encode_payload();
        let Message::Auth(decoded) = Message::decode(MsgType::Auth, &payload).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.signature, auth.signature);
        assert_eq!(decoded.public_key, auth.public_key);
        assert_eq!(decoded.timestamp_ms, auth.timestamp_ms);
        assert_eq!(decoded.nonce, auth.nonce);
        assert_eq!(decoded.asserted, auth.asserted);
    }

    #[test]
    fn route_reply_rejects_inflated_count() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[1u8; ID_LEN]);
        buf.put_u32(u32::MAX);
        assert!(Message::decode(MsgType::RouteReply, &buf).is_err());
    }

    #[test]
    fn stream_frames_round_trip() {
        let frames = vec![
            StreamFrame::Data {
                rx_win_start: Seq(9),
                seq: Seq(65_535),
                payload: Bytes::from_static(b"fragment"),
            },
            StreamFrame::Ack {
                rx_win_start: Seq(3),
                rx_win_size: 512,
                rx_win_end: Seq(19),
                ack_seq: Seq(18),
                timestamp_ms: 123_456,
                gaps: vec![(Seq(5), Seq(6)), (Seq(10), Seq(10))],
            },
            StreamFrame::AckAck {
                timestamp_ms: 123_456,
            },
            StreamFrame::Nack {
                rx_win_start: Seq(3),
                range: (Seq(7), Seq(9)),
            },
            StreamFrame::Close,
        ];
        for frame in frames {
            let bytes = frame.encode();
            assert_eq!(StreamFrame::decode(&bytes).expect("decode"), frame);
        }
    }

    #[test]
    fn stream_frame_rejects_oversized_fragment() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(&vec![0u8; MAX_FRAGMENT_LEN + 1]);
        assert!(StreamFrame::decode(&buf).is_err());
    }
}
