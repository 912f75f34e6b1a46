//! Binary frame codec for the live-room WebSocket protocol.
//!
//! Every logical packet starts with a 16 byte big-endian header:
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | total length     |
//! | 4      | 2    | header length    |
//! | 6      | 2    | protocol version |
//! | 8      | 4    | operation        |
//! | 12     | 4    | sequence         |
//!
//! A physical WebSocket frame may carry many logical packets back to back, and a
//! compressed packet (version 2 or 3) wraps a complete plain packet stream that is
//! decoded recursively.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::io::Read;
use tracing::{debug, trace};

use crate::error::{BliveError, Result};

/// Size of the fixed packet header.
pub const HEADER_LENGTH: usize = 16;

/// Default bound on nested compressed packets.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 8;

/// Body of the client heartbeat packet: `520` as big-endian u32.
pub const HEARTBEAT_PAYLOAD: [u8; 4] = 520u32.to_be_bytes();

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    /// Client heartbeat
    Heartbeat = 2,
    /// Server heartbeat reply carrying the popularity value
    HeartbeatReply = 3,
    /// Server notification (chat, gifts, ...)
    Notification = 5,
    /// Client auth (join room)
    Auth = 7,
    /// Server auth reply
    AuthReply = 8,
}

impl Operation {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::Heartbeat),
            3 => Some(Self::HeartbeatReply),
            5 => Some(Self::Notification),
            7 => Some(Self::Auth),
            8 => Some(Self::AuthReply),
            _ => None,
        }
    }
}

/// Protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolVersion {
    /// Uncompressed JSON body
    Plain = 0,
    /// Uncompressed heartbeat / auth body
    Control = 1,
    /// Zlib-compressed packet stream
    Zlib = 2,
    /// Brotli-compressed packet stream
    Brotli = 3,
}

impl ProtocolVersion {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Plain),
            1 => Some(Self::Control),
            2 => Some(Self::Zlib),
            3 => Some(Self::Brotli),
            _ => None,
        }
    }

    fn is_compressed(self) -> bool {
        matches!(self, Self::Zlib | Self::Brotli)
    }
}

/// Fixed 16 byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Header + body length
    pub total_length: u32,
    /// Always 16 on the wire
    pub header_length: u16,
    pub protocol_version: u16,
    pub operation: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Build a header for a body of `body_len` bytes.
    pub fn new(
        operation: Operation,
        version: ProtocolVersion,
        body_len: usize,
        sequence: u32,
    ) -> Self {
        Self {
            total_length: (HEADER_LENGTH + body_len) as u32,
            header_length: HEADER_LENGTH as u16,
            protocol_version: version as u16,
            operation: operation as u32,
            sequence,
        }
    }

    /// Parse and validate the header at `offset`.
    ///
    /// Fails when fewer than 16 bytes remain, when the lengths are inconsistent,
    /// or when `total_length` runs past the end of `buf`.
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self> {
        let invalid = |reason: String| BliveError::frame(offset, reason, Bytes::copy_from_slice(buf));

        let remaining = buf.len().saturating_sub(offset);
        if remaining < HEADER_LENGTH {
            return Err(invalid(format!(
                "header needs {HEADER_LENGTH} bytes, {remaining} remaining"
            )));
        }

        let data = &buf[offset..offset + HEADER_LENGTH];
        let header = Self {
            total_length: BigEndian::read_u32(&data[0..4]),
            header_length: BigEndian::read_u16(&data[4..6]),
            protocol_version: BigEndian::read_u16(&data[6..8]),
            operation: BigEndian::read_u32(&data[8..12]),
            sequence: BigEndian::read_u32(&data[12..16]),
        };

        if (header.header_length as usize) < HEADER_LENGTH {
            return Err(invalid(format!(
                "header length {} below {HEADER_LENGTH}",
                header.header_length
            )));
        }
        if header.total_length < header.header_length as u32 {
            return Err(invalid(format!(
                "total length {} below header length {}",
                header.total_length, header.header_length
            )));
        }
        if header.total_length as usize > remaining {
            return Err(invalid(format!(
                "total length {} exceeds {remaining} remaining bytes",
                header.total_length
            )));
        }

        Ok(header)
    }

    /// Serialize the header into `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.total_length);
        buf.put_u16(self.header_length);
        buf.put_u16(self.protocol_version);
        buf.put_u32(self.operation);
        buf.put_u32(self.sequence);
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u32(self.operation)
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_u16(self.protocol_version)
    }
}

/// One `(header, body)` pair sliced out of a physical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPacket {
    /// Position of the header within the buffer it was split from.
    pub offset: usize,
    pub header: PacketHeader,
    pub body: Bytes,
}

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// JSON notification body, to be routed through the message registry.
    Notification(Bytes),
    /// Popularity value from a heartbeat reply.
    Popularity(u32),
    /// The server accepted the auth packet.
    Authenticated,
    /// Any other operation, passed through untouched.
    Other { operation: u32, body: Bytes },
}

#[derive(Debug, Deserialize)]
struct AuthReplyBody {
    code: i64,
}

/// Build a complete packet.
pub fn encode_packet(
    operation: Operation,
    version: ProtocolVersion,
    sequence: u32,
    payload: &[u8],
) -> Bytes {
    let header = PacketHeader::new(operation, version, payload.len(), sequence);
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    header.write_to(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encoder for client-originated control packets.
///
/// Owns the outbound sequence counter, which increments on every packet.
#[derive(Debug)]
pub struct FrameEncoder {
    next_sequence: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self { next_sequence: 1 }
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `payload` as a control packet (protocol version 1, no compression).
    pub fn encode(&mut self, operation: Operation, payload: &[u8]) -> Bytes {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        encode_packet(operation, ProtocolVersion::Control, sequence, payload)
    }

    /// Encode the auth packet carrying the JSON auth payload.
    pub fn auth(&mut self, payload: &[u8]) -> Bytes {
        self.encode(Operation::Auth, payload)
    }

    /// Encode a heartbeat packet.
    pub fn heartbeat(&mut self) -> Bytes {
        self.encode(Operation::Heartbeat, &HEARTBEAT_PAYLOAD)
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }
}

/// Split a buffer into its logical packets without decompressing anything.
pub fn split_packets(buf: &Bytes) -> Result<Vec<LogicalPacket>> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let header = PacketHeader::parse(buf, offset)?;
        let start = offset + header.header_length as usize;
        let end = offset + header.total_length as usize;
        packets.push(LogicalPacket {
            offset,
            header,
            body: buf.slice(start..end),
        });
        offset = end;
    }

    Ok(packets)
}

/// Decode a physical frame into packets.
///
/// Compressed packets are decompressed on the blocking pool and their contents
/// decoded recursively, up to `max_depth` levels of nesting. Packets are returned
/// in wire order. A non-zero auth reply fails with [`BliveError::Auth`].
pub async fn decode(buf: Bytes, max_depth: usize) -> Result<Vec<Packet>> {
    decode_nested(buf, 0, max_depth).await
}

fn decode_nested(buf: Bytes, depth: usize, max_depth: usize) -> BoxFuture<'static, Result<Vec<Packet>>> {
    Box::pin(async move {
        let logical = split_packets(&buf)?;
        let mut packets = Vec::with_capacity(logical.len());

        for packet in logical {
            let offset = packet.offset;
            match packet.header.version() {
                Some(version) if version.is_compressed() => {
                    if depth + 1 > max_depth {
                        return Err(BliveError::frame(
                            offset,
                            format!("compressed packets nested deeper than {max_depth}"),
                            buf.clone(),
                        ));
                    }
                    let inner = decompress_offloaded(version, packet.body)
                        .await
                        .map_err(|reason| BliveError::frame(offset, reason, buf.clone()))?;
                    trace!(depth, offset, len = inner.len(), "Decompressed nested packet stream");
                    let nested = decode_nested(inner, depth + 1, max_depth)
                        .await
                        .map_err(|e| locate_in_outer(e, offset, &buf))?;
                    packets.extend(nested);
                }
                _ => {
                    if let Some(decoded) = interpret(packet, &buf)? {
                        packets.push(decoded);
                    }
                }
            }
        }

        Ok(packets)
    })
}

/// Re-anchor a frame error from a decompressed stream on the compressed
/// packet at `offset` of `outer`.
fn locate_in_outer(error: BliveError, offset: usize, outer: &Bytes) -> BliveError {
    match error {
        BliveError::Frame {
            offset: inner,
            reason,
            ..
        } => BliveError::frame(
            offset,
            format!("{reason} (inner offset {inner})"),
            outer.clone(),
        ),
        other => other,
    }
}

/// Turn an uncompressed logical packet of `frame` into a [`Packet`].
fn interpret(packet: LogicalPacket, frame: &Bytes) -> Result<Option<Packet>> {
    let LogicalPacket {
        offset,
        header,
        body,
    } = packet;

    match header.operation() {
        Some(Operation::Notification) => {
            if body.is_empty() {
                trace!("Skipping empty notification");
                return Ok(None);
            }
            Ok(Some(Packet::Notification(body)))
        }
        Some(Operation::HeartbeatReply) => {
            if body.len() < 4 {
                return Err(BliveError::frame(
                    offset,
                    format!("heartbeat reply body has {} bytes, expected 4", body.len()),
                    frame.clone(),
                ));
            }
            Ok(Some(Packet::Popularity(BigEndian::read_u32(&body[0..4]))))
        }
        Some(Operation::AuthReply) => {
            let reply: AuthReplyBody = serde_json::from_slice(&body).map_err(|e| {
                BliveError::frame(offset, format!("invalid auth reply: {e}"), frame.clone())
            })?;
            if reply.code != 0 {
                return Err(BliveError::Auth {
                    code: reply.code,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Ok(Some(Packet::Authenticated))
        }
        _ => {
            debug!(operation = header.operation, "Unhandled operation");
            Ok(Some(Packet::Other {
                operation: header.operation,
                body,
            }))
        }
    }
}

async fn decompress_offloaded(
    version: ProtocolVersion,
    body: Bytes,
) -> std::result::Result<Bytes, String> {
    tokio::task::spawn_blocking(move || match version {
        ProtocolVersion::Brotli => decompress_brotli(&body),
        ProtocolVersion::Zlib => decompress_zlib(&body),
        other => Err(format!("protocol version {other:?} is not compressed")),
    })
    .await
    .map_err(|e| format!("decompression task failed: {e}"))?
    .map(Bytes::from)
}

/// Decompress zlib data.
fn decompress_zlib(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| format!("zlib decompression failed: {e}"))?;
    Ok(decompressed)
}

/// Decompress brotli data.
fn decompress_brotli(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut decompressed = Vec::new();
    brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut decompressed)
        .map_err(|e| format!("brotli decompression failed: {e}"))?;
    Ok(decompressed)
}
