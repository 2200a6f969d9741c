//! Transport-layer packet codec (component A).
//!
//! Builds the 4/8-byte TL header, the optional WebSocket frame wrapper, and
//! the little-endian sample payload for data packets. Meta payloads are
//! produced by [`super::meta`] and handed to [`serialize_packet`] as bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::ws_frame;

pub const MAX_SIGNAL_NUMBER: u32 = (1 << 20) - 1;
const INLINE_SIZE_MAX: usize = 255;
const TYPE_DATA: u32 = 1;
const TYPE_META: u32 = 2;
/// Meta payload's leading 4-byte little-endian tag identifying the encoding
/// of the bytes that follow; `2` means MessagePack, the only kind this
/// implementation produces (spec §4.A).
const META_TYPE_MSGPACK: u32 = 2;
const META_TAG_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("destination buffer too small")]
    BufferTooSmall,
    #[error("payload exceeds the 65535-byte WebSocket extended-length ceiling")]
    PayloadTooLarge,
    #[error("signal number {0} exceeds the 20-bit field budget")]
    SignalNumberOutOfRange(u32),
    #[error("malformed transport-layer header")]
    BadHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Meta,
}

/// Rule governing how an emitted data packet's samples were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Explicit,
    Linear,
    Constant,
}

/// Every datatype a signal's samples can carry, with its wire size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Real32,
    Real64,
    Complex32,
    Complex64,
}

impl DataType {
    /// Wire size in bytes, per spec §4.A.
    pub const fn sample_size(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Real32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Real64 | DataType::Complex32 => 8,
            DataType::Int128 | DataType::UInt128 | DataType::Complex64 => 16,
        }
    }

    /// Name as it appears in meta messages (component B).
    pub const fn wire_name(self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Int128 => "int128",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::UInt128 => "uint128",
            DataType::Real32 => "real32",
            DataType::Real64 => "real64",
            DataType::Complex32 => "complex32",
            DataType::Complex64 => "complex64",
        }
    }
}

/// One raw sample, already split into its little-endian byte representation
/// by the caller (the producer knows its own numeric type). Keeping the
/// codec agnostic to Rust-side numeric types avoids generic sprawl across a
/// component whose job is purely byte layout.
pub type SampleBytes<'a> = &'a [u8];

/// A packet ready to serialize: either a meta payload or a data payload.
pub enum Packet<'a> {
    Meta {
        /// 0 scopes the meta message to the stream itself; non-zero
        /// addresses one signal (subscribe/unsubscribe ack, definition).
        signal_number: u32,
        /// Raw MessagePack bytes from [`super::meta`]; `serialize_packet`
        /// prepends the 4-byte little-endian `meta_type = 2` tag required by
        /// spec §4.A, so `payload` here does not carry it.
        payload: Bytes,
    },
    DataExplicit {
        signal_number: u32,
        sample_size: usize,
        samples: &'a [SampleBytes<'a>],
    },
    DataImplicit {
        signal_number: u32,
        value_index: u64,
        sample: SampleBytes<'a>,
    },
}

fn tl_header_word(signal_number: u32, packet_type: u32, inline_size: u32) -> u32 {
    (signal_number & MAX_SIGNAL_NUMBER) | (inline_size << 20) | (packet_type << 28)
}

/// Write the TL header (4 or 8 bytes) for `payload_size` bytes belonging to
/// `signal_number`, of `packet_type`.
fn write_tl_header(
    dst: &mut BytesMut,
    signal_number: u32,
    packet_type: u32,
    payload_size: usize,
) -> Result<(), CodecError> {
    if signal_number > MAX_SIGNAL_NUMBER {
        return Err(CodecError::SignalNumberOutOfRange(signal_number));
    }
    if payload_size <= INLINE_SIZE_MAX {
        let word = tl_header_word(signal_number, packet_type, payload_size as u32);
        dst.put_u32_le(word);
    } else {
        let word = tl_header_word(signal_number, packet_type, 0);
        dst.put_u32_le(word);
        dst.put_u32_le(payload_size as u32);
    }
    Ok(())
}

fn tl_header_len(payload_size: usize) -> usize {
    if payload_size <= INLINE_SIZE_MAX {
        4
    } else {
        8
    }
}

/// Write the implicit-rule payload (value index + one sample) directly into
/// `dst`, field by field. Per the §9 Design Note, this avoids the reference
/// implementation's aliased three-`uint64` stack buffer.
fn write_implicit_payload(dst: &mut BytesMut, value_index: u64, sample: SampleBytes<'_>) {
    dst.put_u64_le(value_index);
    dst.extend_from_slice(sample);
}

/// Serialize `packet` into `dst`, prefixed by a WebSocket frame header when
/// `ws_enabled`. Reserves `payload_size + 16` bytes up front, mirroring the
/// reference implementation's stack allocation sizing.
pub fn serialize_packet(
    packet: &Packet<'_>,
    dst: &mut BytesMut,
    ws_enabled: bool,
) -> Result<usize, CodecError> {
    let (signal_number, packet_type, payload_len) = match packet {
        Packet::Meta {
            signal_number,
            payload,
        } => (*signal_number, TYPE_META, META_TAG_LEN + payload.len()),
        Packet::DataExplicit {
            signal_number,
            sample_size,
            samples,
        } => (*signal_number, TYPE_DATA, sample_size * samples.len()),
        Packet::DataImplicit {
            signal_number,
            sample,
            ..
        } => (*signal_number, TYPE_DATA, 8 + sample.len()),
    };

    let tl_len = tl_header_len(payload_len);
    let total_tl = tl_len + payload_len;

    if ws_enabled && total_tl > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge);
    }

    dst.reserve(payload_len + 16);
    let start = dst.len();

    if ws_enabled {
        ws_frame::write_head(dst, ws_frame::OPCODE_BINARY, total_tl)
            .map_err(|_| CodecError::PayloadTooLarge)?;
    }

    write_tl_header(dst, signal_number, packet_type, payload_len)?;

    match packet {
        Packet::Meta { payload, .. } => {
            dst.put_u32_le(META_TYPE_MSGPACK);
            dst.extend_from_slice(payload);
        }
        Packet::DataExplicit {
            sample_size,
            samples,
            ..
        } => {
            for s in samples.iter() {
                debug_assert_eq!(s.len(), *sample_size);
                dst.extend_from_slice(s);
            }
        }
        Packet::DataImplicit {
            value_index,
            sample,
            ..
        } => write_implicit_payload(dst, *value_index, sample),
    }

    Ok(dst.len() - start)
}

/// Decode a TL header from the front of `buf`. Returns
/// `(kind, signal_number, payload_size, header_len)`. Used by the JSON-RPC
/// and WS RX paths when they need to inspect inbound framed bytes, and by
/// the round-trip tests backing invariant 4 (§8).
pub fn decode_tl_header(buf: &[u8]) -> Result<(PacketKind, u32, usize, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::BadHeader);
    }
    let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let signal_number = word & MAX_SIGNAL_NUMBER;
    let inline_size = (word >> 20) & 0xFF;
    let packet_type = (word >> 28) & 0x3;

    let kind = match packet_type {
        TYPE_DATA => PacketKind::Data,
        TYPE_META => PacketKind::Meta,
        _ => return Err(CodecError::BadHeader),
    };

    if inline_size != 0 {
        Ok((kind, signal_number, inline_size as usize, 4))
    } else {
        if buf.len() < 8 {
            return Err(CodecError::BadHeader);
        }
        let size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        Ok((kind, signal_number, size, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_explicit_int32_three_samples_no_websocket() {
        let samples: Vec<i32> = vec![1, 2, 3];
        let sample_bytes: Vec<[u8; 4]> = samples.iter().map(|s| s.to_le_bytes()).collect();
        let refs: Vec<SampleBytes> = sample_bytes.iter().map(|b| b.as_slice()).collect();

        let packet = Packet::DataExplicit {
            signal_number: 1,
            sample_size: 4,
            samples: &refs,
        };
        let mut dst = BytesMut::new();
        serialize_packet(&packet, &mut dst, false).unwrap();

        // word = signal_number=1 | size=12<<20 | type=DATA(1)<<28
        let expected_header: u32 = 1 | (12 << 20) | (1 << 28);
        assert_eq!(&dst[0..4], &expected_header.to_le_bytes());
        assert_eq!(
            &dst[4..],
            &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0][..]
        );
    }

    #[test]
    fn boundary_255_uses_4_byte_header_256_uses_8() {
        // TL payload_size includes the 4-byte meta_type tag, so a 251-byte
        // MessagePack body lands exactly on the 255-byte inline boundary.
        let payload_251 = vec![0u8; 251];
        let mut dst = BytesMut::new();
        let packet = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(payload_251),
        };
        serialize_packet(&packet, &mut dst, false).unwrap();
        assert_eq!(tl_header_len(255), 4);
        assert_eq!(dst.len(), 4 + 255);

        let payload_252 = vec![0u8; 252];
        let mut dst2 = BytesMut::new();
        let packet2 = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(payload_252),
        };
        serialize_packet(&packet2, &mut dst2, false).unwrap();
        assert_eq!(tl_header_len(256), 8);
        assert_eq!(dst2.len(), 8 + 256);
    }

    #[test]
    fn round_trip_header_matches_invariant_4() {
        let payload = vec![7u8; 40];
        let mut dst = BytesMut::new();
        let packet = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(payload.clone()),
        };
        serialize_packet(&packet, &mut dst, false).unwrap();

        let (kind, signal_number, size, header_len) = decode_tl_header(&dst).unwrap();
        assert_eq!(kind, PacketKind::Meta);
        assert_eq!(signal_number, 0);
        assert_eq!(size, 4 + 40);
        let body = &dst[header_len..header_len + size];
        assert_eq!(u32::from_le_bytes([body[0], body[1], body[2], body[3]]), 2);
        assert_eq!(&body[4..], &payload[..]);
    }

    #[test]
    fn implicit_payload_is_value_index_then_sample_no_aliasing() {
        let sample = 42i32.to_le_bytes();
        let packet = Packet::DataImplicit {
            signal_number: 2,
            value_index: 9,
            sample: &sample,
        };
        let mut dst = BytesMut::new();
        serialize_packet(&packet, &mut dst, false).unwrap();
        // header (4 bytes, payload = 8 + 4 = 12) + 8-byte index + 4-byte sample
        assert_eq!(dst.len(), 4 + 12);
        let (_, _, size, header_len) = decode_tl_header(&dst).unwrap();
        assert_eq!(size, 12);
        let body = &dst[header_len..];
        assert_eq!(&body[0..8], &9u64.to_le_bytes());
        assert_eq!(&body[8..12], &sample);
    }

    #[test]
    fn oversized_ws_payload_rejected() {
        let payload = vec![0u8; 70_000];
        let packet = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(payload),
        };
        let mut dst = BytesMut::new();
        let err = serialize_packet(&packet, &mut dst, true).unwrap_err();
        assert_eq!(err, CodecError::PayloadTooLarge);
    }

    #[test]
    fn websocket_boundary_125_vs_126() {
        // total_tl = 4-byte TL header + 4-byte meta_type tag + msgpack body.
        let packet_125 = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(vec![0u8; 117]), // 4 + 4 + 117 = 125
        };
        let mut dst = BytesMut::new();
        serialize_packet(&packet_125, &mut dst, true).unwrap();
        assert_eq!(dst[1] & 0x7F, 125);

        let packet_126 = Packet::Meta {
            signal_number: 0,
            payload: Bytes::from(vec![0u8; 118]), // 4 + 4 + 118 = 126
        };
        let mut dst2 = BytesMut::new();
        serialize_packet(&packet_126, &mut dst2, true).unwrap();
        assert_eq!(dst2[1] & 0x7F, 126);
    }
}
