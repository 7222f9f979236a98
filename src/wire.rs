//! Packet formats and the fixed-offset codec.
//!
//! Every packet starts with a 32-byte common header whose first 16 bytes
//! mirror TCP field offsets (source port, destination port, two unused
//! 32-bit words where TCP's seq/ack live) so that NIC TSO/RSS machinery
//! leaves them intact. `doff` carries the header length in 32-bit words in
//! its high nibble, again for TSO's benefit. The checksum slot sits at
//! TCP's checksum offset and is never filled in.
//!
//! All multi-byte fields are network byte order except `id`, which is
//! written little-endian and treated as opaque by everyone but the client
//! that chose it.

use byteorder::{ByteOrder, LittleEndian, NetworkEndian};

use crate::error::TransportError;

/// Total number of priority levels the wire format can express.
pub const MAX_PRIORITIES: usize = 8;

/// Every packet is padded to at least this many bytes.
pub const MIN_PACKET_LEN: usize = 64;

/// Assumed IPv4 header size when deriving segment capacity from the MTU.
pub const IPV4_HEADER_LEN: usize = 20;

mod field {
    #![allow(non_snake_case)]

    pub type Field = core::ops::Range<usize>;

    // Common header. SPORT/DPORT and the two UNUSED words mirror TCP.
    pub const SPORT: Field = 0..2;
    pub const DPORT: Field = 2..4;
    pub const UNUSED1: Field = 4..8;
    pub const UNUSED2: Field = 8..12;
    pub const DOFF: usize = 12;
    pub const TYPE: usize = 13;
    pub const GRO_COUNT: usize = 14;
    pub const CHECKSUM: Field = 16..18;
    pub const PRIORITY: usize = 18;
    pub const ID: Field = 20..28;

    // DATA trailer.
    pub const MESSAGE_LENGTH: Field = 32..36;
    pub const INCOMING: Field = 36..40;
    pub const CUTOFF_VERSION: Field = 40..42;
    pub const RETRANSMIT: usize = 42;

    // GRANT trailer.
    pub const GRANT_OFFSET: Field = 32..36;
    pub const GRANT_PRIORITY: usize = 36;

    // RESEND trailer.
    pub const RESEND_OFFSET: Field = 32..36;
    pub const RESEND_LENGTH: Field = 36..40;
    pub const RESEND_PRIORITY: usize = 40;

    // CUTOFFS trailer.
    pub const CUTOFFS: Field = 32..64;
    pub const CUTOFFS_VERSION: Field = 64..66;
}

pub const COMMON_HEADER_LEN: usize = 32;
/// DATA header: common header plus the message-level trailer, before the
/// first segment header.
pub const DATA_HEADER_LEN: usize = 44;
/// Per-segment header: offset and length.
pub const SEG_HEADER_LEN: usize = 8;
pub const GRANT_PACKET_LEN: usize = 37;
pub const RESEND_PACKET_LEN: usize = 41;
pub const CUTOFFS_PACKET_LEN: usize = 66;

/// The transport-level packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x10,
    Grant = 0x11,
    Resend = 0x12,
    Restart = 0x13,
    Busy = 0x14,
    Cutoffs = 0x15,
    Freeze = 0x16,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Result<Self, TransportError> {
        match value {
            0x10 => Ok(PacketType::Data),
            0x11 => Ok(PacketType::Grant),
            0x12 => Ok(PacketType::Resend),
            0x13 => Ok(PacketType::Restart),
            0x14 => Ok(PacketType::Busy),
            0x15 => Ok(PacketType::Cutoffs),
            0x16 => Ok(PacketType::Freeze),
            other => Err(TransportError::UnknownPacketType(other)),
        }
    }
}

/// Fields shared by every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    /// Diagnostic copy of the priority the packet was sent at.
    pub priority: u8,
    pub id: u64,
}

/// One contiguous run of message bytes inside a DATA packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Data {
        message_length: u32,
        /// Highest byte offset the sender is authorized to have sent.
        incoming: u32,
        cutoff_version: u16,
        retransmit: bool,
        segments: Vec<Segment>,
    },
    Grant {
        /// New authorized horizon; never regresses for a given RPC.
        offset: u32,
        priority: u8,
    },
    Resend {
        offset: u32,
        length: u32,
        priority: u8,
    },
    Restart,
    Busy,
    Cutoffs {
        cutoffs: [u32; MAX_PRIORITIES],
        version: u16,
    },
    Freeze,
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Data { .. } => PacketType::Data,
            PacketBody::Grant { .. } => PacketType::Grant,
            PacketBody::Resend { .. } => PacketType::Resend,
            PacketBody::Restart => PacketType::Restart,
            PacketBody::Busy => PacketType::Busy,
            PacketBody::Cutoffs { .. } => PacketType::Cutoffs,
            PacketBody::Freeze => PacketType::Freeze,
        }
    }
}

fn write_common(buf: &mut [u8], hdr: &CommonHeader, ptype: PacketType, header_len: usize) {
    NetworkEndian::write_u16(&mut buf[field::SPORT], hdr.sport);
    NetworkEndian::write_u16(&mut buf[field::DPORT], hdr.dport);
    NetworkEndian::write_u32(&mut buf[field::UNUSED1], 0);
    NetworkEndian::write_u32(&mut buf[field::UNUSED2], 0);
    // High nibble is the header length in 32-bit words, rounded up.
    buf[field::DOFF] = ((header_len.div_ceil(4)) as u8) << 4;
    buf[field::TYPE] = ptype as u8;
    buf[field::GRO_COUNT] = 0;
    NetworkEndian::write_u16(&mut buf[field::CHECKSUM], 0);
    buf[field::PRIORITY] = hdr.priority;
    LittleEndian::write_u64(&mut buf[field::ID], hdr.id);
}

fn read_common(buf: &[u8]) -> CommonHeader {
    CommonHeader {
        sport: NetworkEndian::read_u16(&buf[field::SPORT]),
        dport: NetworkEndian::read_u16(&buf[field::DPORT]),
        priority: buf[field::PRIORITY],
        id: LittleEndian::read_u64(&buf[field::ID]),
    }
}

fn pad(mut buf: Vec<u8>) -> Vec<u8> {
    if buf.len() < MIN_PACKET_LEN {
        buf.resize(MIN_PACKET_LEN, 0);
    }
    buf
}

/// Encode a packet into a freshly allocated datagram, padded to the
/// 64-byte minimum.
pub fn encode(hdr: &CommonHeader, body: &PacketBody) -> Vec<u8> {
    match body {
        PacketBody::Data {
            message_length,
            incoming,
            cutoff_version,
            retransmit,
            segments,
        } => {
            let payload: usize = segments
                .iter()
                .map(|s| SEG_HEADER_LEN + s.data.len())
                .sum();
            let mut buf = vec![0u8; DATA_HEADER_LEN + payload];
            write_common(&mut buf, hdr, PacketType::Data, DATA_HEADER_LEN);
            NetworkEndian::write_u32(&mut buf[field::MESSAGE_LENGTH], *message_length);
            NetworkEndian::write_u32(&mut buf[field::INCOMING], *incoming);
            NetworkEndian::write_u16(&mut buf[field::CUTOFF_VERSION], *cutoff_version);
            buf[field::RETRANSMIT] = *retransmit as u8;
            let mut at = DATA_HEADER_LEN;
            for seg in segments {
                NetworkEndian::write_u32(&mut buf[at..at + 4], seg.offset);
                NetworkEndian::write_u32(&mut buf[at + 4..at + 8], seg.data.len() as u32);
                buf[at + 8..at + 8 + seg.data.len()].copy_from_slice(&seg.data);
                at += SEG_HEADER_LEN + seg.data.len();
            }
            pad(buf)
        }
        PacketBody::Grant { offset, priority } => {
            let mut buf = vec![0u8; GRANT_PACKET_LEN];
            write_common(&mut buf, hdr, PacketType::Grant, GRANT_PACKET_LEN);
            NetworkEndian::write_u32(&mut buf[field::GRANT_OFFSET], *offset);
            buf[field::GRANT_PRIORITY] = *priority;
            pad(buf)
        }
        PacketBody::Resend {
            offset,
            length,
            priority,
        } => {
            let mut buf = vec![0u8; RESEND_PACKET_LEN];
            write_common(&mut buf, hdr, PacketType::Resend, RESEND_PACKET_LEN);
            NetworkEndian::write_u32(&mut buf[field::RESEND_OFFSET], *offset);
            NetworkEndian::write_u32(&mut buf[field::RESEND_LENGTH], *length);
            buf[field::RESEND_PRIORITY] = *priority;
            pad(buf)
        }
        PacketBody::Restart => {
            let mut buf = vec![0u8; COMMON_HEADER_LEN];
            write_common(&mut buf, hdr, PacketType::Restart, COMMON_HEADER_LEN);
            pad(buf)
        }
        PacketBody::Busy => {
            let mut buf = vec![0u8; COMMON_HEADER_LEN];
            write_common(&mut buf, hdr, PacketType::Busy, COMMON_HEADER_LEN);
            pad(buf)
        }
        PacketBody::Cutoffs { cutoffs, version } => {
            let mut buf = vec![0u8; CUTOFFS_PACKET_LEN];
            write_common(&mut buf, hdr, PacketType::Cutoffs, CUTOFFS_PACKET_LEN);
            for (i, cutoff) in cutoffs.iter().enumerate() {
                let at = field::CUTOFFS.start + i * 4;
                NetworkEndian::write_u32(&mut buf[at..at + 4], *cutoff);
            }
            NetworkEndian::write_u16(&mut buf[field::CUTOFFS_VERSION], *version);
            pad(buf)
        }
        PacketBody::Freeze => {
            let mut buf = vec![0u8; COMMON_HEADER_LEN];
            write_common(&mut buf, hdr, PacketType::Freeze, COMMON_HEADER_LEN);
            pad(buf)
        }
    }
}

/// Decode a datagram. Trailing padding beyond the structured fields is
/// ignored; a buffer shorter than its declared contents is an error.
pub fn decode(buf: &[u8]) -> Result<(CommonHeader, PacketBody), TransportError> {
    if buf.len() < COMMON_HEADER_LEN {
        return Err(TransportError::PacketTooShort);
    }
    let hdr = read_common(buf);
    let body = match PacketType::from_wire(buf[field::TYPE])? {
        PacketType::Data => {
            if buf.len() < DATA_HEADER_LEN {
                return Err(TransportError::PacketTooShort);
            }
            let message_length = NetworkEndian::read_u32(&buf[field::MESSAGE_LENGTH]);
            let incoming = NetworkEndian::read_u32(&buf[field::INCOMING]);
            let cutoff_version = NetworkEndian::read_u16(&buf[field::CUTOFF_VERSION]);
            let retransmit = buf[field::RETRANSMIT] != 0;
            let mut segments = Vec::new();
            let mut at = DATA_HEADER_LEN;
            // A minimum-size packet may carry pure padding after its last
            // segment; stop once a segment header no longer fits.
            while at + SEG_HEADER_LEN <= buf.len() {
                let offset = NetworkEndian::read_u32(&buf[at..at + 4]);
                let len = NetworkEndian::read_u32(&buf[at + 4..at + 8]) as usize;
                if len == 0 {
                    break;
                }
                if at + SEG_HEADER_LEN + len > buf.len() {
                    return Err(TransportError::MalformedPacket("segment overruns packet"));
                }
                segments.push(Segment {
                    offset,
                    data: buf[at + SEG_HEADER_LEN..at + SEG_HEADER_LEN + len].to_vec(),
                });
                at += SEG_HEADER_LEN + len;
            }
            if segments.is_empty() {
                return Err(TransportError::MalformedPacket("DATA without segments"));
            }
            PacketBody::Data {
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                segments,
            }
        }
        PacketType::Grant => {
            if buf.len() < GRANT_PACKET_LEN {
                return Err(TransportError::PacketTooShort);
            }
            PacketBody::Grant {
                offset: NetworkEndian::read_u32(&buf[field::GRANT_OFFSET]),
                priority: buf[field::GRANT_PRIORITY],
            }
        }
        PacketType::Resend => {
            if buf.len() < RESEND_PACKET_LEN {
                return Err(TransportError::PacketTooShort);
            }
            PacketBody::Resend {
                offset: NetworkEndian::read_u32(&buf[field::RESEND_OFFSET]),
                length: NetworkEndian::read_u32(&buf[field::RESEND_LENGTH]),
                priority: buf[field::RESEND_PRIORITY],
            }
        }
        PacketType::Restart => PacketBody::Restart,
        PacketType::Busy => PacketBody::Busy,
        PacketType::Cutoffs => {
            if buf.len() < CUTOFFS_PACKET_LEN {
                return Err(TransportError::PacketTooShort);
            }
            let mut cutoffs = [0u32; MAX_PRIORITIES];
            for (i, cutoff) in cutoffs.iter_mut().enumerate() {
                let at = field::CUTOFFS.start + i * 4;
                *cutoff = NetworkEndian::read_u32(&buf[at..at + 4]);
            }
            PacketBody::Cutoffs {
                cutoffs,
                version: NetworkEndian::read_u16(&buf[field::CUTOFFS_VERSION]),
            }
        }
        PacketType::Freeze => PacketBody::Freeze,
    };
    Ok((hdr, body))
}
