//! Outbound message assembly.
//!
//! A message is cut once, at creation, into packet buffers of up to
//! `max_gso_data` bytes; each buffer becomes one DATA packet carrying one
//! or more MTU-bounded segments. The buffers themselves are encoded at
//! transmit time from the retained message bytes, so a RESTART simply
//! rewinds the cursor and retransmission cannot observe any per-send
//! mutation of earlier buffers.

use crate::config::Config;
use crate::error::TransportError;
use crate::wire::Segment;

/// Geometry of one outbound packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketGeom {
    pub offset: u32,
    pub len: u32,
}

/// An outbound message and its transmit cursor.
#[derive(Debug)]
pub struct MessageOut {
    pub length: u32,
    data: Vec<u8>,
    pub packets: Vec<PacketGeom>,
    /// Initial bytes sendable without any grant.
    pub unscheduled: u32,
    /// Cumulative bytes the receiver has authorized.
    pub granted: u32,
    /// Index of the next buffer to transmit; monotonically non-decreasing
    /// except across RESTART.
    pub next_packet: usize,
    /// Priority from the most recent GRANT, used for scheduled packets.
    pub sched_priority: u8,
}

impl MessageOut {
    pub fn new(data: Vec<u8>, config: &Config) -> Result<Self, TransportError> {
        if data.is_empty() {
            return Err(TransportError::MessageEmpty);
        }
        if data.len() > config.max_message_size {
            return Err(TransportError::MessageTooLarge);
        }
        let length = data.len() as u32;
        let gso = config.max_gso_data() as u32;
        let mut packets = Vec::with_capacity(length.div_ceil(gso) as usize);
        let mut offset = 0u32;
        while offset < length {
            let len = gso.min(length - offset);
            packets.push(PacketGeom { offset, len });
            offset += len;
        }
        let unscheduled = config.unscheduled_for(length);
        Ok(Self {
            length,
            data,
            packets,
            unscheduled,
            granted: unscheduled,
            next_packet: 0,
            sched_priority: 0,
        })
    }

    /// The next buffer the grant window currently allows, if any. A buffer
    /// is sendable once its first byte is granted; grants are rounded up
    /// to whole buffers on the sending side.
    pub fn next_ready(&self) -> Option<PacketGeom> {
        let pkt = self.packets.get(self.next_packet)?;
        (pkt.offset < self.granted).then_some(*pkt)
    }

    pub fn advance(&mut self) {
        self.next_packet += 1;
    }

    pub fn fully_sent(&self) -> bool {
        self.next_packet >= self.packets.len()
    }

    /// Bytes not yet handed to the wire.
    pub fn bytes_left(&self) -> u32 {
        match self.packets.get(self.next_packet) {
            Some(pkt) => self.length - pkt.offset,
            None => 0,
        }
    }

    /// Record a GRANT. Offsets never regress.
    pub fn record_grant(&mut self, offset: u32, priority: u8) {
        let offset = offset.min(self.length);
        if offset > self.granted {
            self.granted = offset;
        }
        self.sched_priority = priority;
    }

    /// Rewind for a full replay after RESTART.
    pub fn restart(&mut self) {
        self.next_packet = 0;
        self.granted = self.unscheduled;
    }

    /// The authorized horizon a DATA packet for `pkt` must advertise:
    /// the receiver always learns at least the unscheduled window, and
    /// otherwise how far transmission has actually progressed.
    pub fn incoming_for(&self, pkt: PacketGeom) -> u32 {
        self.unscheduled.max(pkt.offset + pkt.len)
    }

    /// Split one buffer into its wire segments.
    pub fn segments_for(&self, pkt: PacketGeom, config: &Config) -> Vec<Segment> {
        let seg_max = config.max_seg_payload() as u32;
        let mut segments = Vec::with_capacity(pkt.len.div_ceil(seg_max) as usize);
        let mut at = pkt.offset;
        let end = pkt.offset + pkt.len;
        while at < end {
            let len = seg_max.min(end - at);
            segments.push(Segment {
                offset: at,
                data: self.data[at as usize..(at + len) as usize].to_vec(),
            });
            at += len;
        }
        segments
    }

    /// Buffers overlapping `[offset, offset + length)`, for retransmission.
    pub fn packets_in_range(&self, offset: u32, length: u32) -> Vec<PacketGeom> {
        let end = offset.saturating_add(length).min(self.length);
        self.packets
            .iter()
            .filter(|p| p.offset < end && p.offset + p.len > offset)
            .copied()
            .collect()
    }

    /// Highest byte offset already handed to the wire.
    pub fn sent_bytes(&self) -> u32 {
        match self.packets.get(self.next_packet) {
            Some(pkt) => pkt.offset,
            None => self.length,
        }
    }
}
