//! Inbound message reassembly.
//!
//! Segments are kept in offset order and may leave holes; a message is
//! complete only when coverage equals `total_length`. Duplicate or
//! overlapping arrivals (retransmissions racing the original) are dropped
//! whole, so accepted segments never overlap and byte accounting stays
//! exact.

use smallvec::SmallVec;

/// An inbound message under reconstruction.
#[derive(Debug)]
pub struct MessageIn {
    pub total_length: u32,
    /// Received runs, sorted by offset, non-overlapping.
    segments: Vec<(u32, Vec<u8>)>,
    /// Bytes not yet received.
    pub bytes_remaining: u32,
    /// Highest byte the sender is authorized to have sent. Never
    /// regresses.
    pub incoming: u32,
    /// True if the message needs grants (its length exceeds the sender's
    /// initial unscheduled horizon).
    pub scheduled: bool,
}

impl MessageIn {
    pub fn new(total_length: u32, incoming: u32) -> Self {
        Self {
            total_length,
            segments: Vec::new(),
            bytes_remaining: total_length,
            incoming: incoming.min(total_length),
            scheduled: incoming < total_length,
        }
    }

    pub fn bytes_received(&self) -> u32 {
        self.total_length - self.bytes_remaining
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Raise the authorized horizon; GRANT offsets never regress.
    pub fn note_incoming(&mut self, incoming: u32) {
        let incoming = incoming.min(self.total_length);
        if incoming > self.incoming {
            self.incoming = incoming;
        }
    }

    /// Insert one received run. Returns the number of newly covered bytes
    /// (zero for duplicates, overlaps, and out-of-bounds arrivals).
    pub fn add_segment(&mut self, offset: u32, data: Vec<u8>) -> u32 {
        let len = data.len() as u32;
        if len == 0 || offset >= self.total_length || offset + len > self.total_length {
            return 0;
        }
        let pos = self.segments.partition_point(|(o, _)| *o < offset);
        if let Some((prev_off, prev_data)) = pos.checked_sub(1).and_then(|i| self.segments.get(i))
            && prev_off + prev_data.len() as u32 > offset
        {
            return 0;
        }
        if let Some((next_off, _)) = self.segments.get(pos)
            && offset + len > *next_off
        {
            return 0;
        }
        self.segments.insert(pos, (offset, data));
        self.bytes_remaining -= len;
        len
    }

    /// The first missing range below the authorized horizon, for RESEND.
    /// Returns `None` when everything authorized so far has arrived.
    pub fn resend_gap(&self) -> Option<(u32, u32)> {
        let mut expected = 0u32;
        for (offset, data) in &self.segments {
            if *offset > expected {
                let end = (*offset).min(self.incoming);
                if end > expected {
                    return Some((expected, end - expected));
                }
                return None;
            }
            expected = offset + data.len() as u32;
        }
        if expected < self.incoming {
            return Some((expected, self.incoming - expected));
        }
        None
    }

    /// All missing ranges below the horizon. Diagnostic helper; RESEND
    /// itself only ever asks for the first gap.
    pub fn gaps(&self) -> SmallVec<[(u32, u32); 4]> {
        let mut gaps = SmallVec::new();
        let mut expected = 0u32;
        for (offset, data) in &self.segments {
            if *offset > expected {
                let end = (*offset).min(self.incoming);
                if end > expected {
                    gaps.push((expected, end - expected));
                }
            }
            expected = expected.max(offset + data.len() as u32);
        }
        if expected < self.incoming {
            gaps.push((expected, self.incoming - expected));
        }
        gaps
    }

    /// Consume the buffer and return the assembled message. Must only be
    /// called once the message is complete.
    pub fn assemble(self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut out = Vec::with_capacity(self.total_length as usize);
        for (_, data) in self.segments {
            out.extend_from_slice(&data);
        }
        out
    }
}
