//! Engine tunables.
//!
//! Every knob the runtime exposes lives here, with the derived geometry
//! (segment capacity, GSO batching, unscheduled window) computed in one
//! place so the send and receive paths agree on it.

use crate::error::TransportError;
use crate::wire::{DATA_HEADER_LEN, IPV4_HEADER_LEN, MAX_PRIORITIES, SEG_HEADER_LEN};

/// Lowest port allocated to client sockets; explicit binds must stay below.
pub const CLIENT_PORT_FLOOR: u16 = 0x8000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Unscheduled-window size in bytes; rounded up to full packet buffers
    /// when a message is assembled.
    pub rtt_bytes: u32,
    /// Uplink bandwidth; drives the NIC-queue estimator's cycles-per-kbyte.
    pub link_mbps: u64,
    /// Total priority levels in use (at most [`MAX_PRIORITIES`]).
    pub num_priorities: u8,
    /// Added to each packet's priority before it reaches the sink.
    pub base_priority: u8,
    /// Highest level used for scheduled (granted) packets; levels above it
    /// are reserved for unscheduled traffic.
    pub max_sched_prio: u8,
    /// Per-priority largest-message-size thresholds for unscheduled
    /// packets, monotonically non-increasing.
    pub unsched_cutoffs: [u32; MAX_PRIORITIES],
    /// Initial version advertised for `unsched_cutoffs`.
    pub cutoff_version: u16,
    /// Bytes added to an RPC's authorized horizon per grant.
    pub grant_increment: u32,
    /// Cap on the number of simultaneously granted inbound messages.
    pub max_overcommit: usize,
    /// Silent ticks before a RESEND is issued.
    pub resend_ticks: u32,
    /// Minimum ticks between RESENDs to the same peer.
    pub resend_interval: u32,
    /// RESENDs without progress before an RPC is aborted.
    pub abort_resends: u32,
    /// Packets smaller than this bypass the throttle entirely.
    pub throttle_min_bytes: usize,
    /// NIC-queue depth limit; the estimator refuses packets that would
    /// push expected idle time further than this past now.
    pub max_nic_queue_ns: u64,
    /// Link MTU, including IP header but not link framing.
    pub mtu: usize,
    /// Upper bound on a single packet buffer, before rounding down to an
    /// integral number of MTU-sized packets.
    pub max_gso_size: usize,
    /// Cap on DATA segments accepted from a single inbound datagram.
    pub max_gro_segs: usize,
    /// Dead RPCs released per reap pass.
    pub reap_limit: usize,
    /// Dead-list length beyond which the timer reaps aggressively.
    pub max_dead_buffs: usize,
    /// Largest message the engine accepts.
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtt_bytes: 60_000,
            link_mbps: 10_000,
            num_priorities: MAX_PRIORITIES as u8,
            base_priority: 0,
            max_sched_prio: 5,
            unsched_cutoffs: [
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                u32::MAX,
                65_536,
                1_400,
            ],
            cutoff_version: 1,
            grant_increment: 10_000,
            max_overcommit: 8,
            resend_ticks: 5,
            resend_interval: 2,
            abort_resends: 10,
            throttle_min_bytes: 200,
            max_nic_queue_ns: 2_000_000,
            mtu: 1500,
            max_gso_size: 10_000,
            max_gro_segs: 20,
            reap_limit: 10,
            max_dead_buffs: 128,
            max_message_size: 1 << 20,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.num_priorities == 0 || self.num_priorities as usize > MAX_PRIORITIES {
            return Err(TransportError::InvalidConfig("num_priorities out of range"));
        }
        if self.max_sched_prio >= self.num_priorities {
            return Err(TransportError::InvalidConfig(
                "max_sched_prio must be below num_priorities",
            ));
        }
        if self
            .unsched_cutoffs
            .windows(2)
            .any(|pair| pair[1] > pair[0])
        {
            return Err(TransportError::InvalidConfig(
                "unsched_cutoffs must be non-increasing",
            ));
        }
        if self.mtu <= IPV4_HEADER_LEN + DATA_HEADER_LEN + SEG_HEADER_LEN {
            return Err(TransportError::InvalidConfig("mtu too small for a segment"));
        }
        if self.grant_increment == 0 {
            return Err(TransportError::InvalidConfig("grant_increment is zero"));
        }
        if self.max_overcommit == 0 {
            return Err(TransportError::InvalidConfig("max_overcommit is zero"));
        }
        if self.link_mbps == 0 {
            return Err(TransportError::InvalidConfig("link_mbps is zero"));
        }
        Ok(())
    }

    /// Largest payload one segment can carry within the MTU.
    pub fn max_seg_payload(&self) -> usize {
        self.mtu - IPV4_HEADER_LEN - DATA_HEADER_LEN - SEG_HEADER_LEN
    }

    /// Segments batched into one packet buffer.
    pub fn segs_per_buffer(&self) -> usize {
        (self.max_gso_size / self.mtu).max(1)
    }

    /// Largest run of message bytes one packet buffer can carry.
    pub fn max_gso_data(&self) -> usize {
        self.segs_per_buffer() * self.max_seg_payload()
    }

    /// Unscheduled byte count for a message of `length` bytes: the RTT
    /// window rounded up to whole packet buffers, capped at the message.
    pub fn unscheduled_for(&self, length: u32) -> u32 {
        let gso = self.max_gso_data() as u64;
        let rounded = (self.rtt_bytes as u64).div_ceil(gso) * gso;
        rounded.min(length as u64) as u32
    }

    /// Wire bytes for a packet buffer carrying `data_len` message bytes,
    /// counting replicated per-MTU headers the way the device will frame
    /// them after segmentation.
    pub fn wire_bytes_for(&self, data_len: usize) -> usize {
        let seg = self.max_seg_payload();
        let packets = data_len.div_ceil(seg).max(1);
        data_len + packets * (IPV4_HEADER_LEN + DATA_HEADER_LEN + SEG_HEADER_LEN)
    }
}
