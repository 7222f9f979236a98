//! Per-destination state.
//!
//! Peer entries are append-only for the life of the process: once created
//! they are never removed, so `Arc<Peer>` references handed out by the
//! table may be retained indefinitely without any reclamation scheme.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::TransportError;
use crate::sink::PacketSink;
use crate::wire::MAX_PRIORITIES;

/// State for one remote host.
#[derive(Debug)]
pub struct Peer {
    pub addr: IpAddr,
    /// The peer's advertised unscheduled-priority cutoffs; seeded from the
    /// local defaults until a CUTOFFS packet replaces them.
    cutoffs: RwLock<[u32; MAX_PRIORITIES]>,
    /// Version of `cutoffs`, as last told to us by the peer. Zero means we
    /// have never heard from it, which guarantees a refresh on first
    /// contact.
    pub cutoff_version: AtomicU16,
    /// Tick at which we last sent this peer a RESEND.
    pub last_resend_tick: AtomicU64,
    /// Tick at which we last sent this peer our CUTOFFS.
    pub last_cutoffs_sent_tick: AtomicU64,
}

impl Peer {
    fn new(addr: IpAddr, config: &Config) -> Self {
        Self {
            addr,
            cutoffs: RwLock::new(config.unsched_cutoffs),
            cutoff_version: AtomicU16::new(0),
            last_resend_tick: AtomicU64::new(0),
            last_cutoffs_sent_tick: AtomicU64::new(0),
        }
    }

    /// Install cutoffs advertised by the peer.
    pub fn set_cutoffs(&self, cutoffs: [u32; MAX_PRIORITIES], version: u16) {
        *self.cutoffs.write() = cutoffs;
        self.cutoff_version.store(version, Ordering::Release);
    }

    /// Priority for an unscheduled packet of a message of `length` bytes:
    /// the highest level whose cutoff admits the message. Cutoffs are
    /// non-increasing, so smaller messages land on higher levels.
    pub fn unsched_priority(&self, config: &Config, length: u32) -> u8 {
        let cutoffs = self.cutoffs.read();
        let top = config.num_priorities as usize - 1;
        for level in (0..=top).rev() {
            if length <= cutoffs[level] {
                return level as u8;
            }
        }
        0
    }
}

/// Append-only table of peers keyed by address.
#[derive(Debug)]
pub struct PeerTable {
    peers: RwLock<HashMap<IpAddr, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Look up `addr`, creating and route-resolving an entry on miss.
    pub fn get_or_create(
        &self,
        addr: IpAddr,
        config: &Config,
        sink: &dyn PacketSink,
    ) -> Result<Arc<Peer>, TransportError> {
        if let Some(peer) = self.peers.read().get(&addr) {
            return Ok(peer.clone());
        }
        let mut peers = self.peers.write();
        // Raced insert: someone else may have resolved it meanwhile.
        if let Some(peer) = peers.get(&addr) {
            return Ok(peer.clone());
        }
        sink.resolve(addr)
            .map_err(|_| TransportError::PeerUnreachable)?;
        let peer = Arc::new(Peer::new(addr, config));
        peers.insert(addr, peer.clone());
        Ok(peer)
    }

    /// Look up `addr` without creating.
    pub fn get(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(&addr).cloned()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
