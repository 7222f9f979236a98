//! The RPC state machine and the per-socket hash-bucket tables.
//!
//! Each socket keeps two tables, one for RPCs it initiated and one for
//! RPCs it is serving. A bucket's lock protects both the bucket's list
//! and every RPC stored in it, so holding it is the one requirement for
//! touching an RPC; there is no separate per-RPC lock or lifetime
//! counter.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::incoming::MessageIn;
use crate::outgoing::MessageOut;
use crate::peer::Peer;

/// Identifier of an RPC, chosen by the client and unique per client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RpcId(pub u64);

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Sending a message (request on clients, response on servers).
    Outgoing,
    /// Receiving a message (response on clients, request on servers).
    Incoming,
    /// Complete inbound message waiting for the application.
    Ready,
    /// Request claimed by the application, awaiting its reply (servers).
    InService,
    /// Freed; awaiting reap.
    Dead,
}

/// Enough information to find an RPC again from a scheduler list without
/// holding any reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcKey {
    /// The local port the RPC lives under (client port for client RPCs,
    /// server port for server RPCs).
    pub own_port: u16,
    pub id: RpcId,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub is_client: bool,
}

/// One request/response exchange.
#[derive(Debug)]
pub struct Rpc {
    pub id: RpcId,
    pub is_client: bool,
    pub peer: Arc<Peer>,
    /// Remote port packets for this RPC are addressed to.
    pub peer_port: u16,
    pub state: RpcState,
    pub msgin: Option<MessageIn>,
    pub msgout: Option<MessageOut>,
    /// Failure to surface to the application; meaningful on clients only.
    pub error: Option<TransportError>,
    pub silent_ticks: u32,
    pub num_resends: u32,
    /// Set by dispatch on any packet for this RPC; consumed by the timer.
    pub saw_packet: bool,
}

impl Rpc {
    pub fn new(id: RpcId, is_client: bool, peer: Arc<Peer>, peer_port: u16) -> Self {
        Self {
            id,
            is_client,
            peer,
            peer_port,
            state: if is_client {
                RpcState::Outgoing
            } else {
                RpcState::Incoming
            },
            msgin: None,
            msgout: None,
            error: None,
            silent_ticks: 0,
            num_resends: 0,
            saw_packet: false,
        }
    }

    pub fn key(&self, own_port: u16) -> RpcKey {
        RpcKey {
            own_port,
            id: self.id,
            peer_addr: self.peer.addr,
            peer_port: self.peer_port,
            is_client: self.is_client,
        }
    }

    /// Note inbound traffic for this RPC; keeps the timer quiet.
    pub fn note_activity(&mut self) {
        self.saw_packet = true;
        self.silent_ticks = 0;
    }
}

pub const RPC_BUCKETS: usize = 1024;

/// Hash-bucket table of active RPCs. The bucket lock doubles as the RPC
/// lock for everything it contains.
#[derive(Debug)]
pub struct RpcTable {
    buckets: Vec<Mutex<Vec<Rpc>>>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self {
            buckets: (0..RPC_BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    #[inline]
    pub fn bucket(&self, id: RpcId) -> &Mutex<Vec<Rpc>> {
        &self.buckets[(id.0 % RPC_BUCKETS as u64) as usize]
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Mutex<Vec<Rpc>>> {
        self.buckets.iter()
    }

    /// Count live RPCs. Diagnostic; takes every bucket lock in turn.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a client RPC in a locked bucket. Client ids are unique per
/// socket, so the id alone identifies the RPC.
pub fn find_client(bucket: &mut [Rpc], id: RpcId) -> Option<&mut Rpc> {
    bucket.iter_mut().find(|r| r.id == id)
}

/// Find a server RPC in a locked bucket. Server RPCs are identified by
/// `(id, peer address, peer port)` so that distinct clients reusing an id
/// can never collide.
pub fn find_server(
    bucket: &mut [Rpc],
    id: RpcId,
    peer_addr: IpAddr,
    peer_port: u16,
) -> Option<&mut Rpc> {
    bucket
        .iter_mut()
        .find(|r| r.id == id && r.peer.addr == peer_addr && r.peer_port == peer_port)
}
