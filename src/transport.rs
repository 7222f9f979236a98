//! The top-level engine aggregate.
//!
//! One `Transport` owns every shared table: sockets, peers, the grantable
//! list, the throttled list and the NIC-queue estimator. It is passed by
//! `Arc` into every operation; there are no ambient singletons.
//!
//! Lock hierarchy, outermost first: socket-table write lock, socket lock,
//! bucket lock, then grantable lock or throttle lock. The last two are
//! never held together.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::RngCore;
use tracing::debug;

use crate::config::{CLIENT_PORT_FLOOR, Config};
use crate::error::TransportError;
use crate::grant::GrantableEntry;
use crate::metrics::{self, Metrics};
use crate::pacer::ThrottledEntry;
use crate::peer::PeerTable;
use crate::rpc::{RpcId, RpcKey};
use crate::sink::PacketSink;
use crate::socket::Socket;
use crate::time::TimeSource;
use crate::wire::{CommonHeader, MAX_PRIORITIES, PacketBody};

pub struct Transport {
    pub config: Config,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) sink: Arc<dyn PacketSink>,
    pub metrics: Metrics,

    /// Port-indexed socket table. A socket appears under its client port
    /// and, when bound, under its server port as well.
    pub(crate) sockets: RwLock<HashMap<u16, Arc<Socket>>>,
    pub(crate) peers: PeerTable,

    /// RPCs with scheduled inbound bytes outstanding, sorted by bytes
    /// remaining ascending (ties keep insertion order).
    pub(crate) grantable: Mutex<Vec<GrantableEntry>>,

    /// RPCs with granted-but-unsent bytes the estimator refused to take,
    /// sorted by remaining outbound bytes ascending.
    pub(crate) throttled: Mutex<Vec<ThrottledEntry>>,
    /// Cycle count at which the NIC is expected to go idle.
    pub(crate) link_idle_time: AtomicU64,
    pub(crate) pacer_active: AtomicBool,
    pub(crate) pacer_exit: AtomicBool,
    pub(crate) pacer_mutex: Mutex<()>,
    pub(crate) pacer_cond: Condvar,

    /// Locally advertised unscheduled-priority cutoffs and their version.
    pub(crate) local_cutoffs: RwLock<[u32; MAX_PRIORITIES]>,
    pub(crate) cutoff_version: AtomicU16,

    pub(crate) next_outgoing_id: AtomicU64,
    next_client_port: AtomicU16,
    pub(crate) tick_count: AtomicU64,

    /// Cycles one kilobyte occupies on the wire, padded by 5% so the
    /// queue estimate errs long rather than underflowing.
    pub(crate) cycles_per_kbyte: u64,
    pub(crate) max_nic_queue_cycles: u64,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(
        config: Config,
        time: Arc<dyn TimeSource>,
        sink: Arc<dyn PacketSink>,
        rng: &mut dyn RngCore,
    ) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        let cps = time.cycles_per_second() as u128;
        let cycles_per_kbyte = (cps * 8_400 / (config.link_mbps as u128 * 1_000_000)) as u64;
        let max_nic_queue_cycles =
            (config.max_nic_queue_ns as u128 * cps / 1_000_000_000) as u64;
        // Ids start at a random point; zero is reserved as "no RPC".
        let first_id = (rng.next_u64() | 1).max(1);
        Ok(Arc::new(Self {
            local_cutoffs: RwLock::new(config.unsched_cutoffs),
            cutoff_version: AtomicU16::new(config.cutoff_version),
            time,
            sink,
            metrics: Metrics::new(),
            sockets: RwLock::new(HashMap::new()),
            peers: PeerTable::new(),
            grantable: Mutex::new(Vec::new()),
            throttled: Mutex::new(Vec::new()),
            link_idle_time: AtomicU64::new(0),
            pacer_active: AtomicBool::new(false),
            pacer_exit: AtomicBool::new(false),
            pacer_mutex: Mutex::new(()),
            pacer_cond: Condvar::new(),
            next_outgoing_id: AtomicU64::new(first_id),
            next_client_port: AtomicU16::new(0),
            tick_count: AtomicU64::new(1),
            cycles_per_kbyte,
            max_nic_queue_cycles,
            config,
        }))
    }

    /// Open a socket on a freshly allocated client port.
    pub fn open_socket(self: &Arc<Self>) -> Result<Arc<Socket>, TransportError> {
        let mut sockets = self.sockets.write();
        let span = u16::MAX - CLIENT_PORT_FLOOR;
        for _ in 0..=span {
            let offset = self.next_client_port.fetch_add(1, Ordering::Relaxed) % span;
            let port = CLIENT_PORT_FLOOR + offset;
            if !sockets.contains_key(&port) {
                let socket = Socket::new(Arc::downgrade(self), port);
                sockets.insert(port, socket.clone());
                debug!(port, "socket opened");
                return Ok(socket);
            }
        }
        Err(TransportError::PortsExhausted)
    }

    /// Register `socket` under an explicitly bound server port.
    pub(crate) fn register_server_port(
        &self,
        port: u16,
        socket: &Arc<Socket>,
    ) -> Result<(), TransportError> {
        if port == 0 || port >= CLIENT_PORT_FLOOR {
            return Err(TransportError::InvalidPort(port));
        }
        let mut sockets = self.sockets.write();
        if sockets.contains_key(&port) {
            return Err(TransportError::PortInUse);
        }
        sockets.insert(port, socket.clone());
        Ok(())
    }

    pub(crate) fn deregister_ports(&self, ports: &[u16]) {
        let mut sockets = self.sockets.write();
        for port in ports {
            sockets.remove(port);
        }
    }

    pub(crate) fn socket_by_port(&self, port: u16) -> Option<Arc<Socket>> {
        self.sockets.read().get(&port).cloned()
    }

    pub(crate) fn socket_for(&self, key: &RpcKey) -> Option<Arc<Socket>> {
        self.socket_by_port(key.own_port)
    }

    /// Every open socket, each listed once.
    pub(crate) fn all_sockets(&self) -> Vec<Arc<Socket>> {
        let sockets = self.sockets.read();
        let mut seen = Vec::with_capacity(sockets.len());
        let mut out = Vec::with_capacity(sockets.len());
        for socket in sockets.values() {
            if !seen.contains(&socket.client_port) {
                seen.push(socket.client_port);
                out.push(socket.clone());
            }
        }
        out
    }

    pub(crate) fn alloc_id(&self) -> RpcId {
        let id = self.next_outgoing_id.fetch_add(1, Ordering::Relaxed);
        RpcId(if id == 0 { u64::MAX } else { id })
    }

    pub(crate) fn current_tick(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Replace the advertised unscheduled cutoffs; peers learn the new
    /// table through CUTOFFS refreshes triggered by their next DATA.
    pub fn set_unsched_cutoffs(&self, cutoffs: [u32; MAX_PRIORITIES]) {
        *self.local_cutoffs.write() = cutoffs;
        self.cutoff_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop `key` from the grantable and throttled lists. The two locks
    /// are taken one after the other, never together.
    pub(crate) fn unlink_rpc(&self, key: &RpcKey) {
        self.grantable.lock().retain(|e| e.key != *key);
        self.throttled.lock().retain(|e| e.key != *key);
    }

    /// Encode and emit one packet.
    pub(crate) fn send_packet(
        &self,
        dst: IpAddr,
        hdr: &CommonHeader,
        body: &PacketBody,
    ) -> Result<(), TransportError> {
        let datagram = crate::wire::encode(hdr, body);
        metrics::inc(&self.metrics.packets_sent);
        self.sink.send(dst, &datagram)
    }

    /// Diagnostic: current length of the grantable list.
    pub fn grantable_len(&self) -> usize {
        self.grantable.lock().len()
    }

    /// Diagnostic: current length of the throttled list.
    pub fn throttled_len(&self) -> usize {
        self.throttled.lock().len()
    }

    /// Diagnostic: the NIC-queue estimator's expected idle cycle.
    pub fn link_idle_cycles(&self) -> u64 {
        self.link_idle_time.load(Ordering::Relaxed)
    }
}
