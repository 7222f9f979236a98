//! Sockets: the application-facing endpoint.
//!
//! A socket owns its two RPC tables, the ready queues, the list of
//! blocked-receiver interests and the dead-RPC list. Freeing an RPC is
//! two-phase: `free_rpc` only marks it dead and queues it; the buffers go
//! away later in `reap`, which a receiver can hold off with the atomic
//! `reap_disable` counter while it copies payload out.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::TransportError;
use crate::metrics;
use crate::outgoing::MessageOut;
use crate::rpc::{Rpc, RpcId, RpcKey, RpcState, RpcTable, find_client, find_server};
use crate::transport::Transport;

bitflags! {
    /// What a receiver is willing to accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        const REQUEST = 1 << 0;
        const RESPONSE = 1 << 1;
        const NONBLOCKING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// One complete message handed to the application.
#[derive(Debug)]
pub struct Message {
    pub id: RpcId,
    pub peer: SocketAddr,
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

/// A blocked receiver's registration. The waker fills `ready` first and
/// then publishes the id with a single atomic store; the receiver
/// re-looks-up the RPC afterwards, and an id that reads zero (or an RPC
/// that vanished in between) just means retry.
#[derive(Debug)]
pub(crate) struct Interest {
    wants_request: bool,
    wants_response: bool,
    specific: Option<RpcId>,
    ready: Mutex<Option<RpcKey>>,
    id: AtomicU64,
}

impl Interest {
    fn new(wants_request: bool, wants_response: bool, specific: Option<RpcId>) -> Self {
        Self {
            wants_request,
            wants_response,
            specific,
            ready: Mutex::new(None),
            id: AtomicU64::new(0),
        }
    }

    fn matches(&self, key: &RpcKey, is_request: bool) -> bool {
        match self.specific {
            Some(id) => id == key.id,
            None => {
                if is_request {
                    self.wants_request
                } else {
                    self.wants_response
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SocketInner {
    pub ready_requests: VecDeque<RpcKey>,
    pub ready_responses: VecDeque<RpcKey>,
    pub interests: Vec<Arc<Interest>>,
    pub dead: Vec<Rpc>,
}

pub struct Socket {
    transport: Weak<Transport>,
    pub client_port: u16,
    /// Bound server port, zero when unbound.
    server_port: AtomicU64,
    shutdown: AtomicBool,
    pub(crate) client_rpcs: RpcTable,
    pub(crate) server_rpcs: RpcTable,
    pub(crate) inner: Mutex<SocketInner>,
    recv_cond: Condvar,
    /// Nonzero while some receiver is copying payload out; blocks reaping.
    pub reap_disable: AtomicUsize,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("client_port", &self.client_port)
            .finish_non_exhaustive()
    }
}

impl Socket {
    pub(crate) fn new(transport: Weak<Transport>, client_port: u16) -> Arc<Self> {
        Arc::new(Self {
            transport,
            client_port,
            server_port: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            client_rpcs: RpcTable::new(),
            server_rpcs: RpcTable::new(),
            inner: Mutex::new(SocketInner::default()),
            recv_cond: Condvar::new(),
            reap_disable: AtomicUsize::new(0),
        })
    }

    fn transport(&self) -> Result<Arc<Transport>, TransportError> {
        self.transport.upgrade().ok_or(TransportError::Shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn server_port(&self) -> Option<u16> {
        match self.server_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port as u16),
        }
    }

    /// Bind a server port so this socket can receive requests.
    pub fn bind(self: &Arc<Self>, port: u16) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }
        if self.server_port().is_some() {
            return Err(TransportError::PortInUse);
        }
        let transport = self.transport()?;
        transport.register_server_port(port, self)?;
        self.server_port.store(port as u64, Ordering::Release);
        Ok(())
    }

    /// Start a new RPC: assemble the request and transmit as much of its
    /// unscheduled window as the NIC queue will take.
    pub fn send_request(
        self: &Arc<Self>,
        dest: SocketAddr,
        data: Vec<u8>,
    ) -> Result<RpcId, TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }
        let transport = self.transport()?;
        let msgout = MessageOut::new(data, &transport.config)?;
        let peer = transport
            .peers
            .get_or_create(dest.ip(), &transport.config, &*transport.sink)?;
        let id = transport.alloc_id();
        let mut rpc = Rpc::new(id, true, peer, dest.port());
        rpc.msgout = Some(msgout);
        let key = rpc.key(self.client_port);
        {
            let mut bucket = self.client_rpcs.bucket(id).lock();
            bucket.push(rpc);
        }
        debug!(%id, peer = %dest, "client RPC started");
        transport.transmit_data(&key, false, usize::MAX);
        Ok(id)
    }

    /// Answer a request previously returned by `recv`. Valid only while
    /// that RPC is in service.
    pub fn reply(
        self: &Arc<Self>,
        id: RpcId,
        peer: SocketAddr,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }
        let transport = self.transport()?;
        let msgout = MessageOut::new(data, &transport.config)?;
        let key = {
            let mut bucket = self.server_rpcs.bucket(id).lock();
            let rpc = find_server(&mut bucket, id, peer.ip(), peer.port())
                .ok_or(TransportError::UnknownRpc)?;
            if rpc.state != RpcState::InService {
                return Err(TransportError::NotInService);
            }
            rpc.msgout = Some(msgout);
            rpc.state = RpcState::Outgoing;
            rpc.key(self.own_server_port())
        };
        transport.transmit_data(&key, false, usize::MAX);
        Ok(())
    }

    fn own_server_port(&self) -> u16 {
        self.server_port().unwrap_or(self.client_port)
    }

    /// Receive one complete message, blocking unless `NONBLOCKING`.
    pub fn recv(
        self: &Arc<Self>,
        flags: RecvFlags,
        id: Option<RpcId>,
    ) -> Result<Message, TransportError> {
        let wants_request = flags.contains(RecvFlags::REQUEST) && id.is_none();
        let wants_response = flags.contains(RecvFlags::RESPONSE) || id.is_some();
        if !wants_request && !wants_response {
            return Err(TransportError::InvalidFlags);
        }
        loop {
            if self.is_shutdown() {
                return Err(TransportError::Shutdown);
            }
            let mut inner = self.inner.lock();
            if let Some(key) = Self::match_ready(&mut inner, wants_request, wants_response, id) {
                drop(inner);
                match self.claim(&key)? {
                    Some(message) => {
                        self.reap_opportunistic();
                        return Ok(message);
                    }
                    None => continue,
                }
            }
            if flags.contains(RecvFlags::NONBLOCKING) {
                return Err(TransportError::WouldBlock);
            }
            let interest = Arc::new(Interest::new(wants_request, wants_response, id));
            inner.interests.push(interest.clone());
            loop {
                self.recv_cond.wait(&mut inner);
                if self.is_shutdown() {
                    inner.interests.retain(|i| !Arc::ptr_eq(i, &interest));
                    return Err(TransportError::Shutdown);
                }
                if interest.id.load(Ordering::Acquire) != 0 {
                    break;
                }
            }
            let key = interest.ready.lock().take();
            drop(inner);
            let Some(key) = key else { continue };
            match self.claim(&key)? {
                Some(message) => {
                    self.reap_opportunistic();
                    return Ok(message);
                }
                None => continue,
            }
        }
    }

    fn match_ready(
        inner: &mut SocketInner,
        wants_request: bool,
        wants_response: bool,
        id: Option<RpcId>,
    ) -> Option<RpcKey> {
        if let Some(id) = id {
            if let Some(at) = inner.ready_responses.iter().position(|k| k.id == id) {
                return inner.ready_responses.remove(at);
            }
            if let Some(at) = inner.ready_requests.iter().position(|k| k.id == id) {
                return inner.ready_requests.remove(at);
            }
            return None;
        }
        if wants_response
            && let Some(key) = inner.ready_responses.pop_front()
        {
            return Some(key);
        }
        if wants_request
            && let Some(key) = inner.ready_requests.pop_front()
        {
            return Some(key);
        }
        None
    }

    /// Pull a ready RPC's message out. `Ok(None)` means the RPC vanished
    /// between wake and lookup; the caller retries.
    fn claim(&self, key: &RpcKey) -> Result<Option<Message>, TransportError> {
        let transport = self.transport()?;
        self.reap_disable.fetch_add(1, Ordering::AcqRel);
        let result = self.claim_inner(&transport, key);
        self.reap_disable.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn claim_inner(
        &self,
        transport: &Arc<Transport>,
        key: &RpcKey,
    ) -> Result<Option<Message>, TransportError> {
        let table = if key.is_client {
            &self.client_rpcs
        } else {
            &self.server_rpcs
        };
        let bucket = table.bucket(key.id);
        let mut guard = bucket.lock();
        let found = if key.is_client {
            find_client(&mut guard, key.id)
        } else {
            find_server(&mut guard, key.id, key.peer_addr, key.peer_port)
        };
        let Some(rpc) = found else {
            return Ok(None);
        };
        if rpc.state != RpcState::Ready {
            return Ok(None);
        }
        if let Some(error) = rpc.error.take() {
            let at = guard
                .iter()
                .position(|r| r.id == key.id && r.peer_port == key.peer_port)
                .expect("rpc disappeared under its bucket lock");
            let rpc = guard.swap_remove(at);
            drop(guard);
            self.free_rpc(transport, rpc, key);
            return Err(error);
        }
        let peer_addr = SocketAddr::new(rpc.peer.addr, rpc.peer_port);
        let id = rpc.id;
        if key.is_client {
            let data = match rpc.msgin.take() {
                Some(msgin) => msgin.assemble(),
                None => return Ok(None),
            };
            let at = guard
                .iter()
                .position(|r| r.id == key.id)
                .expect("rpc disappeared under its bucket lock");
            let rpc = guard.swap_remove(at);
            drop(guard);
            self.free_rpc(transport, rpc, key);
            Ok(Some(Message {
                id,
                peer: peer_addr,
                kind: MessageKind::Response,
                data,
            }))
        } else {
            let data = match rpc.msgin.take() {
                Some(msgin) => msgin.assemble(),
                None => return Ok(None),
            };
            rpc.state = RpcState::InService;
            Ok(Some(Message {
                id,
                peer: peer_addr,
                kind: MessageKind::Request,
                data,
            }))
        }
    }

    /// Hand a Ready RPC to a blocked receiver, or queue it.
    pub(crate) fn wake_ready(&self, key: RpcKey, is_request: bool) {
        let mut inner = self.inner.lock();
        if let Some(at) = inner
            .interests
            .iter()
            .position(|i| i.matches(&key, is_request))
        {
            let interest = inner.interests.swap_remove(at);
            *interest.ready.lock() = Some(key);
            interest.id.store(key.id.0, Ordering::Release);
            self.recv_cond.notify_all();
            return;
        }
        if is_request {
            inner.ready_requests.push_back(key);
        } else {
            inner.ready_responses.push_back(key);
        }
    }

    /// Phase one of freeing: mark dead, unlink from scheduler lists and
    /// queue for the reaper.
    pub(crate) fn free_rpc(&self, transport: &Transport, mut rpc: Rpc, key: &RpcKey) {
        rpc.state = RpcState::Dead;
        transport.unlink_rpc(key);
        self.inner.lock().dead.push(rpc);
    }

    /// Phase two: actually release dead RPCs, at most `limit` per pass.
    /// Refuses to run while any receiver holds `reap_disable`.
    pub fn reap(&self, limit: usize) -> usize {
        if self.reap_disable.load(Ordering::Acquire) != 0 {
            return 0;
        }
        let reaped: Vec<Rpc> = {
            let mut inner = self.inner.lock();
            let take = limit.min(inner.dead.len());
            inner.dead.drain(..take).collect()
        };
        let count = reaped.len();
        if count > 0
            && let Some(transport) = self.transport.upgrade()
        {
            metrics::add(&transport.metrics.reaped_rpcs, count as u64);
        }
        drop(reaped);
        count
    }

    fn reap_opportunistic(&self) {
        if let Some(transport) = self.transport.upgrade() {
            self.reap(transport.config.reap_limit);
        }
    }

    /// Abort every client RPC addressed to `peer` with `error`.
    pub fn abort_peer(self: &Arc<Self>, peer: IpAddr, error: TransportError) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let mut to_wake = Vec::new();
        for bucket in self.client_rpcs.buckets() {
            let mut guard = bucket.lock();
            for rpc in guard.iter_mut() {
                if rpc.peer.addr == peer && rpc.state != RpcState::Dead {
                    rpc.error = Some(error.clone());
                    rpc.state = RpcState::Ready;
                    let key = rpc.key(self.client_port);
                    transport.unlink_rpc(&key);
                    to_wake.push(key);
                    metrics::inc(&transport.metrics.peer_aborts);
                }
            }
        }
        for key in to_wake {
            self.wake_ready(key, false);
        }
    }

    /// Shut the socket down: wake every blocked receiver with an error,
    /// abort in-flight RPCs and withdraw from the port table. The pacer
    /// drops this socket's RPCs when it next sees them.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = self.transport.upgrade();
        for (table, own_port) in [
            (&self.client_rpcs, self.client_port),
            (&self.server_rpcs, self.own_server_port()),
        ] {
            for bucket in table.buckets() {
                let drained: Vec<Rpc> = {
                    let mut guard = bucket.lock();
                    guard.drain(..).collect()
                };
                for rpc in drained {
                    let key = rpc.key(own_port);
                    if let Some(transport) = &transport {
                        self.free_rpc(transport, rpc, &key);
                    }
                }
            }
        }
        {
            let mut inner = self.inner.lock();
            inner.ready_requests.clear();
            inner.ready_responses.clear();
            inner.interests.clear();
            self.recv_cond.notify_all();
        }
        if let Some(transport) = &transport {
            let mut ports = vec![self.client_port];
            if let Some(server_port) = self.server_port() {
                ports.push(server_port);
            }
            transport.deregister_ports(&ports);
        }
        debug!(port = self.client_port, "socket shut down");
    }

    /// Diagnostic: number of RPCs queued for the reaper.
    pub fn dead_count(&self) -> usize {
        self.inner.lock().dead.len()
    }

    /// Diagnostic: number of live RPCs across both tables.
    pub fn active_rpcs(&self) -> usize {
        self.client_rpcs.len() + self.server_rpcs.len()
    }
}
