//! The SRPT grant scheduler.
//!
//! The receiver keeps every scheduled inbound message on a single list
//! sorted by bytes remaining, ascending; only the top `max_overcommit`
//! entries receive grants, at priorities descending with list position.
//! Entries carry keys, not references: an RPC is always re-resolved under
//! its bucket lock before its horizon moves, which also means grants for
//! an RPC always see every DATA byte accounted before them.

use smallvec::SmallVec;
use tracing::trace;

use crate::metrics;
use crate::rpc::{RpcKey, RpcState, find_client, find_server};
use crate::transport::Transport;
use crate::wire::{CommonHeader, PacketBody};

/// One scheduled inbound message awaiting grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrantableEntry {
    pub key: RpcKey,
    pub bytes_remaining: u32,
}

impl Transport {
    /// Record that `key`'s inbound message now has `bytes_remaining` left,
    /// inserting it if new. Repositioning is a remove-and-reinsert at the
    /// partition point, so an entry whose key shrank bubbles toward the
    /// head while ties keep their arrival order.
    pub(crate) fn grantable_update(&self, key: &RpcKey, bytes_remaining: u32) {
        let mut grantable = self.grantable.lock();
        if let Some(at) = grantable.iter().position(|e| e.key == *key) {
            grantable.remove(at);
        }
        let at = grantable.partition_point(|e| e.bytes_remaining <= bytes_remaining);
        grantable.insert(
            at,
            GrantableEntry {
                key: *key,
                bytes_remaining,
            },
        );
    }

    pub(crate) fn grantable_remove(&self, key: &RpcKey) {
        self.grantable.lock().retain(|e| e.key != *key);
    }

    /// One scheduler pass: walk the top of the grantable list and top up
    /// each RPC's authorized horizon to one RTT past what has arrived.
    pub(crate) fn send_grants(&self) {
        let candidates: SmallVec<[(RpcKey, u8); 8]> = {
            let grantable = self.grantable.lock();
            grantable
                .iter()
                .take(self.config.max_overcommit)
                .enumerate()
                .map(|(pos, e)| {
                    let priority = self.config.max_sched_prio.saturating_sub(pos as u8);
                    (e.key, priority)
                })
                .collect()
        };
        for (key, priority) in candidates {
            self.grant_one(&key, priority);
        }
    }

    /// Issue any grants due for one RPC. The horizon only ever advances,
    /// and each grant adds exactly `grant_increment` bytes, so the GRANT
    /// offsets for an RPC form a strictly increasing sequence.
    fn grant_one(&self, key: &RpcKey, priority: u8) {
        let Some(socket) = self.socket_for(key) else {
            self.grantable_remove(key);
            return;
        };
        if socket.is_shutdown() {
            self.grantable_remove(key);
            return;
        }
        let table = if key.is_client {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let mut offsets: SmallVec<[u32; 8]> = SmallVec::new();
        {
            let mut bucket = table.bucket(key.id).lock();
            let found = if key.is_client {
                find_client(&mut bucket, key.id)
            } else {
                find_server(&mut bucket, key.id, key.peer_addr, key.peer_port)
            };
            let Some(rpc) = found else {
                drop(bucket);
                self.grantable_remove(key);
                return;
            };
            if rpc.state != RpcState::Incoming {
                drop(bucket);
                self.grantable_remove(key);
                return;
            }
            let Some(msgin) = rpc.msgin.as_mut() else {
                return;
            };
            while msgin.incoming < msgin.total_length
                && msgin.incoming.saturating_sub(msgin.bytes_received()) < self.config.rtt_bytes
            {
                let next = msgin
                    .incoming
                    .saturating_add(self.config.grant_increment)
                    .min(msgin.total_length);
                msgin.incoming = next;
                offsets.push(next);
            }
        }
        if offsets.is_empty() {
            return;
        }
        let hdr = CommonHeader {
            sport: key.own_port,
            dport: key.peer_port,
            priority: priority + self.config.base_priority,
            id: key.id.0,
        };
        for offset in offsets {
            trace!(id = %key.id, offset, priority, "grant");
            let _ = self.send_packet(
                key.peer_addr,
                &hdr,
                &PacketBody::Grant { offset, priority },
            );
            metrics::inc(&self.metrics.grants_sent);
        }
    }
}
