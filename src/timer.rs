//! Tick-driven loss recovery.
//!
//! `Transport::tick` runs at a fixed rate (1 ms nominal). Each pass walks
//! every live RPC: receivers that have gone silent ask their peer to
//! resend the first missing range, stalled senders retry transmission,
//! and RPCs silent past the abort threshold are torn down. A client
//! abort surfaces a timeout to the application; a server abort discards
//! state silently (the client will RESTART or time out on its own).

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::metrics;
use crate::rpc::{Rpc, RpcKey, RpcState};
use crate::socket::Socket;
use crate::transport::Transport;
use crate::wire::{CommonHeader, PacketBody};
use std::sync::Arc;

/// What one RPC needs after a tick, decided under its bucket lock and
/// acted on after the lock is dropped.
enum TickAction {
    Resend { key: RpcKey, offset: u32, length: u32 },
    Retry { key: RpcKey },
    Abort { key: RpcKey },
}

impl Transport {
    /// One timer tick over every socket.
    pub fn tick(self: &Arc<Self>) {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        for socket in self.all_sockets() {
            if socket.is_shutdown() {
                continue;
            }
            self.tick_socket(&socket, tick);
            if socket.dead_count() > self.config.max_dead_buffs {
                socket.reap(usize::MAX);
            } else {
                socket.reap(self.config.reap_limit);
            }
        }
    }

    fn tick_socket(self: &Arc<Self>, socket: &Arc<Socket>, tick: u64) {
        let server_port = socket.server_port().unwrap_or(socket.client_port);
        for (table, own_port, is_client) in [
            (&socket.client_rpcs, socket.client_port, true),
            (&socket.server_rpcs, server_port, false),
        ] {
            for bucket in table.buckets() {
                let mut actions = Vec::new();
                let mut aborted = Vec::new();
                {
                    let mut guard = bucket.lock();
                    let mut at = 0;
                    while at < guard.len() {
                        match self.tick_rpc(&mut guard[at], own_port, tick) {
                            Some(TickAction::Abort { key }) if !is_client => {
                                // Server timeout: discard state silently.
                                let rpc = guard.swap_remove(at);
                                aborted.push((rpc, key));
                                metrics::inc(&self.metrics.server_rpc_discards);
                                continue;
                            }
                            Some(action) => actions.push(action),
                            None => {}
                        }
                        at += 1;
                    }
                }
                for (rpc, key) in aborted {
                    debug!(id = %key.id, "server RPC discarded after timeout");
                    socket.free_rpc(self, rpc, &key);
                }
                for action in actions {
                    self.run_tick_action(socket, action);
                }
            }
        }
    }

    /// Per-RPC tick bookkeeping under the bucket lock.
    fn tick_rpc(&self, rpc: &mut Rpc, own_port: u16, tick: u64) -> Option<TickAction> {
        if rpc.state == RpcState::Dead
            || rpc.state == RpcState::Ready
            || rpc.state == RpcState::InService
        {
            return None;
        }
        if rpc.saw_packet {
            rpc.saw_packet = false;
            rpc.silent_ticks = 0;
            return None;
        }
        let key = rpc.key(own_port);

        // A sender with granted-but-unsent bytes is its own bottleneck:
        // retry transmission instead of counting silence.
        if rpc.state == RpcState::Outgoing
            && rpc
                .msgout
                .as_ref()
                .is_some_and(|m| m.next_ready().is_some())
        {
            return Some(TickAction::Retry { key });
        }

        // Waiting on the peer: a client for response bytes (or the first
        // of them), a server for the rest of a partly arrived request.
        let expecting_inbound = match rpc.state {
            RpcState::Incoming => true,
            RpcState::Outgoing => rpc.is_client,
            _ => false,
        };
        if !expecting_inbound {
            return None;
        }
        rpc.silent_ticks += 1;
        if rpc.silent_ticks < self.config.resend_ticks {
            return None;
        }
        if rpc.num_resends >= self.config.abort_resends {
            if rpc.is_client {
                rpc.error = Some(crate::error::TransportError::PeerTimeout);
                rpc.state = RpcState::Ready;
                metrics::inc(&self.metrics.client_rpc_timeouts);
            }
            return Some(TickAction::Abort { key });
        }
        // At most one RESEND per peer per resend_interval ticks; a
        // suppressed request does not count toward the abort threshold.
        let last = rpc.peer.last_resend_tick.load(Ordering::Relaxed);
        if tick.saturating_sub(last) < self.config.resend_interval as u64 {
            return None;
        }
        rpc.peer.last_resend_tick.store(tick, Ordering::Relaxed);
        let (offset, length) = match rpc.msgin.as_ref() {
            Some(msgin) => match msgin.resend_gap() {
                Some(gap) => gap,
                // Everything authorized has arrived but the message is
                // incomplete; probe past the horizon, which at worst
                // draws a BUSY and proves the peer alive.
                None => (msgin.incoming, self.config.grant_increment),
            },
            // No response byte yet: ask for the unscheduled window.
            None => (0, self.config.unscheduled_for(u32::MAX)),
        };
        rpc.num_resends += 1;
        Some(TickAction::Resend {
            key,
            offset,
            length,
        })
    }

    fn run_tick_action(self: &Arc<Self>, socket: &Arc<Socket>, action: TickAction) {
        match action {
            TickAction::Retry { key } => {
                self.transmit_data(&key, false, usize::MAX);
            }
            TickAction::Resend {
                key,
                offset,
                length,
            } => {
                let priority = self.config.num_priorities - 1 + self.config.base_priority;
                let hdr = CommonHeader {
                    sport: key.own_port,
                    dport: key.peer_port,
                    priority,
                    id: key.id.0,
                };
                debug!(id = %key.id, offset, length, "resend requested");
                let _ = self.send_packet(
                    key.peer_addr,
                    &hdr,
                    &PacketBody::Resend {
                        offset,
                        length,
                        priority,
                    },
                );
                metrics::inc(&self.metrics.resends_sent);
            }
            TickAction::Abort { key } => {
                debug!(id = %key.id, "client RPC timed out");
                self.unlink_rpc(&key);
                socket.wake_ready(key, false);
            }
        }
    }
}
