//! Inbound packet dispatch.
//!
//! `Transport::deliver` is the softirq analog: it decodes one datagram,
//! finds (or, for a fresh request, creates) the RPC it belongs to,
//! applies the state transition under the bucket lock, and only after
//! dropping that lock re-evaluates the grant scheduler and wakes any
//! receiver the packet completed a message for.
//!
//! Invalid input is counted and dropped; it never elicits a
//! retransmission request. The one generative response to an unknown RPC
//! is RESTART, sent when a server is asked to RESEND state it no longer
//! has.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::incoming::MessageIn;
use crate::metrics;
use crate::rpc::{Rpc, RpcId, RpcKey, RpcState, find_client, find_server};
use crate::socket::Socket;
use crate::transport::Transport;
use crate::wire::{CommonHeader, PacketBody, Segment};

/// Scheduler work decided under a bucket lock, run after it is dropped.
enum GrantWork {
    Update { key: RpcKey, bytes_remaining: u32 },
    Remove { key: RpcKey },
}

impl Transport {
    /// Process one inbound datagram.
    pub fn deliver(self: &Arc<Self>, src: IpAddr, datagram: &[u8]) {
        metrics::inc(&self.metrics.packets_received);
        let (hdr, body) = match crate::wire::decode(datagram) {
            Ok(decoded) => decoded,
            Err(TransportError::UnknownPacketType(t)) => {
                metrics::inc(&self.metrics.unknown_packet_types);
                warn!(packet_type = t, %src, "unknown packet type");
                return;
            }
            Err(error) => {
                metrics::inc(&self.metrics.short_packets);
                warn!(%error, %src, "dropping malformed packet");
                return;
            }
        };
        let Some(socket) = self.socket_by_port(hdr.dport) else {
            metrics::inc(&self.metrics.unknown_rpcs);
            trace!(dport = hdr.dport, "no socket for packet");
            return;
        };
        if socket.is_shutdown() {
            return;
        }
        let is_client_view = hdr.dport == socket.client_port;
        match body {
            PacketBody::Data {
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                segments,
            } => self.handle_data(
                &socket,
                src,
                &hdr,
                is_client_view,
                message_length,
                incoming,
                cutoff_version,
                retransmit,
                segments,
            ),
            PacketBody::Grant { offset, priority } => {
                self.handle_grant(&socket, src, &hdr, is_client_view, offset, priority)
            }
            PacketBody::Resend {
                offset,
                length,
                priority,
            } => self.handle_resend(&socket, src, &hdr, is_client_view, offset, length, priority),
            PacketBody::Restart => self.handle_restart(&socket, src, &hdr, is_client_view),
            PacketBody::Busy => self.handle_busy(&socket, src, &hdr, is_client_view),
            PacketBody::Cutoffs { cutoffs, version } => {
                if let Ok(peer) = self.peers.get_or_create(src, &self.config, &*self.sink) {
                    peer.set_cutoffs(cutoffs, version);
                    debug!(%src, version, "peer cutoffs updated");
                }
            }
            PacketBody::Freeze => {
                metrics::inc(&self.metrics.freeze_requests);
                debug!(%src, "freeze requested");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_data(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        src: IpAddr,
        hdr: &CommonHeader,
        is_client_view: bool,
        message_length: u32,
        incoming: u32,
        cutoff_version: u16,
        retransmit: bool,
        segments: Vec<Segment>,
    ) {
        if message_length as usize > self.config.max_message_size {
            metrics::inc(&self.metrics.short_packets);
            warn!(message_length, "message above size cap");
            return;
        }
        let Ok(peer) = self.peers.get_or_create(src, &self.config, &*self.sink) else {
            metrics::inc(&self.metrics.unknown_rpcs);
            return;
        };
        let id = RpcId(hdr.id);
        let table = if is_client_view {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let mut wake: Option<(RpcKey, bool)> = None;
        let mut grant_work: Option<GrantWork> = None;
        {
            let mut guard = table.bucket(id).lock();
            let rpc = if is_client_view {
                let Some(rpc) = find_client(&mut guard, id) else {
                    metrics::inc(&self.metrics.unknown_rpcs);
                    return;
                };
                if rpc.state == RpcState::Outgoing {
                    // First response packet: the client flips to receiving.
                    rpc.state = RpcState::Incoming;
                    rpc.msgin = Some(MessageIn::new(message_length, incoming));
                }
                rpc
            } else {
                if find_server(&mut guard, id, src, hdr.sport).is_none() {
                    // Only the very start of a message may create server
                    // state.
                    if segments.first().is_none_or(|s| s.offset != 0) {
                        metrics::inc(&self.metrics.unknown_rpcs);
                        trace!(%id, "data for unknown server RPC");
                        return;
                    }
                    let mut rpc = Rpc::new(id, false, peer.clone(), hdr.sport);
                    rpc.msgin = Some(MessageIn::new(message_length, incoming));
                    guard.push(rpc);
                    debug!(%id, %src, "server RPC created");
                }
                find_server(&mut guard, id, src, hdr.sport).expect("just inserted")
            };
            if rpc.state != RpcState::Incoming {
                metrics::inc(&self.metrics.redundant_segments);
                rpc.note_activity();
                return;
            }
            rpc.note_activity();
            rpc.num_resends = 0;
            let own_port = hdr.dport;
            let key = rpc.key(own_port);
            let msgin = rpc.msgin.as_mut().expect("incoming RPC without msgin");
            msgin.note_incoming(incoming);
            let mut newly = 0u32;
            for seg in segments.into_iter().take(self.config.max_gro_segs) {
                let accepted = msgin.add_segment(seg.offset, seg.data);
                if accepted == 0 {
                    metrics::inc(&self.metrics.redundant_segments);
                }
                newly += accepted;
            }
            metrics::add(&self.metrics.data_bytes_received, newly as u64);
            if retransmit {
                trace!(%id, "retransmitted data received");
            }
            let complete = msgin.is_complete();
            let scheduled = msgin.scheduled;
            let bytes_remaining = msgin.bytes_remaining;
            if complete {
                rpc.state = RpcState::Ready;
                if scheduled {
                    grant_work = Some(GrantWork::Remove { key });
                }
                wake = Some((key, !is_client_view));
            } else if scheduled && newly > 0 {
                grant_work = Some(GrantWork::Update {
                    key,
                    bytes_remaining,
                });
            }
        }
        // Bucket lock dropped: tell the sender about stale cutoffs, renew
        // grants, wake a receiver.
        if cutoff_version != self.cutoff_version.load(Ordering::Acquire) {
            self.refresh_peer_cutoffs(&peer, hdr);
        }
        match grant_work {
            Some(GrantWork::Update {
                key,
                bytes_remaining,
            }) => {
                self.grantable_update(&key, bytes_remaining);
                self.send_grants();
            }
            Some(GrantWork::Remove { key }) => {
                self.grantable_remove(&key);
                self.send_grants();
            }
            None => {}
        }
        if let Some((key, is_request)) = wake {
            debug!(id = %key.id, is_request, "message complete");
            socket.wake_ready(key, is_request);
        }
    }

    fn handle_grant(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        src: IpAddr,
        hdr: &CommonHeader,
        is_client_view: bool,
        offset: u32,
        priority: u8,
    ) {
        let id = RpcId(hdr.id);
        let table = if is_client_view {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let key = {
            let mut guard = table.bucket(id).lock();
            let found = if is_client_view {
                find_client(&mut guard, id)
            } else {
                find_server(&mut guard, id, src, hdr.sport)
            };
            let Some(rpc) = found else {
                metrics::inc(&self.metrics.unknown_rpcs);
                return;
            };
            rpc.note_activity();
            let Some(msgout) = rpc.msgout.as_mut() else {
                return;
            };
            msgout.record_grant(offset, priority);
            trace!(%id, offset, "grant received");
            rpc.key(hdr.dport)
        };
        self.transmit_data(&key, false, usize::MAX);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_resend(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        src: IpAddr,
        hdr: &CommonHeader,
        is_client_view: bool,
        offset: u32,
        length: u32,
        priority: u8,
    ) {
        let id = RpcId(hdr.id);
        let table = if is_client_view {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let mut guard = table.bucket(id).lock();
        let found = if is_client_view {
            find_client(&mut guard, id)
        } else {
            find_server(&mut guard, id, src, hdr.sport)
        };
        let Some(rpc) = found else {
            drop(guard);
            if !is_client_view {
                // The server has no trace of this RPC: tell the client to
                // start over. Replaying the request is part of the
                // protocol contract.
                let reply = CommonHeader {
                    sport: hdr.dport,
                    dport: hdr.sport,
                    priority: self.config.num_priorities - 1 + self.config.base_priority,
                    id: hdr.id,
                };
                debug!(%id, %src, "RESEND for unknown RPC, sending RESTART");
                let _ = self.send_packet(src, &reply, &PacketBody::Restart);
                metrics::inc(&self.metrics.restarts_sent);
            } else {
                metrics::inc(&self.metrics.unknown_rpcs);
            }
            return;
        };
        rpc.note_activity();
        let busy = match rpc.msgout.as_ref() {
            // Nothing of the requested range has even been authorized for
            // sending; answer BUSY so the peer's timer stays quiet.
            Some(msgout) => offset >= msgout.granted,
            None => true,
        };
        if busy {
            let reply = CommonHeader {
                sport: hdr.dport,
                dport: hdr.sport,
                priority: self.config.num_priorities - 1 + self.config.base_priority,
                id: hdr.id,
            };
            let _ = self.send_packet(src, &reply, &PacketBody::Busy);
            metrics::inc(&self.metrics.busy_sent);
            return;
        }
        let msgout = rpc.msgout.as_ref().expect("checked above");
        let dst_port = rpc.peer_port;
        let wire_priority = priority + self.config.base_priority;
        for pkt in msgout.packets_in_range(offset, length) {
            self.check_nic_queue(self.config.wire_bytes_for(pkt.len as usize), true);
            let out_hdr = CommonHeader {
                sport: hdr.dport,
                dport: dst_port,
                priority: wire_priority,
                id: hdr.id,
            };
            let body = PacketBody::Data {
                message_length: msgout.length,
                incoming: msgout.incoming_for(pkt),
                cutoff_version: rpc.peer.cutoff_version.load(Ordering::Acquire),
                retransmit: true,
                segments: msgout.segments_for(pkt, &self.config),
            };
            debug!(%id, offset = pkt.offset, "retransmitting");
            let _ = self.send_packet(rpc.peer.addr, &out_hdr, &body);
            metrics::inc(&self.metrics.resent_packets);
        }
    }

    fn handle_restart(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        src: IpAddr,
        hdr: &CommonHeader,
        is_client_view: bool,
    ) {
        if !is_client_view {
            metrics::inc(&self.metrics.unknown_rpcs);
            return;
        }
        let id = RpcId(hdr.id);
        let key = {
            let mut guard = socket.client_rpcs.bucket(id).lock();
            let Some(rpc) = find_client(&mut guard, id) else {
                metrics::inc(&self.metrics.unknown_rpcs);
                return;
            };
            if rpc.state != RpcState::Outgoing && rpc.state != RpcState::Incoming {
                return;
            }
            rpc.note_activity();
            rpc.num_resends = 0;
            // Discard any partial response and rewind the request; the
            // server may end up executing it twice.
            rpc.msgin = None;
            rpc.state = RpcState::Outgoing;
            if let Some(msgout) = rpc.msgout.as_mut() {
                msgout.restart();
            }
            rpc.key(hdr.dport)
        };
        metrics::inc(&self.metrics.restarts_received);
        debug!(%id, %src, "restarting RPC from offset 0");
        self.grantable_remove(&key);
        self.transmit_data(&key, false, usize::MAX);
    }

    fn handle_busy(
        &self,
        socket: &Arc<Socket>,
        src: IpAddr,
        hdr: &CommonHeader,
        is_client_view: bool,
    ) {
        let id = RpcId(hdr.id);
        let table = if is_client_view {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let mut guard = table.bucket(id).lock();
        let found = if is_client_view {
            find_client(&mut guard, id)
        } else {
            find_server(&mut guard, id, src, hdr.sport)
        };
        if let Some(rpc) = found {
            rpc.note_activity();
        }
    }

    /// Send our unscheduled cutoffs to a peer whose DATA advertised a
    /// stale version. Rate-limited to one refresh per tick per peer.
    fn refresh_peer_cutoffs(&self, peer: &crate::peer::Peer, hdr: &CommonHeader) {
        let tick = self.current_tick();
        if peer.last_cutoffs_sent_tick.swap(tick, Ordering::Relaxed) == tick {
            return;
        }
        let reply = CommonHeader {
            sport: hdr.dport,
            dport: hdr.sport,
            priority: self.config.num_priorities - 1 + self.config.base_priority,
            id: hdr.id,
        };
        let body = PacketBody::Cutoffs {
            cutoffs: *self.local_cutoffs.read(),
            version: self.cutoff_version.load(Ordering::Acquire),
        };
        let _ = self.send_packet(peer.addr, &reply, &body);
    }
}
