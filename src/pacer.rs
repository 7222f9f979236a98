//! The pacer and the NIC-queue estimator.
//!
//! The estimator is one atomic cycle count: the instant the NIC is
//! expected to go idle if nothing further is queued. Keeping that horizon
//! within `max_nic_queue_cycles` of now keeps the hardware queue short
//! enough that a newly granted short message can still preempt a long one,
//! while never letting the link go idle when data is waiting.
//!
//! RPCs the estimator turns away go onto the throttled list, sorted by
//! remaining bytes ascending, and a dedicated pacer thread drains it.
//! Senders that find the estimator willing may still transmit directly,
//! which keeps the link busy when the pacer thread is descheduled.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::metrics;
use crate::rpc::{Rpc, RpcKey, RpcState, find_client, find_server};
use crate::transport::Transport;
use crate::wire::{CommonHeader, PacketBody};

/// Packets transmitted from the head RPC per pacer iteration.
const PACER_BATCH: usize = 5;

/// One sender with granted-but-unsent bytes waiting for the NIC queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThrottledEntry {
    pub key: RpcKey,
    pub bytes_remaining: u32,
}

/// Handle for a running pacer thread.
pub struct PacerHandle {
    thread: Option<thread::JoinHandle<()>>,
    transport: Arc<Transport>,
}

impl PacerHandle {
    /// Ask the pacer to exit and join it.
    pub fn stop(mut self) {
        self.transport.pacer_exit.store(true, Ordering::Release);
        self.transport.pacer_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PacerHandle {
    fn drop(&mut self) {
        self.transport.pacer_exit.store(true, Ordering::Release);
        self.transport.pacer_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) enum XmitStop {
    /// Everything sendable right now went out.
    Drained,
    /// The NIC queue refused a packet; the RPC belongs on the throttled
    /// list.
    QueueFull,
    /// The per-iteration batch limit was reached with more to send.
    Batch,
}

impl Transport {
    /// Admit `wire_bytes` to the NIC-queue estimate. Returns false when
    /// the queue is already `max_nic_queue_cycles` deep, unless `force`.
    pub(crate) fn check_nic_queue(&self, wire_bytes: usize, force: bool) -> bool {
        let pkt_cycles = wire_bytes as u64 * self.cycles_per_kbyte / 1000;
        loop {
            let idle = self.link_idle_time.load(Ordering::Relaxed);
            let now = self.time.cycles();
            if !force && idle > now.saturating_add(self.max_nic_queue_cycles) {
                return false;
            }
            let new_idle = idle.max(now) + pkt_cycles;
            if self
                .link_idle_time
                .compare_exchange(idle, new_idle, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Transmit as much of `key`'s outgoing message as grants and the NIC
    /// queue allow. Enqueues the RPC on the throttled list if the queue
    /// refuses a packet. `force_first` pushes the first packet through
    /// regardless, which is how the pacer avoids starving its head RPC.
    pub(crate) fn transmit_data(&self, key: &RpcKey, force_first: bool, limit: usize) -> usize {
        let Some(socket) = self.socket_for(key) else {
            return 0;
        };
        if socket.is_shutdown() {
            return 0;
        }
        let table = if key.is_client {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let bucket = table.bucket(key.id);
        let mut guard = bucket.lock();
        let found = if key.is_client {
            find_client(&mut guard, key.id)
        } else {
            find_server(&mut guard, key.id, key.peer_addr, key.peer_port)
        };
        let Some(rpc) = found else {
            return 0;
        };
        let (sent, stop) = self.xmit_rpc_locked(key, rpc, force_first, limit);
        let finished = self.note_xmit_progress(rpc, key, &stop);
        if finished {
            let at = guard
                .iter()
                .position(|r| r.id == key.id && r.peer_port == key.peer_port)
                .expect("rpc disappeared under its bucket lock");
            let rpc = guard.swap_remove(at);
            drop(guard);
            socket.free_rpc(self, rpc, key);
        }
        sent
    }

    /// Transmit loop for one RPC whose bucket lock is already held.
    pub(crate) fn xmit_rpc_locked(
        &self,
        key: &RpcKey,
        rpc: &mut Rpc,
        force_first: bool,
        limit: usize,
    ) -> (usize, XmitStop) {
        let mut sent = 0usize;
        let peer = rpc.peer.clone();
        let Some(msgout) = rpc.msgout.as_mut() else {
            return (0, XmitStop::Drained);
        };
        while let Some(pkt) = msgout.next_ready() {
            if sent >= limit {
                return (sent, XmitStop::Batch);
            }
            let wire_bytes = self.config.wire_bytes_for(pkt.len as usize);
            // Small packets bypass the throttle; they still book their
            // wire time so the idle estimate cannot drift low.
            let force =
                (force_first && sent == 0) || wire_bytes < self.config.throttle_min_bytes;
            if !self.check_nic_queue(wire_bytes, force) {
                return (sent, XmitStop::QueueFull);
            }
            let priority = if pkt.offset < msgout.unscheduled {
                peer.unsched_priority(&self.config, msgout.length)
            } else {
                msgout.sched_priority
            };
            let hdr = CommonHeader {
                sport: key.own_port,
                dport: key.peer_port,
                priority: priority + self.config.base_priority,
                id: key.id.0,
            };
            let body = PacketBody::Data {
                message_length: msgout.length,
                incoming: msgout.incoming_for(pkt),
                cutoff_version: peer.cutoff_version.load(Ordering::Acquire),
                retransmit: false,
                segments: msgout.segments_for(pkt, &self.config),
            };
            trace!(id = %key.id, offset = pkt.offset, len = pkt.len, "data out");
            let _ = self.send_packet(key.peer_addr, &hdr, &body);
            metrics::add(&self.metrics.data_bytes_sent, pkt.len as u64);
            msgout.advance();
            sent += 1;
        }
        (sent, XmitStop::Drained)
    }

    /// Post-transmit bookkeeping: throttle on queue refusal, and report
    /// whether a server RPC finished its response and should be freed.
    fn note_xmit_progress(&self, rpc: &mut Rpc, key: &RpcKey, stop: &XmitStop) -> bool {
        match stop {
            XmitStop::QueueFull | XmitStop::Batch => {
                if let Some(msgout) = rpc.msgout.as_ref() {
                    self.enqueue_throttled(key, msgout.bytes_left());
                }
                false
            }
            XmitStop::Drained => {
                self.throttled_remove(key);
                !rpc.is_client
                    && rpc.state == RpcState::Outgoing
                    && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent())
            }
        }
    }

    /// Insert or reposition `key` on the throttled list and wake the
    /// pacer.
    pub(crate) fn enqueue_throttled(&self, key: &RpcKey, bytes_remaining: u32) {
        {
            let mut throttled = self.throttled.lock();
            if let Some(at) = throttled.iter().position(|e| e.key == *key) {
                throttled.remove(at);
            } else {
                metrics::inc(&self.metrics.throttled_rpcs);
            }
            let at = throttled.partition_point(|e| e.bytes_remaining <= bytes_remaining);
            throttled.insert(
                at,
                ThrottledEntry {
                    key: *key,
                    bytes_remaining,
                },
            );
        }
        self.pacer_cond.notify_all();
    }

    pub(crate) fn throttled_remove(&self, key: &RpcKey) {
        self.throttled.lock().retain(|e| e.key != *key);
    }

    /// One pacer iteration. Returns false when the throttled list is
    /// empty and the caller should sleep.
    pub fn pacer_poll(self: &Arc<Self>) -> bool {
        let entry = self.throttled.lock().first().copied();
        let Some(entry) = entry else {
            return false;
        };
        // The entry is only a key; if the RPC is freed between here and
        // the bucket lookup the re-resolution below just misses and the
        // stale entry is dropped.
        let key = entry.key;
        let Some(socket) = self.socket_for(&key) else {
            self.throttled_remove(&key);
            return true;
        };
        if socket.is_shutdown() {
            self.throttled_remove(&key);
            return true;
        }
        let table = if key.is_client {
            &socket.client_rpcs
        } else {
            &socket.server_rpcs
        };
        let bucket = table.bucket(key.id);
        // The bucket lock is ordered above the throttle lock, so the
        // pacer may only try-lock it; a busy bucket means skip this pass.
        let Some(mut guard) = bucket.try_lock() else {
            metrics::inc(&self.metrics.pacer_skipped_rpcs);
            return true;
        };

        self.pacer_active.store(true, Ordering::Release);
        let finished = self.pacer_xmit(&mut guard, &key);
        self.pacer_active.store(false, Ordering::Release);

        if finished {
            let at = guard
                .iter()
                .position(|r| r.id == key.id && r.peer_port == key.peer_port);
            if let Some(at) = at {
                let rpc = guard.swap_remove(at);
                drop(guard);
                socket.free_rpc(self, rpc, &key);
            }
        }
        true
    }

    fn pacer_xmit(self: &Arc<Self>, guard: &mut Vec<Rpc>, key: &RpcKey) -> bool {
        let found = if key.is_client {
            find_client(guard, key.id)
        } else {
            find_server(guard, key.id, key.peer_addr, key.peer_port)
        };
        let Some(rpc) = found else {
            self.throttled_remove(key);
            return false;
        };
        let before = rpc.msgout.as_ref().map(|m| m.sent_bytes()).unwrap_or(0);
        let (_sent, _stop) = self.xmit_rpc_locked(key, rpc, true, PACER_BATCH);
        let after = rpc.msgout.as_ref().map(|m| m.sent_bytes()).unwrap_or(0);
        metrics::add(&self.metrics.pacer_bytes, (after - before) as u64);
        match rpc.msgout.as_ref().and_then(|m| m.next_ready()) {
            // More granted bytes remain: keep the entry, refresh its key.
            Some(_) => {
                if let Some(msgout) = rpc.msgout.as_ref() {
                    self.enqueue_throttled(key, msgout.bytes_left());
                }
                false
            }
            None => {
                self.throttled_remove(key);
                !rpc.is_client
                    && rpc.state == RpcState::Outgoing
                    && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent())
            }
        }
    }

    /// Run the pacer on a dedicated thread until `PacerHandle::stop`.
    pub fn spawn_pacer(self: &Arc<Self>) -> PacerHandle {
        let transport = self.clone();
        let thread = thread::Builder::new()
            .name("srpt-pacer".into())
            .spawn(move || {
                debug!("pacer running");
                loop {
                    if transport.pacer_exit.load(Ordering::Acquire) {
                        break;
                    }
                    if transport.pacer_poll() {
                        thread::yield_now();
                    } else {
                        let mut guard = transport.pacer_mutex.lock();
                        // Re-check under the sleep lock so a wakeup sent
                        // between poll and wait is not lost.
                        if transport.throttled.lock().is_empty()
                            && !transport.pacer_exit.load(Ordering::Acquire)
                        {
                            transport
                                .pacer_cond
                                .wait_for(&mut guard, Duration::from_millis(10));
                        }
                    }
                }
                debug!("pacer stopped");
            })
            .expect("failed to spawn pacer thread");
        PacerHandle {
            thread: Some(thread),
            transport: self.clone(),
        }
    }
}
