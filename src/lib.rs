//! # srpt-rpc
//!
//! A receiver-driven, priority-scheduled, message-oriented RPC transport
//! engine for datagram networks.
//!
//! The receiver is in charge of bandwidth: beyond a configurable
//! unscheduled window, a sender only transmits bytes the receiver has
//! granted, and grants always go to the message with the fewest bytes
//! remaining (SRPT), a bounded number of senders at a time. On the
//! sending side a pacer keeps the NIC queue short enough that a newly
//! granted short message can preempt a long one already draining.
//!
//! ## Architecture
//!
//! - **Sockets and RPCs**: each socket owns hash-bucket tables of its
//!   client- and server-side RPCs; a bucket's lock is also the lock for
//!   every RPC in it.
//! - **Grant scheduler**: one list of scheduled inbound messages, sorted
//!   by bytes remaining; the top `max_overcommit` entries receive grants.
//! - **Pacer**: an atomic cycle-count estimate of NIC-queue depth; RPCs
//!   the estimator refuses drain through a throttled list on a dedicated
//!   thread.
//! - **Recovery**: a tick-driven timer emits RESENDs for silent RPCs;
//!   servers answer RESENDs for forgotten RPCs with RESTART, and the
//!   client replays the request from the beginning.
//!
//! The engine is I/O-agnostic: packets leave through a [`PacketSink`] and
//! time comes from a [`TimeSource`], so the whole protocol runs under
//! deterministic test harnesses.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod grant;
pub mod incoming;
pub mod metrics;
pub mod outgoing;
pub mod pacer;
pub mod peer;
pub mod rpc;
pub mod sink;
pub mod socket;
pub mod time;
pub mod timer;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::TransportError;
pub use incoming::MessageIn;
pub use outgoing::MessageOut;
pub use pacer::PacerHandle;
pub use rpc::{RpcId, RpcState};
pub use sink::{ChannelSink, PacketSink};
pub use socket::{Message, MessageKind, RecvFlags, Socket};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use transport::Transport;
