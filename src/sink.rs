use std::fmt::Debug;
use std::net::IpAddr;

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::error::TransportError;

/// The raw packet-injection boundary.
///
/// The engine hands every encoded datagram to a `PacketSink`; IP framing,
/// VLAN priority mapping and the actual device queue live behind it.
pub trait PacketSink: Send + Sync + Debug {
    /// Transmit one datagram to `dst`.
    fn send(&self, dst: IpAddr, datagram: &[u8]) -> Result<(), TransportError>;

    /// Resolve a route to `dst`. Called once when a peer entry is created;
    /// a failure aborts every RPC bound for that peer.
    fn resolve(&self, _dst: IpAddr) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A sink that hands every datagram to a channel. Used by the test
/// harnesses to observe emitted traffic.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<(IpAddr, Vec<u8>)>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<(IpAddr, Vec<u8>)>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, dst: IpAddr, datagram: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send((dst, datagram.to_vec()))
            .map_err(|_| TransportError::SendFailed)
    }
}
