#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use rand::SeedableRng;
use rand::rngs::StdRng;
use srpt_rpc::wire::{self, CommonHeader, DATA_HEADER_LEN, IPV4_HEADER_LEN, PacketBody,
    SEG_HEADER_LEN, Segment};
use srpt_rpc::{ChannelSink, Config, ManualTimeSource, Transport};

pub const CYCLES_PER_SECOND: u64 = 1_000_000_000;

/// A config with round numbers: 1000-byte segments, ten segments per
/// packet buffer (so 10 kB buffers), a 60 kB unscheduled window and 10 kB
/// grants.
pub fn test_config() -> Config {
    let mtu = IPV4_HEADER_LEN + DATA_HEADER_LEN + SEG_HEADER_LEN + 1000;
    Config {
        mtu,
        max_gso_size: 10 * mtu,
        rtt_bytes: 60_000,
        grant_increment: 10_000,
        ..Config::default()
    }
}

/// One transport with a manual clock and a capturing sink.
pub struct Node {
    pub transport: Arc<Transport>,
    pub time: Arc<ManualTimeSource>,
    pub rx: Receiver<(IpAddr, Vec<u8>)>,
    pub addr: IpAddr,
}

pub fn node(config: Config, addr: &str) -> Node {
    let time = Arc::new(ManualTimeSource::new(CYCLES_PER_SECOND));
    let (sink, rx) = ChannelSink::new();
    let mut rng = StdRng::seed_from_u64(0xfeed);
    let transport = Transport::new(config, time.clone(), Arc::new(sink), &mut rng)
        .expect("config must validate");
    Node {
        transport,
        time,
        rx,
        addr: addr.parse().expect("test address"),
    }
}

pub fn node_with_seed(config: Config, addr: &str, seed: u64) -> Node {
    let time = Arc::new(ManualTimeSource::new(CYCLES_PER_SECOND));
    let (sink, rx) = ChannelSink::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let transport = Transport::new(config, time.clone(), Arc::new(sink), &mut rng)
        .expect("config must validate");
    Node {
        transport,
        time,
        rx,
        addr: addr.parse().expect("test address"),
    }
}

impl Node {
    /// Everything this node has emitted since the last drain, decoded.
    pub fn drain(&self) -> Vec<(IpAddr, CommonHeader, PacketBody)> {
        let mut out = Vec::new();
        while let Ok((dst, datagram)) = self.rx.try_recv() {
            let (hdr, body) = wire::decode(&datagram).expect("emitted packets must decode");
            out.push((dst, hdr, body));
        }
        out
    }
}

/// Shuttle packets between two nodes until both go quiet, recording every
/// packet as `(from_a, header, body)`.
pub fn pump(a: &Node, b: &Node) -> Vec<(bool, CommonHeader, PacketBody)> {
    let mut log = Vec::new();
    for _ in 0..10_000 {
        let mut moved = false;
        while let Ok((dst, datagram)) = a.rx.try_recv() {
            let (hdr, body) = wire::decode(&datagram).expect("emitted packets must decode");
            log.push((true, hdr, body));
            if dst == b.addr {
                b.transport.deliver(a.addr, &datagram);
            }
            moved = true;
        }
        while let Ok((dst, datagram)) = b.rx.try_recv() {
            let (hdr, body) = wire::decode(&datagram).expect("emitted packets must decode");
            log.push((false, hdr, body));
            if dst == a.addr {
                a.transport.deliver(b.addr, &datagram);
            }
            moved = true;
        }
        if !moved {
            return log;
        }
    }
    panic!("pump did not converge");
}

/// Build a DATA packet the way a remote sender would.
pub fn data_packet(
    sport: u16,
    dport: u16,
    id: u64,
    message_length: u32,
    incoming: u32,
    segments: Vec<Segment>,
) -> Vec<u8> {
    let hdr = CommonHeader {
        sport,
        dport,
        priority: 0,
        id,
    };
    wire::encode(
        &hdr,
        &PacketBody::Data {
            message_length,
            incoming,
            cutoff_version: 1,
            retransmit: false,
            segments,
        },
    )
}

/// A single run of `len` bytes starting at `offset`, with recognizable
/// contents.
pub fn segment(offset: u32, len: u32) -> Segment {
    Segment {
        offset,
        data: pattern(offset, len),
    }
}

/// Deterministic payload so reassembly mistakes show up as content
/// mismatches.
pub fn pattern(offset: u32, len: u32) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 251) as u8).collect()
}
