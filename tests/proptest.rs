mod common;

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use srpt_rpc::wire::{self, CommonHeader, PacketBody, Segment};
use srpt_rpc::{MessageIn, MessageOut};

fn arb_header() -> impl Strategy<Value = CommonHeader> {
    (any::<u16>(), any::<u16>(), 0u8..8, any::<u64>()).prop_map(|(sport, dport, priority, id)| {
        CommonHeader {
            sport,
            dport,
            priority,
            id,
        }
    })
}

fn arb_segments() -> impl Strategy<Value = Vec<Segment>> {
    proptest::collection::vec(
        (any::<u32>(), proptest::collection::vec(any::<u8>(), 1..600)),
        1..4,
    )
    .prop_map(|segs| {
        segs.into_iter()
            .map(|(offset, data)| Segment { offset, data })
            .collect()
    })
}

fn arb_body() -> impl Strategy<Value = PacketBody> {
    prop_oneof![
        (any::<u32>(), any::<u32>(), any::<u16>(), any::<bool>(), arb_segments()).prop_map(
            |(message_length, incoming, cutoff_version, retransmit, segments)| {
                PacketBody::Data {
                    message_length,
                    incoming,
                    cutoff_version,
                    retransmit,
                    segments,
                }
            }
        ),
        (any::<u32>(), 0u8..8).prop_map(|(offset, priority)| PacketBody::Grant {
            offset,
            priority
        }),
        (any::<u32>(), any::<u32>(), 0u8..8).prop_map(|(offset, length, priority)| {
            PacketBody::Resend {
                offset,
                length,
                priority,
            }
        }),
        Just(PacketBody::Restart),
        Just(PacketBody::Busy),
        Just(PacketBody::Freeze),
        (proptest::array::uniform8(any::<u32>()), any::<u16>()).prop_map(|(cutoffs, version)| {
            PacketBody::Cutoffs { cutoffs, version }
        }),
    ]
}

proptest! {
    /// Every packet survives encode/decode unchanged, and every encoding
    /// meets the minimum-size rule.
    #[test]
    fn prop_codec_round_trip(hdr in arb_header(), body in arb_body()) {
        let datagram = wire::encode(&hdr, &body);
        prop_assert!(datagram.len() >= wire::MIN_PACKET_LEN);
        let (decoded_hdr, decoded_body) = wire::decode(&datagram).unwrap();
        prop_assert_eq!(decoded_hdr, hdr);
        prop_assert_eq!(decoded_body, body);
    }

    /// Segmenting a message and reassembling the segments in any order
    /// reproduces the message exactly.
    #[test]
    fn prop_segment_reassemble_identity(
        payload in proptest::collection::vec(any::<u8>(), 1..40_000),
        shuffle_seed in any::<u64>(),
    ) {
        let config = common::test_config();
        let msgout = MessageOut::new(payload.clone(), &config).unwrap();
        let mut segments: Vec<Segment> = msgout
            .packets
            .iter()
            .flat_map(|pkt| msgout.segments_for(*pkt, &config))
            .collect();
        segments.shuffle(&mut StdRng::seed_from_u64(shuffle_seed));

        let total = payload.len() as u32;
        let mut msgin = MessageIn::new(total, total);
        let mut accepted = 0u32;
        for seg in segments {
            accepted += msgin.add_segment(seg.offset, seg.data);
        }
        prop_assert_eq!(accepted, total);
        prop_assert!(msgin.is_complete());
        prop_assert_eq!(msgin.assemble(), payload);
    }

    /// Duplicated segments change nothing: conservation holds under
    /// arbitrary replay.
    #[test]
    fn prop_duplicate_replay_is_inert(
        payload in proptest::collection::vec(any::<u8>(), 1..20_000),
        replay_seed in any::<u64>(),
    ) {
        let config = common::test_config();
        let msgout = MessageOut::new(payload.clone(), &config).unwrap();
        let segments: Vec<Segment> = msgout
            .packets
            .iter()
            .flat_map(|pkt| msgout.segments_for(*pkt, &config))
            .collect();

        let total = payload.len() as u32;
        let mut msgin = MessageIn::new(total, total);
        for seg in &segments {
            msgin.add_segment(seg.offset, seg.data.clone());
        }
        // Replay a random half of the segments again.
        let mut rng = StdRng::seed_from_u64(replay_seed);
        let mut replayed = segments.clone();
        replayed.shuffle(&mut rng);
        for seg in replayed.into_iter().take(segments.len() / 2) {
            prop_assert_eq!(msgin.add_segment(seg.offset, seg.data), 0);
        }
        prop_assert_eq!(msgin.bytes_received(), total);
        prop_assert_eq!(msgin.assemble(), payload);
    }
}
