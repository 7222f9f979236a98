use srpt_rpc::TransportError;
use srpt_rpc::wire::{
    self, COMMON_HEADER_LEN, CommonHeader, MAX_PRIORITIES, MIN_PACKET_LEN, PacketBody, PacketType,
    Segment,
};

fn header() -> CommonHeader {
    CommonHeader {
        sport: 0x8001,
        dport: 77,
        priority: 6,
        id: 0x1122_3344_5566_7788,
    }
}

#[test]
fn test_data_round_trip() {
    let body = PacketBody::Data {
        message_length: 50_000,
        incoming: 60_000,
        cutoff_version: 3,
        retransmit: true,
        segments: vec![
            Segment {
                offset: 0,
                data: vec![1; 1000],
            },
            Segment {
                offset: 1000,
                data: vec![2; 500],
            },
        ],
    };
    let datagram = wire::encode(&header(), &body);
    let (hdr, decoded) = wire::decode(&datagram).unwrap();
    assert_eq!(hdr, header());
    assert_eq!(decoded, body);
}

#[test]
fn test_control_round_trips() {
    let bodies = [
        PacketBody::Grant {
            offset: 70_000,
            priority: 5,
        },
        PacketBody::Resend {
            offset: 20_000,
            length: 1_000,
            priority: 7,
        },
        PacketBody::Restart,
        PacketBody::Busy,
        PacketBody::Freeze,
        PacketBody::Cutoffs {
            cutoffs: [u32::MAX, 1 << 20, 1 << 18, 1 << 16, 1 << 14, 8192, 4096, 1400],
            version: 9,
        },
    ];
    for body in bodies {
        let datagram = wire::encode(&header(), &body);
        let (hdr, decoded) = wire::decode(&datagram).unwrap();
        assert_eq!(hdr, header());
        assert_eq!(decoded, body, "{:?}", body.packet_type());
    }
}

#[test]
fn test_minimum_padding() {
    for body in [
        PacketBody::Restart,
        PacketBody::Busy,
        PacketBody::Freeze,
        PacketBody::Grant {
            offset: 1,
            priority: 0,
        },
        PacketBody::Data {
            message_length: 4,
            incoming: 4,
            cutoff_version: 0,
            retransmit: false,
            segments: vec![Segment {
                offset: 0,
                data: vec![0xab; 4],
            }],
        },
    ] {
        let datagram = wire::encode(&header(), &body);
        assert!(
            datagram.len() >= MIN_PACKET_LEN,
            "{:?} shorter than minimum",
            body.packet_type()
        );
    }
}

#[test]
fn test_tcp_mirrored_field_offsets() {
    let datagram = wire::encode(&header(), &PacketBody::Busy);
    // Source and destination port sit where TCP puts them.
    assert_eq!(u16::from_be_bytes([datagram[0], datagram[1]]), 0x8001);
    assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 77);
    // The words at TCP's seq/ack offsets stay zero.
    assert_eq!(&datagram[4..12], &[0u8; 8]);
    // The checksum slot at TCP's offset is never filled in.
    assert_eq!(&datagram[16..18], &[0u8; 2]);
    // doff's high nibble carries the header size in 32-bit words.
    assert_eq!(datagram[12] >> 4, (COMMON_HEADER_LEN / 4) as u8);
    assert_eq!(datagram[13], PacketType::Busy as u8);
}

#[test]
fn test_short_packet_rejected() {
    assert_eq!(
        wire::decode(&[0u8; 10]),
        Err(TransportError::PacketTooShort)
    );
}

#[test]
fn test_unknown_type_rejected() {
    let mut datagram = wire::encode(&header(), &PacketBody::Busy);
    datagram[13] = 0x77;
    assert_eq!(
        wire::decode(&datagram),
        Err(TransportError::UnknownPacketType(0x77))
    );
}

#[test]
fn test_truncated_segment_rejected() {
    let body = PacketBody::Data {
        message_length: 5_000,
        incoming: 5_000,
        cutoff_version: 0,
        retransmit: false,
        segments: vec![Segment {
            offset: 0,
            data: vec![7; 2000],
        }],
    };
    let datagram = wire::encode(&header(), &body);
    // Chop the payload mid-segment.
    assert!(wire::decode(&datagram[..datagram.len() - 100]).is_err());
}

#[test]
fn test_data_without_segments_rejected() {
    let body = PacketBody::Data {
        message_length: 5_000,
        incoming: 5_000,
        cutoff_version: 0,
        retransmit: false,
        segments: vec![Segment {
            offset: 0,
            data: vec![7; 100],
        }],
    };
    let mut datagram = wire::encode(&header(), &body);
    // Zero out the segment header: decode should see no segments at all.
    for byte in &mut datagram[44..] {
        *byte = 0;
    }
    assert!(matches!(
        wire::decode(&datagram),
        Err(TransportError::MalformedPacket(_))
    ));
}

#[test]
fn test_cutoffs_cover_all_priority_levels() {
    let cutoffs = [8, 7, 6, 5, 4, 3, 2, 1];
    let datagram = wire::encode(&header(), &PacketBody::Cutoffs { cutoffs, version: 1 });
    let (_, decoded) = wire::decode(&datagram).unwrap();
    match decoded {
        PacketBody::Cutoffs {
            cutoffs: roundtrip,
            version,
        } => {
            assert_eq!(roundtrip.len(), MAX_PRIORITIES);
            assert_eq!(roundtrip, cutoffs);
            assert_eq!(version, 1);
        }
        other => panic!("wrong body: {other:?}"),
    }
}
