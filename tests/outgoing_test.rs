mod common;

use common::{pattern, test_config};
use srpt_rpc::{MessageOut, TransportError};

#[test]
fn test_buffer_geometry() {
    let config = test_config();
    assert_eq!(config.max_seg_payload(), 1000);
    assert_eq!(config.segs_per_buffer(), 10);
    assert_eq!(config.max_gso_data(), 10_000);

    let msgout = MessageOut::new(pattern(0, 25_000), &config).unwrap();
    let geometry: Vec<(u32, u32)> = msgout.packets.iter().map(|p| (p.offset, p.len)).collect();
    assert_eq!(geometry, vec![(0, 10_000), (10_000, 10_000), (20_000, 5_000)]);
}

#[test]
fn test_unscheduled_rounded_to_buffers() {
    let config = test_config();
    // 60 kB is an exact multiple of the buffer size.
    let msgout = MessageOut::new(pattern(0, 200_000), &config).unwrap();
    assert_eq!(msgout.unscheduled, 60_000);
    assert_eq!(msgout.granted, 60_000);

    // A message smaller than the window is entirely unscheduled.
    let small = MessageOut::new(pattern(0, 100), &config).unwrap();
    assert_eq!(small.unscheduled, 100);

    // A message one byte over the window still gets only the window.
    let over = MessageOut::new(pattern(0, 60_001), &config).unwrap();
    assert_eq!(over.unscheduled, 60_000);
    assert_eq!(over.length, 60_001);
}

#[test]
fn test_grants_gate_the_cursor() {
    let config = test_config();
    let mut msgout = MessageOut::new(pattern(0, 100_000), &config).unwrap();
    // The unscheduled window covers the first six buffers.
    for expected in (0..60_000).step_by(10_000) {
        let pkt = msgout.next_ready().expect("unscheduled buffer must be sendable");
        assert_eq!(pkt.offset, expected);
        msgout.advance();
    }
    assert!(msgout.next_ready().is_none());
    msgout.record_grant(70_000, 5);
    let pkt = msgout.next_ready().expect("granted buffer must be sendable");
    assert_eq!(pkt.offset, 60_000);
    assert_eq!(msgout.sched_priority, 5);
}

#[test]
fn test_grant_offsets_never_regress() {
    let config = test_config();
    let mut msgout = MessageOut::new(pattern(0, 100_000), &config).unwrap();
    msgout.record_grant(80_000, 5);
    msgout.record_grant(70_000, 4);
    assert_eq!(msgout.granted, 80_000);
    // Grants are capped at the message length.
    msgout.record_grant(u32::MAX, 3);
    assert_eq!(msgout.granted, 100_000);
}

#[test]
fn test_restart_rewinds_cursor_and_grants() {
    let config = test_config();
    let mut msgout = MessageOut::new(pattern(0, 100_000), &config).unwrap();
    msgout.record_grant(90_000, 5);
    while msgout.next_ready().is_some() {
        msgout.advance();
    }
    assert_eq!(msgout.sent_bytes(), 90_000);
    msgout.restart();
    assert_eq!(msgout.granted, msgout.unscheduled);
    let pkt = msgout.next_ready().expect("restart must rewind to offset 0");
    assert_eq!(pkt.offset, 0);
}

#[test]
fn test_segments_carry_message_bytes() {
    let config = test_config();
    let msgout = MessageOut::new(pattern(0, 12_345), &config).unwrap();
    let mut reassembled = Vec::new();
    for pkt in &msgout.packets {
        for seg in msgout.segments_for(*pkt, &config) {
            assert!(seg.data.len() <= config.max_seg_payload());
            assert_eq!(seg.offset as usize, reassembled.len());
            reassembled.extend_from_slice(&seg.data);
        }
    }
    assert_eq!(reassembled, pattern(0, 12_345));
}

#[test]
fn test_incoming_horizon_per_buffer() {
    let config = test_config();
    let msgout = MessageOut::new(pattern(0, 100_000), &config).unwrap();
    // Early buffers advertise the unscheduled window; later ones the
    // progress of transmission.
    assert_eq!(msgout.incoming_for(msgout.packets[0]), 60_000);
    assert_eq!(msgout.incoming_for(msgout.packets[6]), 70_000);
    assert_eq!(msgout.incoming_for(msgout.packets[9]), 100_000);
}

#[test]
fn test_packets_in_range() {
    let config = test_config();
    let msgout = MessageOut::new(pattern(0, 50_000), &config).unwrap();
    let hit: Vec<u32> = msgout
        .packets_in_range(20_000, 1_000)
        .iter()
        .map(|p| p.offset)
        .collect();
    assert_eq!(hit, vec![20_000]);
    let straddle: Vec<u32> = msgout
        .packets_in_range(9_999, 2)
        .iter()
        .map(|p| p.offset)
        .collect();
    assert_eq!(straddle, vec![0, 10_000]);
}

#[test]
fn test_size_limits() {
    let config = test_config();
    assert_eq!(
        MessageOut::new(Vec::new(), &config).err(),
        Some(TransportError::MessageEmpty)
    );
    let too_big = vec![0u8; config.max_message_size + 1];
    assert_eq!(
        MessageOut::new(too_big, &config).err(),
        Some(TransportError::MessageTooLarge)
    );
    // Exactly the cap is fine.
    assert!(MessageOut::new(vec![0u8; config.max_message_size], &config).is_ok());
}
