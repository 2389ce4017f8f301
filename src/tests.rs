//! Cross-module integration tests: full send/receive flows, adaptive
//! behavior, and the bookkeeping invariants that only show up when the
//! pieces run together.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{Error, FecConfig, FecController, FecStrategy, PathState};

fn controller_with_paths(paths: &[(u32, f64, f64, f64)]) -> FecController {
    let mut ctl = FecController::new(FecConfig::default()).unwrap();
    for &(id, rtt, loss, bw) in paths {
        ctl.add_path(id, PathState::new(id, rtt, loss, bw));
    }
    ctl
}

#[test]
fn test_padding_emits_four_source_frames() {
    // 3000 bytes at block_size 1200 with k=4: three data blocks plus one
    // zero-padded block, then m repair blocks.
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);

    assert!(ctl.send_stream_data(&[0xC3; 3000], 0).unwrap().is_empty());
    let packets = ctl.flush().unwrap();

    let sources: Vec<_> = packets.iter().filter(|p| !p.is_repair).collect();
    assert_eq!(sources.len(), 4);
    assert_eq!(packets.len() - sources.len(), 2);
    assert!(sources[3].frame.payload.iter().all(|&b| b == 0));
}

#[test]
fn test_repair_path_tracks_correlation() {
    let mut ctl = controller_with_paths(&[
        (0, 20.0, 0.01, 100.0),
        (1, 25.0, 0.02, 90.0),
        (2, 30.0, 0.03, 80.0),
    ]);
    ctl.update_loss_correlation(0, 1, 0.9);
    ctl.update_loss_correlation(0, 2, 0.1);

    let packets = ctl.send_stream_data(&[1u8; 4800], 0).unwrap();
    for packet in packets.iter().filter(|p| p.is_repair) {
        assert_eq!(packet.path_id, 2);
    }
}

#[test]
fn test_adaptive_rate_up_shift() {
    let mut config = FecConfig::default();
    config.update_interval = Duration::ZERO;
    let mut ctl = FecController::new(config).unwrap();
    ctl.add_path(0, PathState::new(0, 20.0, 0.02, 100.0));
    ctl.add_path(1, PathState::new(1, 30.0, 0.02, 80.0));
    ctl.periodic_update();

    // Path 0 degrades from 2% to 18% loss.
    ctl.update_path_state(PathState::new(0, 20.0, 0.18, 100.0));
    ctl.periodic_update();

    let decision = ctl.current_decision();
    assert!(
        decision.m as f64 / decision.k as f64 > 0.3,
        "decision {:?} should carry more than 30% redundancy",
        decision
    );
}

#[test]
fn test_all_paths_lossy_send_fails() {
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.9, 100.0), (1, 30.0, 0.9, 80.0)]);
    assert_eq!(
        ctl.send_stream_data(&[1u8; 1200], 0),
        Err(Error::NoPathsAvailable)
    );
}

#[test]
fn test_streamed_groups_recover_under_interleaved_loss() {
    let mut sender = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);
    let mut receiver = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);
    sender.update_loss_correlation(0, 1, 0.3);

    // Stream 5 full groups; drop one source packet per group, a different
    // index each time, and deliver everything else out of order per group.
    let payload_per_group = 4800usize;
    let mut sent_payload = Vec::new();
    let mut recovered_payload = Vec::new();

    for round in 0..5usize {
        let payload: Vec<u8> = (0..payload_per_group)
            .map(|i| ((i + round * 13) % 256) as u8)
            .collect();
        sent_payload.extend_from_slice(&payload);

        let mut packets = sender.send_stream_data(&payload, 0).unwrap();
        assert_eq!(packets.len(), 6);

        // Rotate which source index is lost; deliver repairs first.
        let lost_index = (round % 4) as u32;
        packets.rotate_left(4);
        for packet in packets {
            if !packet.is_repair && packet.frame.header.block_index == lost_index {
                continue;
            }
            let blocks = receiver.receive_fec_frame(&packet.frame.serialize(), packet.path_id);
            for block in blocks {
                recovered_payload.extend_from_slice(&block);
            }
        }
    }

    assert_eq!(recovered_payload, sent_payload);
    assert_eq!(receiver.get_statistics().packets_recovered, 20);
}

#[test]
fn test_duplicate_delivery_does_not_change_output() {
    let mut sender = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);
    let mut receiver = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);

    let payload = vec![0x42u8; 4800];
    let packets = sender.send_stream_data(&payload, 0).unwrap();

    let mut outputs = Vec::new();
    // Deliver every frame twice, in order.
    for packet in packets.iter().chain(packets.iter()) {
        let blocks = receiver.receive_fec_frame(&packet.frame.serialize(), packet.path_id);
        if !blocks.is_empty() {
            outputs.push(blocks);
        }
    }

    // Exactly one decode fired despite the duplicates.
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].concat(), payload);
}

#[test]
fn test_packet_number_spaces_are_independent() {
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);
    ctl.update_loss_correlation(0, 1, 0.2);

    let mut per_path: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for _ in 0..4 {
        for packet in ctl.send_stream_data(&[7u8; 4800], 0).unwrap() {
            per_path
                .entry(packet.path_id)
                .or_default()
                .push(packet.packet_number);
        }
    }

    assert_eq!(per_path.len(), 2);
    for (path_id, numbers) in per_path {
        let expect: Vec<u64> = (1..=numbers.len() as u64).collect();
        assert_eq!(numbers, expect, "path {} numbers must be gap-free", path_id);
    }
}

#[test]
fn test_statistics_accumulate_monotonically() {
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);

    let mut last_total = 0;
    for round in 1..=3u64 {
        ctl.send_stream_data(&[9u8; 4800], 0).unwrap();
        let stats = ctl.get_statistics();
        assert_eq!(stats.fec_groups_created, round);
        assert_eq!(stats.source_packets_sent, 4 * round);
        assert_eq!(stats.repair_packets_sent, 2 * round);
        assert!(stats.total_packets_sent > last_total);
        last_total = stats.total_packets_sent;
        assert!(stats.avg_encoding_time_us >= 0.0);
    }
}

#[test]
fn test_strategy_modes_bound_the_decision() {
    let mut config = FecConfig::default();
    config.update_interval = Duration::ZERO;
    let mut ctl = FecController::new(config).unwrap();
    ctl.add_path(0, PathState::new(0, 40.0, 0.08, 60.0));
    ctl.add_path(1, PathState::new(1, 60.0, 0.08, 40.0));

    ctl.set_fec_strategy(FecStrategy::Conservative);
    ctl.periodic_update();
    let conservative = ctl.current_decision().redundancy_rate;

    ctl.set_fec_strategy(FecStrategy::Aggressive);
    ctl.periodic_update();
    let aggressive = ctl.current_decision().redundancy_rate;

    assert!(
        aggressive > conservative,
        "aggressive {} must exceed conservative {}",
        aggressive,
        conservative
    );
    assert!(aggressive >= 0.4);
    assert!(conservative <= 0.3 + 0.1); // ceiling quantization headroom
}

#[test]
fn test_rate_change_applies_to_new_groups_only() {
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.01, 100.0), (1, 30.0, 0.02, 50.0)]);

    // Seal one group under (4, 2).
    let before = ctl.send_stream_data(&[1u8; 4800], 0).unwrap();
    assert_eq!(before.len(), 6);

    // Reconfigure to (8, 3); the next group seals at 8 blocks.
    ctl.configure(8, 3, 1200).unwrap();
    assert!(ctl.send_stream_data(&[2u8; 4800], 0).unwrap().is_empty());
    let after = ctl.send_stream_data(&[3u8; 4800], 0).unwrap();
    assert_eq!(after.len(), 11);
    assert_eq!(after.iter().filter(|p| p.is_repair).count(), 3);

    // Group ids stayed monotonic across the rate change.
    assert!(after[0].frame.header.group_id > before[0].frame.header.group_id);
}

#[test]
fn test_disabled_fec_keeps_packet_numbers_flowing() {
    let mut ctl = controller_with_paths(&[(0, 20.0, 0.01, 100.0)]);

    let first = ctl.send_stream_data(&[1u8; 4800], 0).unwrap();
    let max_pn = first.iter().map(|p| p.packet_number).max().unwrap();

    ctl.set_fec_enabled(false);
    let bare = ctl.send_stream_data(&[2u8; 100], 0).unwrap();
    assert_eq!(bare.len(), 1);
    assert_eq!(bare[0].packet_number, max_pn + 1);

    ctl.set_fec_enabled(true);
    let resumed = ctl.send_stream_data(&[3u8; 4800], 0).unwrap();
    assert_eq!(resumed[0].packet_number, max_pn + 2);
}
