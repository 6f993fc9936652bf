mod support;

use morpheus_netvsc::protocol::{status, NvspMessage, CHANNEL_TYPE_DATA, INVALID_SECTION_INDEX};
use morpheus_netvsc::transport::TransferRange;
use morpheus_netvsc::{InboundPacket, NetvscConfig, VfAssociation};

use support::*;

fn frame_bytes(len: usize, fill: u8) -> Vec<u8> {
    (0..len).map(|i| fill.wrapping_add(i as u8)).collect()
}

fn tids(completions: &[(u64, u32)]) -> Vec<u64> {
    completions.iter().map(|&(tid, _)| tid).collect()
}

#[test]
fn test_frames_delivered_and_completed() {
    let (device, transport, stack) = bring_up();

    let a = frame_bytes(60, 0x10);
    let b = frame_bytes(1514, 0x80);
    transport.write_recv(0, &a);
    transport.write_recv(1728, &b);
    transport.deliver(1, 77, &[(0, 60), (1728, 1514)]);

    assert_eq!(device.poll(1), 1);

    let st = stack.state();
    assert_eq!(st.delivered, vec![(1, a), (1, b)]);
    drop(st);

    assert_eq!(transport.recv_completions(), vec![(77, status::SUCCESS)]);
    assert_eq!(device.outstanding_recvs(), 0);
    assert_eq!(device.stats().rx_frames, 2);
    device.remove();
}

#[test]
fn test_frame_outside_receive_buffer_fails() {
    let (device, transport, stack) = bring_up();

    transport.deliver(0, 5, &[(0, 60), (BUFFER_SIZE as u32 - 10, 20)]);
    device.poll(0);

    // The valid frame still went up.
    assert_eq!(stack.state().delivered.len(), 1);
    assert_eq!(transport.recv_completions(), vec![(5, status::FAIL)]);
    assert_eq!(device.stats().rx_failed, 1);
    device.remove();
}

#[test]
fn test_rejected_frame_fails_completion() {
    let (device, transport, stack) = bring_up();
    stack.state().reject_frames = true;

    transport.deliver(0, 6, &[(0, 60)]);
    device.poll(0);
    assert_eq!(transport.recv_completions(), vec![(6, status::FAIL)]);
    device.remove();
}

#[test]
fn test_foreign_page_set_dropped() {
    let (device, transport, stack) = bring_up();

    let payload = NvspMessage::SendRndisPacket {
        channel_type: CHANNEL_TYPE_DATA,
        section_index: INVALID_SECTION_INDEX,
        section_size: 0,
    }
    .encode();
    transport.push_inbound(
        0,
        InboundPacket::TransferPages {
            transaction_id: 9,
            pageset_id: 1,
            payload,
            ranges: vec![TransferRange { byte_offset: 0, byte_count: 60 }],
        },
    );
    assert_eq!(device.poll(0), 1);

    assert!(stack.state().delivered.is_empty());
    assert!(transport.recv_completions().is_empty());
    assert_eq!(device.outstanding_recvs(), 0);
    device.remove();
}

#[test]
fn test_deferred_completions_keep_order() {
    let (device, transport, _stack) = bring_up();
    transport.state().block_completions = true;

    for tid in 1..=3 {
        transport.deliver(0, tid, &[(0, 60)]);
    }
    device.poll(0);
    assert!(transport.recv_completions().is_empty());
    assert_eq!(device.pending_recv_completions(0), 3);
    assert_eq!(device.outstanding_recvs(), 3);

    transport.state().block_completions = false;
    device.poll(0);
    assert_eq!(tids(&transport.recv_completions()), vec![1, 2, 3]);
    assert_eq!(device.pending_recv_completions(0), 0);
    assert_eq!(device.outstanding_recvs(), 0);
    device.remove();
}

#[test]
fn test_full_ring_sends_inline() {
    let config = NetvscConfig { recv_completion_slots: 4, ..test_config() };
    let (device, transport, _stack) = bring_up_with(PeerState::default(), config);

    transport.state().block_completions = true;
    for tid in 1..=3 {
        transport.deliver(0, tid, &[(0, 60)]);
    }
    device.poll(0);
    assert_eq!(device.pending_recv_completions(0), 3);

    transport.state().block_completions = false;
    transport.deliver(0, 4, &[(0, 60)]);
    device.poll(0);

    // The overflowing completion went out first, the queued ones after.
    assert_eq!(tids(&transport.recv_completions()), vec![4, 1, 2, 3]);
    assert_eq!(device.stats().rx_inline_completions, 1);
    assert_eq!(device.stats().rx_lost_completions, 0);
    assert_eq!(device.outstanding_recvs(), 0);
    device.remove();
}

#[test]
fn test_full_ring_and_blocked_channel_loses_completion() {
    let config = NetvscConfig { recv_completion_slots: 4, ..test_config() };
    let (device, transport, _stack) = bring_up_with(PeerState::default(), config);

    transport.state().block_completions = true;
    for tid in 1..=4 {
        transport.deliver(0, tid, &[(0, 60)]);
    }
    device.poll(0);

    assert_eq!(device.pending_recv_completions(0), 3);
    assert_eq!(device.outstanding_recvs(), 3);
    assert_eq!(device.stats().rx_lost_completions, 1);

    transport.state().block_completions = false;
    device.poll(0);
    assert_eq!(tids(&transport.recv_completions()), vec![1, 2, 3]);
    device.remove();
}

#[test]
fn test_watermark_drains_before_queueing() {
    let config = NetvscConfig { recv_completion_slots: 10, ..test_config() };
    let (device, transport, _stack) = bring_up_with(PeerState::default(), config);

    transport.state().block_completions = true;
    for tid in 1..=9 {
        transport.deliver(0, tid, &[(0, 60)]);
    }
    device.poll(0);
    assert_eq!(device.pending_recv_completions(0), 9);

    // Nine outstanding is over 80% of ten sub-allocations: the backlog is
    // pushed out before the new completion is queued, so no inline send.
    transport.state().block_completions = false;
    transport.deliver(0, 10, &[(0, 60)]);
    device.poll(0);

    assert_eq!(tids(&transport.recv_completions()), (1..=10).collect::<Vec<u64>>());
    assert_eq!(device.stats().rx_inline_completions, 0);
    device.remove();
}

#[test]
fn test_send_table_update() {
    let (device, transport, _stack) = bring_up();
    assert_eq!(device.send_table(), None);

    let table: Vec<u32> = (0..16).map(|i| i % 2).collect();
    let payload = NvspMessage::SendIndirectionTable { table: table.clone() }.encode();
    transport.push_inbound(0, InboundPacket::Inband { request_id: 0, payload });
    device.poll(0);
    assert_eq!(device.send_table().map(|t| t.to_vec()), Some(table.clone()));

    // Wrong size is ignored and the previous table kept.
    let payload = NvspMessage::SendIndirectionTable { table: vec![1; 15] }.encode();
    transport.push_inbound(0, InboundPacket::Inband { request_id: 0, payload });
    device.poll(0);
    assert_eq!(device.send_table().map(|t| t.to_vec()), Some(table));
    device.remove();
}

#[test]
fn test_vf_association() {
    let (device, transport, _stack) = bring_up();
    assert_eq!(device.vf_association(), None);

    let payload = NvspMessage::VfAssociation { allocated: 1, serial: 42 }.encode();
    transport.push_inbound(0, InboundPacket::Inband { request_id: 0, payload });
    device.poll(0);
    assert_eq!(device.vf_association(), Some(VfAssociation { allocated: true, serial: 42 }));
    device.remove();
}

#[test]
fn test_inbound_ignored_once_drained_for_removal() {
    let (device, transport, stack) = bring_up();
    device.begin_remove();

    transport.deliver(0, 3, &[(0, 60)]);
    assert_eq!(device.poll(0), 0);
    assert!(stack.state().delivered.is_empty());
    assert!(transport.recv_completions().is_empty());
    device.remove();
}

#[test]
fn test_stray_packets_ignored() {
    let (device, transport, _stack) = bring_up();

    let payload = NvspMessage::SendRndisPacketComplete { status: status::SUCCESS }.encode();
    transport.push_inbound(0, InboundPacket::Completion { request_id: 0xDEAD, payload });
    transport.push_inbound(0, InboundPacket::Other { packet_type: 0x11, request_id: 1 });
    transport.push_inbound(0, InboundPacket::Completion { request_id: 2, payload: vec![1, 2] });

    assert_eq!(device.poll(0), 3);
    assert_eq!(device.outstanding_sends(), 0);
    device.remove();
}
