//! Synchronization engine integration tests
//!
//! Two mono 48kHz/16-bit ports with a 10ms threshold (960 bytes per channel).

mod helpers;

use helpers::*;
use streamsync_common::{
    EngineEvent, GroupMode, Marker, MarkerKind, MarkerPool, PortDirection, PortState, StreamData,
};
use streamsync_engine::config::SyncConfig;
use streamsync_engine::sync::SyncState;
use streamsync_engine::{EngineError, ProcessOutcome, StreamEngine, SyncEngine};

fn frame_config() -> SyncConfig {
    SyncConfig {
        max_input_ports: 2,
        ..SyncConfig::default()
    }
}

/// Both ports deliver a full first frame and become synced
fn synced_harness(config: SyncConfig) -> Harness<SyncEngine> {
    let mut h = sync_harness(config);
    let (result, _, outputs) = h.cycle(
        vec![Some(pcm(FRAME_BYTES, 0xA1)), Some(pcm(FRAME_BYTES, 0xB1))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    for out in outputs.iter().flatten() {
        assert_eq!(out.len_per_ch() as usize, FRAME_BYTES);
    }
    assert!(h.engine.input(0).unwrap().ext.has_sent_output());
    assert!(h.engine.input(1).unwrap().ext.has_sent_output());
    h.drain_events();
    h
}

fn release(pool: &mut MarkerPool, buffers: &mut [Option<StreamData>]) {
    for sd in buffers.iter_mut().flatten() {
        pool.destroy_all(&mut sd.metadata, false);
    }
}

#[test]
fn test_threshold_from_frame_duration() {
    let h = sync_harness(frame_config());
    let port = h.engine.input(0).unwrap();
    assert_eq!(port.ext.threshold_bytes_per_ch() as usize, FRAME_BYTES);
    assert_eq!(port.peer().map(|p| p.index), Some(0));
    assert_eq!(h.engine.output(1).unwrap().peer().map(|p| p.index), Some(1));
}

#[test]
fn test_output_withheld_until_lagging_port_fills() {
    let mut h = synced_harness(frame_config());

    // A delivers half a frame, B a full one: nothing may leave
    let (result, inputs, outputs) = h.cycle(
        vec![Some(pcm(HALF_FRAME_BYTES, 0xA2)), Some(pcm(FRAME_BYTES, 0xB2))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::NeedMoreData);
    assert!(outputs.iter().flatten().all(|o| o.len_per_ch() == 0));
    // Input was taken into the internal buffers, not dropped
    assert_eq!(inputs[0].as_ref().unwrap().len_per_ch() as usize, HALF_FRAME_BYTES);
    assert_eq!(inputs[1].as_ref().unwrap().len_per_ch() as usize, FRAME_BYTES);

    // A catches up; both frames leave together
    let (result, _, outputs) = h.cycle(
        vec![Some(pcm(HALF_FRAME_BYTES, 0xA3)), None],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    let out_a = outputs[0].as_ref().unwrap();
    let out_b = outputs[1].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch() as usize, FRAME_BYTES);
    assert_eq!(out_b.len_per_ch() as usize, FRAME_BYTES);
    assert!(out_a.bufs[0].as_slice()[..HALF_FRAME_BYTES].iter().all(|&b| b == 0xA2));
    assert!(out_a.bufs[0].as_slice()[HALF_FRAME_BYTES..].iter().all(|&b| b == 0xA3));
    assert!(out_b.bufs[0].as_slice().iter().all(|&b| b == 0xB2));
}

#[test]
fn test_fresh_ports_align_first_frame_with_leading_zeros() {
    let mut h = sync_harness(frame_config());

    let stamped = |len: usize, value: u8, ts: i64| {
        let mut sd = pcm(len, value);
        sd.timestamp = ts;
        sd.flags.timestamp_valid = true;
        sd
    };

    // Neither port has delivered a frame yet; B fills one, A has half
    let (result, _, outputs) = h.cycle(
        vec![Some(stamped(HALF_FRAME_BYTES, 0xA1, 15_000)), Some(pcm(FRAME_BYTES, 0xB1))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);

    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch() as usize, FRAME_BYTES, "Never a short frame without EOS or gap");
    assert!(!out_a.flags.end_of_frame);
    assert!(out_a.bufs[0].as_slice()[..HALF_FRAME_BYTES].iter().all(|&b| b == 0));
    assert!(out_a.bufs[0].as_slice()[HALF_FRAME_BYTES..].iter().all(|&b| b == 0xA1));
    assert!(out_a.flags.timestamp_valid);
    assert_eq!(out_a.timestamp, 10_000, "Backdated by the 5ms of padding");
    assert_eq!(outputs[1].as_ref().unwrap().len_per_ch() as usize, FRAME_BYTES);
    assert!(h.engine.input(0).unwrap().ext.has_sent_output());

    // Both ports now run in lockstep
    let (result, _, outputs) = h.cycle(
        vec![Some(stamped(FRAME_BYTES, 0xA2, 20_000)), Some(pcm(FRAME_BYTES, 0xB2))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch() as usize, FRAME_BYTES);
    assert!(out_a.bufs[0].as_slice().iter().all(|&b| b == 0xA2));
    assert_eq!(out_a.timestamp, 20_000);
}

#[test]
fn test_end_of_stream_drains_lagging_port() {
    let mut h = synced_harness(frame_config());

    let (result, _, _) = h.cycle(
        vec![Some(pcm(HALF_FRAME_BYTES, 0xA2)), Some(pcm(FRAME_BYTES, 0xB2))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::NeedMoreData);

    let mut eos_input = pcm(0, 0);
    end_stream(&mut h.pool, &mut eos_input, None);
    let (result, _, mut outputs) = h.cycle(
        vec![Some(eos_input), None],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);

    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch() as usize, FRAME_BYTES, "Padded to a full frame");
    assert!(out_a.bufs[0].as_slice()[..HALF_FRAME_BYTES].iter().all(|&b| b == 0xA2));
    assert!(out_a.bufs[0].as_slice()[HALF_FRAME_BYTES..].iter().all(|&b| b == 0));
    assert!(out_a.flags.end_of_frame);
    assert!(out_a.flags.marker_eos);

    let eos: Vec<&Marker> = h.pool.iter(&out_a.metadata).map(|(_, m)| m).collect();
    assert_eq!(eos.len(), 1);
    assert!(eos[0].kind.is_flushing_eos());
    assert_eq!(eos[0].offset, 480, "End-of-stream sits at the end of the frame");

    assert_eq!(outputs[1].as_ref().unwrap().len_per_ch() as usize, FRAME_BYTES);
    assert_eq!(h.engine.input(0).unwrap().state(), PortState::Stopped);
    assert_eq!(h.engine.input(1).unwrap().state(), PortState::Started);
    release(&mut h.pool, &mut outputs);
}

#[test]
fn test_data_flow_gap_stops_port() {
    let mut h = synced_harness(frame_config());

    let mut gapped = pcm(HALF_FRAME_BYTES, 0xA2);
    h.pool
        .push_back(&mut gapped.metadata, Marker::new(MarkerKind::DataFlowGap).with_offset(240))
        .unwrap();
    let (result, _, mut outputs) = h.cycle(
        vec![Some(gapped), Some(pcm(FRAME_BYTES, 0xB2))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);

    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch() as usize, HALF_FRAME_BYTES, "Gap flushes a short frame");
    assert!(out_a.flags.end_of_frame);
    assert!(h.pool.has_dfg(&out_a.metadata));
    assert_eq!(h.engine.input(0).unwrap().state(), PortState::Stopped);
    assert_eq!(h.engine.input(1).unwrap().state(), PortState::Started);
    release(&mut h.pool, &mut outputs);
}

#[test]
fn test_late_joiner_padded_with_leading_zeros() {
    let mut h = sync_harness(frame_config());
    h.engine.port_stop(&mut h.pool, PortDirection::Input, 1).unwrap();

    let (result, _, outputs) = h.cycle(
        vec![Some(pcm(FRAME_BYTES, 0xA1)), None],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    assert_eq!(outputs[0].as_ref().unwrap().len_per_ch() as usize, FRAME_BYTES);
    assert_eq!(outputs[1].as_ref().unwrap().len_per_ch(), 0);
    h.drain_events();

    h.engine.port_will_start(&mut h.pool, 1).unwrap();
    assert!(h.engine.is_threshold_disabled());
    let events = h.drain_events();
    assert!(events.contains(&EngineEvent::ThresholdToggled { enabled: false }));
    let policy = h.engine.published_policy().unwrap();
    assert_eq!(policy.mode, GroupMode::AnyPort);
    assert_eq!(policy.groups.len(), 2);

    // B starts with half a frame; it is aligned to A's frame boundary
    let (result, _, outputs) = h.cycle(
        vec![Some(pcm(FRAME_BYTES, 0xA2)), Some(pcm(HALF_FRAME_BYTES, 0xB1))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    assert_eq!(h.engine.input(1).unwrap().state(), PortState::Started);

    let out_b = outputs[1].as_ref().unwrap();
    assert_eq!(out_b.len_per_ch() as usize, FRAME_BYTES);
    assert!(out_b.bufs[0].as_slice()[..HALF_FRAME_BYTES].iter().all(|&b| b == 0));
    assert!(out_b.bufs[0].as_slice()[HALF_FRAME_BYTES..].iter().all(|&b| b == 0xB1));
    assert_eq!(outputs[0].as_ref().unwrap().len_per_ch() as usize, FRAME_BYTES);

    assert!(!h.engine.is_threshold_disabled());
    assert_eq!(h.engine.sync_state(), SyncState::Synced);
    let events = h.drain_events();
    assert!(events.contains(&EngineEvent::ThresholdToggled { enabled: true }));
    assert_eq!(h.engine.published_policy().unwrap().mode, GroupMode::AllPorts);
}

#[test]
fn test_will_start_ignored_for_synced_port() {
    let mut h = synced_harness(frame_config());
    h.engine.port_will_start(&mut h.pool, 0).unwrap();
    assert!(!h.engine.is_threshold_disabled());
    assert!(h.drain_events().is_empty());
}

#[test]
fn test_close_arms_end_of_stream_on_peer_output() {
    let mut h = synced_harness(frame_config());

    h.engine.port_close(&mut h.pool, PortDirection::Input, 0).unwrap();
    assert!(h.engine.output(0).unwrap().peer().is_none());

    let (result, _, mut outputs) = h.cycle(
        vec![None, None],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);

    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch(), 0);
    assert!(out_a.flags.marker_eos);
    assert!(out_a.flags.end_of_frame);
    assert!(h.pool.find_eos(&out_a.metadata).is_some());
    assert!(outputs[1].as_ref().unwrap().metadata.is_empty());
    release(&mut h.pool, &mut outputs);

    // Armed once only
    let (_, _, outputs) = h.cycle(vec![None, None], vec![Some(output(1, FRAME_BYTES)), None]);
    assert!(outputs[0].as_ref().unwrap().metadata.is_empty());
}

#[test]
fn test_close_of_idle_input_arms_nothing() {
    let mut h = sync_harness(frame_config());
    h.engine.port_close(&mut h.pool, PortDirection::Input, 0).unwrap();

    let (_, _, outputs) = h.cycle(vec![None, None], vec![Some(output(1, FRAME_BYTES)), None]);
    let out_a = outputs[0].as_ref().unwrap();
    assert!(out_a.metadata.is_empty());
    assert!(!out_a.flags.marker_eos);
}

#[test]
fn test_module_enable_follows_open_inputs() {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut pool = MarkerPool::new();
    let mut engine = SyncEngine::new(frame_config(), Box::new(tx)).unwrap();

    engine.port_open(PortDirection::Output, 0, 0).unwrap();
    engine.port_open(PortDirection::Input, 0, 1).unwrap();
    engine.set_input_media_format(&mut pool, 0, mono()).unwrap();
    engine.set_container_frame_duration(&mut pool, FRAME_US).unwrap();
    engine.port_start(PortDirection::Input, 0).unwrap();

    let mut inputs = vec![None, None];
    let mut outputs = vec![Some(output(1, FRAME_BYTES)), None];
    engine.process(&mut pool, &mut inputs, &mut outputs).unwrap();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(
        events.contains(&EngineEvent::ModuleEnable { enabled: false }),
        "A single idle input has nothing to align"
    );

    engine.port_open(PortDirection::Input, 1, 2).unwrap();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(events.contains(&EngineEvent::ModuleEnable { enabled: true }));
}

#[test]
fn test_best_effort_port_drops_oldest_data() {
    let config = SyncConfig {
        best_effort_port_ids: vec![2],
        ..frame_config()
    };

    for (config, expected_consumed) in [(config, FRAME_BYTES), (frame_config(), 96)] {
        let mut h = synced_harness(config);
        let (result, _, _) = h.cycle(
            vec![Some(pcm(HALF_FRAME_BYTES, 0xA2)), Some(pcm(FRAME_BYTES, 0xB2))],
            vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
        );
        assert_eq!(result.unwrap(), ProcessOutcome::NeedMoreData);

        // B's buffer holds one frame plus 1ms of slack
        let (result, inputs, _) = h.cycle(
            vec![None, Some(pcm(FRAME_BYTES, 0xB3))],
            vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
        );
        assert_eq!(result.unwrap(), ProcessOutcome::NeedMoreData);
        assert_eq!(inputs[1].as_ref().unwrap().len_per_ch() as usize, expected_consumed);
    }
}

#[test]
fn test_timestamps_follow_data_and_drop_discontinuity() {
    let mut h = sync_harness(frame_config());

    let stamped = |len: usize, value: u8, ts: i64| {
        let mut sd = pcm(len, value);
        sd.timestamp = ts;
        sd.flags.timestamp_valid = true;
        sd
    };

    let (result, _, outputs) = h.cycle(
        vec![Some(stamped(FRAME_BYTES, 1, 1_000)), Some(stamped(FRAME_BYTES, 2, 1_000))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(result.unwrap(), ProcessOutcome::Completed);
    let out_a = outputs[0].as_ref().unwrap();
    assert!(out_a.flags.timestamp_valid);
    assert_eq!(out_a.timestamp, 1_000);

    let (_, _, outputs) = h.cycle(
        vec![Some(stamped(FRAME_BYTES, 1, 11_000)), Some(stamped(FRAME_BYTES, 2, 11_000))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert_eq!(outputs[0].as_ref().unwrap().timestamp, 11_000);

    // A jumps far ahead: its frame is dropped, B is unaffected
    let (_, _, outputs) = h.cycle(
        vec![Some(stamped(FRAME_BYTES, 1, 50_000)), Some(stamped(FRAME_BYTES, 2, 21_000))],
        vec![Some(output(1, FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    let out_a = outputs[0].as_ref().unwrap();
    assert_eq!(out_a.len_per_ch(), 0);
    assert!(out_a.flags.end_of_frame);
    let out_b = outputs[1].as_ref().unwrap();
    assert_eq!(out_b.len_per_ch() as usize, FRAME_BYTES);
    assert_eq!(out_b.timestamp, 21_000);
}

#[test]
fn test_undersized_output_is_protocol_violation() {
    let mut h = sync_harness(frame_config());
    let (result, _, _) = h.cycle(
        vec![Some(pcm(FRAME_BYTES, 1)), Some(pcm(FRAME_BYTES, 2))],
        vec![Some(output(1, HALF_FRAME_BYTES)), Some(output(1, FRAME_BYTES))],
    );
    assert!(matches!(result, Err(EngineError::ProtocolViolation(_))));
}

#[test]
fn test_unsupported_format_rejected() {
    let mut h = sync_harness(frame_config());
    let result = h
        .engine
        .set_input_media_format(&mut h.pool, 0, streamsync_common::MediaFormat::pcm(48_000, 24, 1));
    assert!(matches!(result, Err(EngineError::UnsupportedFormat(_))));
}

#[test]
fn test_media_format_forwarded_to_peer_output() {
    let mut h = sync_harness(frame_config());
    h.engine.set_input_media_format(&mut h.pool, 1, stereo()).unwrap();
    let events = h.drain_events();
    assert!(events.contains(&EngineEvent::OutputMediaFormat {
        port_index: 1,
        format: stereo(),
    }));
}
