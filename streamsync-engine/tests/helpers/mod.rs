//! Shared fixtures for the engine integration tests
//!
//! Every scenario runs 48kHz 16-bit mono, so one 10ms frame is 960 bytes
//! per channel (480 samples) and marker offsets count samples.

#![allow(dead_code)]

use std::sync::mpsc;
use streamsync_common::{
    EngineEvent, Marker, MarkerPool, MediaFormat, PortDirection, StreamData, TrackingHandle,
};
use streamsync_engine::config::{GaplessConfig, SyncConfig};
use streamsync_engine::{GaplessEngine, ProcessOutcome, Result, StreamEngine, SyncEngine};

pub const FRAME_US: u32 = 10_000;
/// One frame of mono 16-bit audio at 48kHz
pub const FRAME_BYTES: usize = 960;
pub const HALF_FRAME_BYTES: usize = 480;

pub fn mono() -> MediaFormat {
    MediaFormat::pcm(48_000, 16, 1)
}

pub fn stereo() -> MediaFormat {
    MediaFormat::pcm(48_000, 16, 2)
}

/// Mono input holding `len` bytes of `value`
pub fn pcm(len: usize, value: u8) -> StreamData {
    StreamData::from_channels(vec![vec![value; len]])
}

/// Empty output buffer with room for `capacity` bytes per channel
pub fn output(channels: usize, capacity: usize) -> StreamData {
    StreamData::new(channels, capacity)
}

/// Append a flushing end-of-stream at the end of `sd` and flag it
pub fn end_stream(pool: &mut MarkerPool, sd: &mut StreamData, tracking: Option<TrackingHandle>) {
    let offset = mono().bytes_to_offset_units(sd.len_per_ch());
    let internal = tracking.is_none();
    let mut marker = Marker::eos(true, internal).with_offset(offset);
    if let Some(tracking) = tracking {
        marker = marker.with_tracking(tracking);
    }
    pool.push_back(&mut sd.metadata, marker).unwrap();
    sd.flags.marker_eos = true;
    sd.flags.end_of_frame = true;
}

/// Engine under test together with its marker pool and event receiver
pub struct Harness<E> {
    pub engine: E,
    pub pool: MarkerPool,
    pub events: mpsc::Receiver<EngineEvent>,
}

impl<E: StreamEngine> Harness<E> {
    /// Run one cycle; buffers are handed back for inspection
    pub fn cycle(
        &mut self,
        inputs: Vec<Option<StreamData>>,
        outputs: Vec<Option<StreamData>>,
    ) -> (Result<ProcessOutcome>, Vec<Option<StreamData>>, Vec<Option<StreamData>>) {
        let mut inputs = inputs;
        let mut outputs = outputs;
        let result = self.engine.process(&mut self.pool, &mut inputs, &mut outputs);
        (result, inputs, outputs)
    }

    /// Events raised since the last call
    pub fn drain_events(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }
}

/// Sync engine with two started input/output pairs (input `n` has id `n + 1`
/// and feeds output `n`, whose id is `n`), configured for 10ms frames
pub fn sync_harness(config: SyncConfig) -> Harness<SyncEngine> {
    let (tx, rx) = mpsc::channel();
    let mut pool = MarkerPool::new();
    let mut engine = SyncEngine::new(config, Box::new(tx)).unwrap();

    for index in 0..2 {
        engine.port_open(PortDirection::Output, index, index as u32).unwrap();
        engine.port_open(PortDirection::Input, index, index as u32 + 1).unwrap();
        engine.set_input_media_format(&mut pool, index, mono()).unwrap();
    }
    engine.set_container_frame_duration(&mut pool, FRAME_US).unwrap();
    for index in 0..2 {
        engine.port_start(PortDirection::Output, index).unwrap();
        engine.port_start(PortDirection::Input, index).unwrap();
    }

    let harness = Harness {
        engine,
        pool,
        events: rx,
    };
    harness.drain_events();
    harness
}

/// Gapless engine with inputs 0/1 (ids 10/11) and the output (id 1) open,
/// mono formats set and every port started
pub fn gapless_harness(config: GaplessConfig) -> Harness<GaplessEngine> {
    let (tx, rx) = mpsc::channel();
    let mut pool = MarkerPool::new();
    let mut engine = GaplessEngine::new(config, Box::new(tx)).unwrap();

    engine.port_open(PortDirection::Output, 0, 1).unwrap();
    for index in 0..2 {
        engine.port_open(PortDirection::Input, index, 10 + index as u32).unwrap();
        engine.set_input_media_format(&mut pool, index, mono()).unwrap();
    }
    engine.port_start(PortDirection::Output, 0).unwrap();
    for index in 0..2 {
        engine.port_start(PortDirection::Input, index).unwrap();
    }

    let harness = Harness {
        engine,
        pool,
        events: rx,
    };
    harness.drain_events();
    harness
}

/// Gapless configuration that leaves pass-through as soon as the inputs
/// have formats: 20ms delay lines, listener 7, 10ms frames
pub fn buffered_config() -> GaplessConfig {
    GaplessConfig {
        early_eos_delay_ms: 20,
        frame_duration_us: Some(FRAME_US),
        module_id: 42,
        duty_cycling: false,
        early_eos_client: Some(7),
    }
}
