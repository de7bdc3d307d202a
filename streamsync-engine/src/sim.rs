//! Deterministic scheduler stand-in
//!
//! Feeds scripted PCM sources into an engine, honors the trigger policy the
//! engine publishes, and records what each cycle produced.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Arc;
use streamsync_common::{
    EngineEvent, Marker, MarkerList, MarkerPool, MediaFormat, PortDirection, Shift, StreamData,
    StreamFlags, TrackingHandle, TrackingRecorder, TriggerPolicy,
};
use streamsync_engine::config::EngineConfig;
use streamsync_engine::{GaplessEngine, ProcessOutcome, StreamEngine, SyncEngine};
use tracing::{debug, info};

const SAMPLE_RATE: u32 = 48_000;
const DEFAULT_FRAME_US: u32 = 10_000;
const DEFAULT_GAPLESS_DELAY_MS: u32 = 20;
const DEFAULT_CLIENT_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    Sync,
    Gapless,
}

/// Pending upstream data for one input
#[derive(Default)]
struct Feed {
    pending: Vec<u8>,
    markers: MarkerList,
    flags: StreamFlags,
}

impl Feed {
    fn is_ready(&self) -> bool {
        !self.pending.is_empty() || !self.markers.is_empty() || self.flags.end_of_frame
    }
}

/// What happened in one cycle
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub triggered: bool,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub consumed: Vec<u32>,
    pub produced: Vec<u32>,
    pub end_of_frame: Vec<bool>,
    pub markers: Vec<Vec<String>>,
    pub events: Vec<String>,
}

pub struct Simulator {
    kind: EngineKind,
    engine: Box<dyn StreamEngine>,
    pool: MarkerPool,
    events: mpsc::Receiver<EngineEvent>,
    policy: TriggerPolicy,
    feeds: Vec<Feed>,
    num_outputs: usize,
    format: MediaFormat,
    frame_bytes: u32,
    cycles: u64,
    recorder: Arc<TrackingRecorder>,
}

impl Simulator {
    pub fn new(kind: EngineKind, config: &EngineConfig, cycles: u64) -> Result<Self> {
        let mut pool = MarkerPool::new();
        let (tx, rx) = mpsc::channel();
        let format = MediaFormat::pcm(SAMPLE_RATE, 16, 1);

        let (engine, num_outputs, frame_us): (Box<dyn StreamEngine>, usize, u32) = match kind {
            EngineKind::Sync => {
                let frame_us = config.sync.frame_duration_us.unwrap_or(DEFAULT_FRAME_US);
                let mut engine = SyncEngine::new(config.sync.clone(), Box::new(tx))
                    .context("Failed to create sync engine")?;
                for index in 0..2 {
                    let in_id = index as u32 + 1;
                    engine.port_open(PortDirection::Output, index, in_id - 1)?;
                    engine.port_open(PortDirection::Input, index, in_id)?;
                    engine.set_input_media_format(&mut pool, index, format)?;
                }
                engine.set_container_frame_duration(&mut pool, frame_us)?;
                (Box::new(engine), 2, frame_us)
            }
            EngineKind::Gapless => {
                let frame_us = config.gapless.frame_duration_us.unwrap_or(DEFAULT_FRAME_US);
                let mut engine = GaplessEngine::new(config.gapless.clone(), Box::new(tx))
                    .context("Failed to create gapless engine")?;
                engine.port_open(PortDirection::Output, 0, 1)?;
                for index in 0..2 {
                    engine.port_open(PortDirection::Input, index, 10 + index as u32)?;
                    engine.set_input_media_format(&mut pool, index, format)?;
                }
                if engine.early_eos_delay_ms() == 0 {
                    engine.set_early_eos_delay(&mut pool, DEFAULT_GAPLESS_DELAY_MS)?;
                }
                if engine.early_eos_client().is_none() {
                    engine.register_early_eos_client(DEFAULT_CLIENT_ID)?;
                }
                engine.set_container_frame_duration(&mut pool, frame_us)?;
                (Box::new(engine), 1, frame_us)
            }
        };

        let mut sim = Self {
            kind,
            policy: TriggerPolicy::default_for(2, num_outputs),
            engine,
            pool,
            events: rx,
            feeds: (0..2).map(|_| Feed::default()).collect(),
            num_outputs,
            format,
            frame_bytes: format.us_to_bytes_per_ch(u64::from(frame_us)),
            cycles,
            recorder: TrackingRecorder::new(),
        };

        for index in 0..num_outputs {
            sim.engine.port_start(PortDirection::Output, index)?;
        }
        for index in 0..2 {
            sim.engine.port_start(PortDirection::Input, index)?;
        }
        sim.drain_events();
        info!("Simulating {} engine for {} cycles", sim.engine.name(), cycles);
        Ok(sim)
    }

    /// Run every cycle and return the reports
    pub fn run(&mut self) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::new();
        for cycle in 0..self.cycles {
            self.produce(cycle)?;
            reports.push(self.step(cycle)?);
        }
        let tracked = self.recorder.events();
        debug!("{} tracked markers completed", tracked.len());
        Ok(reports)
    }

    /// Scripted upstream sources.
    ///
    /// Sync: input 0 trickles half frames and ends two thirds in, input 1
    /// delivers whole frames. Gapless: stream 0 plays the first half and
    /// ends with a tracked end-of-stream, stream 1 is queued just before.
    fn produce(&mut self, cycle: u64) -> Result<()> {
        let half = (self.frame_bytes / 2) as usize;
        let full = self.frame_bytes as usize;
        match self.kind {
            EngineKind::Sync => {
                let end_a = self.cycles * 2 / 3;
                if cycle < end_a {
                    self.push_bytes(0, half, cycle as u8);
                } else if cycle == end_a {
                    self.push_eos(0, None)?;
                }
                if self.feeds[1].pending.len() < full {
                    self.push_bytes(1, full, cycle as u8);
                }
            }
            EngineKind::Gapless => {
                let end_0 = self.cycles / 2;
                if cycle < end_0 {
                    self.push_bytes(0, half, 0x10);
                } else if cycle == end_0 {
                    let handle = TrackingHandle::new(self.recorder.clone());
                    self.push_eos(0, Some(handle))?;
                }
                if cycle + 2 >= end_0 && self.feeds[1].pending.len() < full {
                    self.push_bytes(1, half, 0x20);
                }
            }
        }
        Ok(())
    }

    fn push_bytes(&mut self, index: usize, count: usize, value: u8) {
        self.feeds[index].pending.extend(std::iter::repeat(value).take(count));
    }

    fn push_eos(&mut self, index: usize, tracking: Option<TrackingHandle>) -> Result<()> {
        let feed = &mut self.feeds[index];
        let end = self.format.bytes_to_offset_units(feed.pending.len() as u32);
        let internal = tracking.is_none();
        let mut marker = Marker::eos(true, internal).with_offset(end);
        if let Some(tracking) = tracking {
            marker = marker.with_tracking(tracking);
        }
        self.pool.push_back(&mut feed.markers, marker)?;
        feed.flags.marker_eos = true;
        feed.flags.end_of_frame = true;
        info!("Source {} ends its stream", index);
        Ok(())
    }

    fn step(&mut self, cycle: u64) -> Result<CycleReport> {
        let ready_inputs: Vec<bool> = self.feeds.iter().map(Feed::is_ready).collect();
        let ready_outputs = vec![true; self.num_outputs];
        let mut report = CycleReport {
            cycle,
            triggered: self.policy.is_satisfied(&ready_inputs, &ready_outputs),
            outcome: None,
            error: None,
            consumed: vec![0; self.feeds.len()],
            produced: vec![0; self.num_outputs],
            end_of_frame: vec![false; self.num_outputs],
            markers: vec![Vec::new(); self.num_outputs],
            events: Vec::new(),
        };
        if !report.triggered {
            debug!("Cycle {}: trigger policy not satisfied", cycle);
            report.events = self.drain_events();
            return Ok(report);
        }

        let mut inputs: Vec<Option<StreamData>> = self
            .feeds
            .iter_mut()
            .map(|feed| {
                let mut sd = StreamData::from_channels(vec![feed.pending.clone()]);
                sd.metadata = std::mem::take(&mut feed.markers);
                sd.flags = feed.flags;
                Some(sd)
            })
            .collect();
        let mut outputs: Vec<Option<StreamData>> = (0..self.num_outputs)
            .map(|_| Some(StreamData::new(1, self.frame_bytes as usize)))
            .collect();

        match self.engine.process(&mut self.pool, &mut inputs, &mut outputs) {
            Ok(outcome) => report.outcome = Some(outcome_name(outcome).to_string()),
            Err(e) => report.error = Some(e.to_string()),
        }

        for (index, (feed, sd)) in self.feeds.iter_mut().zip(inputs.iter_mut()).enumerate() {
            let Some(sd) = sd.take() else {
                continue;
            };
            let consumed = sd.len_per_ch();
            report.consumed[index] = consumed;
            feed.pending.drain(..(consumed as usize).min(feed.pending.len()));
            feed.markers = sd.metadata;
            let units = self.format.bytes_to_offset_units(consumed);
            self.pool.shift_offsets(&feed.markers, units, Shift::Left);
            feed.flags = sd.flags;
            feed.flags.marker_eos = self.pool.has_flushing_eos(&feed.markers);
        }

        for (index, sd) in outputs.iter_mut().enumerate() {
            let Some(mut sd) = sd.take() else {
                continue;
            };
            report.produced[index] = sd.len_per_ch();
            report.end_of_frame[index] = sd.flags.end_of_frame;
            report.markers[index] = self
                .pool
                .iter(&sd.metadata)
                .map(|(_, m)| format!("{:?}@{}", m.kind, m.offset))
                .collect();
            self.pool.destroy_all(&mut sd.metadata, false);
        }

        report.events = self.drain_events();
        Ok(report)
    }

    /// Collect raised events, adopting any new trigger policy
    fn drain_events(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let EngineEvent::TriggerPolicyChanged { policy } = &event {
                self.policy = policy.clone();
            }
            names.push(event.event_type().to_string());
        }
        names
    }
}

fn outcome_name(outcome: ProcessOutcome) -> &'static str {
    match outcome {
        ProcessOutcome::Completed => "completed",
        ProcessOutcome::NeedMoreData => "need_more_data",
        ProcessOutcome::OutputFormatChanged => "output_format_changed",
    }
}
