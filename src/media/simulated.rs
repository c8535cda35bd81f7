//! In-process media engine
//!
//! `SimulatedEngine` stands in for real encoder hardware. It keeps encoder
//! parameters with realistic bounds (out-of-range writes are ignored, so the
//! read-back check fails the way a clamping encoder would) and, when
//! generation is enabled, runs a worker thread that pushes synthetic audio and
//! video frames into the encoder outputs at a fixed frame rate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::media::engine::{
    params, EncoderKind, EncoderOutputs, EncoderPair, EngineEvent, EngineEventSink, MediaEngine,
    Muxer, ParamValue, RunState,
};
use crate::media::sample::{AttributeSet, Caps, Sample, StreamKind};

/// Size of one transport stream packet
pub const TS_PACKET_SIZE: usize = 188;

const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const VIDEO_PID: u16 = 0x100;
const AUDIO_PID: u16 = 0x101;

/// Settings for the simulated encoders
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Run a generator thread while playing
    pub generate: bool,
    /// Bytes per synthetic video frame
    pub video_frame_size: usize,
    /// Bytes per synthetic audio frame
    pub audio_frame_size: usize,
    /// Audio frames emitted per video frame
    pub audio_per_video: u32,
    /// Initial attribute set of the video encoder
    pub attributes: AttributeSet,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            generate: true,
            video_frame_size: 4096,
            audio_frame_size: 384,
            audio_per_video: 2,
            attributes: AttributeSet::new()
                .with_resolution(1280, 720)
                .with_framerate(25)
                .with_profile("main"),
        }
    }
}

struct EngineShared {
    events: Option<EngineEventSink>,
    opened: usize,
    muxers: usize,
}

/// Software stand-in for the encoder hardware
pub struct SimulatedEngine {
    config: SimulatedConfig,
    shared: Arc<Mutex<EngineShared>>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SimulatedEngine {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Mutex::new(EngineShared {
                events: None,
                opened: 0,
                muxers: 0,
            })),
        }
    }

    /// Engine that never produces data on its own
    ///
    /// Tests push samples into the junctions themselves.
    pub fn manual() -> Self {
        Self::new(SimulatedConfig {
            generate: false,
            ..SimulatedConfig::default()
        })
    }

    /// Raise an event on the most recently opened encoder pair
    pub fn raise(&self, event: EngineEvent) {
        let events = self.shared.lock().events.clone();
        if let Some(events) = events {
            events(event);
        }
    }

    /// Number of encoder pairs opened so far
    pub fn opened_count(&self) -> usize {
        self.shared.lock().opened
    }

    /// Number of muxers created so far
    pub fn muxer_count(&self) -> usize {
        self.shared.lock().muxers
    }
}

impl MediaEngine for SimulatedEngine {
    fn open(
        &self,
        outputs: EncoderOutputs,
        events: EngineEventSink,
    ) -> Result<Box<dyn EncoderPair>, EngineError> {
        {
            let mut shared = self.shared.lock();
            shared.events = Some(events);
            shared.opened += 1;
        }
        tracing::debug!("simulated encoder pair opened");
        Ok(Box::new(SimulatedEncoders::new(self.config.clone(), outputs)))
    }

    fn create_muxer(&self) -> Result<Box<dyn Muxer>, EngineError> {
        self.shared.lock().muxers += 1;
        Ok(Box::new(SimulatedMuxer::new()))
    }
}

/// Allowed integer range per parameter; `None` marks a boolean parameter
fn param_bounds(encoder: EncoderKind, name: &str) -> Option<Option<(i32, i32)>> {
    let bounds = match (encoder, name) {
        (EncoderKind::Audio, params::BITRATE) => Some((32, 512)),
        (EncoderKind::Video, params::BITRATE) => Some((100, 20_000)),
        (EncoderKind::Video, params::GOP_LENGTH) => Some((0, 300)),
        (EncoderKind::Video, params::BFRAMES) => Some((0, 3)),
        (EncoderKind::Video, params::PFRAMES) => Some((0, 15)),
        (EncoderKind::Video, params::SLICES) => Some((0, 8)),
        (EncoderKind::Video, params::LEVEL) => Some((0, 52)),
        (_, params::INPUT_MODE) => Some((0, 2)),
        (EncoderKind::Video, params::GOP_SCENE) | (EncoderKind::Video, params::OPEN_GOP) => None,
        _ => return None,
    };
    Some(bounds)
}

fn default_params() -> HashMap<(EncoderKind, &'static str), ParamValue> {
    use EncoderKind::*;
    HashMap::from([
        ((Audio, params::BITRATE), ParamValue::Int(128)),
        ((Audio, params::INPUT_MODE), ParamValue::Int(0)),
        ((Video, params::BITRATE), ParamValue::Int(2_000)),
        ((Video, params::GOP_LENGTH), ParamValue::Int(50)),
        ((Video, params::GOP_SCENE), ParamValue::Bool(false)),
        ((Video, params::OPEN_GOP), ParamValue::Bool(false)),
        ((Video, params::BFRAMES), ParamValue::Int(0)),
        ((Video, params::PFRAMES), ParamValue::Int(1)),
        ((Video, params::SLICES), ParamValue::Int(0)),
        ((Video, params::LEVEL), ParamValue::Int(40)),
        ((Video, params::INPUT_MODE), ParamValue::Int(0)),
    ])
}

fn static_name(name: &str) -> Option<&'static str> {
    [
        params::BITRATE,
        params::GOP_LENGTH,
        params::GOP_SCENE,
        params::OPEN_GOP,
        params::BFRAMES,
        params::PFRAMES,
        params::SLICES,
        params::LEVEL,
        params::INPUT_MODE,
    ]
    .into_iter()
    .find(|known| *known == name)
}

struct Generator {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Generator {
    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct SimulatedEncoders {
    config: SimulatedConfig,
    outputs: EncoderOutputs,
    state: RunState,
    params: Arc<Mutex<HashMap<(EncoderKind, &'static str), ParamValue>>>,
    attributes: Arc<Mutex<AttributeSet>>,
    opened_at: Instant,
    generator: Option<Generator>,
}

impl SimulatedEncoders {
    fn new(config: SimulatedConfig, outputs: EncoderOutputs) -> Self {
        let attributes = config.attributes.clone();
        Self {
            config,
            outputs,
            state: RunState::Ready,
            params: Arc::new(Mutex::new(default_params())),
            attributes: Arc::new(Mutex::new(attributes)),
            opened_at: Instant::now(),
            generator: None,
        }
    }

    fn start_generator(&mut self) {
        if self.generator.is_some() || !self.config.generate {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let worker = GeneratorWorker {
            config: self.config.clone(),
            outputs: self.outputs.clone(),
            params: Arc::clone(&self.params),
            attributes: Arc::clone(&self.attributes),
            opened_at: self.opened_at,
            stop: Arc::clone(&stop),
        };
        let handle = thread::Builder::new()
            .name("simulated-encoder".into())
            .spawn(move || worker.run());
        match handle {
            Ok(handle) => {
                self.generator = Some(Generator {
                    stop,
                    handle: Some(handle),
                })
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn encoder thread"),
        }
    }

    fn stop_generator(&mut self) {
        if let Some(mut generator) = self.generator.take() {
            generator.halt();
        }
    }
}

impl Drop for SimulatedEncoders {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

impl EncoderPair for SimulatedEncoders {
    fn set_run_state(&mut self, state: RunState) -> Result<(), EngineError> {
        match state {
            RunState::Playing => self.start_generator(),
            _ => self.stop_generator(),
        }
        self.state = state;
        Ok(())
    }

    fn run_state(&self) -> RunState {
        self.state
    }

    fn set_parameter(
        &mut self,
        encoder: EncoderKind,
        name: &str,
        value: ParamValue,
    ) -> Result<(), EngineError> {
        let key = static_name(name).ok_or_else(|| EngineError::UnknownParameter(name.into()))?;
        let bounds =
            param_bounds(encoder, key).ok_or_else(|| EngineError::UnknownParameter(name.into()))?;
        match (bounds, value) {
            (Some((min, max)), ParamValue::Int(v)) => {
                if v < min || v > max {
                    tracing::debug!(name, value = v, "parameter out of range, ignored");
                    return Ok(());
                }
            }
            (None, ParamValue::Bool(_)) => {}
            _ => return Err(EngineError::WrongType { name: name.into() }),
        }
        self.params.lock().insert((encoder, key), value);
        Ok(())
    }

    fn parameter(&self, encoder: EncoderKind, name: &str) -> Option<ParamValue> {
        let key = static_name(name)?;
        self.params.lock().get(&(encoder, key)).copied()
    }

    fn attributes(&self) -> Option<AttributeSet> {
        Some(self.attributes.lock().clone())
    }

    fn set_attributes(&mut self, attributes: AttributeSet) -> Result<(), EngineError> {
        let mut current = self.attributes.lock();
        if let (Some(w), Some(h)) = (attributes.width, attributes.height) {
            if (16..=1920).contains(&w) && (16..=1080).contains(&h) {
                current.width = Some(w);
                current.height = Some(h);
            }
        }
        if let Some(fps) = attributes.framerate {
            if (1..=60).contains(&fps) {
                current.framerate = Some(fps);
            }
        }
        match attributes.profile.as_deref() {
            Some("main") | Some("high") => current.profile = attributes.profile.clone(),
            Some(other) => tracing::debug!(profile = other, "unsupported profile ignored"),
            None => current.profile = None,
        }
        Ok(())
    }
}

struct GeneratorWorker {
    config: SimulatedConfig,
    outputs: EncoderOutputs,
    params: Arc<Mutex<HashMap<(EncoderKind, &'static str), ParamValue>>>,
    attributes: Arc<Mutex<AttributeSet>>,
    opened_at: Instant,
    stop: Arc<AtomicBool>,
}

impl GeneratorWorker {
    fn run(self) {
        let audio_caps = Arc::new(Caps::new("audio/mpeg"));
        let mut video_caps: Option<Arc<Caps>> = None;
        let mut frame: u64 = 0;

        while !self.stop.load(Ordering::Acquire) {
            let attributes = self.attributes.lock().clone();
            let fps = attributes.framerate.unwrap_or(25).max(1);
            let caps = match video_caps {
                Some(ref caps) if caps.attributes == attributes => Arc::clone(caps),
                _ => {
                    let caps = Arc::new(Caps::new("video/x-h264").with_attributes(attributes));
                    video_caps = Some(Arc::clone(&caps));
                    caps
                }
            };
            let gop = match self.params.lock().get(&(EncoderKind::Video, params::GOP_LENGTH)) {
                Some(ParamValue::Int(n)) if *n > 0 => *n as u64,
                _ => 50,
            };

            let pts = self.opened_at.elapsed();
            let data = Bytes::from(vec![0u8; self.config.video_frame_size]);
            let sample = if frame % gop == 0 {
                Sample::keyframe(StreamKind::Video, data, pts, caps)
            } else {
                Sample::delta(StreamKind::Video, data, pts, caps)
            };
            self.outputs.video.push(&sample);

            let frame_time = Duration::from_secs(1) / fps;
            let audio_step = frame_time / self.config.audio_per_video.max(1);
            for i in 0..self.config.audio_per_video {
                let data = Bytes::from(vec![0u8; self.config.audio_frame_size]);
                let sample =
                    Sample::keyframe(StreamKind::Audio, data, pts + audio_step * i, audio_caps.clone());
                self.outputs.audio.push(&sample);
            }

            frame += 1;
            thread::sleep(frame_time);
        }
    }
}

/// Packs elementary samples into transport stream packets
pub struct SimulatedMuxer {
    caps: Arc<Caps>,
    continuity: [u8; 2],
}

impl SimulatedMuxer {
    pub fn new() -> Self {
        Self {
            caps: Arc::new(Caps::new("video/mpegts")),
            continuity: [0; 2],
        }
    }
}

impl Default for SimulatedMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for SimulatedMuxer {
    fn mux(&mut self, sample: &Sample) -> Vec<Sample> {
        let (pid, cc) = match sample.stream {
            StreamKind::Video => (VIDEO_PID, &mut self.continuity[0]),
            StreamKind::Audio => (AUDIO_PID, &mut self.continuity[1]),
            StreamKind::Transport => return vec![sample.clone()],
        };

        let packets = sample.data.len().div_ceil(TS_PAYLOAD_SIZE).max(1);
        let mut out = BytesMut::with_capacity(packets * TS_PACKET_SIZE);
        for (i, chunk) in sample.data.chunks(TS_PAYLOAD_SIZE).enumerate() {
            let start = if i == 0 { 0x40 } else { 0x00 };
            out.put_u8(0x47);
            out.put_u8(start | ((pid >> 8) as u8 & 0x1f));
            out.put_u8(pid as u8);
            out.put_u8(0x10 | (*cc & 0x0f));
            *cc = cc.wrapping_add(1);
            out.put_slice(chunk);
            out.put_bytes(0xff, TS_PAYLOAD_SIZE - chunk.len());
        }
        if sample.data.is_empty() {
            out.put_u8(0x47);
            out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1f));
            out.put_u8(pid as u8);
            out.put_u8(0x10 | (*cc & 0x0f));
            *cc = cc.wrapping_add(1);
            out.put_bytes(0xff, TS_PAYLOAD_SIZE);
        }

        vec![Sample {
            stream: StreamKind::Transport,
            data: out.freeze(),
            pts: sample.pts,
            dts: sample.dts,
            delta: sample.stream != StreamKind::Video || sample.delta,
            caps: Arc::clone(&self.caps),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Junction;

    fn outputs() -> EncoderOutputs {
        EncoderOutputs {
            audio: Junction::new("audio"),
            video: Junction::new("video"),
        }
    }

    fn open_pair(engine: &SimulatedEngine) -> Box<dyn EncoderPair> {
        engine.open(outputs(), Arc::new(|_| {})).unwrap()
    }

    #[test]
    fn test_out_of_range_parameter_is_ignored() {
        let engine = SimulatedEngine::manual();
        let mut pair = open_pair(&engine);

        pair.set_parameter(EncoderKind::Video, params::BITRATE, ParamValue::Int(50_000))
            .unwrap();
        assert_eq!(
            pair.parameter(EncoderKind::Video, params::BITRATE),
            Some(ParamValue::Int(2_000))
        );

        pair.set_parameter(EncoderKind::Video, params::BITRATE, ParamValue::Int(4_000))
            .unwrap();
        assert_eq!(
            pair.parameter(EncoderKind::Video, params::BITRATE),
            Some(ParamValue::Int(4_000))
        );
    }

    #[test]
    fn test_unknown_and_mistyped_parameters_fail() {
        let engine = SimulatedEngine::manual();
        let mut pair = open_pair(&engine);

        assert!(matches!(
            pair.set_parameter(EncoderKind::Video, "sharpness", ParamValue::Int(1)),
            Err(EngineError::UnknownParameter(_))
        ));
        assert!(matches!(
            pair.set_parameter(EncoderKind::Video, params::OPEN_GOP, ParamValue::Int(1)),
            Err(EngineError::WrongType { .. })
        ));
    }

    #[test]
    fn test_attribute_set_keeps_unsupported_fields() {
        let engine = SimulatedEngine::manual();
        let mut pair = open_pair(&engine);

        let mut attrs = pair.attributes().unwrap();
        attrs.width = Some(8000);
        attrs.height = Some(8000);
        attrs.framerate = Some(30);
        pair.set_attributes(attrs).unwrap();

        let attrs = pair.attributes().unwrap();
        assert_eq!(attrs.width, Some(1280));
        assert_eq!(attrs.framerate, Some(30));
    }

    #[test]
    fn test_muxer_emits_whole_ts_packets() {
        let mut muxer = SimulatedMuxer::new();
        let caps = Arc::new(Caps::new("video/x-h264"));
        let sample = Sample::keyframe(
            StreamKind::Video,
            Bytes::from(vec![1u8; 400]),
            Duration::from_millis(40),
            caps,
        );

        let out = muxer.mux(&sample);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream, StreamKind::Transport);
        assert_eq!(out[0].data.len(), 3 * TS_PACKET_SIZE);
        assert_eq!(out[0].data[0], 0x47);
        assert!(!out[0].delta);
        assert_eq!(out[0].pts, Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_muxed_audio_is_never_a_keyframe() {
        let mut muxer = SimulatedMuxer::new();
        let caps = Arc::new(Caps::new("audio/mpeg"));
        let sample = Sample::keyframe(
            StreamKind::Audio,
            Bytes::from_static(b"aac"),
            Duration::ZERO,
            caps,
        );
        assert!(muxer.mux(&sample)[0].delta);
    }

    #[test]
    fn test_raise_reaches_last_opened_pair() {
        let engine = SimulatedEngine::manual();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _pair = engine
            .open(outputs(), Arc::new(move |ev| sink.lock().push(ev)))
            .unwrap();

        engine.raise(EngineEvent::SignalLost);
        assert_eq!(*seen.lock(), vec![EngineEvent::SignalLost]);
        assert_eq!(engine.opened_count(), 1);
    }
}
