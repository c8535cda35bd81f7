//! Source pipeline
//!
//! Owns the encoder pair, the two persistent elementary junctions and the
//! transport junction, plus the muxer stage that feeds it:
//!
//! ```text
//!   encoders ──► atee ──┬──► (consumer branches)
//!            │          └──► mux input ──┐
//!            └─► vtee ──┬──► (consumer branches)
//!                       └──► mux input ──┴──► muxer ──► tstee ──► (consumer branches)
//! ```
//!
//! The muxer stage is built on demand by [`SourcePipeline::ensure_muxed`]
//! and removed by [`SourcePipeline::halt`], which detaches the audio input
//! first and the video input from the audio barrier's continuation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConfigError, EngineError, Error, Result};
use crate::graph::{Edge, EdgeTarget, Junction};
use crate::media::{
    params, AttributeSet, EncoderKind, EncoderOutputs, EncoderPair, EngineEventSink, MediaEngine,
    Muxer, ParamValue, RunState, Sample,
};
use crate::source::properties::{InputMode, Profile, PropertyField, PropertyReport, SourceProperties};

/// Callback run once the muxer stage has been torn down
pub type HaltCallback = Arc<dyn Fn() + Send + Sync>;

/// Run-state of the source pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceState {
    /// No encoder pair exists
    Absent,
    Ready,
    /// Encoders paused while only the upstream consumer is active
    Paused,
    Playing,
}

impl SourceState {
    /// Numeric code published to observers
    pub fn code(&self) -> i32 {
        match self {
            SourceState::Absent => 0,
            SourceState::Ready => RunState::Ready.code(),
            SourceState::Paused => RunState::Paused.code(),
            SourceState::Playing => RunState::Playing.code(),
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceState::Absent => "absent",
            SourceState::Ready => "ready",
            SourceState::Paused => "paused",
            SourceState::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Junction port feeding one elementary stream into the shared muxer
struct MuxInput {
    muxer: Arc<Mutex<Box<dyn Muxer>>>,
    output: Arc<Junction>,
}

impl EdgeTarget for MuxInput {
    fn receive(&self, sample: &Sample) {
        let muxed = self.muxer.lock().mux(sample);
        for out in &muxed {
            self.output.push(out);
        }
    }
}

struct MuxStage {
    audio_edge: Arc<Edge>,
    video_edge: Arc<Edge>,
    muxer: Arc<Mutex<Box<dyn Muxer>>>,
}

impl MuxStage {
    /// Remove both inputs through their barriers, audio first
    fn detach(self, done: HaltCallback) {
        let MuxStage {
            audio_edge,
            video_edge,
            muxer,
        } = self;
        let audio = Arc::clone(&audio_edge);
        audio_edge.add_barrier(move || {
            audio.unlink();
            let video = Arc::clone(&video_edge);
            video_edge.add_barrier(move || {
                video.unlink();
                drop(muxer);
                tracing::debug!("muxer stage removed");
                done();
            });
        });
    }

    /// Unlink both inputs directly; only valid once the encoders are stopped
    fn unlink_stopped(self) {
        self.audio_edge.unlink();
        self.video_edge.unlink();
    }
}

struct ActiveSource {
    encoders: Box<dyn EncoderPair>,
    audio: Arc<Junction>,
    video: Arc<Junction>,
    transport: Arc<Junction>,
    mux: Option<MuxStage>,
    state: SourceState,
}

/// The encoder pair and its fan-out junctions
pub struct SourcePipeline {
    engine: Arc<dyn MediaEngine>,
    events: EngineEventSink,
    on_halted: HaltCallback,
    active: Option<ActiveSource>,
    properties: SourceProperties,
    properties_loaded: bool,
}

impl SourcePipeline {
    /// Create a new, absent pipeline
    ///
    /// `events` receives encoder events of every pair opened later;
    /// `on_halted` runs after each muxer teardown completes.
    pub fn new(engine: Arc<dyn MediaEngine>, events: EngineEventSink, on_halted: HaltCallback) -> Self {
        Self {
            engine,
            events,
            on_halted,
            active: None,
            properties: SourceProperties::default(),
            properties_loaded: false,
        }
    }

    pub fn state(&self) -> SourceState {
        self.active
            .as_ref()
            .map(|a| a.state)
            .unwrap_or(SourceState::Absent)
    }

    pub fn is_present(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_muxed(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.mux.is_some())
    }

    fn active(&self) -> Result<&ActiveSource> {
        self.active.as_ref().ok_or(Error::NoSource)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveSource> {
        self.active.as_mut().ok_or(Error::NoSource)
    }

    pub fn audio_junction(&self) -> Result<Arc<Junction>> {
        Ok(Arc::clone(&self.active()?.audio))
    }

    pub fn video_junction(&self) -> Result<Arc<Junction>> {
        Ok(Arc::clone(&self.active()?.video))
    }

    pub fn transport_junction(&self) -> Result<Arc<Junction>> {
        Ok(Arc::clone(&self.active()?.transport))
    }

    /// Open a fresh encoder pair and its junctions
    ///
    /// Properties saved by an earlier [`destroy`](Self::destroy) are applied
    /// to the new pair.
    pub fn create(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let audio = Junction::new("atee");
        let video = Junction::new("vtee");
        let transport = Junction::new("tstee");
        let outputs = EncoderOutputs {
            audio: Arc::clone(&audio),
            video: Arc::clone(&video),
        };
        let encoders = self.engine.open(outputs, Arc::clone(&self.events))?;
        self.active = Some(ActiveSource {
            encoders,
            audio,
            video,
            transport,
            mux: None,
            state: SourceState::Ready,
        });
        tracing::info!("source pipeline created");

        if self.properties_loaded {
            let report = self.apply_properties(self.properties.clone())?;
            for (field, err) in report.failures() {
                tracing::warn!(field = field.name(), error = %err, "stored property not restored");
            }
        }
        Ok(())
    }

    /// Stop and drop the encoder pair, keeping its properties
    ///
    /// Returns false if there was nothing to destroy.
    pub fn destroy(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            tracing::info!("no source pipeline to destroy");
            return false;
        };
        self.properties = read_properties(active.encoders.as_ref(), &self.properties);
        self.properties_loaded = true;

        if let Err(e) = active.encoders.set_run_state(RunState::Null) {
            tracing::warn!(error = %e, "encoders did not reach null state");
        }
        if let Some(stage) = active.mux.take() {
            stage.unlink_stopped();
        }
        tracing::info!("source pipeline destroyed");
        true
    }

    /// Destroy and immediately recreate the pipeline
    pub fn rebuild(&mut self) -> Result<()> {
        self.destroy();
        self.create()
    }

    /// Build the muxer stage if it does not exist; returns true if built
    pub fn ensure_muxed(&mut self) -> Result<bool> {
        let active = self.active.as_mut().ok_or(Error::NoSource)?;
        if active.mux.is_some() {
            return Ok(false);
        }
        let muxer = Arc::new(Mutex::new(self.engine.create_muxer()?));
        let input = Arc::new(MuxInput {
            muxer: Arc::clone(&muxer),
            output: Arc::clone(&active.transport),
        });
        let audio_edge = active.audio.request_port(Arc::clone(&input) as Arc<dyn EdgeTarget>);
        let video_edge = active.video.request_port(input as Arc<dyn EdgeTarget>);
        active.mux = Some(MuxStage {
            audio_edge,
            video_edge,
            muxer,
        });
        tracing::info!("muxer stage linked");
        Ok(true)
    }

    /// Drive the encoders to playing
    pub fn play(&mut self) -> Result<()> {
        let active = self.active_mut()?;
        if active.state != SourceState::Playing {
            active.encoders.set_run_state(RunState::Playing)?;
            active.state = SourceState::Playing;
            tracing::info!("source pipeline playing");
        }
        Ok(())
    }

    /// Pause the encoders; returns true if they were playing
    pub fn pause(&mut self) -> Result<bool> {
        let active = self.active_mut()?;
        if active.state != SourceState::Playing {
            return Ok(false);
        }
        active.encoders.set_run_state(RunState::Paused)?;
        active.state = SourceState::Paused;
        tracing::info!("source encoders paused");
        Ok(true)
    }

    /// Resume paused encoders; returns true if they were paused
    pub fn resume(&mut self) -> Result<bool> {
        let active = self.active_mut()?;
        if active.state != SourceState::Paused {
            return Ok(false);
        }
        active.encoders.set_run_state(RunState::Playing)?;
        active.state = SourceState::Playing;
        tracing::info!("source encoders resumed");
        Ok(true)
    }

    /// Remove the muxer stage and return to ready
    ///
    /// Only valid when no consumer needs the muxed stream.
    pub fn halt(&mut self) -> Result<()> {
        let on_halted = Arc::clone(&self.on_halted);
        let active = self.active_mut()?;
        if let Some(stage) = active.mux.take() {
            stage.detach(on_halted);
        }
        if active.state != SourceState::Ready {
            active.encoders.set_run_state(RunState::Ready)?;
            active.state = SourceState::Ready;
        }
        tracing::info!("source pipeline halted");
        Ok(())
    }

    /// Cached property snapshot
    pub fn properties(&self) -> &SourceProperties {
        &self.properties
    }

    /// Re-read the property snapshot from the engine
    pub fn refresh_properties(&mut self) -> &SourceProperties {
        if let Some(active) = self.active.as_ref() {
            self.properties = read_properties(active.encoders.as_ref(), &self.properties);
            self.properties_loaded = true;
        }
        &self.properties
    }

    /// Apply every field of `props` independently, verifying each by read-back
    ///
    /// Zero bitrates and frame rate, and an incomplete resolution, are
    /// skipped. There is no rollback: accepted fields stay applied when
    /// others fail.
    pub fn apply_properties(&mut self, props: SourceProperties) -> Result<PropertyReport> {
        let encoders = self.active.as_mut().ok_or(Error::NoSource)?.encoders.as_mut();
        let mut report = PropertyReport::new();
        let video = EncoderKind::Video;

        if props.audio_bitrate != 0 {
            report.record(
                PropertyField::AudioBitrate,
                write_param(encoders, EncoderKind::Audio, params::BITRATE, ParamValue::Int(props.audio_bitrate), "audioBitrate"),
            );
        }
        if props.video_bitrate != 0 {
            report.record(
                PropertyField::VideoBitrate,
                write_param(encoders, video, params::BITRATE, ParamValue::Int(props.video_bitrate), "videoBitrate"),
            );
        }
        let ints = [
            (PropertyField::GopLength, params::GOP_LENGTH, props.gop_length),
            (PropertyField::BFrames, params::BFRAMES, props.b_frames),
            (PropertyField::PFrames, params::PFRAMES, props.p_frames),
            (PropertyField::Slices, params::SLICES, props.slices),
            (PropertyField::Level, params::LEVEL, props.level),
        ];
        for (field, name, value) in ints {
            report.record(field, write_param(encoders, video, name, ParamValue::Int(value), field.name()));
        }
        report.record(
            PropertyField::GopOnSceneChange,
            write_param(encoders, video, params::GOP_SCENE, ParamValue::Bool(props.gop_on_scene_change), "gopOnSceneChange"),
        );
        report.record(
            PropertyField::OpenGop,
            write_param(encoders, video, params::OPEN_GOP, ParamValue::Bool(props.open_gop), "openGop"),
        );
        if props.framerate != 0 {
            report.record(PropertyField::Framerate, write_framerate(encoders, props.framerate));
        }
        if props.width != 0 && props.height != 0 {
            report.record(
                PropertyField::Resolution,
                write_resolution(encoders, props.width, props.height),
            );
        }
        report.record(PropertyField::Profile, write_profile(encoders, props.profile));

        self.refresh_properties();
        Ok(report)
    }

    fn encoders_mut(&mut self) -> Result<&mut dyn EncoderPair> {
        Ok(self.active_mut()?.encoders.as_mut())
    }

    fn encoders(&self) -> Result<&dyn EncoderPair> {
        Ok(self.active()?.encoders.as_ref())
    }

    /// Write a bitrate; zero is rejected
    pub fn set_bitrate(&mut self, encoder: EncoderKind, kbps: i32) -> Result<()> {
        let field = match encoder {
            EncoderKind::Audio => "audioBitrate",
            EncoderKind::Video => "videoBitrate",
        };
        if kbps == 0 {
            return Err(ConfigError::Zero(field).into());
        }
        write_param(self.encoders_mut()?, encoder, params::BITRATE, ParamValue::Int(kbps), field)?;
        self.refresh_properties();
        Ok(())
    }

    /// Write an integer video parameter; zero is allowed
    pub fn set_video_int(&mut self, name: &str, field: &'static str, value: i32) -> Result<()> {
        write_param(self.encoders_mut()?, EncoderKind::Video, name, ParamValue::Int(value), field)?;
        self.refresh_properties();
        Ok(())
    }

    /// Write a boolean video parameter
    pub fn set_video_flag(&mut self, name: &str, field: &'static str, value: bool) -> Result<()> {
        write_param(self.encoders_mut()?, EncoderKind::Video, name, ParamValue::Bool(value), field)?;
        self.refresh_properties();
        Ok(())
    }

    /// Select the capture input of both encoders
    pub fn set_input_mode(&mut self, mode: InputMode) -> Result<()> {
        let encoders = self.encoders_mut()?;
        let value = ParamValue::Int(mode.code());
        write_param(encoders, EncoderKind::Audio, params::INPUT_MODE, value, "inputMode")?;
        write_param(encoders, EncoderKind::Video, params::INPUT_MODE, value, "inputMode")?;
        tracing::debug!(mode = mode.code(), "input mode set");
        Ok(())
    }

    pub fn set_framerate(&mut self, fps: u32) -> Result<()> {
        write_framerate(self.encoders_mut()?, fps)?;
        self.refresh_properties();
        Ok(())
    }

    /// Replace width and height together; both must be non-zero
    pub fn set_resolution(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ConfigError::Zero("resolution").into());
        }
        write_resolution(self.encoders_mut()?, width, height)?;
        self.refresh_properties();
        Ok(())
    }

    pub fn set_profile(&mut self, code: i32) -> Result<()> {
        write_profile(self.encoders_mut()?, Profile::from_code(code))?;
        self.refresh_properties();
        Ok(())
    }

    /// Read an encoder parameter straight from the engine
    pub fn parameter(&self, encoder: EncoderKind, name: &str) -> Result<ParamValue> {
        self.encoders()?
            .parameter(encoder, name)
            .ok_or_else(|| EngineError::UnknownParameter(name.to_string()).into())
    }

    /// Read the video attribute set straight from the engine
    pub fn attributes(&self) -> Result<AttributeSet> {
        self.encoders()?
            .attributes()
            .ok_or_else(|| EngineError::NoAttributes.into())
    }
}

impl std::fmt::Debug for SourcePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePipeline")
            .field("state", &self.state())
            .field("muxed", &self.is_muxed())
            .field("properties", &self.properties)
            .finish()
    }
}

fn read_properties(encoders: &dyn EncoderPair, previous: &SourceProperties) -> SourceProperties {
    let int = |kind, name, fallback: i32| {
        encoders
            .parameter(kind, name)
            .and_then(|v| v.as_int())
            .unwrap_or(fallback)
    };
    let flag = |name, fallback: bool| {
        encoders
            .parameter(EncoderKind::Video, name)
            .and_then(|v| v.as_bool())
            .unwrap_or(fallback)
    };
    let video = EncoderKind::Video;
    let mut props = SourceProperties {
        audio_bitrate: int(EncoderKind::Audio, params::BITRATE, previous.audio_bitrate),
        video_bitrate: int(video, params::BITRATE, previous.video_bitrate),
        gop_length: int(video, params::GOP_LENGTH, previous.gop_length),
        gop_on_scene_change: flag(params::GOP_SCENE, previous.gop_on_scene_change),
        open_gop: flag(params::OPEN_GOP, previous.open_gop),
        b_frames: int(video, params::BFRAMES, previous.b_frames),
        p_frames: int(video, params::PFRAMES, previous.p_frames),
        slices: int(video, params::SLICES, previous.slices),
        level: int(video, params::LEVEL, previous.level),
        ..previous.clone()
    };
    if let Some(attrs) = encoders.attributes() {
        props.width = attrs.width.unwrap_or(0);
        props.height = attrs.height.unwrap_or(0);
        props.framerate = attrs.framerate.unwrap_or(0);
        props.profile = Profile::from_name(attrs.profile.as_deref());
    }
    props
}

fn write_param(
    encoders: &mut dyn EncoderPair,
    encoder: EncoderKind,
    name: &str,
    value: ParamValue,
    field: &'static str,
) -> std::result::Result<(), ConfigError> {
    encoders
        .set_parameter(encoder, name, value)
        .map_err(|source| ConfigError::Engine { field, source })?;
    match encoders.parameter(encoder, name) {
        Some(actual) if actual == value => Ok(()),
        actual => Err(ConfigError::NotAccepted {
            field,
            requested: value.to_string(),
            actual: actual.map(|v| v.to_string()).unwrap_or_else(|| "none".into()),
        }),
    }
}

/// Read the whole attribute set, edit it, write it back and return the read-back
fn replace_attributes<F>(
    encoders: &mut dyn EncoderPair,
    field: &'static str,
    edit: F,
) -> std::result::Result<AttributeSet, ConfigError>
where
    F: FnOnce(&mut AttributeSet),
{
    let no_attributes = || ConfigError::Engine {
        field,
        source: EngineError::NoAttributes,
    };
    let mut attrs = encoders.attributes().ok_or_else(no_attributes)?;
    edit(&mut attrs);
    tracing::debug!(field, attributes = ?attrs, "replacing attribute set");
    encoders
        .set_attributes(attrs)
        .map_err(|source| ConfigError::Engine { field, source })?;
    encoders.attributes().ok_or_else(no_attributes)
}

fn write_framerate(encoders: &mut dyn EncoderPair, fps: u32) -> std::result::Result<(), ConfigError> {
    let actual = replace_attributes(encoders, "framerate", |a| a.framerate = Some(fps))?;
    if actual.framerate == Some(fps) {
        Ok(())
    } else {
        Err(ConfigError::NotAccepted {
            field: "framerate",
            requested: fps.to_string(),
            actual: format!("{:?}", actual.framerate),
        })
    }
}

fn write_resolution(
    encoders: &mut dyn EncoderPair,
    width: u32,
    height: u32,
) -> std::result::Result<(), ConfigError> {
    let actual = replace_attributes(encoders, "resolution", |a| {
        a.width = Some(width);
        a.height = Some(height);
    })?;
    if actual.width == Some(width) && actual.height == Some(height) {
        Ok(())
    } else {
        Err(ConfigError::NotAccepted {
            field: "resolution",
            requested: format!("{}x{}", width, height),
            actual: format!(
                "{}x{}",
                actual.width.unwrap_or(0),
                actual.height.unwrap_or(0)
            ),
        })
    }
}

fn write_profile(encoders: &mut dyn EncoderPair, profile: Profile) -> std::result::Result<(), ConfigError> {
    let actual = replace_attributes(encoders, "profile", |a| {
        a.profile = Some(profile.as_str().to_string())
    })?;
    let actual = Profile::from_name(actual.profile.as_deref());
    if actual == profile {
        Ok(())
    } else {
        Err(ConfigError::NotAccepted {
            field: "profile",
            requested: profile.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::media::{Caps, SimulatedEngine, StreamKind};

    #[derive(Default)]
    struct Count(AtomicUsize);

    impl EdgeTarget for Count {
        fn receive(&self, _sample: &Sample) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline(engine: Arc<SimulatedEngine>) -> (SourcePipeline, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pipeline = SourcePipeline::new(
            engine,
            Arc::new(|_| {}),
            Arc::new(move || {
                let _ = tx.lock().send(());
            }),
        );
        (pipeline, rx)
    }

    fn video_sample() -> Sample {
        Sample::keyframe(
            StreamKind::Video,
            Bytes::from_static(b"frame"),
            Duration::ZERO,
            Arc::new(Caps::new("video/x-h264")),
        )
    }

    #[test]
    fn test_create_and_destroy() {
        let engine = Arc::new(SimulatedEngine::manual());
        let (mut source, _rx) = pipeline(Arc::clone(&engine));
        assert_eq!(source.state(), SourceState::Absent);
        assert!(matches!(source.play(), Err(Error::NoSource)));

        source.create().unwrap();
        assert_eq!(source.state(), SourceState::Ready);
        source.play().unwrap();
        assert_eq!(source.state(), SourceState::Playing);

        assert!(source.destroy());
        assert!(!source.destroy());
        assert_eq!(source.state(), SourceState::Absent);
    }

    #[test]
    fn test_ensure_muxed_is_idempotent_and_feeds_transport() {
        let engine = Arc::new(SimulatedEngine::manual());
        let (mut source, _rx) = pipeline(Arc::clone(&engine));
        source.create().unwrap();

        assert!(source.ensure_muxed().unwrap());
        assert!(!source.ensure_muxed().unwrap());
        assert_eq!(engine.muxer_count(), 1);

        let ts = Arc::new(Count::default());
        source.transport_junction().unwrap().request_port(ts.clone());
        source.video_junction().unwrap().push(&video_sample());
        assert_eq!(ts.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_halt_removes_muxer_through_barriers() {
        let engine = Arc::new(SimulatedEngine::manual());
        let (mut source, rx) = pipeline(Arc::clone(&engine));
        source.create().unwrap();
        source.ensure_muxed().unwrap();
        source.play().unwrap();
        let ts = Arc::new(Count::default());
        let transport = source.transport_junction().unwrap();
        transport.request_port(ts.clone());

        source.halt().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(source.state(), SourceState::Ready);
        assert!(!source.is_muxed());
        assert_eq!(source.audio_junction().unwrap().port_count(), 0);
        assert_eq!(source.video_junction().unwrap().port_count(), 0);
        source.video_junction().unwrap().push(&video_sample());
        assert_eq!(ts.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_and_resume_only_change_matching_states() {
        let (mut source, _rx) = pipeline(Arc::new(SimulatedEngine::manual()));
        source.create().unwrap();
        assert!(!source.pause().unwrap());

        source.play().unwrap();
        assert!(source.pause().unwrap());
        assert_eq!(source.state(), SourceState::Paused);
        assert!(source.resume().unwrap());
        assert!(!source.resume().unwrap());
        assert_eq!(source.state(), SourceState::Playing);
    }

    #[test]
    fn test_apply_properties_reports_each_field() {
        let (mut source, _rx) = pipeline(Arc::new(SimulatedEngine::manual()));
        source.create().unwrap();
        let mut props = source.refresh_properties().clone();
        props.audio_bitrate = 96;
        props.video_bitrate = 50_000;
        props.gop_length = 25;

        let report = source.apply_properties(props).unwrap();

        assert_eq!(report.get(PropertyField::AudioBitrate), Some(&Ok(())));
        assert!(matches!(
            report.get(PropertyField::VideoBitrate),
            Some(Err(ConfigError::NotAccepted { .. }))
        ));
        assert_eq!(source.properties().audio_bitrate, 96);
        assert_eq!(source.properties().video_bitrate, 2_000);
        assert_eq!(source.properties().gop_length, 25);
    }

    #[test]
    fn test_zero_fields_are_skipped() {
        let (mut source, _rx) = pipeline(Arc::new(SimulatedEngine::manual()));
        source.create().unwrap();
        let props = SourceProperties {
            width: 640,
            ..SourceProperties::default()
        };

        let report = source.apply_properties(props).unwrap();
        let applied: Vec<_> = report.applied().collect();
        assert!(!applied.contains(&PropertyField::AudioBitrate));
        assert!(!applied.contains(&PropertyField::Framerate));
        assert!(!applied.contains(&PropertyField::Resolution));
        assert!(applied.contains(&PropertyField::Profile));
    }

    #[test]
    fn test_rebuild_restores_properties() {
        let engine = Arc::new(SimulatedEngine::manual());
        let (mut source, _rx) = pipeline(Arc::clone(&engine));
        source.create().unwrap();
        source.set_video_int(params::GOP_LENGTH, "gopLength", 30).unwrap();
        source.set_resolution(1920, 1080).unwrap();

        source.rebuild().unwrap();

        assert_eq!(engine.opened_count(), 2);
        assert_eq!(
            source.parameter(EncoderKind::Video, params::GOP_LENGTH).unwrap(),
            ParamValue::Int(30)
        );
        let attrs = source.attributes().unwrap();
        assert_eq!((attrs.width, attrs.height), (Some(1920), Some(1080)));
    }

    #[test]
    fn test_set_resolution_round_trip_and_zero() {
        let (mut source, _rx) = pipeline(Arc::new(SimulatedEngine::manual()));
        source.create().unwrap();

        source.set_resolution(1280, 720).unwrap();
        assert_eq!(source.properties().width, 1280);
        assert_eq!(source.properties().height, 720);

        assert!(matches!(
            source.set_resolution(0, 0),
            Err(Error::Config(ConfigError::Zero(_)))
        ));
        assert!(matches!(
            source.set_bitrate(EncoderKind::Audio, 0),
            Err(Error::Config(ConfigError::Zero("audioBitrate")))
        ));
    }

    #[test]
    fn test_profile_and_input_mode() {
        let (mut source, _rx) = pipeline(Arc::new(SimulatedEngine::manual()));
        source.create().unwrap();

        source.set_profile(1).unwrap();
        assert_eq!(source.properties().profile, Profile::High);
        source.set_profile(5).unwrap();
        assert_eq!(source.properties().profile, Profile::Main);

        source.set_input_mode(InputMode::Background).unwrap();
        assert_eq!(
            source.parameter(EncoderKind::Audio, params::INPUT_MODE).unwrap(),
            ParamValue::Int(2)
        );
    }
}
