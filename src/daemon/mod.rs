//! The daemon aggregate
//!
//! [`Daemon`] owns the source pipeline and the three consumers behind one
//! coarse lock, exposes the control API and runs the control loop.
//!
//! # Locking
//!
//! Every control call and every control loop event takes the lock for the
//! duration of one logical transition. Nothing awaits while holding it:
//! enabling the upstream connects between two locked halves, enabling HLS
//! binds its listener the same way, and segment directories are removed
//! after the lock is released.

pub mod attribute;
pub mod config;
mod control;
pub mod coordinator;
pub mod event;
pub mod notify;
pub mod timer;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::hls::{Credentials, HlsControl, HttpServer, HttpState, SegmentedLiveServer};
use crate::media::{params, EncoderKind, MediaEngine};
use crate::rtsp::{RtspDistributor, RtspHost};
use crate::source::{InputMode, SourcePipeline};
use crate::upstream::{Connector, TcpConnector, UpstreamPusher};

pub use attribute::{Attribute, AttributeValue};
pub use config::DaemonConfig;
pub use coordinator::{ConsumerStates, Context};
pub use event::{Consumer, ControlEvent, EventSender, ProbeEvent, TimerKind};
pub use notify::{Notification, Notifier};
pub use timer::TimerSlot;

use coordinator::Core;

pub(crate) struct Shared {
    pub(crate) config: DaemonConfig,
    pub(crate) core: Mutex<Core>,
    pub(crate) notifier: Notifier,
    pub(crate) events: EventSender,
    connector: Arc<dyn Connector>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
}

/// Builder for [`Daemon`]
pub struct DaemonBuilder {
    config: DaemonConfig,
    engine: Option<Arc<dyn MediaEngine>>,
    rtsp_host: Option<Arc<dyn RtspHost>>,
    connector: Option<Arc<dyn Connector>>,
}

impl DaemonBuilder {
    /// Media engine providing the encoders and the muxer (required)
    pub fn engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// RTSP server the distributor mounts its presentations on (required)
    pub fn rtsp_host(mut self, host: Arc<dyn RtspHost>) -> Self {
        self.rtsp_host = Some(host);
        self
    }

    /// Upstream connector; plain TCP by default
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Create the daemon with a fresh source pipeline
    pub fn build(self) -> Result<Daemon> {
        let config = self.config;
        let engine = self.engine.ok_or(Error::MissingCollaborator("media engine"))?;
        let host = self.rtsp_host.ok_or(Error::MissingCollaborator("rtsp host"))?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.upstream.connect_timeout)));

        let (events, receiver) = EventSender::channel();
        let notifier = Notifier::new(config.notify_capacity);

        let engine_events = events.clone();
        let halted = events.clone();
        let mut source = SourcePipeline::new(
            engine,
            Arc::new(move |event| engine_events.post(ControlEvent::Engine(event))),
            Arc::new(move || halted.post(ControlEvent::MuxerHalted)),
        );
        source.create()?;

        let host_events = events.clone();
        host.set_event_sink(Arc::new(move |event| host_events.post(ControlEvent::Rtsp(event))));

        let core = Core::new(
            source,
            RtspDistributor::new(config.rtsp.clone(), host),
            SegmentedLiveServer::new(config.hls.clone()),
            UpstreamPusher::new(config.upstream.clone()),
        );
        tracing::info!("daemon created");

        Ok(Daemon(Arc::new(Shared {
            config,
            core: Mutex::new(core),
            notifier,
            events,
            connector,
            receiver: Mutex::new(Some(receiver)),
        })))
    }
}

/// Handle to the daemon; cheap to clone
#[derive(Clone)]
pub struct Daemon(Arc<Shared>);

impl Daemon {
    pub fn builder(config: DaemonConfig) -> DaemonBuilder {
        DaemonBuilder {
            config,
            engine: None,
            rtsp_host: None,
            connector: None,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.0.config
    }

    /// Start the control loop; it runs until [`shutdown`](Self::shutdown)
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        let receiver = self
            .0
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("control loop already started".into()))?;
        Ok(tokio::spawn(control::run(Arc::clone(&self.0), receiver)))
    }

    /// Receive notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.0.notifier.subscribe()
    }

    /// Snapshot of the consumer states
    pub fn states(&self) -> ConsumerStates {
        self.0.core.lock().states()
    }

    /// Enable or disable the RTSP distributor
    ///
    /// Empty `path` and zero `port` select the configured defaults; an empty
    /// `user` serves without authentication.
    pub async fn enable_rtsp(&self, enable: bool, path: &str, port: u16, user: &str, pass: &str) -> bool {
        let shared = &self.0;
        let mut core = shared.core.lock();
        if enable {
            let enabled = core.with_rtsp(&shared.notifier, &shared.events, |r, ctx| {
                r.enable(ctx, path, port, user, pass)
            });
            core.coordinate(&shared.notifier);
            enabled
        } else {
            let disabled = core.with_rtsp(&shared.notifier, &shared.events, |r, ctx| r.disable(ctx));
            if disabled {
                core.after_disable(&shared.notifier);
            }
            disabled
        }
    }

    /// Enable or disable the HLS server
    pub async fn enable_hls(&self, enable: bool, port: u16, user: &str, pass: &str) -> bool {
        let shared = &self.0;
        if !enable {
            let directory = {
                let mut core = shared.core.lock();
                let directory = core.with_hls(&shared.notifier, &shared.events, |h, ctx| h.disable(ctx));
                if directory.is_some() {
                    core.after_disable(&shared.notifier);
                }
                directory
            };
            return match directory {
                Some(directory) => {
                    control::remove_directory(directory).await;
                    true
                }
                None => false,
            };
        }

        let directory = {
            let mut core = shared.core.lock();
            core.hls.begin_enable()
        };
        let Some(directory) = directory else {
            return false;
        };
        let state = HttpState {
            directory: directory.clone(),
            playlist_name: shared.config.hls.playlist_name.clone(),
            realm: shared.config.hls.realm.clone(),
            credentials: Credentials::new(user, pass),
            control: Arc::new(HlsBridge {
                shared: Arc::downgrade(shared),
            }),
        };
        let http = match tokio::fs::create_dir_all(&directory).await {
            Ok(()) => HttpServer::bind(port, state).await,
            Err(e) => Err(e),
        };

        let mut core = shared.core.lock();
        let enabled = core.with_hls(&shared.notifier, &shared.events, |h, ctx| h.finish_enable(ctx, http));
        core.coordinate(&shared.notifier);
        enabled
    }

    /// Enable or disable the TCP upstream
    ///
    /// The connect runs without the daemon lock held. A refused connection
    /// returns false and leaves the upstream disabled.
    pub async fn enable_upstream(&self, enable: bool, host: &str, port: u16, token: &str) -> bool {
        let shared = &self.0;
        if !enable {
            let mut core = shared.core.lock();
            let disabled = core.with_upstream(&shared.notifier, &shared.events, |u, ctx| u.disable(ctx));
            if disabled {
                core.after_disable(&shared.notifier);
            }
            return disabled;
        }

        let ticket = {
            let mut core = shared.core.lock();
            core.with_upstream(&shared.notifier, &shared.events, |u, ctx| {
                u.begin_enable(ctx, host, port)
            })
        };
        let Some(ticket) = ticket else {
            return false;
        };
        let connection = shared.connector.connect(host, port).await;

        let mut core = shared.core.lock();
        let enabled = core.with_upstream(&shared.notifier, &shared.events, |u, ctx| {
            u.finish_enable(ctx, ticket, connection, token)
        });
        core.coordinate(&shared.notifier);
        enabled
    }

    /// Replace the video resolution
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut core = self.0.core.lock();
        core.source.set_resolution(width, height)
    }

    /// Read an attribute
    pub fn property(&self, attribute: Attribute) -> Result<AttributeValue> {
        let mut core = self.0.core.lock();
        if let Some(value) = consumer_property(&core, attribute) {
            return Ok(value);
        }
        if attribute == Attribute::InputMode {
            let mode = core.source.parameter(EncoderKind::Video, params::INPUT_MODE)?;
            return Ok(AttributeValue::Int(mode.as_int().unwrap_or(0).into()));
        }
        let props = core.source.refresh_properties();
        let value = match attribute {
            Attribute::AudioBitrate => props.audio_bitrate.into(),
            Attribute::VideoBitrate => props.video_bitrate.into(),
            Attribute::GopLength => props.gop_length.into(),
            Attribute::GopOnSceneChange => props.gop_on_scene_change.into(),
            Attribute::OpenGop => props.open_gop.into(),
            Attribute::BFrames => props.b_frames.into(),
            Attribute::PFrames => props.p_frames.into(),
            Attribute::Slices => props.slices.into(),
            Attribute::Level => props.level.into(),
            Attribute::Width => props.width.into(),
            Attribute::Height => props.height.into(),
            Attribute::Framerate => props.framerate.into(),
            Attribute::Profile => props.profile.code().into(),
            other => return Err(Error::UnknownAttribute(other.name().to_string())),
        };
        Ok(value)
    }

    /// Write an attribute; the engine's read-back decides success
    pub fn set_property(&self, attribute: Attribute, value: AttributeValue) -> Result<()> {
        if !attribute.is_writable() {
            return Err(Error::ReadOnlyAttribute(attribute.name().to_string()));
        }
        let shared = &self.0;
        let mut core = shared.core.lock();
        let source = &mut core.source;
        tracing::debug!(%attribute, %value, "set property");

        match attribute {
            Attribute::AudioBitrate => source.set_bitrate(EncoderKind::Audio, value.expect_i32(attribute)?),
            Attribute::VideoBitrate => source.set_bitrate(EncoderKind::Video, value.expect_i32(attribute)?),
            Attribute::GopLength => source.set_video_int(params::GOP_LENGTH, "gopLength", value.expect_i32(attribute)?),
            Attribute::BFrames => source.set_video_int(params::BFRAMES, "bFrames", value.expect_i32(attribute)?),
            Attribute::PFrames => source.set_video_int(params::PFRAMES, "pFrames", value.expect_i32(attribute)?),
            Attribute::Slices => source.set_video_int(params::SLICES, "slices", value.expect_i32(attribute)?),
            Attribute::Level => source.set_video_int(params::LEVEL, "level", value.expect_i32(attribute)?),
            Attribute::GopOnSceneChange => {
                source.set_video_flag(params::GOP_SCENE, "gopOnSceneChange", value.expect_bool(attribute)?)
            }
            Attribute::OpenGop => source.set_video_flag(params::OPEN_GOP, "openGop", value.expect_bool(attribute)?),
            Attribute::Width => {
                let height = source.refresh_properties().height;
                source.set_resolution(value.expect_u32(attribute)?, height)
            }
            Attribute::Height => {
                let width = source.refresh_properties().width;
                source.set_resolution(width, value.expect_u32(attribute)?)
            }
            Attribute::Framerate => source.set_framerate(value.expect_u32(attribute)?),
            Attribute::Profile => source.set_profile(value.expect_i32(attribute)?),
            Attribute::InputMode => {
                let mode = InputMode::try_from(value.expect_i32(attribute)?)?;
                source.set_input_mode(mode)
            }
            Attribute::AutoBitrate => {
                let adaptive = value.expect_bool(attribute)?;
                core.with_upstream(&shared.notifier, &shared.events, |u, ctx| {
                    u.set_adaptive_bitrate(ctx, adaptive)
                });
                Ok(())
            }
            other => Err(Error::ReadOnlyAttribute(other.name().to_string())),
        }
    }

    /// Disable every consumer, destroy the source and stop the control loop
    pub async fn shutdown(&self) {
        let shared = &self.0;
        tracing::info!("daemon shutting down");
        let directory = {
            let mut core = shared.core.lock();
            core.with_upstream(&shared.notifier, &shared.events, |u, ctx| u.disable(ctx));
            core.with_rtsp(&shared.notifier, &shared.events, |r, ctx| r.disable(ctx));
            let directory = core.with_hls(&shared.notifier, &shared.events, |h, ctx| h.disable(ctx));
            core.source.destroy();
            core.sync_source_state(&shared.notifier);
            directory
        };
        if let Some(directory) = directory {
            control::remove_directory(directory).await;
        }
        shared.events.post(ControlEvent::Shutdown);
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").field("states", &self.states()).finish()
    }
}

fn consumer_property(core: &Core, attribute: Attribute) -> Option<AttributeValue> {
    let value = match attribute {
        Attribute::AutoBitrate => core.upstream.adaptive_bitrate().into(),
        Attribute::SourceState => core.source.state().code().into(),
        Attribute::RtspState => core.rtsp.state().code().into(),
        Attribute::HlsState => core.hls.state().code().into(),
        Attribute::UpstreamState => core.upstream.state().code().into(),
        Attribute::RtspClientCount => AttributeValue::Int(core.rtsp.client_count() as i64),
        Attribute::UriParameters => AttributeValue::Text(core.rtsp.query().to_string()),
        Attribute::Path => AttributeValue::Text(core.rtsp.path().to_string()),
        _ => return None,
    };
    Some(value)
}

/// Lets the HLS listener drive its server without owning the daemon
struct HlsBridge {
    shared: Weak<Shared>,
}

#[async_trait]
impl HlsControl for HlsBridge {
    async fn playlist_requested(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let (first_segment, wait) = {
            let mut core = shared.core.lock();
            let first_segment = core.with_hls(&shared.notifier, &shared.events, |h, ctx| {
                h.on_playlist_request(ctx)
            });
            core.coordinate(&shared.notifier);
            (first_segment, core.hls.config().segment_duration)
        };
        let Some(mut first_segment) = first_segment else {
            return false;
        };
        let ready = *first_segment.borrow();
        if !ready {
            let timed_out = tokio::time::timeout(wait, first_segment.wait_for(|ready| *ready))
                .await
                .is_err();
            if timed_out {
                tracing::debug!("first segment not ready in time");
            }
        }
        true
    }

    fn touch(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut core = shared.core.lock();
            core.with_hls(&shared.notifier, &shared.events, |h, ctx| h.touch(ctx));
        }
    }
}
