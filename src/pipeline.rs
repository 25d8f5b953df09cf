//! Session orchestration
//!
//! Components start in dependency order (tracking, discovery, server,
//! encoders, capture) and stop in reverse. Each component runs in its own
//! context:
//!
//! - tracking, camera, video and audio encoding on dedicated threads
//! - muxer, supervisor and address watcher as tokio tasks
//!
//! A fatal fault reported from any context cancels the root token, which
//! unwinds every component. The host still calls [`Pipeline::stop`] to join
//! them.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::source::sleep_unless_cancelled;
use crate::capture::{
    create_shared_buffer, latest_slot, AudioBackend, CameraBackend, FrameSource,
    FrameSynchronizer, RawFrame, SharedRingBuffer, SlotReader, SyntheticCamera, ToneGenerator,
};
use crate::clock::{RetryPolicy, SessionClock};
use crate::codec::{AudioCodec, AudioEncoder, EncodedUnit, EncodingStage, StageState, VideoCodec, VideoEncoder};
use crate::config::{AppConfig, AudioSourceKind, CameraKind, StreamConfig, TrackerKind, VideoSettings};
use crate::constants::{POSE_HISTORY_CAPACITY, RING_BUFFER_CAPACITY};
use crate::discovery::{local_ip, service_attributes, DiscoveryAdvertiser, ServiceRegistry};
use crate::error::{CaptureError, CodecError, Error, FaultReporter, Result};
use crate::mux::{DataMuxer, MuxScheduler, StreamUnit};
use crate::rtsp::{StatusHandle, StatusPublisher, StreamDistributor, StreamServer, ServerStatus};
use crate::tracking::{
    SimulatedTracker, TrackerSample, TrackingBackend, TrackingSession, TrackingState,
    TrackingStateHandle, UnsupportedTracker,
};

const FRAME_WAIT: Duration = Duration::from_millis(50);
const AUDIO_IDLE: Duration = Duration::from_millis(5);
const MUX_TICK: Duration = Duration::from_millis(10);
const ENCODER_READY_TIMEOUT: Duration = Duration::from_secs(5);
const SIMULATED_DEPTH: (u32, u32) = (160, 90);

pub type VideoCodecFactory = Box<dyn FnOnce() -> std::result::Result<Box<dyn VideoCodec>, CodecError> + Send>;
pub type AudioCodecFactory = Box<dyn FnOnce() -> std::result::Result<Box<dyn AudioCodec>, CodecError> + Send>;

/// Collaborators the pipeline drives.
///
/// Codecs are built by factories on their worker thread, since encoder
/// handles are not `Send`.
pub struct Components {
    pub camera: Box<dyn CameraBackend>,
    pub audio: Box<dyn AudioBackend>,
    pub tracker: Box<dyn TrackingBackend>,
    pub registry: Option<Box<dyn ServiceRegistry>>,
    pub video_codec: VideoCodecFactory,
    pub audio_codec: AudioCodecFactory,
}

impl Components {
    /// Default backends for `config`. Codec settings are checked here so an
    /// unsupported configuration fails before anything is acquired.
    pub fn for_config(config: &AppConfig, clock: SessionClock) -> Result<Self> {
        let stream = &config.stream;

        let camera: Box<dyn CameraBackend> = match config.capture.camera {
            CameraKind::Synthetic => Box::new(SyntheticCamera::new(clock)),
        };

        let audio = audio_backend(config, clock);

        let tracker: Box<dyn TrackingBackend> = match config.tracking.backend {
            TrackerKind::Simulated => {
                let tracker = SimulatedTracker::new(clock);
                if stream.include_depth {
                    Box::new(tracker.with_depth(SIMULATED_DEPTH.0, SIMULATED_DEPTH.1))
                } else {
                    Box::new(tracker)
                }
            }
            TrackerKind::Unsupported => Box::new(UnsupportedTracker::new("no AR runtime on this host")),
        };

        let registry = if config.discovery.enabled {
            mdns_registry()
        } else {
            None
        };

        Ok(Self {
            camera,
            audio,
            tracker,
            registry,
            video_codec: video_codec_factory(stream)?,
            audio_codec: audio_codec_factory(stream)?,
        })
    }
}

fn audio_backend(config: &AppConfig, clock: SessionClock) -> Box<dyn AudioBackend> {
    let settings = config.stream.audio;
    match config.capture.audio {
        #[cfg(feature = "microphone")]
        AudioSourceKind::Microphone => Box::new(crate::capture::CpalMicrophone::new(
            clock,
            config.capture.audio_device.clone(),
            settings.sample_rate,
            settings.channels,
        )),
        #[cfg(not(feature = "microphone"))]
        AudioSourceKind::Microphone => {
            warn!("Built without microphone support, using a test tone");
            Box::new(ToneGenerator::new(clock, settings.sample_rate, settings.channels))
        }
        AudioSourceKind::Tone => Box::new(ToneGenerator::new(clock, settings.sample_rate, settings.channels)),
    }
}

#[cfg(feature = "mdns")]
fn mdns_registry() -> Option<Box<dyn ServiceRegistry>> {
    match crate::discovery::MdnsRegistry::new() {
        Ok(registry) => Some(Box::new(registry)),
        Err(e) => {
            warn!("Service discovery unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "mdns"))]
fn mdns_registry() -> Option<Box<dyn ServiceRegistry>> {
    warn!("Built without mDNS support, the stream will not be advertised");
    None
}

#[cfg(feature = "h264")]
fn video_codec_factory(stream: &StreamConfig) -> Result<VideoCodecFactory> {
    use crate::codec::H264Codec;

    let settings = stream.video;
    if stream.has_video {
        H264Codec::check_settings(&settings)?;
    }
    Ok(Box::new(move || {
        H264Codec::new(&settings).map(|codec| Box::new(codec) as Box<dyn VideoCodec>)
    }))
}

#[cfg(not(feature = "h264"))]
fn video_codec_factory(stream: &StreamConfig) -> Result<VideoCodecFactory> {
    if stream.has_video {
        return Err(CodecError::Unsupported("built without H.264 support".into()).into());
    }
    Ok(Box::new(|| Err(CodecError::Unsupported("built without H.264 support".into()))))
}

fn audio_codec_factory(stream: &StreamConfig) -> Result<AudioCodecFactory> {
    use crate::codec::OpusCodec;

    let settings = stream.audio;
    if stream.has_audio {
        OpusCodec::check_settings(&settings)?;
    }
    Ok(Box::new(move || {
        OpusCodec::new(&settings).map(|codec| Box::new(codec) as Box<dyn AudioCodec>)
    }))
}

/// A running streaming session
pub struct Pipeline {
    stream: StreamConfig,
    clock: SessionClock,
    root: CancellationToken,
    capture_cancel: CancellationToken,
    encoder_cancel: CancellationToken,
    discovery_cancel: CancellationToken,
    tracking_cancel: CancellationToken,
    status: Arc<StatusPublisher>,
    tracking_state: Option<TrackingStateHandle>,
    advertised_ip: Option<IpAddr>,

    tracking_thread: Option<JoinHandle<()>>,
    advertiser: Option<Arc<Mutex<DiscoveryAdvertiser>>>,
    watcher_task: Option<tokio::task::JoinHandle<()>>,
    server: Option<StreamServer>,
    mux_task: Option<tokio::task::JoinHandle<()>>,
    video_worker: Option<JoinHandle<()>>,
    audio_worker: Option<JoinHandle<()>>,
    frame_source: Option<FrameSource>,
    audio_backend: Option<Box<dyn AudioBackend>>,
    supervisor_task: Option<tokio::task::JoinHandle<()>>,
    faulted: Arc<AtomicBool>,
    stopped: bool,
}

impl Pipeline {
    /// Start a session with the default backends. Must run inside a tokio runtime.
    pub async fn start(config: AppConfig) -> Result<Self> {
        config.stream.validate()?;
        let clock = SessionClock::new();
        let components = Components::for_config(&config, clock)?;
        Self::start_with(config, clock, components).await
    }

    /// Start a session with explicit backends.
    ///
    /// The configuration is validated before any component is touched. When a
    /// later step fails, everything already started is stopped again.
    pub async fn start_with(config: AppConfig, clock: SessionClock, components: Components) -> Result<Self> {
        config.stream.validate()?;
        info!(
            mode = ?config.stream.mode,
            video = config.stream.has_video,
            audio = config.stream.has_audio,
            ar = config.stream.has_ar,
            resolution = %config.stream.resolution_string(),
            "Starting pipeline"
        );

        let root = CancellationToken::new();
        let (faults, fault_rx) = FaultReporter::channel();
        let status = Arc::new(StatusPublisher::new());
        let faulted = Arc::new(AtomicBool::new(false));

        let mut pipeline = Pipeline {
            stream: config.stream.clone(),
            clock,
            capture_cancel: root.child_token(),
            encoder_cancel: root.child_token(),
            discovery_cancel: root.child_token(),
            tracking_cancel: root.child_token(),
            root: root.clone(),
            status: status.clone(),
            tracking_state: None,
            advertised_ip: None,
            tracking_thread: None,
            advertiser: None,
            watcher_task: None,
            server: None,
            mux_task: None,
            video_worker: None,
            audio_worker: None,
            frame_source: None,
            audio_backend: None,
            supervisor_task: Some(tokio::spawn(supervise(fault_rx, status, faulted.clone(), root))),
            faulted,
            stopped: false,
        };

        if let Err(e) = pipeline.start_components(&config, components, faults).await {
            error!("Pipeline start failed: {}", e);
            pipeline.stop().await;
            pipeline.status.record_error(&e);
            return Err(e);
        }

        info!("Pipeline started");
        Ok(pipeline)
    }

    async fn start_components(
        &mut self,
        config: &AppConfig,
        components: Components,
        faults: FaultReporter,
    ) -> Result<()> {
        let Components {
            camera,
            audio,
            tracker,
            registry,
            video_codec,
            audio_codec,
        } = components;
        let stream = config.stream.clone();

        // Tracking
        let poses = if stream.has_ar {
            let tc = &config.tracking;
            let session = TrackingSession::new(
                tracker,
                RetryPolicy::new(tc.retry_attempts, Duration::from_millis(tc.retry_backoff_ms)),
                stream.include_depth,
                tc.max_depth_bytes,
            );
            self.tracking_state = Some(session.state_handle());
            let (pose_tx, pose_rx) = bounded(POSE_HISTORY_CAPACITY);
            self.tracking_thread = Some(spawn_tracking(
                session,
                pose_tx,
                Duration::from_millis(tc.poll_interval_ms.max(1)),
                faults.clone(),
                self.tracking_cancel.clone(),
            )?);
            Some(pose_rx)
        } else {
            None
        };

        // Discovery, registered once the port is known
        self.advertiser = registry.map(|r| Arc::new(Mutex::new(DiscoveryAdvertiser::new(r))));

        // Server
        let server = StreamServer::start(
            config.server.clone(),
            stream.clone(),
            config.discovery.service_name.clone(),
            self.clock,
            self.status.clone(),
            &self.root,
        )?;
        let bound = server.local_addr();
        let host = advertised_host(bound);
        self.advertised_ip = Some(host);
        self.status.set_running(Some(server.url_for(host)));
        let distributor = server.distributor();
        self.server = Some(server);

        if let Some(advertiser) = self.advertiser.clone() {
            let name = config.discovery.service_name.clone();
            let attributes = service_attributes(&stream);
            let registered = tokio::task::spawn_blocking(move || {
                let mut advertiser = advertiser.lock();
                advertiser.register(&name, host, bound.port(), attributes)
            })
            .await;
            match registered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => faults.report(e),
                Err(e) => warn!("Registration task failed: {}", e),
            }
            self.watcher_task = Some(tokio::spawn(watch_address(
                self.advertiser.clone(),
                Duration::from_secs(config.discovery.address_poll_secs.max(1)),
                self.discovery_cancel.clone(),
            )));
        }

        // Muxer
        let (mux_tx, mux_rx) = mpsc::channel(config.mux.channel_capacity.max(1));
        self.mux_task = Some(tokio::spawn(mux_loop(
            mux_rx,
            distributor,
            self.clock,
            Duration::from_millis(config.mux.reorder_window_ms),
        )));

        // Encoders
        let frame_writer = if stream.needs_camera() {
            let (writer, reader) = latest_slot::<RawFrame>();
            let worker = VideoWorker {
                frames: reader,
                poses,
                tracking: self.tracking_state.clone(),
                sync: FrameSynchronizer::new(config.tracking.sync_tolerance()),
                include_depth: stream.include_depth,
                output: mux_tx.clone(),
                faults: faults.clone(),
                cancel: self.encoder_cancel.clone(),
            };
            let codec = stream.has_video.then_some((video_codec, stream.video));
            let (ready_tx, ready_rx) = oneshot::channel();
            self.video_worker = Some(worker.spawn(codec, ready_tx)?);
            wait_ready("video", ready_rx).await?;
            Some(writer)
        } else {
            None
        };

        let ring = if stream.has_audio {
            let ring = create_shared_buffer(RING_BUFFER_CAPACITY);
            let worker = AudioWorker {
                ring: ring.clone(),
                output: mux_tx.clone(),
                faults: faults.clone(),
                cancel: self.encoder_cancel.clone(),
            };
            let (ready_tx, ready_rx) = oneshot::channel();
            self.audio_worker = Some(worker.spawn(audio_codec, ready_tx)?);
            wait_ready("audio", ready_rx).await?;
            Some(ring)
        } else {
            None
        };
        drop(mux_tx);

        // Capture
        if let Some(writer) = frame_writer {
            let cc = &config.capture;
            let retry = RetryPolicy::new(cc.retry_attempts, Duration::from_millis(cc.retry_backoff_ms));
            let video = stream.video;
            let faults = faults.clone();
            let cancel = self.capture_cancel.clone();
            let source = tokio::task::spawn_blocking(move || {
                FrameSource::start(camera, video, retry, writer, faults, cancel)
            })
            .await
            .map_err(|e| CaptureError::StreamError(e.to_string()))??;
            self.frame_source = Some(source);
        }

        if let Some(ring) = ring {
            let faults = faults.clone();
            let (backend, started) = tokio::task::spawn_blocking(move || {
                let mut audio = audio;
                let started = audio.start(ring, faults);
                (audio, started)
            })
            .await
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;
            self.audio_backend = Some(backend);
            started?;
        }

        Ok(())
    }

    /// Stop every component in reverse start order. Idempotent, and safe after
    /// a partial start or a fatal teardown.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Stopping pipeline");

        self.capture_cancel.cancel();
        if let Some(mut source) = self.frame_source.take() {
            join_blocking("camera", move || source.stop()).await;
        }
        if let Some(mut audio) = self.audio_backend.take() {
            join_blocking("audio capture", move || audio.stop()).await;
        }

        // Encoders drain into the muxer, which exits once both are gone
        self.encoder_cancel.cancel();
        for (name, worker) in [("video encoder", self.video_worker.take()), ("audio encoder", self.audio_worker.take())] {
            if let Some(handle) = worker {
                join_thread(name, handle).await;
            }
        }
        if let Some(task) = self.mux_task.take() {
            if let Err(e) = task.await {
                warn!("Muxer task failed: {}", e);
            }
        }

        if let Some(mut server) = self.server.take() {
            server.shutdown().await;
        }

        self.discovery_cancel.cancel();
        if let Some(task) = self.watcher_task.take() {
            let _ = task.await;
        }
        if let Some(advertiser) = self.advertiser.take() {
            join_blocking("discovery", move || {
                advertiser.lock().shutdown();
            })
            .await;
        }

        self.tracking_cancel.cancel();
        if let Some(handle) = self.tracking_thread.take() {
            join_thread("tracking", handle).await;
        }

        self.root.cancel();
        if let Some(task) = self.supervisor_task.take() {
            let _ = task.await;
        }
        self.status.set_stopped();
        info!("Pipeline stopped");
    }

    /// Resolves once the session was torn down, by a fatal fault or by [`stop`](Self::stop)
    pub async fn closed(&self) {
        self.root.cancelled().await;
    }

    /// Whether a fatal fault tore the session down. Stays set after [`stop`](Self::stop).
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Current tracking state; `NotTracking` when the session carries no AR
    pub fn tracking_state(&self) -> TrackingState {
        self.tracking_state
            .as_ref()
            .map_or(TrackingState::NotTracking, TrackingStateHandle::get)
    }

    pub fn tracking_handle(&self) -> Option<TrackingStateHandle> {
        self.tracking_state.clone()
    }

    pub fn status(&self) -> ServerStatus {
        self.status.handle().get()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.handle()
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(StreamServer::local_addr)
    }

    pub fn is_advertised(&self) -> bool {
        self.advertiser
            .as_ref()
            .is_some_and(|a| a.lock().is_registered())
    }

    /// SDP served to clients, as seen from the advertised address
    pub fn session_sdp(&self) -> Option<String> {
        let server = self.server.as_ref()?;
        let host = self.advertised_ip?;
        Some(server.session_description(host).to_sdp())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn advertised_host(bound: SocketAddr) -> IpAddr {
    let ip = bound.ip();
    if !ip.is_unspecified() {
        return ip;
    }
    local_ip().unwrap_or_else(|e| {
        warn!("Falling back to loopback: {}", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

async fn wait_ready(name: &str, ready: oneshot::Receiver<std::result::Result<(), CodecError>>) -> Result<()> {
    match tokio::time::timeout(ENCODER_READY_TIMEOUT, ready).await {
        Ok(Ok(result)) => result.map_err(Error::from),
        Ok(Err(_)) => Err(CodecError::EncoderInit(format!("{} encoder thread exited", name)).into()),
        Err(_) => Err(CodecError::EncoderInit(format!("{} encoder did not start in time", name)).into()),
    }
}

async fn join_thread(name: &'static str, handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => debug!("{} thread joined", name),
        _ => warn!("{} thread panicked", name),
    }
}

async fn join_blocking<F>(name: &'static str, f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = tokio::task::spawn_blocking(f).await {
        warn!("Stopping {} failed: {}", name, e);
    }
}

/// Records every fault; cancels the session on the first fatal one
async fn supervise(
    mut faults: mpsc::UnboundedReceiver<Error>,
    status: Arc<StatusPublisher>,
    faulted: Arc<AtomicBool>,
    root: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            fault = faults.recv() => match fault {
                Some(err) => {
                    status.record_error(&err);
                    if err.is_fatal() {
                        error!("Fatal fault, tearing the session down: {}", err);
                        faulted.store(true, Ordering::Release);
                        root.cancel();
                        status.set_stopped();
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

fn spawn_tracking(
    mut session: TrackingSession,
    poses: Sender<TrackerSample>,
    interval: Duration,
    faults: FaultReporter,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ar-tracking".into())
        .spawn(move || {
            if let Err(e) = session.start_until(&cancel) {
                if cancel.is_cancelled() {
                    debug!("Tracking start abandoned");
                    return;
                }
                warn!("Streaming without AR data: {}", e);
                faults.report(e);
                return;
            }

            while sleep_unless_cancelled(&cancel, interval) {
                let polled = session.poll();
                if !polled.fresh {
                    continue;
                }
                if let Some(sample) = polled.sample {
                    if let Err(TrySendError::Disconnected(_)) = poses.try_send(sample) {
                        break;
                    }
                }
            }

            session.stop();
            debug!(state = %session.state(), "Tracking stopped");
        })
}

/// Pairs frames with poses and encodes them
struct VideoWorker {
    frames: SlotReader<RawFrame>,
    poses: Option<Receiver<TrackerSample>>,
    tracking: Option<TrackingStateHandle>,
    sync: FrameSynchronizer,
    include_depth: bool,
    output: mpsc::Sender<StreamUnit>,
    faults: FaultReporter,
    cancel: CancellationToken,
}

impl VideoWorker {
    /// `codec` is absent for AR-only sessions
    fn spawn(
        self,
        codec: Option<(VideoCodecFactory, VideoSettings)>,
        ready: oneshot::Sender<std::result::Result<(), CodecError>>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("video-encoder".into())
            .spawn(move || {
                let stage = match codec {
                    Some((factory, settings)) => {
                        match build_stage(factory, |codec| VideoEncoder::new(codec, &settings)) {
                            Ok(stage) => Some(stage),
                            Err(e) => {
                                let _ = ready.send(Err(e));
                                return;
                            }
                        }
                    }
                    None => None,
                };
                let _ = ready.send(Ok(()));
                self.run(stage);
            })
    }

    fn run(mut self, mut stage: Option<EncodingStage<VideoEncoder>>) {
        while !self.cancel.is_cancelled() {
            self.drain_poses();
            match self.frames.take_timeout(FRAME_WAIT) {
                Ok(Some(frame)) => {
                    if !self.process(stage.as_mut(), frame) {
                        break;
                    }
                }
                Ok(None) => {}
                // Capture ended
                Err(_) => break,
            }
        }
        if let Some(stage) = stage.as_mut() {
            self.finish(stage);
        }
    }

    fn drain_poses(&mut self) {
        if let Some(poses) = &self.poses {
            for sample in poses.try_iter() {
                self.sync.push_sample(sample);
            }
        }
    }

    /// Returns false once the pipeline should stop
    fn process(&mut self, stage: Option<&mut EncodingStage<VideoEncoder>>, frame: RawFrame) -> bool {
        let state = self
            .tracking
            .as_ref()
            .map_or(TrackingState::NotTracking, TrackingStateHandle::get);
        let synced = self.sync.synchronize(frame, state, self.include_depth);
        let mut ar = synced.ar;

        let units = match stage {
            Some(stage) => match stage.submit(synced.frame) {
                Ok(units) => units,
                Err(e) => {
                    self.faults.report(e);
                    return false;
                }
            },
            None => Vec::new(),
        };

        if units.is_empty() {
            return match ar.take() {
                Some(ar) => emit(&self.output, DataMuxer::combine(None, None, Some(ar))),
                None => true,
            };
        }
        for unit in units {
            if !emit(&self.output, DataMuxer::combine(Some(unit), None, ar.take())) {
                return false;
            }
        }
        true
    }

    fn finish(&self, stage: &mut EncodingStage<VideoEncoder>) {
        if stage.state() == StageState::Running {
            match stage.drain() {
                Ok(units) => {
                    for unit in units {
                        emit(&self.output, DataMuxer::combine(Some(unit), None, None));
                    }
                }
                Err(e) => self.faults.report(e),
            }
        }
        let stats = stage.stats();
        info!(
            frames = stats.units_encoded,
            key_frames = stats.key_frames,
            avg_bytes = stats.average_unit_size(),
            "Video encoder finished"
        );
        stage.release();
    }
}

/// Pulls PCM from the ring buffer and encodes it
struct AudioWorker {
    ring: SharedRingBuffer,
    output: mpsc::Sender<StreamUnit>,
    faults: FaultReporter,
    cancel: CancellationToken,
}

impl AudioWorker {
    fn spawn(
        self,
        factory: AudioCodecFactory,
        ready: oneshot::Sender<std::result::Result<(), CodecError>>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("audio-encoder".into())
            .spawn(move || {
                let stage = match build_stage(factory, AudioEncoder::new) {
                    Ok(stage) => stage,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));
                self.run(stage);
            })
    }

    fn run(self, mut stage: EncodingStage<AudioEncoder>) {
        'outer: loop {
            let cancelled = self.cancel.is_cancelled();
            let mut idle = true;
            while let Some(chunk) = self.ring.pop() {
                idle = false;
                match stage.submit(chunk) {
                    Ok(units) => {
                        for unit in units {
                            if !self.send(unit) {
                                break 'outer;
                            }
                        }
                    }
                    Err(e) => {
                        self.faults.report(e);
                        break 'outer;
                    }
                }
            }
            if cancelled {
                break;
            }
            if idle {
                thread::sleep(AUDIO_IDLE);
            }
        }

        if stage.state() == StageState::Running {
            match stage.drain() {
                Ok(units) => {
                    for unit in units {
                        self.send(unit);
                    }
                }
                Err(e) => self.faults.report(e),
            }
        }
        let stats = stage.stats();
        info!(
            packets = stats.units_encoded,
            overwritten = self.ring.overwritten(),
            "Audio encoder finished"
        );
        stage.release();
    }

    fn send(&self, unit: EncodedUnit) -> bool {
        emit(&self.output, DataMuxer::combine(None, Some(unit), None))
    }
}

fn build_stage<C, E>(
    factory: Box<dyn FnOnce() -> std::result::Result<C, CodecError> + Send>,
    encoder: impl FnOnce(C) -> E,
) -> std::result::Result<EncodingStage<E>, CodecError>
where
    E: crate::codec::MediaEncoder,
{
    let codec = factory()?;
    let mut stage = EncodingStage::new();
    stage.configure(encoder(codec))?;
    stage.start()?;
    Ok(stage)
}

/// Returns false once the muxer is gone
fn emit(output: &mpsc::Sender<StreamUnit>, unit: Option<StreamUnit>) -> bool {
    match unit {
        Some(unit) => output.blocking_send(unit).is_ok(),
        None => true,
    }
}

async fn mux_loop(
    mut input: mpsc::Receiver<StreamUnit>,
    distributor: Arc<StreamDistributor>,
    clock: SessionClock,
    window: Duration,
) {
    let mut scheduler = MuxScheduler::new(window);
    let mut tick = tokio::time::interval(MUX_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            unit = input.recv() => match unit {
                Some(unit) => {
                    scheduler.push(unit);
                }
                None => break,
            },
            _ = tick.tick() => {
                for unit in scheduler.pop_ready(clock.now_micros()) {
                    distributor.publish(unit);
                }
            }
        }
    }

    for unit in scheduler.flush() {
        distributor.publish(unit);
    }
    let stats = scheduler.stats();
    info!(
        emitted = stats.emitted,
        late_dropped = stats.late_dropped,
        published = distributor.published(),
        "Muxer stopped"
    );
}

/// Re-registers the service when the host address changes
async fn watch_address(
    advertiser: Option<Arc<Mutex<DiscoveryAdvertiser>>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let Some(advertiser) = advertiser else {
        return;
    };
    let mut tick = tokio::time::interval(period);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let Ok(ip) = local_ip() else {
                    continue;
                };
                let advertiser = advertiser.clone();
                let changed = tokio::task::spawn_blocking(move || {
                    let mut advertiser = advertiser.lock();
                    advertiser.on_address_changed(ip)
                })
                .await;
                if let Ok(Err(e)) = changed {
                    warn!("Re-registration after address change failed: {}", e);
                }
            }
        }
    }
}
