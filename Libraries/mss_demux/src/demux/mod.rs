//! The demuxer controller.
//!
//! [`MssDemux`] accumulates the manifest delivered by the host, exposes one output
//! channel per playable stream and runs one fetch loop per channel. Seeks and bitrate
//! reconfigurations stop every loop, reposition the streams and restart them.

pub mod host;
mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use host::{
    ChannelEvent, ChannelId, ChannelInfo, FlowError, Format, Host, OutputBuffer, Query, QueryAnswer, SeekRequest,
    Segment, SinkEvent,
};

use crate::caps;
use crate::config::DemuxConfig;
use crate::download::Fetcher;
use crate::error::DemuxError;
use crate::manifest::{Manifest, StreamType};
use crate::selector;
use stream::{DemuxStream, OutputChannel};

/// Lifecycle states driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

impl State {
    fn step_towards(self, target: State) -> State {
        use State::*;
        match (self, target > self) {
            (Null, true) => Ready,
            (Ready, true) => Paused,
            (Paused, true) => Playing,
            (Playing, false) => Paused,
            (Paused, false) => Ready,
            (Ready, false) => Null,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingManifest,
    Streaming,
}

/// Settings shared with the fetch loops.
pub(crate) struct Settings {
    config: Mutex<DemuxConfig>,
    /// Set when the bitrate ceiling may have changed since the last selection.
    update_bitrates: AtomicBool,
}

impl Settings {
    fn new(config: DemuxConfig) -> Self {
        Self {
            config: Mutex::new(config),
            update_bitrates: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> DemuxConfig {
        self.config.lock().clone()
    }

    pub fn mark_dirty(&self) {
        self.update_bitrates.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.update_bitrates.load(Ordering::Acquire)
    }

    /// Clears the dirty flag, returning whether this call was the one to clear it.
    pub fn take_dirty(&self) -> bool {
        self.update_bitrates.swap(false, Ordering::AcqRel)
    }
}

/// A parsed manifest and where it came from.
pub(crate) struct Session {
    pub manifest: Arc<Manifest>,
    pub base_url: String,
    pub manifest_uri: String,
    /// Serializes live manifest reloads.
    pub reload_lock: tokio::sync::Mutex<()>,
}

pub(crate) enum ControlMessage {
    Reconfigure,
}

/// What a fetch loop shares with the controller.
pub(crate) struct LoopShared {
    pub host: Arc<dyn Host>,
    pub settings: Arc<Settings>,
    pub session: Arc<Session>,
    pub control: mpsc::UnboundedSender<ControlMessage>,
}

#[derive(Default)]
struct ChannelNames {
    videos: u32,
    audios: u32,
}

impl ChannelNames {
    fn next(&mut self, stream_type: StreamType) -> Option<ChannelId> {
        let (prefix, counter) = match stream_type {
            StreamType::Video => ("video", &mut self.videos),
            StreamType::Audio => ("audio", &mut self.audios),
            StreamType::Unknown => return None,
        };
        let id = ChannelId::new(format!("{prefix}_{:02}", *counter));
        *counter += 1;
        Some(id)
    }
}

struct DemuxState {
    phase: Phase,
    loop_shared: Option<Arc<LoopShared>>,
    streams: Vec<DemuxStream>,
    segment: Segment,
    names: ChannelNames,
}

impl Default for DemuxState {
    fn default() -> Self {
        Self {
            phase: Phase::AwaitingManifest,
            loop_shared: None,
            streams: Vec::new(),
            segment: Segment::default(),
            names: ChannelNames::default(),
        }
    }
}

struct Inner {
    host: Arc<dyn Host>,
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<Settings>,
    element_state: Mutex<State>,
    manifest_buffer: Mutex<BytesMut>,
    /// Current manifest, readable without waiting on the controller lock.
    manifest: RwLock<Option<Arc<Manifest>>>,
    state: tokio::sync::Mutex<DemuxState>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    root_token: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

/// Smooth Streaming demuxer.
///
/// Cloning yields another handle on the same demuxer.
#[derive(Clone)]
pub struct MssDemux {
    inner: Arc<Inner>,
}

impl MssDemux {
    pub fn new(host: Arc<dyn Host>, fetcher: Arc<dyn Fetcher>, config: DemuxConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                host,
                fetcher,
                settings: Arc::new(Settings::new(config)),
                element_state: Mutex::new(State::Null),
                manifest_buffer: Mutex::new(BytesMut::new()),
                manifest: RwLock::new(None),
                state: tokio::sync::Mutex::new(DemuxState::default()),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
                root_token: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.element_state.lock()
    }

    /// Walks the lifecycle one state at a time until `target` is reached.
    pub async fn set_state(&self, target: State) {
        loop {
            let current = self.state();
            if current == target {
                return;
            }
            let next = current.step_towards(target);
            debug!("State change {:?} -> {:?}", current, next);
            match (current, next) {
                (State::Ready, State::Paused) => {
                    self.inner.state.lock().await.segment = Segment::default();
                }
                (State::Paused, State::Ready) => self.inner.reset().await,
                _ => {}
            }
            *self.inner.element_state.lock() = next;
        }
    }

    /// Appends a chunk of manifest data.
    pub fn chain(&self, data: Bytes) -> Result<(), FlowError> {
        if self.state() < State::Paused {
            debug!("Refusing manifest data while not started");
            return Err(FlowError::Flushing);
        }
        let mut buffer = self.inner.manifest_buffer.lock();
        buffer.extend_from_slice(&data);
        info!("Received manifest buffer, total size is {} bytes", buffer.len());
        Ok(())
    }

    pub async fn sink_event(&self, event: SinkEvent) -> Result<(), DemuxError> {
        match event {
            SinkEvent::Eos => self.inner.process_manifest().await,
            SinkEvent::FlushStop => {
                self.inner.reset().await;
                Ok(())
            }
        }
    }

    pub async fn seek(&self, request: SeekRequest) -> bool {
        self.inner.seek(request).await
    }

    /// Stores a new connection speed in bits per second, 0 meaning unknown.
    ///
    /// Running fetch loops pick the change up and trigger a reconfiguration.
    pub fn set_connection_speed(&self, speed: u64) {
        self.inner.settings.config.lock().connection_speed = speed;
        self.inner.settings.mark_dirty();
        debug!("Connection speed set to {speed} bps");
    }

    pub fn connection_speed(&self) -> u64 {
        self.inner.settings.config.lock().connection_speed
    }

    pub fn config(&self) -> DemuxConfig {
        self.inner.settings.config()
    }

    pub fn query(&self, query: Query) -> Option<QueryAnswer> {
        let manifest = self.inner.manifest.read().clone();
        match query {
            Query::Duration(Format::Time) => {
                let duration = manifest?.duration()?;
                debug!("Replying to duration query: {:?}", duration);
                Some(QueryAnswer::Duration(duration))
            }
            Query::Seeking(Format::Time) => {
                let manifest = manifest?;
                if manifest.is_live() {
                    return None;
                }
                Some(QueryAnswer::Seeking {
                    seekable: true,
                    start: Duration::ZERO,
                    stop: manifest.duration(),
                })
            }
            Query::Latency => Some(QueryAnswer::Latency {
                live: manifest.map(|manifest| manifest.is_live()).unwrap_or(false),
                min: Duration::ZERO,
                max: None,
            }),
            _ => None,
        }
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.inner.manifest.read().clone()
    }

    /// Currently exposed channels, in stream order.
    pub async fn channels(&self) -> Vec<ChannelInfo> {
        let state = self.inner.state.lock().await;
        state.streams.iter().map(|stream| stream.channel().info().clone()).collect()
    }

    /// Selected bitrate of every exposed channel.
    pub async fn current_bitrates(&self) -> Vec<(ChannelId, u64)> {
        let state = self.inner.state.lock().await;
        state
            .streams
            .iter()
            .map(|stream| (stream.channel().id().clone(), stream.stream().lock().current_bitrate()))
            .collect()
    }

    /// Stops every fetch loop, removes the channels and forgets the manifest.
    pub async fn reset(&self) {
        self.inner.reset().await;
    }
}

impl Inner {
    async fn process_manifest(self: &Arc<Self>) -> Result<(), DemuxError> {
        let data = {
            let buffer = self.manifest_buffer.lock();
            if buffer.is_empty() {
                warn!("Received EOS without a manifest.");
                return Ok(());
            }
            Bytes::copy_from_slice(&buffer)
        };

        let mut state = self.state.lock().await;
        if state.phase == Phase::Streaming {
            debug!("Manifest already processed");
            return Ok(());
        }

        let Some(uri) = self.host.upstream_uri() else {
            return Err(self.fail(DemuxError::NoManifestUri));
        };
        info!("Upstream is using URI: {uri}");
        let base_url = base_url(&uri);

        info!("Received manifest: {} bytes", data.len());
        let manifest = match Manifest::parse(&data) {
            Ok(manifest) => Arc::new(manifest),
            Err(e) => return Err(self.fail(e.into())),
        };
        info!("Live stream: {}", manifest.is_live());

        let session = Arc::new(Session {
            manifest: manifest.clone(),
            base_url,
            manifest_uri: uri,
            reload_lock: tokio::sync::Mutex::new(()),
        });
        self.create_streams(&mut state, &manifest)?;

        state.loop_shared = Some(Arc::new(LoopShared {
            host: self.host.clone(),
            settings: self.settings.clone(),
            session,
            control: self.control_tx.clone(),
        }));
        state.phase = Phase::Streaming;
        *self.manifest.write() = Some(manifest);

        self.spawn_control_task();
        self.start_loops(&mut state);
        Ok(())
    }

    fn create_streams(&self, state: &mut DemuxState, manifest: &Manifest) -> Result<(), DemuxError> {
        if manifest.streams().is_empty() {
            return Err(self.fail(DemuxError::NoPlayableStreams { detail: "no streams found at the Manifest" }));
        }

        let mut candidates = Vec::new();
        for shared in manifest.streams() {
            let stream_type = shared.lock().stream_type();
            let Some(id) = state.names.next(stream_type) else {
                warn!("Skipping unknown type stream");
                continue;
            };
            shared.lock().set_active(true);
            candidates.push((id, shared.clone()));
        }

        let config = self.settings.config();
        info!("Changing max bitrate to {}", config.connection_speed);
        manifest.change_bitrate(config.connection_speed);
        self.settings.take_dirty();

        for (id, shared) in candidates {
            let (stream_type, caps) = {
                let stream = shared.lock();
                (stream.stream_type(), caps::stream_caps(&stream))
            };
            let Some(caps) = caps else {
                warn!("Couldn't get caps from manifest stream {id}, not exposing it");
                shared.lock().set_active(false);
                continue;
            };

            let channel = Arc::new(OutputChannel::new(ChannelInfo { id, stream_type, caps }));
            self.expose_channel(&channel, state.segment.clone());
            state.streams.push(DemuxStream::new(
                channel,
                shared,
                self.fetcher.clone(),
                config.download_rate_history,
            ));
        }

        if state.streams.is_empty() {
            return Err(self.fail(DemuxError::NoPlayableStreams {
                detail: "No known stream formats found at the Manifest",
            }));
        }
        self.host.no_more_channels();
        Ok(())
    }

    fn expose_channel(&self, channel: &OutputChannel, segment: Segment) {
        let info = channel.info();
        info!("Adding channel {} with caps {}", info.id, info.caps);
        self.host.add_channel(info);
        self.host.push_event(&info.id, ChannelEvent::StreamStart { stream_id: info.id.to_string() });
        self.host.push_event(&info.id, ChannelEvent::Caps(info.caps.clone()));
        channel.set_pending_segment(segment);
    }

    fn fail(&self, error: DemuxError) -> DemuxError {
        error!("{}: {}", error, error.debug_detail());
        self.host.post_error(&error);
        error
    }

    fn spawn_control_task(self: &Arc<Self>) {
        let Some(mut rx) = self.control_rx.lock().take() else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(self);
        let token = self.root_token.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = rx.recv() => message,
                };
                let Some(message) = message else { break };
                let Some(inner) = weak.upgrade() else { break };
                match message {
                    ControlMessage::Reconfigure => inner.reconfigure().await,
                }
            }
            debug!("Control task stopped");
        });
    }

    /// Starts every loop, including the ones that ended on EOS or an error.
    fn start_loops(&self, state: &mut DemuxState) {
        let Some(shared) = state.loop_shared.clone() else {
            return;
        };
        for stream in &mut state.streams {
            stream.start(&shared, &self.root_token);
        }
    }

    /// Restarts only the loops that were stopped from outside.
    fn resume_loops(&self, state: &mut DemuxState) {
        let Some(shared) = state.loop_shared.clone() else {
            return;
        };
        for stream in state.streams.iter_mut().filter(|stream| stream.is_resumable()) {
            stream.start(&shared, &self.root_token);
        }
    }

    async fn stop_loops(&self, state: &mut DemuxState) {
        for stream in &state.streams {
            stream.cancel();
        }
        for stream in &mut state.streams {
            stream.join().await;
        }
    }

    fn push_to_all(&self, state: &DemuxState, event: ChannelEvent) {
        for stream in &state.streams {
            self.host.push_event(stream.channel().id(), event.clone());
        }
    }

    async fn seek(&self, request: SeekRequest) -> bool {
        if request.format != Format::Time {
            warn!("Only time format seeks are supported");
            return false;
        }

        let mut state = self.state.lock().await;
        let Some(manifest) = self.manifest.read().clone() else {
            debug!("No manifest to seek in");
            return false;
        };
        if manifest.is_live() {
            warn!("Seeking is not supported on live streams");
            return false;
        }

        debug!("Seeking to {:?}", request.start);
        if request.flush {
            self.push_to_all(&state, ChannelEvent::FlushStart);
        }
        self.stop_loops(&mut state).await;

        if !manifest.seek(request.start) {
            warn!("Could not find seeked fragment");
            if request.flush {
                self.push_to_all(&state, ChannelEvent::FlushStop);
            }
            self.start_loops(&mut state);
            return false;
        }

        state.segment.do_seek(request.rate, request.start, request.stop);
        for stream in &state.streams {
            stream.channel().set_pending_segment(state.segment.clone());
        }
        if request.flush {
            self.push_to_all(&state, ChannelEvent::FlushStop);
        }
        self.start_loops(&mut state);
        true
    }

    async fn reconfigure(&self) {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Streaming {
            return;
        }

        debug!("Starting streams reconfiguration due to bitrate changes");
        self.stop_loops(&mut state).await;

        let config = self.settings.config();
        let mut changed = false;
        for stream in state.streams.iter().filter(|stream| stream.is_resumable()) {
            let ceiling = selector::stream_ceiling(
                config.connection_speed,
                config.bitrate_limit,
                stream.measured_rate(),
                config.adaptive_bitrate,
            );
            let mut logical = stream.stream().lock();
            if logical.is_active() && selector::select_bitrate(&mut logical, ceiling) {
                info!(
                    "Changed {} to bitrate {} (ceiling {})",
                    stream.channel().id(),
                    logical.current_bitrate(),
                    ceiling
                );
                changed = true;
            }
        }

        if changed {
            let DemuxState { streams, segment, names, .. } = &mut *state;
            let mut retired = Vec::new();
            for stream in streams.iter_mut().filter(|stream| stream.is_resumable()) {
                let (stream_type, caps, start) = {
                    let logical = stream.stream().lock();
                    (
                        logical.stream_type(),
                        caps::stream_caps(&logical),
                        logical.fragment_timestamp().unwrap_or_default(),
                    )
                };
                let Some(caps) = caps else {
                    warn!("No caps for the new quality of {}, keeping its channel", stream.channel().id());
                    continue;
                };
                let Some(id) = names.next(stream_type) else {
                    continue;
                };

                let channel = Arc::new(OutputChannel::new(ChannelInfo { id, stream_type, caps }));
                self.expose_channel(&channel, segment.starting_at(start));
                retired.push(stream.replace_channel(channel));
            }
            self.host.no_more_channels();

            for channel in retired {
                debug!("Retiring channel {}", channel.id());
                self.host.push_event(channel.id(), ChannelEvent::Eos);
                self.host.remove_channel(channel.id());
            }
        } else {
            debug!("No bitrate change, resuming streams");
        }

        self.resume_loops(&mut state);
    }

    async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.stop_loops(&mut state).await;
        for stream in state.streams.drain(..) {
            self.host.remove_channel(stream.channel().id());
        }
        *state = DemuxState::default();
        self.settings.take_dirty();

        self.manifest_buffer.lock().clear();
        *self.manifest.write() = None;
        debug!("Demuxer reset");
    }
}

/// Strips the trailing `/Manifest` component of the manifest URI.
fn base_url(uri: &str) -> String {
    match uri.to_ascii_lowercase().rfind("/manifest") {
        Some(index) => uri[..index].to_string(),
        None => {
            warn!("Stream's URI didn't end with /manifest");
            uri.to_string()
        }
    }
}
