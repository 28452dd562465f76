//! Output channels and the per-stream fetch loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::host::{ChannelEvent, ChannelId, ChannelInfo, FlowError, OutputBuffer, Segment};
use super::{ControlMessage, LoopShared};
use crate::download::{DownloadRate, Fetcher};
use crate::error::{DemuxError, TimelineError};
use crate::manifest::{ManifestDocument, SharedStream};
use crate::selector;

/// An exposed output channel.
#[derive(Debug)]
pub(crate) struct OutputChannel {
    info: ChannelInfo,
    /// Segment to push before the next buffer, set by seeks and channel switches.
    pending_segment: Mutex<Option<Segment>>,
    next_timestamp: Mutex<Option<Duration>>,
}

impl OutputChannel {
    pub fn new(info: ChannelInfo) -> Self {
        Self {
            info,
            pending_segment: Mutex::new(None),
            next_timestamp: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.info.id
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn set_pending_segment(&self, segment: Segment) {
        *self.pending_segment.lock() = Some(segment);
    }

    pub fn take_pending_segment(&self) -> Option<Segment> {
        self.pending_segment.lock().take()
    }

    /// Remembers where the buffer at `pts` ends. Returns whether `pts` is not where the
    /// previous buffer ended.
    pub fn track_timestamp(&self, pts: Duration, duration: Option<Duration>) -> bool {
        let mut next = self.next_timestamp.lock();
        let discont = *next != Some(pts);
        *next = duration.map(|duration| pts + duration);
        discont
    }
}

/// Why a fetch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    Eos,
    Cancelled,
    Reconfigure,
    Flushing,
    Error,
}

impl LoopExit {
    /// Whether the loop was stopped from outside and should pick up where it left off.
    pub fn is_resumable(self) -> bool {
        matches!(self, LoopExit::Cancelled | LoopExit::Reconfigure)
    }
}

struct StreamTask {
    cancel: CancellationToken,
    handle: JoinHandle<LoopExit>,
}

/// A logical stream bound to its output channel and fetch loop.
pub(crate) struct DemuxStream {
    channel: Arc<OutputChannel>,
    stream: SharedStream,
    download_rate: Arc<Mutex<DownloadRate>>,
    fetcher: Arc<dyn Fetcher>,
    task: Option<StreamTask>,
    last_exit: Option<LoopExit>,
}

impl DemuxStream {
    pub fn new(channel: Arc<OutputChannel>, stream: SharedStream, fetcher: Arc<dyn Fetcher>, history: usize) -> Self {
        Self {
            channel,
            stream,
            download_rate: Arc::new(Mutex::new(DownloadRate::new(history))),
            fetcher,
            task: None,
            last_exit: None,
        }
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }

    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub fn measured_rate(&self) -> Option<u64> {
        self.download_rate.lock().current_rate()
    }

    /// False once the loop returned on its own because of EOS or an error.
    pub fn is_resumable(&self) -> bool {
        self.last_exit.map_or(true, LoopExit::is_resumable)
    }

    /// Points the stream at a new channel, returning the old one.
    pub fn replace_channel(&mut self, channel: Arc<OutputChannel>) -> Arc<OutputChannel> {
        std::mem::replace(&mut self.channel, channel)
    }

    /// Spawns the fetch loop unless one is still running.
    pub fn start(&mut self, shared: &Arc<LoopShared>, parent: &CancellationToken) {
        if let Some(task) = &self.task {
            if !task.handle.is_finished() {
                return;
            }
        }

        let cancel = parent.child_token();
        let context = FetchContext {
            channel: self.channel.clone(),
            stream: self.stream.clone(),
            download_rate: self.download_rate.clone(),
            fetcher: self.fetcher.clone(),
            shared: shared.clone(),
        };
        let span = info_span!("fetch_loop", channel = %self.channel.id());
        let handle = tokio::spawn(context.run(cancel.clone()).instrument(span));
        self.task = Some(StreamTask { cancel, handle });
        self.last_exit = None;
    }

    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.cancel.cancel();
        }
    }

    /// Waits for the fetch loop to return. Call [`DemuxStream::cancel`] first to stop it.
    pub async fn join(&mut self) -> Option<LoopExit> {
        let task = self.task.take()?;
        let exit = match task.handle.await {
            Ok(exit) => {
                trace!("Fetch loop of {} returned {:?}", self.channel.id(), exit);
                exit
            }
            Err(e) => {
                warn!("Fetch loop of {} did not complete: {e}", self.channel.id());
                LoopExit::Error
            }
        };
        self.last_exit = Some(exit);
        Some(exit)
    }
}

impl Drop for DemuxStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct FetchContext {
    channel: Arc<OutputChannel>,
    stream: SharedStream,
    download_rate: Arc<Mutex<DownloadRate>>,
    fetcher: Arc<dyn Fetcher>,
    shared: Arc<LoopShared>,
}

impl FetchContext {
    async fn run(self, cancel: CancellationToken) -> LoopExit {
        let id = self.channel.id().clone();
        let mut failures = 0u32;
        debug!("Starting fetch loop");

        loop {
            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            self.check_download_rate();
            if self.shared.settings.is_dirty() {
                if self.shared.settings.take_dirty() {
                    debug!("Bitrate changes pending, requesting reconfiguration");
                    if self.shared.control.send(ControlMessage::Reconfigure).is_err() {
                        warn!("Demuxer is gone, dropping reconfiguration request");
                    }
                }
                return LoopExit::Reconfigure;
            }

            let request = self.stream.lock().fragment_request();
            let request = match request {
                Ok(request) => request,
                Err(TimelineError::Eos) => {
                    if self.shared.session.manifest.is_live() {
                        match self.reload_live_manifest(&cancel).await {
                            Some(true) => continue,
                            Some(false) => {
                                let interval = self.shared.settings.config().manifest_reload_interval();
                                if !sleep_or_cancel(interval, &cancel).await {
                                    return LoopExit::Cancelled;
                                }
                                continue;
                            }
                            None => return LoopExit::Cancelled,
                        }
                    }

                    self.push_pending_segment();
                    debug!("Reached end of stream, pushing EOS");
                    self.shared.host.push_event(&id, ChannelEvent::Eos);
                    return LoopExit::Eos;
                }
                Err(source) => {
                    let error = DemuxError::FragmentUrl { channel: id.to_string(), source };
                    error!("{}: {}", error, error.debug_detail());
                    self.shared.host.post_error(&error);
                    return LoopExit::Error;
                }
            };

            let url = format!("{}/{}", self.shared.session.base_url, request.path);
            trace!("Fetching fragment {} from {}", request.number, url);
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                result = self.fetcher.fetch(&url) => result,
            };

            let data = match result {
                Ok(data) => {
                    failures = 0;
                    data
                }
                Err(source) => {
                    failures += 1;
                    let config = self.shared.settings.config();
                    if failures >= config.max_download_errors {
                        let error = DemuxError::DownloadFailed {
                            channel: id.to_string(),
                            url,
                            attempts: failures,
                            source,
                        };
                        error!("{}: {}", error, error.debug_detail());
                        self.shared.host.post_error(&error);
                        return LoopExit::Error;
                    }

                    let delay = config.retry_delay(failures);
                    warn!("Failed to download {} (attempt {}): {}, retrying in {:?}", url, failures, source, delay);
                    if !sleep_or_cancel(delay, &cancel).await {
                        return LoopExit::Cancelled;
                    }
                    continue;
                }
            };

            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }
            self.download_rate.lock().add_sample(data.len(), started.elapsed());

            self.push_pending_segment();
            let discont = self.channel.track_timestamp(request.timestamp, request.duration);
            let buffer = OutputBuffer {
                data,
                pts: request.timestamp,
                duration: request.duration,
                discont,
                sequence: request.number,
            };

            match self.shared.host.push_buffer(&id, buffer) {
                Ok(()) => {}
                Err(FlowError::NotLinked) => trace!("Channel not linked, dropping fragment {}", request.number),
                Err(FlowError::Flushing) => {
                    debug!("Channel is flushing, stopping");
                    return LoopExit::Flushing;
                }
                Err(FlowError::Eos) => {
                    debug!("Downstream reached end of stream, stopping");
                    return LoopExit::Eos;
                }
                Err(FlowError::Error) => {
                    warn!("Downstream error while pushing fragment {}, stopping", request.number);
                    return LoopExit::Error;
                }
            }

            {
                let mut stream = self.stream.lock();
                // a seek or a reload may have moved the cursor while the fragment was in flight
                if stream.current_fragment().map(|fragment| fragment.time) == Some(request.time)
                    && stream.advance().is_err()
                {
                    trace!("Fragment list exhausted");
                }
            }
        }
    }

    /// In adaptive mode, flags a reconfiguration when the measured rate calls for another level.
    fn check_download_rate(&self) {
        let config = self.shared.settings.config();
        if !config.adaptive_bitrate {
            return;
        }

        let measured = self.download_rate.lock().current_rate();
        let ceiling = selector::stream_ceiling(config.connection_speed, config.bitrate_limit, measured, true);
        let stream = self.stream.lock();
        let target = selector::target_index(&stream, ceiling);
        if target != stream.current_quality_index() {
            info!(
                "Download rate {:?} bps calls for quality level {} instead of {}",
                measured,
                target,
                stream.current_quality_index()
            );
            self.shared.settings.mark_dirty();
        }
    }

    fn push_pending_segment(&self) {
        if let Some(segment) = self.channel.take_pending_segment() {
            debug!("Pushing segment starting at {:?}", segment.start);
            self.shared.host.push_event(self.channel.id(), ChannelEvent::Segment(segment));
        }
    }

    /// Fetches the manifest again and merges the new fragments.
    ///
    /// Returns whether this stream has a fragment to fetch afterwards, or `None` when
    /// cancelled. Reloads are serialized across loops, and a loop that waited for
    /// another one's reload does not fetch the manifest again.
    async fn reload_live_manifest(&self, cancel: &CancellationToken) -> Option<bool> {
        let session = &self.shared.session;
        let reload = async {
            let _guard = session.reload_lock.lock().await;
            if !self.stream.lock().is_eos() {
                return true;
            }

            debug!("Reloading live manifest from {}", session.manifest_uri);
            match self.fetcher.fetch(&session.manifest_uri).await {
                Ok(data) => match ManifestDocument::parse(&data) {
                    Ok(document) => {
                        session.manifest.reload_fragments(&document);
                    }
                    Err(e) => warn!("Failed to parse reloaded manifest: {e}"),
                },
                Err(e) => warn!("Failed to reload manifest: {e}"),
            }

            let eos = self.stream.lock().is_eos();
            !eos
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            updated = reload => Some(updated),
        }
    }
}

/// Sleeps for `delay`. Returns `false` when cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
