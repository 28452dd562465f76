use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use mss_demux::demux::{ChannelEvent, ChannelId, ChannelInfo, FlowError, Host, OutputBuffer};
use mss_demux::DemuxError;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Per channel counters reported once the download is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub caps: String,
    pub buffers: u64,
    pub bytes: u64,
    pub eos: bool,
    pub removed: bool,
    pub failed: bool,
}

impl ChannelSummary {
    fn finished(&self) -> bool {
        self.eos || self.removed || self.failed
    }
}

/// [`Host`] writing every fragment of every channel to disk.
///
/// Fragments land in `<output>/<channel>/<sequence>_<pts in ns>.frag`, next to a
/// `caps.txt` describing the channel.
pub struct FileHost {
    uri: String,
    output_dir: PathBuf,
    channels: RwLock<HashMap<ChannelId, ChannelSummary>>,
    errors: Mutex<Vec<String>>,
    changed: Notify,
}

impl FileHost {
    pub fn new(uri: &str, output_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        fs::create_dir_all(output_dir.as_ref())?;
        Ok(Self {
            uri: uri.to_string(),
            output_dir: output_dir.as_ref().to_path_buf(),
            channels: RwLock::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    pub fn channel_dir(&self, channel: &ChannelId) -> PathBuf {
        self.output_dir.join(channel.as_str())
    }

    /// Channels sorted by name.
    pub fn summary(&self) -> Vec<ChannelSummary> {
        let mut summary = self.channels.read().values().cloned().collect::<Vec<_>>();
        summary.sort_by(|a, b| a.id.cmp(&b.id));
        summary
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// True once at least one channel exists and every channel is done.
    pub fn is_finished(&self) -> bool {
        let channels = self.channels.read();
        !channels.is_empty() && channels.values().all(ChannelSummary::finished)
    }

    pub async fn wait_finished(&self) {
        loop {
            let notified = self.changed.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    fn update(&self, channel: &ChannelId, update: impl FnOnce(&mut ChannelSummary)) {
        if let Some(summary) = self.channels.write().get_mut(channel) {
            update(summary);
        }
        self.changed.notify_waiters();
    }
}

impl Host for FileHost {
    fn upstream_uri(&self) -> Option<String> {
        Some(self.uri.clone())
    }

    fn add_channel(&self, channel: &ChannelInfo) {
        let dir = self.channel_dir(&channel.id);
        let caps = channel.caps.to_string();
        if let Err(e) = fs::create_dir_all(&dir).and_then(|_| fs::write(dir.join("caps.txt"), &caps)) {
            error!("Failed to prepare {}: {}", dir.display(), e);
        }
        info!("New {} channel {}: {}", channel.stream_type.name(), channel.id, caps);

        self.channels.write().insert(
            channel.id.clone(),
            ChannelSummary {
                id: channel.id.clone(),
                caps,
                buffers: 0,
                bytes: 0,
                eos: false,
                removed: false,
                failed: false,
            },
        );
    }

    fn remove_channel(&self, channel: &ChannelId) {
        debug!("Channel {} removed", channel);
        self.update(channel, |summary| summary.removed = true);
    }

    fn no_more_channels(&self) {
        debug!("All channels announced");
    }

    fn push_event(&self, channel: &ChannelId, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Eos => {
                info!("Channel {} finished", channel);
                self.update(channel, |summary| summary.eos = true);
            }
            ChannelEvent::Segment(segment) => debug!("Channel {} segment from {:?}", channel, segment.start),
            other => debug!("Channel {} event {:?}", channel, other),
        }
        true
    }

    fn push_buffer(&self, channel: &ChannelId, buffer: OutputBuffer) -> Result<(), FlowError> {
        let path = self
            .channel_dir(channel)
            .join(format!("{:08}_{}.frag", buffer.sequence, buffer.pts.as_nanos()));
        if let Err(e) = fs::write(&path, &buffer.data) {
            error!("Failed to write {}: {}", path.display(), e);
            // the fetch loop stops on this error and never pushes EOS
            self.update(channel, |summary| summary.failed = true);
            return Err(FlowError::Error);
        }

        debug!(
            "Channel {} fragment {} at {:?} ({} bytes{})",
            channel,
            buffer.sequence,
            buffer.pts,
            buffer.data.len(),
            if buffer.discont { ", discont" } else { "" }
        );
        self.update(channel, |summary| {
            summary.buffers += 1;
            summary.bytes += buffer.data.len() as u64;
        });
        Ok(())
    }

    fn post_error(&self, error: &DemuxError) {
        error!("{}: {}", error, error.debug_detail());
        self.errors.lock().push(error.to_string());

        let failed = match error {
            DemuxError::DownloadFailed { channel, .. } | DemuxError::FragmentUrl { channel, .. } => {
                Some(ChannelId::new(channel.clone()))
            }
            _ => None,
        };
        if let Some(channel) = failed {
            self.update(&channel, |summary| summary.failed = true);
        } else {
            self.changed.notify_waiters();
        }
    }
}
