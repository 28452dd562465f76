use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mss_demux::demux::{ChannelEvent, ChannelId, ChannelInfo, FlowError, Host, OutputBuffer, SinkEvent, State};
use mss_demux::error::FetchError;
use mss_demux::{DemuxConfig, DemuxError, ErrorKind, Fetcher, MssDemux};
use parking_lot::Mutex;

pub const BASE_URL: &str = "http://media.test/video.ism";
pub const MANIFEST_URI: &str = "http://media.test/video.ism/Manifest";

/// Everything the demuxer did to the host, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Added(ChannelInfo),
    Removed(ChannelId),
    NoMoreChannels,
    Event(ChannelId, ChannelEvent),
    Buffer(ChannelId, OutputBuffer),
    Error(ErrorKind, String),
}

pub struct RecordingHost {
    uri: Option<String>,
    records: Mutex<Vec<Record>>,
    flow: Mutex<HashMap<String, FlowError>>,
}

impl RecordingHost {
    pub fn new(uri: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.map(str::to_string),
            records: Mutex::new(Vec::new()),
            flow: Mutex::new(HashMap::new()),
        })
    }

    /// Makes every buffer pushed on `channel` fail with `error`.
    pub fn fail_channel(&self, channel: &str, error: FlowError) {
        self.flow.lock().insert(channel.to_string(), error);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn added(&self) -> Vec<ChannelId> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Added(info) => Some(info.id),
                _ => None,
            })
            .collect()
    }

    pub fn buffers(&self, channel: &str) -> Vec<OutputBuffer> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Buffer(id, buffer) if id.as_str() == channel => Some(buffer),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self, channel: &str) -> Vec<ChannelEvent> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Event(id, event) if id.as_str() == channel => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(ErrorKind, String)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Error(kind, message) => Some((kind, message)),
                _ => None,
            })
            .collect()
    }

    pub fn has_eos(&self, channel: &str) -> bool {
        self.events(channel).contains(&ChannelEvent::Eos)
    }

    /// Polls the records until `predicate` holds, giving up after five seconds.
    pub async fn wait_for(&self, predicate: impl Fn(&RecordingHost) -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn record(&self, record: Record) {
        self.records.lock().push(record);
    }
}

impl Host for RecordingHost {
    fn upstream_uri(&self) -> Option<String> {
        self.uri.clone()
    }

    fn add_channel(&self, channel: &ChannelInfo) {
        self.record(Record::Added(channel.clone()));
    }

    fn remove_channel(&self, channel: &ChannelId) {
        self.record(Record::Removed(channel.clone()));
    }

    fn no_more_channels(&self) {
        self.record(Record::NoMoreChannels);
    }

    fn push_event(&self, channel: &ChannelId, event: ChannelEvent) -> bool {
        self.record(Record::Event(channel.clone(), event));
        true
    }

    fn push_buffer(&self, channel: &ChannelId, buffer: OutputBuffer) -> Result<(), FlowError> {
        let flow = self.flow.lock().get(channel.as_str()).copied();
        self.record(Record::Buffer(channel.clone(), buffer));
        match flow {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn post_error(&self, error: &DemuxError) {
        self.record(Record::Error(error.kind(), error.to_string()));
    }
}

/// In-memory [`Fetcher`]. Unknown URLs answer with their own URL as body.
#[derive(Default)]
pub struct MemoryFetcher {
    resources: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MemoryFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Self::default() })
    }

    pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
        self.resources.lock().insert(url.to_string(), body.into());
    }

    /// The next `times` requests for `url` fail.
    pub fn fail(&self, url: &str, times: u32) {
        self.failing.lock().insert(url.to_string(), times);
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|request| request.as_str() == url).count()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.requests.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failing = self.failing.lock();
            if let Some(remaining) = failing.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Status { status: 503, url: url.to_string() });
                }
            }
        }

        let body = self.resources.lock().get(url).cloned();
        Ok(body.unwrap_or_else(|| Bytes::from(url.to_string())))
    }
}

/// Config with retries short enough for tests.
pub fn test_config() -> DemuxConfig {
    DemuxConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        manifest_reload_interval_ms: 10,
        ..DemuxConfig::default()
    }
}

/// Starts a demuxer and feeds it `manifest` in two chunks.
pub async fn start_demux(
    host: &Arc<RecordingHost>,
    fetcher: &Arc<MemoryFetcher>,
    config: DemuxConfig,
    manifest: &str,
) -> (MssDemux, Result<(), DemuxError>) {
    let demux = MssDemux::new(host.clone(), fetcher.clone(), config);
    demux.set_state(State::Playing).await;

    let (head, tail) = manifest.as_bytes().split_at(manifest.len() / 2);
    demux.chain(Bytes::copy_from_slice(head)).unwrap();
    demux.chain(Bytes::copy_from_slice(tail)).unwrap();
    let result = demux.sink_event(SinkEvent::Eos).await;
    (demux, result)
}

/// Video fragments of one second at the default timescale.
pub fn vod_manifest(video_fragments: u32, audio_fragments: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<SmoothStreamingMedia MajorVersion="2" MinorVersion="0" Duration="{duration}">
  <StreamIndex Type="video" Name="video" Url="QualityLevels({{bitrate}})/Fragments(video={{start time}})">
    <QualityLevel Index="0" Bitrate="300000" FourCC="H264" MaxWidth="640" MaxHeight="360"
      CodecPrivateData="000000016742C01EDA01E0089F96100000000168CE3C80" />
    <QualityLevel Index="1" Bitrate="1500000" FourCC="H264" MaxWidth="1280" MaxHeight="720"
      CodecPrivateData="000000016742C01FDA01E0089F96100000000168CE3C80" />
    <c t="0" d="10000000" r="{video_fragments}" />
  </StreamIndex>
  <StreamIndex Type="audio" Name="audio" Url="QualityLevels({{bitrate}})/Fragments(audio={{start_time}})">
    <QualityLevel Index="0" Bitrate="64000" FourCC="AACL" SamplingRate="44100" Channels="2" />
    <c t="0" d="{audio_duration}" r="{audio_fragments}" />
  </StreamIndex>
</SmoothStreamingMedia>"#,
        duration = video_fragments as u64 * 10_000_000,
        audio_duration = video_fragments as u64 * 10_000_000 / audio_fragments.max(1) as u64,
    )
}

pub fn video_url(bitrate: u64, time: u64) -> String {
    format!("{BASE_URL}/QualityLevels({bitrate})/Fragments(video={time})")
}

pub fn audio_url(bitrate: u64, time: u64) -> String {
    format!("{BASE_URL}/QualityLevels({bitrate})/Fragments(audio={time})")
}
