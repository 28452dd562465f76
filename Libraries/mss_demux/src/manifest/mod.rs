//! Smooth Streaming manifest data structures.
//! A [`Manifest`] owns one [`LogicalStream`] per `StreamIndex` element, each with its
//! fragment timeline and its quality ladder.

pub mod builder;
pub(crate) mod fragments;
pub mod parser;
pub mod timeline;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::ManifestError;
use crate::selector;
use crate::time::{ticks_to_duration, DEFAULT_TIMESCALE};
use fragments::FragmentListBuilder;
pub use parser::{FragmentNode, ManifestDocument, StreamIndexNode};

/// A logical stream shared between the controller and its fetch loop.
pub type SharedStream = Arc<Mutex<LogicalStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Unknown,
    Video,
    Audio,
}

impl StreamType {
    pub fn from_attr(value: &str) -> Self {
        if value.eq_ignore_ascii_case("video") {
            StreamType::Video
        } else if value.eq_ignore_ascii_case("audio") {
            StreamType::Audio
        } else {
            StreamType::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamType::Video => "video",
            StreamType::Audio => "audio",
            StreamType::Unknown => "unknown",
        }
    }
}

/// One addressable media chunk of a logical stream. Times are in the stream's timescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub number: u64,
    pub time: u64,
    /// `None` only for a trailing fragment whose duration could not be inferred.
    pub duration: Option<u64>,
}

impl Fragment {
    pub fn end(&self) -> Option<u64> {
        self.duration.map(|duration| self.time.saturating_add(duration))
    }
}

/// A single encoding of a logical stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityLevel {
    /// Bits per second, 0 when the document omits it.
    pub bitrate: u64,
    pub fourcc: Option<String>,
    /// Hex encoded codec initialisation data.
    pub codec_private_data: Option<String>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub sampling_rate: Option<u32>,
    pub channels: Option<u32>,
    pub bits_per_sample: Option<u32>,
    pub packet_size: Option<u32>,
    pub audio_tag: Option<u32>,
    pub nal_unit_length_field: Option<u8>,
}

/// One elementary stream of the presentation.
#[derive(Debug)]
pub struct LogicalStream {
    pub(crate) stream_type: StreamType,
    pub(crate) name: Option<String>,
    pub(crate) url_template: Option<String>,
    pub(crate) timescale_override: Option<u64>,
    pub(crate) parent_timescale: u64,
    pub(crate) active: bool,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) qualities: Vec<QualityLevel>,
    /// Index into `fragments`; `fragments.len()` means end of stream.
    pub(crate) current_fragment: usize,
    pub(crate) current_quality: usize,
}

impl LogicalStream {
    pub(crate) fn from_node(node: &StreamIndexNode, parent_timescale: u64) -> Self {
        let mut builder = FragmentListBuilder::new();
        for fragment in &node.fragments {
            builder.add(fragment);
        }

        let mut qualities = node.qualities.clone();
        // sort_by_key is stable, so equal bitrates keep their document order
        qualities.sort_by_key(|quality| quality.bitrate);

        Self {
            stream_type: StreamType::from_attr(node.stream_type.as_deref().unwrap_or_default()),
            name: node.name.clone(),
            url_template: node.url.clone(),
            timescale_override: node.timescale,
            parent_timescale,
            active: false,
            fragments: builder.build(),
            qualities,
            current_fragment: 0,
            current_quality: 0,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Stream timescale, falling back to the manifest's and then to the 100ns default.
    pub fn timescale(&self) -> u64 {
        match self.timescale_override {
            Some(timescale) if timescale > 0 => timescale,
            _ if self.parent_timescale > 0 => self.parent_timescale,
            _ => DEFAULT_TIMESCALE,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn qualities(&self) -> &[QualityLevel] {
        &self.qualities
    }

    pub fn current_quality_index(&self) -> usize {
        self.current_quality
    }

    pub fn current_quality(&self) -> Option<&QualityLevel> {
        self.qualities.get(self.current_quality)
    }

    /// Bitrate of the selected quality level, 0 when the stream has none.
    pub fn current_bitrate(&self) -> u64 {
        self.current_quality().map(|quality| quality.bitrate).unwrap_or(0)
    }

    /// Cursor position, `None` at end of stream.
    pub fn current_fragment_index(&self) -> Option<usize> {
        (self.current_fragment < self.fragments.len()).then_some(self.current_fragment)
    }

    pub fn current_fragment(&self) -> Option<&Fragment> {
        self.fragments.get(self.current_fragment)
    }

    pub fn is_eos(&self) -> bool {
        self.current_fragment >= self.fragments.len()
    }
}

/// A parsed Smooth Streaming manifest.
#[derive(Debug)]
pub struct Manifest {
    live: bool,
    timescale: u64,
    duration: Option<u64>,
    streams: Vec<SharedStream>,
}

impl Manifest {
    pub fn parse(data: &[u8]) -> Result<Self, ManifestError> {
        let document = ManifestDocument::parse(data)?;
        Ok(Self::from_document(&document))
    }

    pub fn from_document(document: &ManifestDocument) -> Self {
        let timescale = document.timescale.filter(|ts| *ts > 0).unwrap_or(DEFAULT_TIMESCALE);
        let streams = document
            .streams
            .iter()
            .map(|node| Arc::new(Mutex::new(LogicalStream::from_node(node, timescale))))
            .collect::<Vec<_>>();

        debug!("Manifest has {} streams, live: {}", streams.len(), document.is_live);

        Self {
            live: document.is_live,
            timescale,
            duration: document.duration,
            streams,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn timescale(&self) -> u64 {
        self.timescale
    }

    /// Total duration, `None` when the document does not declare a positive one.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .filter(|duration| *duration > 0)
            .map(|duration| ticks_to_duration(duration, self.timescale))
    }

    pub fn streams(&self) -> &[SharedStream] {
        &self.streams
    }

    /// Repositions every active stream on `time`.
    ///
    /// Streams are locked in manifest order. When any of them cannot seek, every
    /// cursor is put back where it was and `false` is returned.
    pub fn seek(&self, time: Duration) -> bool {
        let mut guards = self.streams.iter().map(|stream| stream.lock()).collect::<Vec<_>>();
        let saved = guards.iter().map(|stream| stream.current_fragment).collect::<Vec<_>>();

        let mut ok = true;
        for stream in guards.iter_mut().filter(|stream| stream.active) {
            if !stream.seek(time) {
                debug!("Stream {:?} has no fragments to seek in", stream.name);
                ok = false;
            }
        }

        if !ok {
            for (stream, position) in guards.iter_mut().zip(saved) {
                stream.current_fragment = position;
            }
        }
        ok
    }

    /// Applies the bitrate `ceiling` to every active stream. Returns whether any changed.
    pub fn change_bitrate(&self, ceiling: u64) -> bool {
        let mut changed = false;
        for stream in &self.streams {
            let mut stream = stream.lock();
            if stream.active && selector::select_bitrate(&mut stream, ceiling) {
                info!(
                    "{} stream switched to {} bps",
                    stream.stream_type.name(),
                    stream.current_bitrate()
                );
                changed = true;
            }
        }
        changed
    }

    /// Merges the fragment lists of a freshly fetched document into the live streams.
    ///
    /// `StreamIndex` elements are matched to streams by position. Returns whether any
    /// stream received a new fragment list.
    pub fn reload_fragments(&self, document: &ManifestDocument) -> bool {
        let mut updated = false;
        for (stream, node) in self.streams.iter().zip(&document.streams) {
            if stream.lock().reload_fragments(&node.fragments) {
                updated = true;
            }
        }
        updated
    }
}
