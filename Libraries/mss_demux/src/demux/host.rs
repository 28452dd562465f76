//! Boundary between the demuxer and the pipeline hosting it.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::caps::StreamCaps;
use crate::error::DemuxError;
use crate::manifest::StreamType;

/// Name of an output channel, e.g. `video_00`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub stream_type: StreamType,
    pub caps: StreamCaps,
}

/// Position and rate of the data that follows on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub rate: f64,
    pub start: Duration,
    pub stop: Option<Duration>,
    /// Running time of `start`.
    pub time: Duration,
    pub position: Duration,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            time: Duration::ZERO,
            position: Duration::ZERO,
        }
    }
}

impl Segment {
    /// Applies a seek to the segment.
    pub fn do_seek(&mut self, rate: f64, start: Duration, stop: Option<Duration>) {
        self.rate = rate;
        self.start = start;
        self.stop = stop;
        self.time = start;
        self.position = start;
    }

    /// Copy of the segment repositioned at `start`, used when a channel is replaced mid-stream.
    pub fn starting_at(&self, start: Duration) -> Segment {
        Segment {
            start,
            time: start,
            position: start,
            ..self.clone()
        }
    }
}

/// Serialized events pushed on an output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StreamStart { stream_id: String },
    Caps(StreamCaps),
    Segment(Segment),
    FlushStart,
    FlushStop,
    Eos,
}

/// A downloaded fragment, handed to the host untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    pub data: Bytes,
    pub pts: Duration,
    pub duration: Option<Duration>,
    /// Set when `pts` does not follow the previous buffer of the channel.
    pub discont: bool,
    /// Fragment number from the manifest.
    pub sequence: u64,
}

/// Downstream flow results that stop a fetch loop or are tolerated by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("not linked")]
    NotLinked,
    #[error("flushing")]
    Flushing,
    #[error("end of stream")]
    Eos,
    #[error("error")]
    Error,
}

/// Events received on the demuxer's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// The manifest is complete.
    Eos,
    FlushStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Time,
    Bytes,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeekRequest {
    pub rate: f64,
    pub format: Format,
    pub flush: bool,
    pub start: Duration,
    pub stop: Option<Duration>,
}

impl SeekRequest {
    /// Flushing seek to `start` at normal rate.
    pub fn time(start: Duration) -> Self {
        Self {
            rate: 1.0,
            format: Format::Time,
            flush: true,
            start,
            stop: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Duration(Format),
    Seeking(Format),
    Latency,
    Position(Format),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAnswer {
    Duration(Duration),
    Seeking {
        seekable: bool,
        start: Duration,
        stop: Option<Duration>,
    },
    Latency {
        live: bool,
        min: Duration,
        max: Option<Duration>,
    },
}

/// The pipeline hosting the demuxer.
///
/// Methods may be called concurrently from every fetch loop, each loop only ever
/// addressing its own channel.
pub trait Host: Send + Sync {
    /// URI the manifest was read from.
    fn upstream_uri(&self) -> Option<String>;

    fn add_channel(&self, channel: &ChannelInfo);

    fn remove_channel(&self, channel: &ChannelId);

    fn no_more_channels(&self) {}

    /// Returns whether the event was accepted.
    fn push_event(&self, channel: &ChannelId, event: ChannelEvent) -> bool;

    fn push_buffer(&self, channel: &ChannelId, buffer: OutputBuffer) -> Result<(), FlowError>;

    fn post_error(&self, error: &DemuxError);
}
