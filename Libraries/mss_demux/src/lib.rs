//! Smooth Streaming demuxer.
//!
//! Parses Smooth Streaming manifests, keeps a fragment timeline and a quality ladder per
//! stream, and runs one adaptive fetch loop per stream that pushes downloaded fragments
//! to a [`demux::Host`].

pub mod caps;
pub mod config;
pub mod demux;
pub mod download;
pub mod error;
pub mod manifest;
pub mod selector;
pub mod time;

pub use config::DemuxConfig;
pub use demux::{Host, MssDemux};
pub use download::{Fetcher, HttpFetcher};
pub use error::{DemuxError, ErrorKind};
pub use manifest::Manifest;
