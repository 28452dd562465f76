use thiserror::Error;

/// Errors raised while parsing a manifest document.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Malformed attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("Invalid value '{value}' for attribute '{name}'")]
    InvalidAttribute { name: String, value: String },

    #[error("Document has no SmoothStreamingMedia root element")]
    MissingRoot,
}

/// Outcomes of a fragment timeline query that prevent producing a fragment.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("End of stream")]
    Eos,

    #[error("Stream has no quality levels")]
    NoQuality,

    #[error("Stream has no URL template")]
    NoUrlTemplate,
}

/// Errors raised by a [`crate::download::Fetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("404 Not Found: {0}")]
    NotFound(String),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised when loading a [`crate::config::DemuxConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Coarse classification of [`DemuxError`], mirroring the host's error domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The manifest could not be understood.
    Format,
    /// The manifest was understood but nothing in it can be played.
    Demux,
    /// A required resource could not be retrieved.
    NotFound,
}

/// Errors surfaced to the host through [`crate::demux::Host::post_error`].
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Bad manifest file")]
    Manifest(#[source] ManifestError),

    #[error("Couldn't get the Manifest's URI")]
    NoManifestUri,

    #[error("This file contains no playable streams.")]
    NoPlayableStreams { detail: &'static str },

    #[error("Failed to get fragment URL.")]
    FragmentUrl {
        channel: String,
        #[source]
        source: TimelineError,
    },

    #[error("Couldn't download fragments")]
    DownloadFailed {
        channel: String,
        url: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
}

impl DemuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DemuxError::Manifest(_) => ErrorKind::Format,
            DemuxError::NoPlayableStreams { .. } | DemuxError::FragmentUrl { .. } => ErrorKind::Demux,
            DemuxError::NoManifestUri | DemuxError::DownloadFailed { .. } => ErrorKind::NotFound,
        }
    }

    /// Developer-facing detail accompanying the human readable message.
    pub fn debug_detail(&self) -> String {
        match self {
            DemuxError::Manifest(err) => format!("Xml manifest file couldn't be parsed: {err}"),
            DemuxError::NoManifestUri => "need to get the manifest's URI from upstream elements".to_string(),
            DemuxError::NoPlayableStreams { detail } => detail.to_string(),
            DemuxError::FragmentUrl { channel, source } => {
                format!("An error happened when getting fragment URL on {channel}: {source}")
            }
            DemuxError::DownloadFailed { channel, url, attempts, source } => format!(
                "fragment downloading on {channel} has failed {attempts} consecutive times, last {url}: {source}"
            ),
        }
    }
}

impl From<ManifestError> for DemuxError {
    fn from(err: ManifestError) -> Self {
        DemuxError::Manifest(err)
    }
}
