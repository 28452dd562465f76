//! Fragment and manifest downloading.

pub mod fetcher;
pub mod rate;

pub use fetcher::{Fetcher, HttpFetcher};
pub use rate::DownloadRate;
