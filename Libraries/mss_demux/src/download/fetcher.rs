use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{trace, warn};

use crate::error::FetchError;

/// Retrieves a whole resource by URL.
///
/// Dropping the returned future abandons the request, which is how fetch loops cancel
/// an in-flight download.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        trace!("GET {url}");
        let response = self.client.get(url).send().await?;

        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(url.to_string())),
            status => {
                warn!("Received {} from {}", status, url);
                Err(FetchError::Status { status: status.as_u16(), url: url.to_string() })
            }
        }
    }
}
