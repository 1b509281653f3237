pub mod remote;

use async_trait::async_trait;

use crate::crawler::error::FetchError;
use crate::crawler::task::RenderedPage;

#[cfg(test)]
use mockall::automock;

/// The rendering/extraction service: loads a URL and returns its readable
/// content and links. May be slow and may fail; retries are not its
/// caller's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn fetch_and_extract(
        &self,
        url: &str,
        options: &serde_json::Value,
    ) -> Result<RenderedPage, FetchError>;
}

// Re-export common types
pub use remote::RemoteRenderer;
