use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::browser::PageRenderer;
use crate::crawler::error::FetchError;
use crate::crawler::task::RenderedPage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderServiceRequest {
    pub url: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderServiceResponse {
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// HTTP client for the external rendering service
pub struct RemoteRenderer {
    client: Client,
    base_url: String,
}

impl RemoteRenderer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PageRenderer for RemoteRenderer {
    async fn fetch_and_extract(
        &self,
        url: &str,
        options: &serde_json::Value,
    ) -> Result<RenderedPage, FetchError> {
        let endpoint = format!("{}/render", self.base_url);

        let request = RenderServiceRequest {
            url: url.to_string(),
            options: options.clone(),
        };

        debug!("Sending request to rendering service: {}", url);

        let response = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            error!("Rendering service returned {} for {}", status, url);
            return Err(FetchError::network(format!(
                "rendering service returned {} for {}",
                status, url
            )));
        }

        let body = response
            .json::<RenderServiceResponse>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::timeout(format!("reading response for {}: {}", url, e))
                } else {
                    FetchError::extraction(format!("undecodable response for {}: {}", url, e))
                }
            })?;

        if !body.success {
            let message = body
                .error
                .unwrap_or_else(|| "rendering failed with unknown error".to_string());
            error!("Rendering service error for {}: {}", url, message);
            return Err(FetchError::extraction(message));
        }

        debug!("Successfully rendered URL: {}", url);

        Ok(RenderedPage {
            url: body.url,
            title: body.title,
            content: body.content,
            text_content: body.text_content,
            links: body.links,
            meta: body.meta,
        })
    }
}

fn classify_transport_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::timeout(format!("rendering {} timed out: {}", url, err))
    } else {
        FetchError::network(format!("rendering {} failed: {}", url, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::error::FetchErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_successful_render() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .and(body_partial_json(json!({"url": "https://example.com/a"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "url": "https://example.com/a",
                "title": "A",
                "content": "<p>hello</p>",
                "text_content": "hello",
                "links": ["/b", "https://example.com/c"],
                "meta": {"og:title": "A"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let renderer = RemoteRenderer::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let page = renderer
            .fetch_and_extract("https://example.com/a", &serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(page.title.as_deref(), Some("A"));
        assert_eq!(page.links, vec!["/b", "https://example.com/c"]);
        assert_eq!(page.meta["og:title"], "A");
    }

    #[tokio::test]
    async fn test_service_reported_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "readability found no article"
            })))
            .mount(&server)
            .await;

        let renderer = RemoteRenderer::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = renderer
            .fetch_and_extract("https://example.com/a", &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::ExtractionFailed);
        assert!(err.message.contains("no article"));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let renderer = RemoteRenderer::new(&server.uri(), Duration::from_millis(100)).unwrap();
        let err = renderer
            .fetch_and_extract("https://example.com/a", &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_server_error_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/render"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let renderer = RemoteRenderer::new(&format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        let err = renderer
            .fetch_and_extract("https://example.com/a", &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::NetworkError);
    }
}
