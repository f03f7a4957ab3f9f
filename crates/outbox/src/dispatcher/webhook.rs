//! HTTP webhook transport.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use tracing::debug;

use super::{DispatchOutcome, Dispatcher};
use crate::config::WebhookConfig;

/// Longest response body excerpt kept in `last_error`.
const ERROR_BODY_LIMIT: usize = 256;

/// POSTs the payload to the destination; 2xx is success, anything else
/// (including transport errors and timeouts) is a failed outcome.
///
/// Destinations that are absolute `http(s)` URLs are used as-is. Anything
/// else (a message type such as `order.placed`) is appended to `base_url`.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn resolve_url(&self, destination: &str) -> Result<Url, String> {
        if let Ok(url) = Url::parse(destination) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(url);
            }
        }

        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| format!("no webhook base url configured for destination {destination:?}"))?;
        let joined = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            destination.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| format!("invalid webhook url {joined:?}: {e}"))
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn dispatch(&self, destination: &str, payload: &[u8], content_type: &str) -> DispatchOutcome {
        let url = match self.resolve_url(destination) {
            Ok(url) => url,
            Err(e) => return DispatchOutcome::failed(e),
        };

        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(payload.to_vec())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, status = resp.status().as_u16(), "webhook accepted message");
                DispatchOutcome::delivered(Some(resp.status().as_u16()))
            }
            Ok(resp) => {
                let status = resp.status();
                let excerpt = body_excerpt(resp).await;
                DispatchOutcome::rejected(
                    status.as_u16(),
                    format!("webhook {url} returned {status}: {excerpt}"),
                )
            }
            Err(e) => DispatchOutcome::failed(format!("webhook {url} request failed: {e}")),
        }
    }
}

/// First `ERROR_BODY_LIMIT` characters of the body. Stops reading once enough
/// bytes for that many characters have arrived; a body error ends the excerpt.
async fn body_excerpt(mut resp: Response) -> String {
    let byte_limit = ERROR_BODY_LIMIT * 4;
    let mut buf = Vec::with_capacity(ERROR_BODY_LIMIT);
    while buf.len() < byte_limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(byte_limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).chars().take(ERROR_BODY_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(base_url: Option<&str>) -> WebhookDispatcher {
        let mut config = WebhookConfig::default();
        config.base_url = base_url.map(str::to_string);
        WebhookDispatcher::new(config).unwrap()
    }

    #[test]
    fn absolute_destinations_are_used_verbatim() {
        let url = dispatcher(Some("http://base.invalid"))
            .resolve_url("https://hooks.example.com/orders?x=1")
            .unwrap();
        assert_eq!(url.as_str(), "https://hooks.example.com/orders?x=1");
    }

    #[test]
    fn message_types_are_joined_onto_the_base_url() {
        let url = dispatcher(Some("http://127.0.0.1:9000/hooks/"))
            .resolve_url("order.placed")
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/hooks/order.placed");
    }

    #[test]
    fn relative_destination_without_base_is_an_error() {
        assert!(dispatcher(None).resolve_url("order.placed").is_err());
    }

    #[tokio::test]
    async fn unresolvable_destination_is_a_failed_outcome() {
        let outcome = dispatcher(None).dispatch("order.placed", b"{}", "application/json").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no webhook base url"));
    }
}
