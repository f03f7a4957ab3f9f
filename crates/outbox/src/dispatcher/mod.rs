//! Pluggable delivery transports.
//!
//! A [`Dispatcher`] never returns an error: every failure (transport error,
//! non-2xx response, bad destination) is folded into a [`DispatchOutcome`]
//! so the dispatch loop only ever branches on a value.

mod log;
mod webhook;

pub use self::log::LogDispatcher;
pub use self::webhook::WebhookDispatcher;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DispatchMode, WebhookConfig};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub success: bool,
    /// HTTP status, when the transport has one.
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn delivered(status: Option<u16>) -> Self {
        Self {
            success: true,
            status,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: None,
            error: Some(error.into()),
        }
    }

    /// The destination answered, but not with 2xx.
    pub fn rejected(status: u16, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(status),
            error: Some(detail.into()),
        }
    }

    /// Text stored as the row's `last_error`.
    pub fn error_text(&self) -> String {
        match (&self.error, self.status) {
            (Some(error), _) => error.clone(),
            (None, Some(status)) => format!("dispatch failed with status {status}"),
            (None, None) => "dispatch failed".to_string(),
        }
    }
}

/// Delivers one outbox payload to a destination.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, destination: &str, payload: &[u8], content_type: &str) -> DispatchOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Build the transport selected by `mode`.
pub fn build_dispatcher(mode: DispatchMode, webhook: &WebhookConfig) -> Result<Arc<dyn Dispatcher>, DispatcherError> {
    Ok(match mode {
        DispatchMode::Webhook => Arc::new(WebhookDispatcher::new(webhook.clone())?),
        DispatchMode::Log => Arc::new(LogDispatcher),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_text_prefers_detail_then_status() {
        assert_eq!(DispatchOutcome::failed("connection refused").error_text(), "connection refused");
        let bare = DispatchOutcome {
            success: false,
            status: Some(503),
            error: None,
        };
        assert_eq!(bare.error_text(), "dispatch failed with status 503");
    }

    #[tokio::test]
    async fn log_mode_builds_a_dispatcher_that_always_succeeds() {
        let dispatcher = build_dispatcher(DispatchMode::Log, &WebhookConfig::default()).unwrap();
        let outcome = dispatcher.dispatch("order.placed", b"{}", "application/json").await;
        assert!(outcome.success);
    }
}
