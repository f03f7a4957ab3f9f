use async_trait::async_trait;
use tracing::info;

use super::{DispatchOutcome, Dispatcher};

/// Writes each message to the log and reports success. For local runs
/// without a webhook receiver.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, destination: &str, payload: &[u8], content_type: &str) -> DispatchOutcome {
        info!(
            destination = %destination,
            content_type = %content_type,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload),
            "outbox message dispatched to log"
        );
        DispatchOutcome::delivered(None)
    }
}
