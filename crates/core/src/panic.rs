//! Panic payload rendering for work run behind a `tokio::spawn` boundary.

use std::any::Any;

/// Best-effort text of a panic payload (`&str` and `String` payloads).
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
