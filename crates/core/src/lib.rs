//! `shopworks-core`: shared primitives for the background execution subsystem.
//!
//! No database or network code lives here: identifiers, error types, a clock seam and
//! the environment-variable parsing helpers used by every config struct.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod panic;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EnvLookup, ProcessEnv};
pub use error::{CoreError, CoreResult};
pub use id::{MessageId, TaskId};
pub use panic::panic_message;
