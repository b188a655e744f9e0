//! The control loop: the single writer that turns validated signals and timer firings into
//! appended events, plus the per-project actor that serializes access to it.

pub mod actor;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod orchestrator;

pub use actor::*;
pub use clock::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use notifier::*;
pub use orchestrator::*;
