#![forbid(unsafe_code)]

//! Pure orchestration core: protocol types, events, the reducer and the policy gate.
//!
//! Nothing in this crate performs I/O or reads the clock on its own behalf; the control
//! loop in `foreman-runtime` owns both.

pub mod checksum;
pub mod error;
pub mod event;
pub mod ids;
pub mod payload;
pub mod policy;
pub mod protocol;
pub mod reducer;
pub mod signal;
pub mod status;
pub mod time;

pub use error::*;
pub use event::*;
pub use ids::*;
pub use policy::Policy;
pub use protocol::*;
pub use reducer::{apply, reduce};
pub use signal::*;
pub use status::*;
pub use time::*;
