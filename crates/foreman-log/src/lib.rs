//! Event log contract and the non-durable pieces of persistence.

pub mod cache;
pub mod error;
pub mod memory;
pub mod traits;

pub use cache::*;
pub use error::*;
pub use memory::*;
pub use traits::*;
