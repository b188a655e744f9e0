//! HTTP daemon hosting one control loop per project.

pub mod http;
pub mod registry;

pub use http::router;
pub use registry::Registry;
