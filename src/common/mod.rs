//! Common utilities and types

pub mod error;
pub mod http_client;
pub mod serde_secs;

pub use error::{Error, Result};
pub use http_client::SharedClient;
