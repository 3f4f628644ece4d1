pub mod api;
pub mod client;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod node;
pub mod registry;
pub mod shutdown;

pub use error::{AutodError, Result};
