pub mod config;
pub mod error;
pub mod logs;
pub mod url;

pub use error::{BoxError, GovernanceError, Result};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;
