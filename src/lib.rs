pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod transport;

pub use config::Config;
pub use db::QueueStore;
pub use error::{QueueError, QueueResult};
pub use processor::MessageProcessor;
