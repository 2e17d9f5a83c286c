pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod worker;

pub use error::{QueueError, Result};
