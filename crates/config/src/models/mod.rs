pub mod app_config;
pub mod logging;
pub mod message_queue;

pub use app_config::*;
pub use logging::*;
pub use message_queue::*;
