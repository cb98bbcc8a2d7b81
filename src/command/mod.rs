//! Normalized command surface: typed requests/responses and the dispatcher
//! mapping command names to driver operations.

pub mod proxy;
pub mod types;

pub use proxy::send_command;
pub use types::Command;
