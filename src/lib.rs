// Public exports for library usage
pub mod config;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod inventory;
pub mod notifier;
pub mod plan_future;
pub mod result;
pub mod target;
pub mod task;
pub mod transport;
pub mod util;
