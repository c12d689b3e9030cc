pub mod comm;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod jobs;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use event_loop::{run_event_loop, EventLoop, Role};
