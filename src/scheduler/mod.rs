pub mod job;
pub mod master;
pub mod message;
pub mod tracker;

pub use job::{Job, JobRecord, JobStatus};
pub use master::{run_master, DispatchCallback, DispatchStats, Master, MasterOutcome};
pub use message::Message;
pub use tracker::RankTracker;
