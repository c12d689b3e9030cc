use thiserror::Error;
use uuid::Uuid;

use crate::comm::Rank;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum JobFarmError {
    #[error("Master rank {master_rank} is outside the group of size {size}")]
    InvalidMasterRank { master_rank: Rank, size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No worker ranks available to run jobs")]
    NoWorkers,

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unexpected message from rank {rank}: {detail}")]
    UnexpectedMessage { rank: Rank, detail: String },

    #[error("Worker rank {rank} hung up while holding job {job_id:?}")]
    WorkerLost { rank: Rank, job_id: Option<Uuid> },

    #[error("Worker rank {rank} silent for {waited_ms}ms while holding job {job_id:?}")]
    WorkerUnresponsive {
        rank: Rank,
        job_id: Option<Uuid>,
        waited_ms: u64,
    },

    #[error("Payload of {len} bytes for rank {dest} exceeds the {limit} byte limit")]
    PayloadTooLarge { dest: Rank, len: usize, limit: usize },

    #[error("Rank {0} disconnected")]
    Disconnected(Rank),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Timed out connecting to rank {rank} at {addr}")]
    ConnectTimeout { rank: Rank, addr: String },

    #[error("Timed out waiting for ranks {missing:?} to connect")]
    AcceptTimeout { missing: Vec<Rank> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobFarmError>;
