//! Worker side of the event loop.
//!
//! - **Job execution**: [`JobExecutor`] runs a job's `run` on a blocking thread
//!   and stamps status and timing
//! - **Heartbeat**: [`heartbeat::HeartbeatSender`] keeps the master informed
//!   while a job runs
//!
//! # Execution Flow
//!
//! 1. Send `Request` to the master, carrying the previous result (none at first)
//! 2. Block until the master answers
//! 3. `Stop` ends the loop; `Assign` runs the job and goes back to 1

pub mod executor;
pub mod heartbeat;

pub use executor::JobExecutor;

use crate::comm::Communicator;
use crate::config::EventLoopConfig;
use crate::error::{JobFarmError, Result};
use crate::scheduler::{Job, JobRecord, Message};
use heartbeat::HeartbeatSender;

/// Ask the master for work until it says stop. Returns how many jobs this
/// rank executed.
pub async fn run_worker<J: Job>(comm: &mut Communicator, config: &EventLoopConfig) -> Result<usize> {
    let master = config.master_rank;
    let rank = comm.rank();
    let executor = JobExecutor::new(rank);
    let beat = serde_json::to_vec(&Message::<J>::Heartbeat)?;

    let mut last_job: Option<JobRecord<J>> = None;
    let mut executed = 0usize;

    tracing::debug!(rank, master, "Worker loop starting");

    loop {
        comm.send(master, &Message::Request {
            completed: last_job.take(),
        })?;

        match comm.recv_from::<Message<J>>(master).await? {
            Message::Stop => {
                tracing::info!(rank, executed, "Worker stopping");
                return Ok(executed);
            }
            Message::Assign { job } => {
                let heartbeat = if config.heartbeat_interval_ms > 0 {
                    Some(
                        HeartbeatSender::new(config.heartbeat_interval_ms)
                            .spawn(comm.sender(master)?, beat.clone()),
                    )
                } else {
                    None
                };

                let finished = executor.execute(job).await;
                if let Some(heartbeat) = heartbeat {
                    heartbeat.stop().await;
                }

                last_job = Some(finished?);
                executed += 1;
            }
            other => {
                return Err(JobFarmError::UnexpectedMessage {
                    rank: master,
                    detail: format!("worker cannot accept a {} message", other.kind()),
                })
            }
        }
    }
}
