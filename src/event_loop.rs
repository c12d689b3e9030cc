use tokio_util::sync::CancellationToken;

use crate::comm::{Communicator, Rank};
use crate::config::EventLoopConfig;
use crate::error::{JobFarmError, Result};
use crate::scheduler::{DispatchCallback, Job, JobRecord, Master};
use crate::worker::run_worker;

/// What a rank computed before the results broadcast.
#[derive(Debug)]
pub enum Role<J> {
    Master(Vec<JobRecord<J>>),
    Worker,
}

/// Single entry point, called the same way on every rank of a group.
///
/// The rank named by `config.master_rank` hands out the jobs; every other
/// rank works. Afterwards the master's results are broadcast, so every rank
/// returns the same list.
pub struct EventLoop<J: Job> {
    config: EventLoopConfig,
    callback: Option<DispatchCallback<J>>,
    shutdown: CancellationToken,
}

impl<J: Job> EventLoop<J> {
    pub fn new(config: EventLoopConfig) -> Self {
        Self {
            config,
            callback: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Called on the master after every dispatch with `(pending, completed)`.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[JobRecord<J>], &[JobRecord<J>]) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Cancelling `token` drains the master: in-flight jobs are collected,
    /// nothing new is handed out.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.config
    }

    /// `jobs` only matters on the master; workers may pass an empty list.
    ///
    /// # Errors
    ///
    /// Fails before any communication with [`JobFarmError::InvalidConfig`]
    /// if heartbeats cannot beat the worker timeout,
    /// [`JobFarmError::InvalidMasterRank`] if the master rank is outside the
    /// group, or [`JobFarmError::NoWorkers`] if there is work but nobody to
    /// do it.
    pub async fn run(self, comm: &mut Communicator, jobs: Vec<J>) -> Result<Vec<JobRecord<J>>> {
        self.config.validate()?;
        let master_rank = self.config.master_rank;
        let size = comm.size();
        if master_rank >= size {
            return Err(JobFarmError::InvalidMasterRank { master_rank, size });
        }

        let role = if comm.rank() == master_rank {
            if size < 2 && !jobs.is_empty() {
                return Err(JobFarmError::NoWorkers);
            }
            let outcome = Master::new(comm, &self.config, jobs, self.callback)
                .run(&self.shutdown)
                .await?;
            Role::Master(outcome.results)
        } else {
            run_worker::<J>(comm, &self.config).await?;
            Role::Worker
        };

        let seed = match role {
            Role::Master(results) => Some(results),
            Role::Worker => None,
        };
        let results = comm.broadcast(master_rank, seed).await?;
        tracing::debug!(rank = comm.rank(), results = results.len(), "Event loop done");
        Ok(results)
    }
}

/// Run the event loop with default settings plus the given master rank,
/// progress logging flag and dispatch callback.
pub async fn run_event_loop<J: Job>(
    comm: &mut Communicator,
    jobs: Vec<J>,
    master_rank: Rank,
    log_progress: bool,
    callback: Option<DispatchCallback<J>>,
) -> Result<Vec<JobRecord<J>>> {
    let config = EventLoopConfig::new(master_rank).with_log_progress(log_progress);
    let mut event_loop = EventLoop::new(config);
    event_loop.callback = callback;
    event_loop.run(comm, jobs).await
}
