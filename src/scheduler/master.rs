use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::comm::{Communicator, Incoming, Rank};
use crate::config::EventLoopConfig;
use crate::error::{JobFarmError, Result};
use crate::scheduler::job::{Job, JobRecord};
use crate::scheduler::message::Message;
use crate::scheduler::tracker::RankTracker;

/// Progress hook, called with `(pending, completed)` after every dispatch.
pub type DispatchCallback<J> = Box<dyn FnMut(&[JobRecord<J>], &[JobRecord<J>]) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub assignments: usize,
    pub stops: usize,
}

#[derive(Debug)]
pub struct MasterOutcome<J> {
    pub results: Vec<JobRecord<J>>,
    pub stats: DispatchStats,
    /// Jobs never handed out because the loop was drained early.
    pub undispatched: Vec<JobRecord<J>>,
}

enum Wake<J> {
    Received(Rank, Incoming<Message<J>>),
    Shutdown,
    Deadline,
}

/// Hands queued jobs to idle workers and collects what they send back.
///
/// Every worker rank gets a [`RankTracker`] with one open receive. The
/// master waits on all of them at once, answers whichever worker speaks
/// first, and keeps going until every worker has been sent a stop.
pub struct Master<'a, J: Job> {
    comm: &'a mut Communicator,
    config: &'a EventLoopConfig,
    pending: Vec<JobRecord<J>>,
    results: Vec<JobRecord<J>>,
    trackers: BTreeMap<Rank, RankTracker>,
    listening: usize,
    draining: bool,
    stats: DispatchStats,
    callback: Option<DispatchCallback<J>>,
}

impl<'a, J: Job> Master<'a, J> {
    pub fn new(
        comm: &'a mut Communicator,
        config: &'a EventLoopConfig,
        jobs: Vec<J>,
        callback: Option<DispatchCallback<J>>,
    ) -> Self {
        let me = comm.rank();
        let trackers: BTreeMap<Rank, RankTracker> = (0..comm.size())
            .filter(|&rank| rank != me)
            .map(|rank| (rank, RankTracker::new(rank)))
            .collect();
        let listening = trackers.len();
        let results = Vec::with_capacity(jobs.len());

        Self {
            comm,
            config,
            pending: jobs.into_iter().map(JobRecord::new).collect(),
            results,
            trackers,
            listening,
            draining: false,
            stats: DispatchStats::default(),
            callback,
        }
    }

    /// Run until every worker has been stopped.
    ///
    /// Cancelling `shutdown` drains the loop: jobs already handed out are
    /// still collected, nothing new is dispatched.
    ///
    /// # Errors
    ///
    /// - [`JobFarmError::WorkerLost`] when a worker that still owes a reply
    ///   hangs up (it crashed, or its connection dropped).
    /// - [`JobFarmError::WorkerUnresponsive`] when `worker_timeout_ms` is set
    ///   and a worker stays silent for longer than that.
    /// - [`JobFarmError::UnexpectedMessage`] on protocol violations.
    pub async fn run(mut self, shutdown: &CancellationToken) -> Result<MasterOutcome<J>> {
        tracing::info!(
            rank = self.comm.rank(),
            workers = self.trackers.len(),
            jobs = self.pending.len(),
            "Master loop starting"
        );

        let timeout = self.config.worker_timeout_ms.map(Duration::from_millis);

        while self.listening > 0 {
            let deadline = timeout
                .and_then(|t| self.trackers.values().filter_map(|tr| tr.deadline(t)).min())
                .map(tokio::time::Instant::from_std);

            // Shutdown is checked first so a drain takes effect on the next turn.
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !self.draining => Wake::Shutdown,
                received = self.comm.recv_any::<Message<J>>() => {
                    let (rank, incoming) = received?;
                    Wake::Received(rank, incoming)
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() => Wake::Deadline,
            };

            match wake {
                Wake::Received(rank, Incoming::Message(msg)) => self.handle_message(rank, msg)?,
                Wake::Received(rank, Incoming::Hangup) => self.handle_hangup(rank)?,
                Wake::Shutdown => {
                    tracing::warn!(
                        pending = self.pending.len(),
                        in_flight = self.listening,
                        "Shutdown requested, draining workers"
                    );
                    self.draining = true;
                }
                Wake::Deadline => {
                    if let Some(timeout) = timeout {
                        self.check_deadlines(timeout)?;
                    }
                }
            }
        }

        self.cancel_pending();

        if !self.pending.is_empty() {
            tracing::warn!(
                undispatched = self.pending.len(),
                "Master loop ended with jobs left in the queue"
            );
        }
        tracing::info!(
            completed = self.results.len(),
            assignments = self.stats.assignments,
            stops = self.stats.stops,
            "Master loop finished"
        );

        Ok(MasterOutcome {
            results: self.results,
            stats: self.stats,
            undispatched: self.pending,
        })
    }

    fn handle_message(&mut self, rank: Rank, msg: Message<J>) -> Result<()> {
        match msg {
            Message::Request { completed } => self.handle_request(rank, completed),
            Message::Heartbeat => {
                match self.trackers.get_mut(&rank) {
                    Some(tracker) if tracker.listening => {
                        tracker.touch();
                        tracing::trace!(rank, "Heartbeat");
                    }
                    // Late heartbeat from a worker that was already stopped.
                    Some(_) => {}
                    None => return Err(self.protocol_error(rank, "heartbeat from a non-worker")),
                }
                Ok(())
            }
            other => Err(self.protocol_error(
                rank,
                &format!("master cannot accept a {} message", other.kind()),
            )),
        }
    }

    fn handle_request(&mut self, rank: Rank, completed: Option<JobRecord<J>>) -> Result<()> {
        let Some(tracker) = self.trackers.get_mut(&rank) else {
            return Err(self.protocol_error(rank, "request from a non-worker"));
        };
        if !tracker.listening || !tracker.complete() {
            return Err(self.protocol_error(rank, "request without an open receive"));
        }

        match (completed, tracker.assigned_job) {
            (Some(record), Some(assigned)) if record.id == assigned => {
                if !record.is_finished() {
                    let detail = format!("job {} came back {}", record.id, record.status);
                    return Err(self.protocol_error(rank, &detail));
                }
                tracing::debug!(
                    rank,
                    job_id = %record.id,
                    running_time_ms = record.running_time.map(|d| d.as_millis() as u64),
                    "Job result collected"
                );
                self.results.push(record);
            }
            (None, None) => {}
            (reported, assigned) => {
                let detail = format!(
                    "reported job {:?} while holding {:?}",
                    reported.map(|r| r.id),
                    assigned
                );
                return Err(self.protocol_error(rank, &detail));
            }
        }

        self.dispatch(rank)
    }

    /// Answer a worker that just asked for work: next job, or stop.
    fn dispatch(&mut self, rank: Rank) -> Result<()> {
        // Pending jobs are treated as a stack.
        let next = if self.draining {
            None
        } else {
            self.pending.pop()
        };

        match next {
            Some(mut record) => {
                record.mark_running()?;
                let job_id = record.id;
                self.comm.send(rank, &Message::Assign { job: record })?;
                if let Some(tracker) = self.trackers.get_mut(&rank) {
                    tracker.rearm(job_id);
                }
                self.stats.assignments += 1;

                if self.config.log_progress {
                    tracing::info!(
                        rank,
                        job_id = %job_id,
                        pending = self.pending.len(),
                        completed = self.results.len(),
                        "Job dispatched"
                    );
                } else {
                    tracing::debug!(rank, job_id = %job_id, "Job dispatched");
                }

                if let Some(callback) = self.callback.as_mut() {
                    callback(&self.pending, &self.results);
                }
            }
            None => {
                self.comm.send(rank, &Message::<J>::Stop)?;
                if let Some(tracker) = self.trackers.get_mut(&rank) {
                    tracker.release();
                }
                self.listening -= 1;
                self.stats.stops += 1;
                tracing::debug!(rank, still_listening = self.listening, "Worker stopped");
            }
        }
        Ok(())
    }

    fn handle_hangup(&mut self, rank: Rank) -> Result<()> {
        match self.trackers.get(&rank) {
            Some(tracker) if tracker.listening => {
                let job_id = tracker.assigned_job;
                tracing::error!(rank, job_id = ?job_id, "Worker hung up before finishing");
                self.cancel_pending();
                Err(JobFarmError::WorkerLost { rank, job_id })
            }
            _ => {
                tracing::debug!(rank, "Hang-up from a rank that is no longer needed");
                Ok(())
            }
        }
    }

    fn check_deadlines(&mut self, timeout: Duration) -> Result<()> {
        let expired = self
            .trackers
            .values()
            .filter(|tr| tr.listening && tr.is_pending() && tr.silent_for() >= timeout)
            .min_by_key(|tr| tr.rank)
            .map(|tr| (tr.rank, tr.assigned_job, tr.silent_for()));

        if let Some((rank, job_id, silent)) = expired {
            tracing::error!(
                rank,
                job_id = ?job_id,
                silent_ms = silent.as_millis() as u64,
                "Worker unresponsive"
            );
            self.cancel_pending();
            return Err(JobFarmError::WorkerUnresponsive {
                rank,
                job_id,
                waited_ms: silent.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn cancel_pending(&mut self) {
        for tracker in self.trackers.values_mut() {
            if tracker.cancel() {
                tracing::debug!(rank = tracker.rank, "Cancelled outstanding receive");
            }
        }
    }

    fn protocol_error(&self, rank: Rank, detail: &str) -> JobFarmError {
        tracing::error!(rank, detail, "Protocol violation");
        JobFarmError::UnexpectedMessage {
            rank,
            detail: detail.to_string(),
        }
    }
}

/// Convenience wrapper around [`Master`] for callers that never drain.
pub async fn run_master<J: Job>(
    comm: &mut Communicator,
    config: &EventLoopConfig,
    jobs: Vec<J>,
    callback: Option<DispatchCallback<J>>,
) -> Result<MasterOutcome<J>> {
    Master::new(comm, config, jobs, callback)
        .run(&CancellationToken::new())
        .await
}
