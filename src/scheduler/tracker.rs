use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::comm::Rank;

/// State of the one receive the master keeps open per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the worker's next request. `last_seen` moves on heartbeats.
    Pending { last_seen: Instant },
    /// The worker's request arrived and has not been re-armed yet.
    Completed,
    /// Abandoned at shutdown without ever completing.
    Cancelled,
}

/// Master-side bookkeeping for one worker rank.
#[derive(Debug, Clone)]
pub struct RankTracker {
    pub rank: Rank,
    pub request: RequestState,
    pub assigned_job: Option<Uuid>,
    pub listening: bool,
}

impl RankTracker {
    /// A fresh tracker already has its first receive posted.
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            request: RequestState::Pending {
                last_seen: Instant::now(),
            },
            assigned_job: None,
            listening: true,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.request, RequestState::Pending { .. })
    }

    /// Resolve the outstanding receive. Returns false if none was open.
    pub fn complete(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.request = RequestState::Completed;
        true
    }

    /// Post the next receive after handing this rank a job.
    pub fn rearm(&mut self, job_id: Uuid) {
        self.assigned_job = Some(job_id);
        self.request = RequestState::Pending {
            last_seen: Instant::now(),
        };
    }

    /// The rank was told to stop: no further receive is posted.
    pub fn release(&mut self) {
        self.assigned_job = None;
        self.listening = false;
    }

    pub fn touch(&mut self) {
        if let RequestState::Pending { last_seen, .. } = &mut self.request {
            *last_seen = Instant::now();
        }
    }

    pub fn cancel(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.request = RequestState::Cancelled;
        true
    }

    /// When this rank counts as unresponsive, if it is being waited on.
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        match self.request {
            RequestState::Pending { last_seen, .. } if self.listening => Some(last_seen + timeout),
            _ => None,
        }
    }

    pub fn silent_for(&self) -> Duration {
        match self.request {
            RequestState::Pending { last_seen, .. } => last_seen.elapsed(),
            _ => Duration::ZERO,
        }
    }
}
