use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comm::Rank;
use crate::error::{JobFarmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
}

impl JobStatus {
    /// Status only ever moves forward: Queued -> Running -> Finished.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running) | (JobStatus::Running, JobStatus::Finished)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

/// A unit of work that can be shipped to a worker rank.
///
/// The payload travels by value: it is serialized on the master, rebuilt on
/// the worker, mutated by [`Job::run`] and serialized back. Anything `run`
/// wants to report must be written onto `self`.
///
/// A panic inside `run` is not caught. It takes down the worker that ran it.
pub trait Job: Serialize + DeserializeOwned + Send + 'static {
    fn run(&mut self, _rank: Rank) {}
}

/// A job together with its scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<J> {
    pub id: Uuid,
    pub status: JobStatus,
    pub running_time: Option<Duration>,
    pub executed_by: Option<Rank>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job: J,
}

impl<J> JobRecord<J> {
    pub fn new(job: J) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            running_time: None,
            executed_by: None,
            started_at: None,
            completed_at: None,
            job,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }

    /// Called by the master right before the record is sent to a worker.
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)
    }

    /// Called by the worker once `run` has returned. The status flips first,
    /// so `running_time` is never set on a record that is not Finished.
    pub fn mark_finished(
        &mut self,
        rank: Rank,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<()> {
        self.transition(JobStatus::Finished)?;
        self.executed_by = Some(rank);
        self.started_at = Some(started_at);
        self.completed_at = Some(Utc::now());
        self.running_time = Some(elapsed);
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobFarmError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_queued() {
        let record = JobRecord::new(42u32);
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.running_time.is_none());
        assert!(record.executed_by.is_none());
        assert!(!record.is_finished());
    }

    #[test]
    fn forward_transitions_succeed() {
        let mut record = JobRecord::new("payload".to_string());
        record.mark_running().unwrap();
        assert_eq!(record.status, JobStatus::Running);

        record
            .mark_finished(3, Utc::now(), Duration::from_millis(5))
            .unwrap();
        assert!(record.is_finished());
        assert_eq!(record.executed_by, Some(3));
        assert_eq!(record.running_time, Some(Duration::from_millis(5)));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn finishing_a_queued_job_is_rejected() {
        let mut record = JobRecord::new(());
        let err = record
            .mark_finished(1, Utc::now(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            JobFarmError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Finished,
                ..
            }
        ));
        assert!(record.running_time.is_none());
    }

    #[test]
    fn status_never_reverts() {
        let mut record = JobRecord::new(());
        record.mark_running().unwrap();
        record.mark_finished(1, Utc::now(), Duration::ZERO).unwrap();
        assert!(record.mark_running().is_err());
        assert_eq!(record.status, JobStatus::Finished);
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Finished.to_string(), "finished");
    }
}
