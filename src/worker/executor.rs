use std::time::Instant;

use chrono::Utc;

use crate::comm::Rank;
use crate::error::{JobFarmError, Result};
use crate::scheduler::{Job, JobRecord};

/// Runs jobs handed to one worker rank.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    rank: Rank,
}

impl JobExecutor {
    pub fn new(rank: Rank) -> Self {
        Self { rank }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Run `record.job` on a blocking thread and stamp the outcome.
    ///
    /// The record must arrive `Running`. A panic inside [`Job::run`] is
    /// re-raised on the calling task; nothing here catches it.
    pub async fn execute<J: Job>(&self, record: JobRecord<J>) -> Result<JobRecord<J>> {
        let rank = self.rank;
        let job_id = record.id;
        tracing::info!(rank, job_id = %job_id, "Executing job");

        let started_at = Utc::now();
        let start = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            let mut record = record;
            record.job.run(rank);
            record
        });

        let mut record = match handle.await {
            Ok(record) => record,
            Err(e) if e.is_panic() => {
                tracing::error!(rank, job_id = %job_id, "Job panicked");
                std::panic::resume_unwind(e.into_panic())
            }
            Err(e) => {
                return Err(JobFarmError::Internal(format!(
                    "job {} did not run to completion: {}",
                    job_id, e
                )))
            }
        };

        record.mark_finished(rank, started_at, start.elapsed())?;

        tracing::info!(
            rank,
            job_id = %job_id,
            running_time_ms = record.running_time.map(|d| d.as_millis() as u64),
            "Job completed"
        );
        Ok(record)
    }
}
