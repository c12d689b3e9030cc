use serde::{Deserialize, Serialize};

use crate::scheduler::job::JobRecord;

/// Point-to-point protocol between the master and its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message<J> {
    /// Worker -> master. Reports the previous job (if any) and asks for the next one.
    Request { completed: Option<JobRecord<J>> },
    /// Master -> worker.
    Assign { job: JobRecord<J> },
    /// Master -> worker. No more work, leave the loop.
    Stop,
    /// Worker -> master while a job is running.
    Heartbeat,
}

impl<J> Message<J> {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Assign { .. } => "assign",
            Message::Stop => "stop",
            Message::Heartbeat => "heartbeat",
        }
    }
}
