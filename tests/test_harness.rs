//! Test harness for running the event loop on every rank of a group.
//!
//! Provides a configurable test job and helpers that spawn one task per rank.

#![allow(dead_code)]

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use jobfarm::comm::local::local_group;
use jobfarm::comm::{Communicator, Rank};
use jobfarm::config::EventLoopConfig;
use jobfarm::error::Result;
use jobfarm::scheduler::{Job, JobRecord};
use jobfarm::EventLoop;

/// Job that remembers where it ran and how often, optionally sleeping first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJob {
    pub index: usize,
    pub sleep_ms: u64,
    pub explode: bool,
    pub ran_on: Option<Rank>,
    pub runs: u32,
}

impl TestJob {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            sleep_ms: 0,
            explode: false,
            ran_on: None,
            runs: 0,
        }
    }

    pub fn sleeping(index: usize, sleep_ms: u64) -> Self {
        Self {
            sleep_ms,
            ..Self::new(index)
        }
    }

    pub fn exploding(index: usize) -> Self {
        Self {
            explode: true,
            ..Self::new(index)
        }
    }
}

impl Job for TestJob {
    fn run(&mut self, rank: Rank) {
        if self.sleep_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.sleep_ms));
        }
        if self.explode {
            panic!("test job {} exploded", self.index);
        }
        self.ran_on = Some(rank);
        self.runs += 1;
    }
}

pub fn test_jobs(count: usize) -> Vec<TestJob> {
    (0..count).map(TestJob::new).collect()
}

/// What one rank's task produced.
#[derive(Debug)]
pub struct RankOutcome<J> {
    pub rank: Rank,
    pub results: Result<Vec<JobRecord<J>>>,
    pub messages_sent: u64,
}

/// Run `event_loop` on `comm` and report the outcome with the send count.
pub async fn run_rank<J: Job>(
    mut comm: Communicator,
    event_loop: EventLoop<J>,
    jobs: Vec<J>,
) -> RankOutcome<J> {
    let rank = comm.rank();
    let results = event_loop.run(&mut comm, jobs).await;
    let messages_sent = comm.messages_sent();
    RankOutcome {
        rank,
        results,
        messages_sent,
    }
}

/// Spawn every rank of a local group. The master (per `config`) gets `jobs`;
/// `customize` may add callbacks or shutdown tokens per rank.
pub fn spawn_group_with<J, F>(
    size: usize,
    config: EventLoopConfig,
    jobs: Vec<J>,
    customize: F,
) -> Vec<JoinHandle<RankOutcome<J>>>
where
    J: Job + Clone,
    F: Fn(Rank, EventLoop<J>) -> EventLoop<J>,
{
    local_group(size)
        .into_iter()
        .map(|comm| {
            let rank = comm.rank();
            let rank_jobs = if rank == config.master_rank {
                jobs.clone()
            } else {
                Vec::new()
            };
            let event_loop = customize(rank, EventLoop::new(config.clone()));
            tokio::spawn(run_rank(comm, event_loop, rank_jobs))
        })
        .collect()
}

pub fn spawn_group<J: Job + Clone>(
    size: usize,
    config: EventLoopConfig,
    jobs: Vec<J>,
) -> Vec<JoinHandle<RankOutcome<J>>> {
    spawn_group_with(size, config, jobs, |_, event_loop| event_loop)
}

/// Await every rank, failing the test if any task hangs or panics.
pub async fn join_group<J>(handles: Vec<JoinHandle<RankOutcome<J>>>) -> Vec<RankOutcome<J>> {
    let joined = tokio::time::timeout(Duration::from_secs(10), join_all(handles))
        .await
        .expect("group did not finish in time");
    joined
        .into_iter()
        .map(|outcome| outcome.expect("rank task panicked"))
        .collect()
}
