use std::collections::HashSet;
use std::net::SocketAddr;

use crate::comm::Rank;
use crate::error::{JobFarmError, Result};

/// Settings shared by every rank taking part in an event loop run.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Rank that hands out work. Must be inside the group.
    pub master_rank: Rank,
    /// Log every dispatch at info level instead of debug.
    pub log_progress: bool,
    /// Give up on a worker that has been silent this long.
    /// `None` waits forever.
    pub worker_timeout_ms: Option<u64>,
    /// How often a busy worker tells the master it is still alive.
    pub heartbeat_interval_ms: u64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            master_rank: 0,
            log_progress: false,
            worker_timeout_ms: None,
            heartbeat_interval_ms: 500,
        }
    }
}

impl EventLoopConfig {
    pub fn new(master_rank: Rank) -> Self {
        Self {
            master_rank,
            ..Default::default()
        }
    }

    pub fn with_log_progress(mut self, log_progress: bool) -> Self {
        self.log_progress = log_progress;
        self
    }

    pub fn with_worker_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.worker_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// A busy worker must get at least one heartbeat in before the timeout.
    /// A zero heartbeat interval turns heartbeats off and is always allowed.
    pub fn validate(&self) -> Result<()> {
        let Some(timeout_ms) = self.worker_timeout_ms else {
            return Ok(());
        };
        if timeout_ms == 0 {
            return Err(JobFarmError::InvalidConfig(
                "worker timeout must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_interval_ms >= timeout_ms {
            return Err(JobFarmError::InvalidConfig(format!(
                "heartbeat interval {}ms must be shorter than the worker timeout {}ms",
                self.heartbeat_interval_ms, timeout_ms
            )));
        }
        Ok(())
    }
}

/// Membership of a TCP group as seen from one rank.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub rank: Rank,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub connect_timeout_ms: u64,
    pub connect_retry_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub rank: Rank,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            peers: Vec::new(),
            connect_timeout_ms: 10_000,
            connect_retry_interval_ms: 100,
        }
    }
}

impl GroupConfig {
    pub fn new(rank: Rank, listen_addr: SocketAddr) -> Self {
        Self {
            rank,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, rank: Rank, addr: String) -> Self {
        self.peers.push(PeerConfig { rank, addr });
        self
    }

    pub fn size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Own rank plus peer ranks must be exactly `0..size`.
    pub fn validate(&self) -> Result<()> {
        let size = self.size();
        let mut seen = HashSet::with_capacity(size);
        for rank in std::iter::once(self.rank).chain(self.peers.iter().map(|p| p.rank)) {
            if rank >= size {
                return Err(JobFarmError::InvalidGroup(format!(
                    "rank {} is outside the group of size {}",
                    rank, size
                )));
            }
            if !seen.insert(rank) {
                return Err(JobFarmError::InvalidGroup(format!(
                    "rank {} appears more than once",
                    rank
                )));
            }
        }
        Ok(())
    }
}
