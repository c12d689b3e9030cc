//! Ranked process group with point-to-point and collective messaging.
//!
//! Every participant owns one [`Communicator`]. A communicator knows its own
//! rank, the group size, and holds one outbound channel per rank plus a
//! single inbox fed by all of them. The transport behind those channels is
//! either another task in the same process ([`local`]) or a TCP connection
//! to another process ([`tcp`]).
//!
//! # Semantics
//!
//! - **Sends never block**: payloads are serialized and queued.
//! - **Per-pair FIFO**: messages from one rank to another arrive in order.
//!   Nothing is promised across different senders.
//! - **Hang-up**: when a communicator is dropped (including during a panic
//!   unwind) or its connection closes, every peer sees [`Incoming::Hangup`]
//!   for that rank.

pub mod local;
pub mod tcp;

use std::collections::{HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{JobFarmError, Result};

/// A participant's index within its group.
pub type Rank = usize;

#[derive(Debug)]
pub enum Frame {
    Data(Vec<u8>),
    Hangup,
}

#[derive(Debug)]
pub struct Envelope {
    pub source: Rank,
    pub frame: Frame,
}

/// What a receive produced.
#[derive(Debug)]
pub enum Incoming<T> {
    Message(T),
    Hangup,
}

/// Cloneable handle for sending to one rank from outside the owning task.
#[derive(Debug, Clone)]
pub struct RankSender {
    source: Rank,
    dest: Rank,
    max_payload: usize,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl RankSender {
    pub fn dest(&self) -> Rank {
        self.dest
    }

    pub fn send<T: Serialize>(&self, msg: &T) -> Result<()> {
        self.send_bytes(serde_json::to_vec(msg)?)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        check_payload(self.dest, bytes.len(), self.max_payload)?;
        self.tx
            .send(Envelope {
                source: self.source,
                frame: Frame::Data(bytes),
            })
            .map_err(|_| JobFarmError::Disconnected(self.dest))
    }
}

pub struct Communicator {
    rank: Rank,
    size: usize,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    stash: VecDeque<Envelope>,
    hung_up: HashSet<Rank>,
    sent: u64,
    max_payload: usize,
    writers: Vec<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("sent", &self.sent)
            .field("max_payload", &self.max_payload)
            .field("stashed", &self.stash.len())
            .finish()
    }
}

impl Communicator {
    /// `peers[r]` must deliver to rank `r`; `peers[rank]` loops back into `inbox`.
    pub(crate) fn new(
        rank: Rank,
        peers: Vec<mpsc::UnboundedSender<Envelope>>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        writers: Vec<JoinHandle<()>>,
        readers: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            rank,
            size: peers.len(),
            peers,
            inbox,
            stash: VecDeque::new(),
            hung_up: HashSet::new(),
            sent: 0,
            max_payload: usize::MAX,
            writers,
            readers,
            closed: false,
        }
    }

    /// Refuse to send payloads the transport cannot carry.
    pub(crate) fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of point-to-point messages sent through this handle.
    pub fn messages_sent(&self) -> u64 {
        self.sent
    }

    pub fn sender(&self, dest: Rank) -> Result<RankSender> {
        let tx = self.peer(dest)?.clone();
        Ok(RankSender {
            source: self.rank,
            dest,
            max_payload: self.max_payload,
            tx,
        })
    }

    /// Serialize `msg` and queue it for `dest`. Never waits on the receiver.
    pub fn send<T: Serialize>(&mut self, dest: Rank, msg: &T) -> Result<()> {
        let bytes = serde_json::to_vec(msg)?;
        check_payload(dest, bytes.len(), self.max_payload)?;
        self.peer(dest)?
            .send(Envelope {
                source: self.rank,
                frame: Frame::Data(bytes),
            })
            .map_err(|_| JobFarmError::Disconnected(dest))?;
        self.sent += 1;
        Ok(())
    }

    /// Wait for the next message from any rank.
    pub async fn recv_any<T: DeserializeOwned>(&mut self) -> Result<(Rank, Incoming<T>)> {
        let envelope = match self.stash.pop_front() {
            Some(envelope) => envelope,
            None => self.next_envelope().await?,
        };
        let source = envelope.source;
        Ok((source, self.open(envelope)?))
    }

    /// Wait for the next message from `source`. Messages from other ranks are
    /// kept for later receives.
    pub async fn recv_from<T: DeserializeOwned>(&mut self, source: Rank) -> Result<T> {
        self.peer(source)?;
        if let Some(pos) = self.stash.iter().position(|e| e.source == source) {
            if let Some(envelope) = self.stash.remove(pos) {
                return self.expect_message(envelope);
            }
        }
        if self.hung_up.contains(&source) {
            return Err(JobFarmError::Disconnected(source));
        }

        loop {
            let envelope = self.next_envelope().await?;
            if envelope.source == source {
                return self.expect_message(envelope);
            }
            self.stash.push_back(envelope);
        }
    }

    /// Collective: `root` passes `Some(value)`, every other rank passes `None`
    /// and receives the root's value.
    pub async fn broadcast<T>(&mut self, root: Rank, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.peer(root)?;
        if self.rank != root {
            return self.recv_from(root).await;
        }

        let value = value.ok_or_else(|| {
            JobFarmError::Internal("broadcast root called without a value".to_string())
        })?;
        let bytes = serde_json::to_vec(&value)?;
        // Checked before any peer is sent anything.
        if let Some(first) = (0..self.size).find(|&r| r != root) {
            check_payload(first, bytes.len(), self.max_payload)?;
        }
        for dest in (0..self.size).filter(|&r| r != root) {
            self.peer(dest)?
                .send(Envelope {
                    source: self.rank,
                    frame: Frame::Data(bytes.clone()),
                })
                .map_err(|_| JobFarmError::Disconnected(dest))?;
            self.sent += 1;
        }
        tracing::debug!(rank = self.rank, peers = self.size - 1, "Broadcast sent");
        Ok(value)
    }

    /// Signal a hang-up to every peer and wait until the transport has
    /// flushed whatever was queued before it.
    pub async fn close(mut self) {
        self.hang_up();
        for writer in self.writers.drain(..) {
            if let Err(e) = writer.await {
                tracing::warn!(rank = self.rank, error = %e, "Transport writer ended abnormally");
            }
        }
    }

    fn peer(&self, rank: Rank) -> Result<&mpsc::UnboundedSender<Envelope>> {
        self.peers.get(rank).ok_or_else(|| {
            JobFarmError::InvalidGroup(format!(
                "rank {} is outside the group of size {}",
                rank, self.size
            ))
        })
    }

    async fn next_envelope(&mut self) -> Result<Envelope> {
        // The loopback sender lives in `peers`, so the inbox only closes if
        // the communicator is being torn down.
        self.inbox
            .recv()
            .await
            .ok_or_else(|| JobFarmError::Internal("communicator inbox closed".to_string()))
    }

    fn open<T: DeserializeOwned>(&mut self, envelope: Envelope) -> Result<Incoming<T>> {
        match envelope.frame {
            Frame::Data(bytes) => Ok(Incoming::Message(serde_json::from_slice(&bytes)?)),
            Frame::Hangup => {
                self.hung_up.insert(envelope.source);
                Ok(Incoming::Hangup)
            }
        }
    }

    fn expect_message<T: DeserializeOwned>(&mut self, envelope: Envelope) -> Result<T> {
        let source = envelope.source;
        match self.open(envelope)? {
            Incoming::Message(msg) => Ok(msg),
            Incoming::Hangup => Err(JobFarmError::Disconnected(source)),
        }
    }

    fn hang_up(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (rank, tx) in self.peers.iter().enumerate() {
            if rank == self.rank {
                continue;
            }
            let _ = tx.send(Envelope {
                source: self.rank,
                frame: Frame::Hangup,
            });
        }
    }
}

fn check_payload(dest: Rank, len: usize, limit: usize) -> Result<()> {
    if len > limit {
        return Err(JobFarmError::PayloadTooLarge { dest, len, limit });
    }
    Ok(())
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.hang_up();
        for reader in &self.readers {
            reader.abort();
        }
    }
}
