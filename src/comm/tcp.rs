//! TCP transport: one OS process per rank, full mesh of connections.
//!
//! Every pair of ranks shares exactly one connection. The higher rank dials,
//! the lower rank accepts. The first frame on a connection is a [`Hello`]
//! naming the dialing rank; after that, frames carry serialized messages.
//!
//! Frame layout: `[length: u32 BE][payload: [u8; length]]`.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::comm::{Communicator, Envelope, Frame, Rank};
use crate::config::GroupConfig;
use crate::error::{JobFarmError, Result};

/// Largest payload a frame may carry. Enforced on both ends: senders get
/// [`JobFarmError::PayloadTooLarge`], readers treat bigger frames as corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
    size: usize,
}

/// Bind `config.listen_addr` and join the group.
pub async fn connect(config: &GroupConfig) -> Result<Communicator> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    connect_with_listener(listener, config).await
}

/// Join the group using an already bound listener. `config.listen_addr` is
/// ignored.
pub async fn connect_with_listener(
    listener: TcpListener,
    config: &GroupConfig,
) -> Result<Communicator> {
    config.validate()?;
    let me = config.rank;
    let size = config.size();
    let deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);
    let retry = Duration::from_millis(config.connect_retry_interval_ms);

    let inbound: HashSet<Rank> = config
        .peers
        .iter()
        .map(|p| p.rank)
        .filter(|&r| r > me)
        .collect();

    let accept = accept_peers(&listener, me, size, inbound, deadline);
    let dial = async {
        let mut streams = Vec::new();
        for peer in config.peers.iter().filter(|p| p.rank < me) {
            let stream = dial_peer(peer.rank, &peer.addr, me, size, retry, deadline).await?;
            streams.push((peer.rank, stream));
        }
        Ok::<_, JobFarmError>(streams)
    };
    let (accepted, dialed) = tokio::try_join!(accept, dial)?;

    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let mut peers: Vec<Option<mpsc::UnboundedSender<Envelope>>> = vec![None; size];
    peers[me] = Some(inbox_tx.clone());

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for (rank, stream) in accepted.into_iter().chain(dialed) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        peers[rank] = Some(tx);
        writers.push(tokio::spawn(write_frames(rank, write_half, rx)));
        readers.push(tokio::spawn(read_frames(rank, read_half, inbox_tx.clone())));
    }

    let peers = peers
        .into_iter()
        .enumerate()
        .map(|(rank, tx)| {
            tx.ok_or_else(|| JobFarmError::Internal(format!("no connection to rank {}", rank)))
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(rank = me, size, "Joined TCP group");
    Ok(Communicator::new(me, peers, inbox, writers, readers).with_max_payload(MAX_FRAME_LEN))
}

async fn accept_peers(
    listener: &TcpListener,
    me: Rank,
    size: usize,
    mut expected: HashSet<Rank>,
    deadline: Instant,
) -> Result<Vec<(Rank, TcpStream)>> {
    let mut streams = Vec::with_capacity(expected.len());
    while !expected.is_empty() {
        let (mut stream, addr) = match tokio::time::timeout_at(deadline, listener.accept()).await {
            Ok(accepted) => accepted?,
            Err(_) => return Err(accept_timeout(&expected)),
        };
        stream.set_nodelay(true)?;

        let bytes = match tokio::time::timeout_at(deadline, read_frame(&mut stream)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                tracing::warn!(%addr, "Connection closed before handshake");
                continue;
            }
            Ok(Err(e)) => {
                tracing::warn!(%addr, error = %e, "Handshake read failed");
                continue;
            }
            Err(_) => return Err(accept_timeout(&expected)),
        };
        let hello: Hello = match serde_json::from_slice(&bytes) {
            Ok(hello) => hello,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "Malformed handshake");
                continue;
            }
        };

        if hello.size != size {
            return Err(JobFarmError::InvalidGroup(format!(
                "rank {} believes the group has {} members, rank {} has {}",
                hello.rank, hello.size, me, size
            )));
        }
        if !expected.remove(&hello.rank) {
            return Err(JobFarmError::InvalidGroup(format!(
                "rank {} was not expected to connect to rank {}",
                hello.rank, me
            )));
        }

        tracing::debug!(rank = me, peer = hello.rank, %addr, "Accepted peer");
        streams.push((hello.rank, stream));
    }
    Ok(streams)
}

fn accept_timeout(expected: &HashSet<Rank>) -> JobFarmError {
    let mut missing: Vec<Rank> = expected.iter().copied().collect();
    missing.sort_unstable();
    JobFarmError::AcceptTimeout { missing }
}

async fn dial_peer(
    peer: Rank,
    addr: &str,
    me: Rank,
    size: usize,
    retry: Duration,
    deadline: Instant,
) -> Result<TcpStream> {
    loop {
        let attempt = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(attempt) => attempt,
            Err(_) => {
                tracing::warn!(rank = me, peer, addr, "Connect attempt outlived the deadline");
                return Err(JobFarmError::ConnectTimeout {
                    rank: peer,
                    addr: addr.to_string(),
                });
            }
        };
        match attempt {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                let hello = serde_json::to_vec(&Hello { rank: me, size })?;
                write_frame(&mut stream, &hello).await?;
                tracing::debug!(rank = me, peer, addr, "Connected to peer");
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() + retry >= deadline {
                    tracing::warn!(rank = me, peer, addr, error = %e, "Giving up on peer");
                    return Err(JobFarmError::ConnectTimeout {
                        rank: peer,
                        addr: addr.to_string(),
                    });
                }
                tracing::trace!(rank = me, peer, addr, error = %e, "Peer not reachable yet");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

async fn write_frame<W>(io: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    io.write_u32(len).await?;
    io.write_all(payload).await?;
    io.flush().await
}

/// `Ok(None)` on a clean end of stream at a frame boundary.
async fn read_frame<R>(io: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match io.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frames(
    peer: Rank,
    mut io: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope.frame {
            Frame::Data(bytes) => {
                if let Err(e) = write_frame(&mut io, &bytes).await {
                    tracing::warn!(peer, error = %e, "Failed to write frame");
                    break;
                }
            }
            Frame::Hangup => break,
        }
    }
    if let Err(e) = io.shutdown().await {
        tracing::debug!(peer, error = %e, "Socket shutdown failed");
    }
}

async fn read_frames(
    peer: Rank,
    mut io: OwnedReadHalf,
    inbox: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        match read_frame(&mut io).await {
            Ok(Some(bytes)) => {
                let envelope = Envelope {
                    source: peer,
                    frame: Frame::Data(bytes),
                };
                if inbox.send(envelope).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer, error = %e, "Failed to read frame");
                break;
            }
        }
    }
    let _ = inbox.send(Envelope {
        source: peer,
        frame: Frame::Hangup,
    });
}
