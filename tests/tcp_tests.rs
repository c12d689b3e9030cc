mod test_harness;

use std::net::SocketAddr;
use std::time::Duration;

use jobfarm::comm::{tcp, Communicator, Incoming};
use jobfarm::config::{EventLoopConfig, GroupConfig};
use jobfarm::error::JobFarmError;
use jobfarm::scheduler::{JobStatus, Master};
use jobfarm::EventLoop;
use test_harness::{run_rank, test_jobs, TestJob};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT_MS: u64 = 5_000;

async fn bind_listeners(size: usize) -> (Vec<TcpListener>, Vec<SocketAddr>) {
    let mut listeners = Vec::with_capacity(size);
    let mut addrs = Vec::with_capacity(size);
    for _ in 0..size {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        listeners.push(listener);
    }
    (listeners, addrs)
}

fn group_config(rank: usize, addrs: &[SocketAddr]) -> GroupConfig {
    let mut config = GroupConfig::new(rank, addrs[rank]);
    config.connect_timeout_ms = CONNECT_TIMEOUT_MS;
    config.connect_retry_interval_ms = 20;
    for (peer, addr) in addrs.iter().enumerate() {
        if peer != rank {
            config = config.with_peer(peer, addr.to_string());
        }
    }
    config
}

/// Join a full TCP group of `size` ranks on loopback.
async fn tcp_group(size: usize) -> Vec<Communicator> {
    let (listeners, addrs) = bind_listeners(size).await;
    let handles: Vec<_> = listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            let config = group_config(rank, &addrs);
            tokio::spawn(async move { tcp::connect_with_listener(listener, &config).await })
        })
        .collect();

    let mut comms = Vec::with_capacity(size);
    for handle in handles {
        comms.push(handle.await.unwrap().unwrap());
    }
    comms
}

#[tokio::test]
async fn test_tcp_point_to_point_and_broadcast() {
    let mut comms = tcp_group(3).await;
    for (rank, comm) in comms.iter().enumerate() {
        assert_eq!(comm.rank(), rank);
        assert_eq!(comm.size(), 3);
    }

    comms[2].send(0, &"first".to_string()).unwrap();
    comms[2].send(0, &"second".to_string()).unwrap();
    comms[1].send(0, &"from one".to_string()).unwrap();

    // Waiting on rank 1 first must not lose rank 2's messages.
    let from_one: String = comms[0].recv_from(1).await.unwrap();
    assert_eq!(from_one, "from one");
    let first: String = comms[0].recv_from(2).await.unwrap();
    let second: String = comms[0].recv_from(2).await.unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("first", "second"));

    let payload = vec![1u32, 2, 3];
    let root = comms[1].broadcast(1, Some(payload.clone())).await.unwrap();
    assert_eq!(root, payload);
    for rank in [0, 2] {
        let got: Vec<u32> = comms[rank].broadcast(1, None).await.unwrap();
        assert_eq!(got, payload);
    }

    for comm in comms {
        comm.close().await;
    }
}

#[tokio::test]
async fn test_event_loop_over_tcp() {
    let comms = tcp_group(3).await;
    let config = EventLoopConfig::new(0).with_heartbeat_interval_ms(50);

    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let jobs = if comm.rank() == 0 {
                test_jobs(8)
            } else {
                Vec::new()
            };
            tokio::spawn(run_rank(comm, EventLoop::new(config.clone()), jobs))
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        outcomes.push(outcome);
    }

    let master_results = outcomes[0].results.as_ref().unwrap();
    assert_eq!(master_results.len(), 8);
    assert!(master_results
        .iter()
        .all(|r| r.status == JobStatus::Finished && r.job.runs == 1));
    for outcome in &outcomes[1..] {
        assert_eq!(outcome.results.as_ref().unwrap(), master_results);
    }
    // 8 assignments + 2 stops + 2 broadcast messages.
    assert_eq!(outcomes[0].messages_sent, 12);
}

#[tokio::test]
async fn test_oversized_broadcast_fails_on_the_root() {
    let mut comms = tcp_group(2).await;
    let mut worker = comms.pop().unwrap();
    let mut root = comms.pop().unwrap();

    let big = "x".repeat(tcp::MAX_FRAME_LEN + 1);
    let err = root.broadcast(0, Some(big)).await.unwrap_err();
    match err {
        JobFarmError::PayloadTooLarge { dest, len, limit } => {
            assert_eq!(dest, 1);
            assert_eq!(limit, tcp::MAX_FRAME_LEN);
            assert!(len > limit);
        }
        other => panic!("expected PayloadTooLarge, got {}", other),
    }
    assert_eq!(root.messages_sent(), 0);

    // The connection survives the refused send.
    root.send(1, &"after".to_string()).unwrap();
    let got: String = worker.recv_from(0).await.unwrap();
    assert_eq!(got, "after");

    root.close().await;
    worker.close().await;
}

#[tokio::test]
async fn test_dropped_tcp_worker_is_lost() {
    let mut comms = tcp_group(2).await;
    let worker = comms.pop().unwrap();
    let mut master = comms.pop().unwrap();
    drop(worker);

    let config = EventLoopConfig::new(0);
    let err = Master::new(&mut master, &config, test_jobs(2), None)
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JobFarmError::WorkerLost {
            rank: 1,
            job_id: None
        }
    ));
}

#[tokio::test]
async fn test_hangup_is_visible_to_recv_any() {
    let mut comms = tcp_group(2).await;
    let closing = comms.pop().unwrap();
    let mut survivor = comms.pop().unwrap();

    closing.close().await;
    let (source, incoming) = survivor.recv_any::<String>().await.unwrap();
    assert_eq!(source, 1);
    assert!(matches!(incoming, Incoming::Hangup));

    let err = survivor.recv_from::<String>(1).await.unwrap_err();
    assert!(matches!(err, JobFarmError::Disconnected(1)));
}

#[tokio::test]
async fn test_connect_times_out_without_lower_rank() {
    // Rank 1 dials rank 0, which never listens.
    let (mut listeners, addrs) = bind_listeners(2).await;
    let listener = listeners.pop().unwrap();
    drop(listeners);

    let mut config = group_config(1, &addrs);
    config.connect_timeout_ms = 300;
    let err = tcp::connect_with_listener(listener, &config)
        .await
        .unwrap_err();
    match err {
        JobFarmError::ConnectTimeout { rank, addr } => {
            assert_eq!(rank, 0);
            assert_eq!(addr, addrs[0].to_string());
        }
        other => panic!("expected ConnectTimeout, got {}", other),
    }
}

#[tokio::test]
async fn test_connect_gives_up_on_an_unroutable_peer() {
    // 10.255.255.1 is normally blackholed, so the connect itself never
    // completes and only the deadline ends it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = GroupConfig::new(1, addr).with_peer(0, "10.255.255.1:7070".to_string());
    config.connect_timeout_ms = 300;

    let started = tokio::time::Instant::now();
    let err = tcp::connect_with_listener(listener, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, JobFarmError::ConnectTimeout { rank: 0, .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_stray_connection_does_not_abort_the_join() {
    let (mut listeners, addrs) = bind_listeners(2).await;
    let listener_one = listeners.pop().unwrap();
    let listener_zero = listeners.pop().unwrap();

    // Something that is not a group member talks to rank 0 first.
    let mut stray = TcpStream::connect(addrs[0]).await.unwrap();
    let garbage = b"not json";
    stray.write_u32(garbage.len() as u32).await.unwrap();
    stray.write_all(garbage).await.unwrap();
    stray.flush().await.unwrap();

    let config_zero = group_config(0, &addrs);
    let zero =
        tokio::spawn(async move { tcp::connect_with_listener(listener_zero, &config_zero).await });
    let config_one = group_config(1, &addrs);
    let one = tokio::spawn(async move { tcp::connect_with_listener(listener_one, &config_one).await });

    let mut zero = zero.await.unwrap().unwrap();
    let mut one = one.await.unwrap().unwrap();
    one.send(0, &"hello".to_string()).unwrap();
    let got: String = zero.recv_from(1).await.unwrap();
    assert_eq!(got, "hello");
    drop(stray);
}

#[tokio::test]
async fn test_accept_times_out_without_higher_rank() {
    let (mut listeners, addrs) = bind_listeners(2).await;
    drop(listeners.pop());
    let listener = listeners.pop().unwrap();

    let mut config = group_config(0, &addrs);
    config.connect_timeout_ms = 300;
    let err = tcp::connect_with_listener(listener, &config)
        .await
        .unwrap_err();
    match err {
        JobFarmError::AcceptTimeout { missing } => assert_eq!(missing, vec![1]),
        other => panic!("expected AcceptTimeout, got {}", other),
    }
}

#[tokio::test]
async fn test_invalid_group_is_rejected_before_connecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = GroupConfig::new(0, addr).with_peer(3, "127.0.0.1:1".to_string());
    let err = tcp::connect_with_listener(listener, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, JobFarmError::InvalidGroup(_)));
}

#[tokio::test]
async fn test_tcp_group_of_one() {
    let mut comms = tcp_group(1).await;
    let mut comm = comms.pop().unwrap();
    let results = EventLoop::<TestJob>::new(EventLoopConfig::new(0))
        .run(&mut comm, Vec::new())
        .await
        .unwrap();
    assert!(results.is_empty());
}
