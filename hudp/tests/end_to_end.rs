//! End-to-end tests: sender, receiver and emulator on the loopback
//! interface.
//!
//! Every role runs its own background tasks on real sockets bound to
//! `127.0.0.1:0`; waits are bounded with `tokio::time::timeout` so a lost
//! datagram fails the test instead of hanging it.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use hudp::aggregate::{load_snapshot, reconcile, reconcile_pair};
use hudp::config::{ReceiverConfig, SenderConfig};
use hudp::emulator::{Emulator, EmulatorConfig, EmulatorHandle, Endpoints};
use hudp::packet::{now_micros, Channel, Kind, Packet};
use hudp::receiver::Receiver;
use hudp::sender::{Completions, ReliableOutcome, ReliableStatus, Sender, Submitted};
use hudp::socket::Socket;

const WAIT: Duration = Duration::from_secs(10);

async fn ephemeral() -> Socket {
    let addr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

/// Bind all three roles with the emulator in the middle.
async fn relayed(
    sender_cfg: impl FnOnce(SenderConfig) -> SenderConfig,
    emulator_cfg: EmulatorConfig,
) -> (Sender, Completions, Receiver, EmulatorHandle) {
    let sender_sock = ephemeral().await;
    let receiver_sock = ephemeral().await;
    let endpoints = Endpoints {
        sender: sender_sock.local_addr,
        receiver: receiver_sock.local_addr,
    };

    let emulator = Emulator::bind("127.0.0.1:0".parse().unwrap(), endpoints, emulator_cfg)
        .await
        .expect("emulator bind")
        .start();
    let receiver = Receiver::start(receiver_sock, ReceiverConfig::default()).expect("receiver");
    let (sender, completions) =
        Sender::start(sender_sock, sender_cfg(SenderConfig::new(emulator.local_addr)))
            .expect("sender");

    (sender, completions, receiver, emulator)
}

async fn collect(completions: &mut Completions, n: usize) -> Vec<hudp::sender::Completion> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let c = timeout(WAIT, completions.next())
            .await
            .expect("timed out waiting for completions")
            .expect("completion stream closed early");
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// Test 1: clean relay, reliable channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_clean_relay_delivers_every_reliable_message() {
    const N: usize = 100;

    // Generous RTO: on a clean path nothing should ever be resent.
    let (sender, mut completions, receiver, emulator) = relayed(
        |c| SenderConfig {
            rto: Duration::from_secs(1),
            ..c
        },
        EmulatorConfig::default(),
    )
    .await;

    for i in 0..N {
        let submitted = sender
            .send(Channel::Reliable, format!("msg-{i}").as_bytes())
            .await
            .expect("send");
        assert_eq!(submitted, Submitted::Pending { seq: i as u32 });
    }

    let done = collect(&mut completions, N).await;
    assert!(done
        .iter()
        .all(|c| matches!(c.outcome, ReliableOutcome::Delivered { .. })));
    assert!(sender.drain(WAIT).await);
    assert_eq!(sender.status(0), ReliableStatus::Acked);

    let sent = sender.shutdown().await.expect("sender shutdown");
    let received = receiver.shutdown().await.expect("receiver shutdown");
    let stats = emulator.shutdown().await.expect("emulator shutdown");

    assert_eq!(sent.reliable.packets, N as u64);
    assert_eq!(sent.reliable.retransmissions, 0);
    assert_eq!(sent.reliable.failed, 0);
    assert!(sent.reliable.latency_p50_ms.is_some());
    assert_eq!(received.reliable.packets, N as u64);
    assert_eq!(received.reliable.duplicates, 0);
    assert_eq!(received.acks_sent, N as u64);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.received, 2 * N as u64);

    assert_eq!(reconcile(&sent, &received).reliable, Some(1.0));
}

// ---------------------------------------------------------------------------
// Test 2: direct mode, both channels, snapshots through files
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_direct_mode_mixed_channels() {
    const N: usize = 50;

    let receiver_sock = ephemeral().await;
    let mut receiver =
        Receiver::start(receiver_sock, ReceiverConfig::default()).expect("receiver");
    let (sender, mut completions) = Sender::start(
        ephemeral().await,
        SenderConfig {
            rto: Duration::from_secs(1),
            ..SenderConfig::new(receiver.local_addr())
        },
    )
    .expect("sender");
    let mut deliveries = receiver.poll().expect("deliveries");
    assert!(receiver.poll().is_err(), "delivery stream is handed out once");

    for _ in 0..N {
        sender.send(Channel::Reliable, b"hello_R").await.expect("send");
        let s = sender.send(Channel::Unreliable, b"hello_U").await.expect("send");
        assert!(matches!(s, Submitted::Sent { .. }));
    }

    let mut per_channel = [0usize; 2];
    while per_channel.iter().sum::<usize>() < 2 * N {
        let d = timeout(WAIT, deliveries.next())
            .await
            .expect("timed out waiting for deliveries")
            .expect("delivery stream closed");
        match d.channel {
            Channel::Reliable => assert!(d.latency_ms.is_none()),
            Channel::Unreliable => assert!(d.latency_ms.is_some()),
        }
        per_channel[d.channel.index()] += 1;
    }
    assert_eq!(per_channel, [N, N]);
    collect(&mut completions, N).await;

    let sent = sender.shutdown().await.expect("sender shutdown");
    let received = receiver.shutdown().await.expect("receiver shutdown");
    assert_eq!(sent.unreliable.packets, N as u64);
    assert_eq!(sent.unreliable.retransmissions, 0);
    assert_eq!(received.unreliable.packets, N as u64);
    assert_eq!(received.unreliable.bytes, (N * b"hello_U".len()) as u64);
    assert!(received.unreliable.jitter_ms.is_some());

    let dir = std::env::temp_dir();
    let tag = std::process::id();
    let sent_path = dir.join(format!("hudp-e2e-{tag}-sender.json"));
    let recv_path = dir.join(format!("hudp-e2e-{tag}-receiver.json"));
    std::fs::write(&sent_path, sent.to_json().unwrap()).unwrap();
    std::fs::write(&recv_path, received.to_json().unwrap()).unwrap();

    let report = reconcile_pair(
        &load_snapshot(&recv_path).unwrap(),
        &load_snapshot(&sent_path).unwrap(),
    );
    assert_eq!(report.reliable, Some(1.0));
    assert_eq!(report.unreliable, Some(1.0));

    let _ = std::fs::remove_file(&sent_path);
    let _ = std::fs::remove_file(&recv_path);
}

// ---------------------------------------------------------------------------
// Test 3: duplicates are ACKed every time but delivered once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_reliable_packet_is_acked_twice_delivered_once() {
    let mut receiver =
        Receiver::start(ephemeral().await, ReceiverConfig::default()).expect("receiver");
    let mut deliveries = receiver.poll().unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let data = Packet::data(Channel::Reliable, 7, now_micros(), b"once".to_vec()).encode();
    peer.send_to(&data, receiver.local_addr()).await.unwrap();
    peer.send_to(&data, receiver.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    for _ in 0..2 {
        let (n, _) = timeout(WAIT, peer.recv_from(&mut buf))
            .await
            .expect("ACK not received")
            .unwrap();
        let ack = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(ack.header.kind, Kind::Ack);
        assert_eq!(ack.header.seq, 7);
    }

    let first = timeout(WAIT, deliveries.next()).await.unwrap().unwrap();
    assert_eq!(first.payload, b"once");
    assert!(deliveries.try_next().is_none());

    let snap = receiver.shutdown().await.unwrap();
    assert_eq!(snap.reliable.packets, 1);
    assert_eq!(snap.reliable.duplicates, 1);
    assert_eq!(snap.acks_sent, 2);
}

// ---------------------------------------------------------------------------
// Test 4: lossy relay, every reliable send still resolves
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lossy_relay_resolves_every_reliable_message() {
    const N: usize = 50;

    let (sender, mut completions, receiver, emulator) = relayed(
        |c| SenderConfig {
            rto: Duration::from_millis(30),
            max_retries: 3,
            ..c
        },
        EmulatorConfig {
            loss: 0.3,
            base_delay: Duration::from_millis(2),
            jitter: Duration::from_millis(1),
            seed: Some(42),
            ..Default::default()
        },
    )
    .await;

    let mut seqs = Vec::new();
    for _ in 0..N {
        seqs.push(sender.send(Channel::Reliable, b"hello_R").await.unwrap().seq());
    }

    let done = collect(&mut completions, N).await;
    let delivered = done
        .iter()
        .filter(|c| matches!(c.outcome, ReliableOutcome::Delivered { .. }))
        .count();
    for c in &done {
        if let ReliableOutcome::Failed { retries } = c.outcome {
            assert_eq!(retries, 3);
        }
    }
    for seq in seqs {
        assert_ne!(sender.status(seq), ReliableStatus::Pending);
    }
    assert_eq!(sender.pending(), 0);

    let sent = sender.shutdown().await.unwrap();
    let received = receiver.shutdown().await.unwrap();
    let stats = emulator.shutdown().await.unwrap();

    assert!(stats.dropped > 0);
    assert!(sent.reliable.retransmissions > 0);
    assert_eq!(sent.reliable.failed as usize, N - delivered);
    // A Failed message may still have reached the receiver with every ACK lost.
    assert!(received.reliable.packets as usize >= delivered);
    let pdr = reconcile(&sent, &received).reliable.unwrap();
    assert!((0.0..=1.0).contains(&pdr));
}

// ---------------------------------------------------------------------------
// Test 5: black-hole relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_total_loss_fails_reliable_and_never_resends_unreliable() {
    let (sender, mut completions, receiver, emulator) = relayed(
        |c| SenderConfig {
            rto: Duration::from_millis(20),
            max_retries: 2,
            ..c
        },
        EmulatorConfig {
            loss: 1.0,
            ..Default::default()
        },
    )
    .await;

    for _ in 0..10 {
        sender.send(Channel::Unreliable, b"hello_U").await.unwrap();
    }
    let seq = sender.send(Channel::Reliable, b"hello_R").await.unwrap().seq();

    let done = collect(&mut completions, 1).await;
    assert_eq!(done[0].seq, seq);
    assert_eq!(done[0].outcome, ReliableOutcome::Failed { retries: 2 });
    assert_eq!(sender.status(seq), ReliableStatus::Failed);

    let sent = sender.shutdown().await.unwrap();
    let received = receiver.shutdown().await.unwrap();
    emulator.shutdown().await.unwrap();

    assert_eq!(sent.unreliable.packets, 10);
    assert_eq!(sent.unreliable.retransmissions, 0);
    assert_eq!(sent.reliable.retransmissions, 2);
    assert_eq!(received.unreliable.packets, 0);

    let report = reconcile(&sent, &received);
    assert_eq!(report.unreliable, Some(0.0));
    assert_eq!(report.reliable, Some(0.0));
}

// ---------------------------------------------------------------------------
// Test 6: ordered reliable delivery over real sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ordered_receiver_releases_reliable_in_sequence() {
    let config = ReceiverConfig {
        ordered_reliable: true,
        gap_timeout: Duration::from_millis(200),
        ..ReceiverConfig::default()
    };
    let mut receiver = Receiver::start(ephemeral().await, config).expect("receiver");
    let mut deliveries = receiver.poll().unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // 1 arrives before 0; 2 is never sent, so 3 waits out the gap timeout.
    for seq in [1u32, 0, 3] {
        let bytes = Packet::data(Channel::Reliable, seq, now_micros(), vec![seq as u8]).encode();
        peer.send_to(&bytes, receiver.local_addr()).await.unwrap();
    }

    let mut order = Vec::new();
    while order.len() < 3 {
        let d = timeout(WAIT, deliveries.next())
            .await
            .expect("timed out waiting for deliveries")
            .expect("delivery stream closed");
        order.push(d.seq);
    }
    assert_eq!(order, [0, 1, 3]);

    let snap = receiver.shutdown().await.unwrap();
    assert_eq!(snap.reliable.packets, 3);
    assert_eq!(snap.acks_sent, 3);
}
