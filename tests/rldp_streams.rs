//! Reliable stream behaviour over the in-memory backend, with loss,
//! reordering and corruption injected through the link filter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ridgenet::{
    Frame, FrameKind, Identity, Keypair, LinkVerdict, MemoryNetwork, MemoryNode, NetError,
    NetworkNode, NodeConfig, OpContext, RldpConfig, RldpManager, RldpStream, StreamPhase,
};

struct Peer {
    node: Arc<dyn NetworkNode>,
    rldp: RldpManager,
}

fn fast_config() -> RldpConfig {
    RldpConfig {
        max_frame_payload: 256,
        send_window: 4096,
        initial_rto: Duration::from_millis(40),
        max_rto: Duration::from_millis(200),
        max_retries: 6,
        gap_fill_timeout: Duration::from_millis(20),
        close_grace: Duration::from_secs(1),
        open_retry_interval: Duration::from_millis(50),
        ..RldpConfig::default()
    }
}

async fn peer(network: &MemoryNetwork, config: RldpConfig) -> Peer {
    let node: Arc<dyn NetworkNode> = Arc::new(MemoryNode::new(
        network,
        &Keypair::generate(),
        &NodeConfig::default(),
    ));
    node.start(&OpContext::background()).await.unwrap();
    let rldp = RldpManager::new(node.clone(), config).unwrap();
    rldp.start(&OpContext::background()).await.unwrap();
    Peer { node, rldp }
}

async fn connect(a: &Peer, b: &Peer) -> (RldpStream, RldpStream) {
    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let b_id = b.node.peer_id();
    let (opened, accepted) = tokio::join!(
        a.rldp.open(&ctx, &b_id),
        b.rldp.accept(&ctx)
    );
    (opened.unwrap(), accepted.unwrap())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn data_seq(payload: &[u8]) -> Option<u64> {
    Frame::decode(payload)
        .ok()
        .filter(|f| f.kind == FrameKind::Data)
        .map(|f| f.seq)
}

/// Apply `verdict` once to the first DATA frame from `sender` with `seq`.
fn once_on_data(
    network: &MemoryNetwork,
    sender: Identity,
    seq: u64,
    verdict: LinkVerdict,
) -> Arc<AtomicBool> {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    network.set_link_filter(move |from, _, payload| {
        if *from == sender && data_seq(payload) == Some(seq) && !flag.swap(true, Ordering::SeqCst) {
            verdict
        } else {
            LinkVerdict::Deliver
        }
    });
    fired
}

async fn read_exact(stream: &RldpStream, len: usize) -> Vec<u8> {
    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    while out.len() < len {
        let n = stream.read(&ctx, &mut buf).await.unwrap();
        assert!(n > 0, "unexpected end of stream");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[tokio::test]
async fn bytes_arrive_in_order_and_close_is_seen_as_eof() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (writer, reader) = connect(&a, &b).await;
    assert!(writer.is_initiator());
    assert!(!reader.is_initiator());
    assert_eq!(reader.peer().peer_id, a.node.peer_id());

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let payload = pattern(10_000);
    writer.write(&ctx, &payload[..3_000]).await.unwrap();
    writer.write(&ctx, &payload[3_000..]).await.unwrap();
    writer.close(&ctx).await.unwrap();
    assert_eq!(writer.phase(), StreamPhase::Closed);

    assert_eq!(reader.read_to_end(&ctx).await.unwrap(), payload);
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&ctx, &mut buf).await.unwrap(), 0);
    assert!(matches!(
        reader.write(&ctx, b"late").await,
        Err(NetError::StreamClosed)
    ));

    let stats = writer.stats();
    assert_eq!(stats.bytes_sent, 10_000);
    assert!(stats.frames_sent >= 40);
    assert_eq!(reader.stats().bytes_received, 10_000);
}

#[tokio::test]
async fn close_is_idempotent_and_blocks_further_use() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (stream, _remote) = connect(&a, &b).await;

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    stream.close(&ctx).await.unwrap();
    stream.close(&ctx).await.unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(stream.write(&ctx, b"x").await, Err(NetError::StreamClosed)));
    assert!(matches!(stream.read(&ctx, &mut buf).await, Err(NetError::StreamClosed)));
}

#[tokio::test]
async fn dropped_frame_is_retransmitted() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (writer, reader) = connect(&a, &b).await;
    let dropped = once_on_data(&network, a.node.peer_id(), 2, LinkVerdict::Drop);

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let payload = pattern(4 * 256);
    writer.write(&ctx, &payload).await.unwrap();
    assert_eq!(read_exact(&reader, payload.len()).await, payload);
    writer.flush(&ctx).await.unwrap();

    assert!(dropped.load(Ordering::SeqCst));
    assert!(writer.stats().retransmissions >= 1);
}

#[tokio::test]
async fn reordered_frames_are_delivered_in_sequence() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (writer, reader) = connect(&a, &b).await;
    once_on_data(
        &network,
        a.node.peer_id(),
        1,
        LinkVerdict::Delay(Duration::from_millis(60)),
    );

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let payload = pattern(3 * 256);
    writer.write(&ctx, &payload).await.unwrap();
    assert_eq!(read_exact(&reader, payload.len()).await, payload);

    // The late original shows up after the gap was already filled.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(reader.stats().duplicates >= 1);
}

#[tokio::test]
async fn corrupt_frames_are_discarded_and_recovered() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (writer, reader) = connect(&a, &b).await;
    once_on_data(&network, a.node.peer_id(), 1, LinkVerdict::Corrupt);

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let payload = pattern(2 * 256);
    writer.write(&ctx, &payload).await.unwrap();
    assert_eq!(read_exact(&reader, payload.len()).await, payload);

    assert_eq!(reader.stats().corrupt_frames, 1);
    assert!(b.rldp.stats().await.corrupt_frames >= 1);
}

#[tokio::test]
async fn streams_are_multiplexed_independently() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (w1, r1) = connect(&a, &b).await;
    let (w2, r2) = connect(&a, &b).await;
    assert_ne!(w1.id(), w2.id());

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let first = vec![1u8; 1500];
    let second = vec![2u8; 700];
    let (x, y) = tokio::join!(w1.write(&ctx, &first), w2.write(&ctx, &second));
    x.unwrap();
    y.unwrap();

    // Streams accepted in the order they were opened.
    assert_eq!(r1.id(), w1.id());
    assert_eq!(read_exact(&r2, second.len()).await, second);
    assert_eq!(read_exact(&r1, first.len()).await, first);
    assert_eq!(a.rldp.stats().await.streams, 2);
}

#[tokio::test]
async fn writer_stalls_while_the_reader_does_not_read() {
    let network = MemoryNetwork::new();
    let config = RldpConfig {
        recv_window: 8,
        ..fast_config()
    };
    let limit = config.recv_buffer_limit();
    let (window, frame) = (config.send_window, config.max_frame_payload);
    let a = peer(&network, config.clone()).await;
    let b = peer(&network, config).await;
    let (writer, reader) = connect(&a, &b).await;

    let payload = pattern(64 * 1024);
    let stalled = OpContext::with_timeout(Duration::from_millis(500));
    assert!(matches!(
        writer.write(&stalled, &payload).await,
        Err(NetError::Timeout)
    ));
    let queued = writer.stats().bytes_sent as usize;
    assert!(queued <= limit + window + frame, "queued {queued}");
    assert!(reader.stats().bytes_received as usize <= limit + frame);
    assert_eq!(writer.phase(), StreamPhase::Established);

    // Reading drains the buffer and the writer resumes.
    let ctx = OpContext::with_timeout(Duration::from_secs(10));
    let (written, received) = tokio::join!(
        writer.write(&ctx, &payload[queued..]),
        read_exact(&reader, payload.len())
    );
    written.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn exhausted_retries_abort_the_stream() {
    let network = MemoryNetwork::new();
    let config = RldpConfig {
        initial_rto: Duration::from_millis(20),
        max_rto: Duration::from_millis(40),
        max_retries: 3,
        ..fast_config()
    };
    let a = peer(&network, config.clone()).await;
    let b = peer(&network, config).await;
    let (writer, _reader) = connect(&a, &b).await;

    let sender = a.node.peer_id();
    network.set_link_filter(move |from, _, _| {
        if *from == sender {
            LinkVerdict::Drop
        } else {
            LinkVerdict::Deliver
        }
    });

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    writer.write(&ctx, b"never acknowledged").await.unwrap();
    assert!(matches!(writer.flush(&ctx).await, Err(NetError::StreamBroken)));
    assert_eq!(writer.phase(), StreamPhase::Aborted);

    let mut buf = [0u8; 8];
    assert!(matches!(writer.read(&ctx, &mut buf).await, Err(NetError::StreamBroken)));
    assert!(matches!(writer.write(&ctx, b"x").await, Err(NetError::StreamBroken)));
    assert_eq!(writer.stats().retransmissions, 3);
}

#[tokio::test]
async fn open_times_out_without_a_listener() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    // Started node without a stream manager.
    let silent = MemoryNode::new(&network, &Keypair::generate(), &NodeConfig::default());
    silent.start(&OpContext::background()).await.unwrap();

    let ctx = OpContext::with_timeout(Duration::from_millis(300));
    assert!(matches!(
        a.rldp.open_addr(&ctx, silent.addr()).await,
        Err(NetError::OpenTimeout)
    ));

    let unknown = Keypair::generate().identity();
    assert!(matches!(
        a.rldp.open(&OpContext::background(), &unknown).await,
        Err(NetError::PeerNotFound(_))
    ));
    assert_eq!(a.rldp.stats().await.streams, 0);
}

#[tokio::test]
async fn full_backlog_refuses_new_streams() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(
        &network,
        RldpConfig {
            accept_backlog: 1,
            ..fast_config()
        },
    )
    .await;

    let first = {
        let rldp = a.rldp.clone();
        let target = b.node.peer_id();
        tokio::spawn(async move {
            rldp.open(&OpContext::with_timeout(Duration::from_secs(5)), &target)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctx = OpContext::with_timeout(Duration::from_secs(2));
    assert!(matches!(
        a.rldp.open(&ctx, &b.node.peer_id()).await,
        Err(NetError::StreamBroken)
    ));

    let accepted = b.rldp.accept(&ctx).await.unwrap();
    let opened = first.await.unwrap().unwrap();
    assert_eq!(accepted.id(), opened.id());
}

#[tokio::test]
async fn manager_close_resets_peer_streams() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (local, remote) = connect(&a, &b).await;

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    a.rldp.close(&ctx).await.unwrap();
    a.rldp.close(&ctx).await.unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(local.read(&ctx, &mut buf).await, Err(NetError::StreamClosed)));
    assert!(matches!(remote.read(&ctx, &mut buf).await, Err(NetError::StreamBroken)));
    assert!(matches!(
        a.rldp.open(&ctx, &b.node.peer_id()).await,
        Err(NetError::Closed)
    ));
}

#[tokio::test]
async fn node_close_ends_streams_and_accept() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let b = peer(&network, fast_config()).await;
    let (local, _remote) = connect(&a, &b).await;

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        local
            .read(&OpContext::with_timeout(Duration::from_secs(5)), &mut buf)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.node.close(&ctx).await.unwrap();

    assert!(matches!(reader.await.unwrap(), Err(NetError::StreamClosed)));
    assert!(matches!(a.rldp.accept(&ctx).await, Err(NetError::Closed)));
    assert_eq!(a.node.telemetry().await.background_tasks, 0);
}

#[tokio::test]
async fn datagram_queue_has_a_single_consumer() {
    let network = MemoryNetwork::new();
    let a = peer(&network, fast_config()).await;
    let second = RldpManager::new(a.node.clone(), fast_config()).unwrap();
    assert!(matches!(
        second.start(&OpContext::background()).await,
        Err(NetError::AlreadyExists(_))
    ));
    assert!(RldpManager::new(
        a.node.clone(),
        RldpConfig {
            send_window: 10,
            ..fast_config()
        }
    )
    .is_err());
}
