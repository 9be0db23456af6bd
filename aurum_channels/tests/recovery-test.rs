use aurum_channels::core::{
  transact, ChannelConfig, ChannelId, ChannelRecord, Delivery, NodeId, SessionId,
};
use aurum_channels::testkit::{runtime, ProtocolEvent, RecordingProtocol, TestCluster};
use maplit::btreeset;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ChannelConfig {
  let mut config = ChannelConfig::default();
  config.session_relocation_timeout = Duration::from_millis(500);
  config
}

fn expect(protocol: &RecordingProtocol, expected: ProtocolEvent) {
  match protocol.next_event(TIMEOUT) {
    Some(event) => assert_eq!(event, expected, "session {}", protocol.session()),
    None => panic!("session {} never saw {:?}", protocol.session(), expected),
  }
}

fn record(cluster: &TestCluster, channel: ChannelId) -> Option<ChannelRecord> {
  transact(&*cluster.store, Duration::from_secs(1), |txn| {
    Ok(txn.channel(channel).cloned())
  })
  .unwrap()
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
  let start = Instant::now();
  while !cond() {
    if start.elapsed() > TIMEOUT {
      panic!("timed out waiting for {}", what);
    }
    std::thread::sleep(Duration::from_millis(20));
  }
}

// Members A on node 1 and B on node 2, coordinated by node 4. Node 4 crashes after m1, the
// new coordinator retransmits m1, nobody sees it twice. A then moves to node 3 and gets m2
// there.
#[test]
fn retransmission_and_relocation_after_crash() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2), NodeId(3), NodeId(4)];
  let mut cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let on_1 = cluster.sessions.connect(a, NodeId(1));
  let b = cluster.sessions.connect(SessionId(2), NodeId(2));
  let ch = {
    let coord = cluster.node(NodeId(4));
    let ch = coord.create_channel("c".to_string(), Delivery::Reliable).unwrap();
    coord.join(ch, a).unwrap();
    coord.join(ch, SessionId(2)).unwrap();
    coord.send(ch, None, b"m1".to_vec()).unwrap();
    ch
  };
  for p in [&on_1, &b].iter() {
    expect(p, ProtocolEvent::Joined("c".to_string(), ch, Delivery::Reliable));
    expect(p, ProtocolEvent::Message(ch, b"m1".to_vec(), Delivery::Reliable));
  }

  cluster.crash(NodeId(4));
  for node in cluster.running() {
    cluster.node(node).node_failed(NodeId(4));
  }
  let moved = cluster.node(NodeId(2)).reassign_coordinators(NodeId(4)).unwrap();
  assert_eq!(moved.len(), 1);
  let (moved_ch, coordinator) = moved[0];
  assert_eq!(moved_ch, ch);
  assert!(coordinator == NodeId(1) || coordinator == NodeId(2));
  // Already moved: nothing left to do, wherever it runs.
  assert!(cluster.node(NodeId(3)).reassign_coordinators(NodeId(4)).unwrap().is_empty());
  cluster.node(NodeId(2)).recover(NodeId(4));
  assert!(cluster.directory.keys().iter().all(|k| !k.ends_with('4')));

  wait_for("retransmission", || record(&cluster, ch).map(|r| !r.retransmit).unwrap_or(false));
  let rec = record(&cluster, ch).unwrap();
  assert_eq!(rec.coordinator, coordinator);
  assert_eq!(rec.msg_timestamp, 1);
  assert_eq!(on_1.next_event(Duration::from_millis(300)), None);
  assert_eq!(b.next_event(Duration::from_millis(10)), None);

  let done = cluster.node(NodeId(1)).prepare_to_relocate(a, NodeId(3));
  cluster.sessions.depart(a, NodeId(3));
  rt.block_on(async { timeout(TIMEOUT, done).await }).unwrap().unwrap();
  let on_3 = cluster.sessions.arrive(a).unwrap();
  rt.block_on(cluster.node(NodeId(3)).relocated(a));
  assert!(cluster.node(NodeId(1)).session_channels(a).is_empty());

  cluster.node(NodeId(3)).send(ch, None, b"m2".to_vec()).unwrap();
  expect(&on_3, ProtocolEvent::Message(ch, b"m2".to_vec(), Delivery::Reliable));
  expect(&b, ProtocolEvent::Message(ch, b"m2".to_vec(), Delivery::Reliable));
  assert_eq!(on_1.messages(ch), vec![b"m1".to_vec()]);
  assert_eq!(on_3.next_event(Duration::from_millis(300)), None);
}

#[test]
fn survivors_forget_failed_node() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let mut cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(1));
  let d = cluster.sessions.connect(SessionId(2), NodeId(2));
  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("mixed".to_string(), Delivery::Reliable).unwrap();
  coord.join(ch, SessionId(1)).unwrap();
  coord.join(ch, SessionId(2)).unwrap();
  expect(&a, ProtocolEvent::Joined("mixed".to_string(), ch, Delivery::Reliable));
  expect(&d, ProtocolEvent::Joined("mixed".to_string(), ch, Delivery::Reliable));
  let servers = record(&cluster, ch).unwrap().servers.iter().cloned().collect::<BTreeSet<_>>();
  assert_eq!(servers, btreeset! {NodeId(1), NodeId(2)});

  cluster.crash(NodeId(2));
  cluster.node(NodeId(1)).node_failed(NodeId(2));
  wait_for("failed node removal", || {
    record(&cluster, ch).map(|r| !r.servers.contains(&NodeId(2))).unwrap_or(false)
  });
  let rec = record(&cluster, ch).unwrap();
  assert!(rec.is_member(SessionId(1)));
  assert!(!rec.is_member(SessionId(2)));
  let sessions = rt.block_on(cluster.node(NodeId(1)).channel_sessions(ch)).unwrap();
  assert_eq!(sessions, vec![SessionId(1)]);
  // Node 1 still coordinates, so recovering node 2 moves nothing.
  assert!(cluster.node(NodeId(1)).reassign_coordinators(NodeId(2)).unwrap().is_empty());
}
