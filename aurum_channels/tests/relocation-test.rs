use aurum_channels::core::{
  ChannelConfig, ChannelId, Delivery, MembershipStatus, NodeId, SessionId,
};
use aurum_channels::testkit::{runtime, ProtocolEvent, RecordingProtocol, TestCluster};
use std::time::{Duration, Instant};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ChannelConfig {
  let mut config = ChannelConfig::default();
  config.session_relocation_timeout = Duration::from_millis(500);
  config.relocation_retries = 1;
  config
}

fn expect(protocol: &RecordingProtocol, expected: ProtocolEvent) {
  match protocol.next_event(TIMEOUT) {
    Some(event) => assert_eq!(event, expected, "session {}", protocol.session()),
    None => panic!("session {} never saw {:?}", protocol.session(), expected),
  }
}

// For events from different channels, which arrive in no particular order.
fn expect_all(protocol: &RecordingProtocol, expected: Vec<ProtocolEvent>) {
  let mut seen = Vec::new();
  while seen.len() < expected.len() {
    match protocol.next_event(TIMEOUT) {
      Some(event) => seen.push(event),
      None => panic!("session {} saw only {:?}", protocol.session(), seen),
    }
  }
  for event in expected.iter() {
    assert!(seen.contains(event), "session {} never saw {:?}", protocol.session(), event);
  }
}

#[test]
fn memberships_follow_the_session() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2), NodeId(3)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let on_2 = cluster.sessions.connect(a, NodeId(2));
  let b = cluster.sessions.connect(SessionId(2), NodeId(3));
  let coord = cluster.node(NodeId(1));
  let reliable = coord.create_channel("reliable".to_string(), Delivery::Reliable).unwrap();
  let unreliable = coord.create_channel("unreliable".to_string(), Delivery::Unreliable).unwrap();
  coord.join(reliable, a).unwrap();
  coord.join(unreliable, a).unwrap();
  coord.join(reliable, SessionId(2)).unwrap();
  coord.send(reliable, None, b"m1".to_vec()).unwrap();
  expect_all(
    &on_2,
    vec![
      ProtocolEvent::Joined("reliable".to_string(), reliable, Delivery::Reliable),
      ProtocolEvent::Joined("unreliable".to_string(), unreliable, Delivery::Unreliable),
      ProtocolEvent::Message(reliable, b"m1".to_vec(), Delivery::Reliable),
    ],
  );
  expect(&b, ProtocolEvent::Joined("reliable".to_string(), reliable, Delivery::Reliable));
  expect(&b, ProtocolEvent::Message(reliable, b"m1".to_vec(), Delivery::Reliable));

  let done = cluster.node(NodeId(2)).prepare_to_relocate(a, NodeId(3));
  cluster.sessions.depart(a, NodeId(3));
  // Sent mid-move: the old node refuses it, the new node catches the session up.
  coord.send(reliable, None, b"m2".to_vec()).unwrap();
  rt.block_on(async { timeout(TIMEOUT, done).await }).unwrap().unwrap();

  let old = cluster.node(NodeId(2));
  assert!(old.session_channels(a).is_empty());
  assert!(!rt.block_on(old.local_members(reliable)).contains(&a));
  assert!(!rt.block_on(old.local_members(unreliable)).contains(&a));

  let on_3 = cluster.sessions.arrive(a).unwrap();
  let new = cluster.node(NodeId(3));
  rt.block_on(new.relocated(a));
  assert_eq!(new.session_channels(a), vec![reliable, unreliable]);
  assert_eq!(rt.block_on(new.local_membership(reliable, a)), MembershipStatus::Member);
  assert_eq!(rt.block_on(new.local_membership(unreliable, a)), MembershipStatus::Member);

  coord.send(reliable, None, b"m3".to_vec()).unwrap();
  expect(&on_3, ProtocolEvent::Message(reliable, b"m2".to_vec(), Delivery::Reliable));
  expect(&on_3, ProtocolEvent::Message(reliable, b"m3".to_vec(), Delivery::Reliable));
  coord.send(unreliable, None, b"u1".to_vec()).unwrap();
  expect(&on_3, ProtocolEvent::Message(unreliable, b"u1".to_vec(), Delivery::Unreliable));
  expect(&b, ProtocolEvent::Message(reliable, b"m2".to_vec(), Delivery::Reliable));
  expect(&b, ProtocolEvent::Message(reliable, b"m3".to_vec(), Delivery::Reliable));
  assert_eq!(on_3.next_event(Duration::from_millis(300)), None);
  assert_eq!(on_2.messages(reliable), vec![b"m1".to_vec()]);
}

#[test]
fn buffered_leave_applies_before_send() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2), NodeId(3)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let on_2 = cluster.sessions.connect(a, NodeId(2));
  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("ordered".to_string(), Delivery::Reliable).unwrap();
  coord.join(ch, a).unwrap();
  expect(&on_2, ProtocolEvent::Joined("ordered".to_string(), ch, Delivery::Reliable));

  let done = cluster.node(NodeId(2)).prepare_to_relocate(a, NodeId(3));
  cluster.sessions.depart(a, NodeId(3));
  // Both carry timestamp 1 on the new node, and wait there until the session connects.
  coord.send(ch, None, b"m1".to_vec()).unwrap();
  coord.leave(ch, a).unwrap();
  rt.block_on(async { timeout(TIMEOUT, done).await }).unwrap().unwrap();
  // Give the re-routed leave time to reach the new node.
  std::thread::sleep(Duration::from_millis(300));

  let on_3 = cluster.sessions.arrive(a).unwrap();
  let new = cluster.node(NodeId(3));
  rt.block_on(new.relocated(a));
  expect(&on_3, ProtocolEvent::Left(ch));
  assert_eq!(on_3.next_event(Duration::from_millis(300)), None);
  assert!(on_2.messages(ch).is_empty());
  assert!(new.session_channels(a).is_empty());
}

#[test]
fn session_without_channels_moves_at_once() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let _p = cluster.sessions.connect(SessionId(4), NodeId(1));
  let done = cluster.node(NodeId(1)).prepare_to_relocate(SessionId(4), NodeId(2));
  assert_eq!(tokio_test::block_on(done), Ok(()));
}

#[test]
fn unreachable_target_disconnects_session() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let p = cluster.sessions.connect(a, NodeId(1));
  let node = cluster.node(NodeId(1));
  let ch = node.create_channel("stuck".to_string(), Delivery::Reliable).unwrap();
  node.join(ch, a).unwrap();
  expect(&p, ProtocolEvent::Joined("stuck".to_string(), ch, Delivery::Reliable));

  // Node 8 never published a channel server.
  let done = node.prepare_to_relocate(a, NodeId(8));
  let res = rt.block_on(async { timeout(TIMEOUT, done).await }).unwrap();
  assert!(res.is_err());
  assert!(cluster.sessions.was_disconnected(a));
  assert!(node.session_channels(a).is_empty());
}

// Node 2 buffers a join for a session on its way there. Once the session is connected, a leave
// for it waits for the buffered join instead of overtaking it.
#[test]
fn connected_session_waits_for_buffered_requests() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let _on_1 = cluster.sessions.connect(a, NodeId(1));
  cluster.sessions.depart(a, NodeId(2));
  let ch = ChannelId(30);
  let new = cluster.node(NodeId(2));
  let server = new.server_for(NodeId(2)).unwrap();
  assert!(rt.block_on(server.join("later".to_string(), ch, Delivery::Reliable, 5, a)).unwrap());

  let on_2 = cluster.sessions.arrive(a).unwrap();
  let leave = rt.spawn(async move { server.leave(ch, 6, a).await });
  assert_eq!(on_2.next_event(Duration::from_millis(200)), None);

  rt.block_on(new.relocated(a));
  expect(&on_2, ProtocolEvent::Joined("later".to_string(), ch, Delivery::Reliable));
  expect(&on_2, ProtocolEvent::Left(ch));
  assert!(rt.block_on(leave).unwrap().unwrap());
  assert!(new.session_channels(a).is_empty());
}

// Nobody drains the buffer: the leave gives up waiting after the relocation timeout and runs.
#[test]
fn undrained_buffer_times_out_and_request_proceeds() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = SessionId(1);
  let _on_1 = cluster.sessions.connect(a, NodeId(1));
  cluster.sessions.depart(a, NodeId(2));
  let ch = ChannelId(31);
  let server = cluster.node(NodeId(2)).server_for(NodeId(2)).unwrap();
  assert!(rt.block_on(server.join("stuck".to_string(), ch, Delivery::Reliable, 5, a)).unwrap());

  let on_2 = cluster.sessions.arrive(a).unwrap();
  let start = Instant::now();
  let leave = rt.spawn(async move { server.leave(ch, 6, a).await });
  assert_eq!(on_2.next_event(Duration::from_millis(300)), None);
  expect(&on_2, ProtocolEvent::Left(ch));
  assert!(start.elapsed() >= config().session_relocation_timeout);
  assert!(rt.block_on(leave).unwrap().unwrap());
  // The buffered join is still waiting for a drain that never came.
  assert_eq!(on_2.next_event(Duration::from_millis(100)), None);
}
