use aurum_channels::core::{ChannelConfig, ChannelError, Delivery, NodeId, SessionId};
use aurum_channels::testkit::{runtime, ProtocolEvent, RecordingProtocol, TestCluster};
use maplit::btreeset;
use std::collections::BTreeSet;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn expect(protocol: &RecordingProtocol, expected: ProtocolEvent) {
  match protocol.next_event(TIMEOUT) {
    Some(event) => assert_eq!(event, expected, "session {}", protocol.session()),
    None => panic!("session {} never saw {:?}", protocol.session(), expected),
  }
}

fn config() -> ChannelConfig {
  let mut config = ChannelConfig::default();
  config.session_relocation_timeout = Duration::from_millis(500);
  config
}

#[test]
fn join_send_close() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(1));
  let b = cluster.sessions.connect(SessionId(2), NodeId(2));

  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("lobby".to_string(), Delivery::Reliable).unwrap();
  assert_eq!(coord.channel_by_name("lobby").unwrap(), Some(ch));
  assert!(matches!(
    coord.create_channel("lobby".to_string(), Delivery::Unreliable),
    Err(ChannelError::NameInUse(_))
  ));

  coord.join(ch, SessionId(1)).unwrap();
  // Joins may be queued on any node; the coordinator is asked to service them.
  cluster.node(NodeId(2)).join(ch, SessionId(2)).unwrap();
  expect(&a, ProtocolEvent::Joined("lobby".to_string(), ch, Delivery::Reliable));
  expect(&b, ProtocolEvent::Joined("lobby".to_string(), ch, Delivery::Reliable));

  let members = rt.block_on(coord.channel_sessions(ch)).unwrap();
  assert_eq!(members.into_iter().collect::<BTreeSet<_>>(), btreeset! {SessionId(1), SessionId(2)});

  coord.send(ch, None, b"one".to_vec()).unwrap();
  cluster.node(NodeId(2)).send(ch, Some(SessionId(2)), b"two".to_vec()).unwrap();
  for p in [&a, &b].iter() {
    expect(p, ProtocolEvent::Message(ch, b"one".to_vec(), Delivery::Reliable));
    expect(p, ProtocolEvent::Message(ch, b"two".to_vec(), Delivery::Reliable));
  }
  assert_eq!(coord.current_message_timestamp(ch).unwrap(), 2);
  let saved = coord.channel_messages(ch, 1, 2).unwrap();
  assert_eq!(saved.values().cloned().collect::<Vec<_>>(), vec![b"one".to_vec(), b"two".to_vec()]);

  coord.close(ch).unwrap();
  expect(&a, ProtocolEvent::Left(ch));
  expect(&b, ProtocolEvent::Left(ch));
  assert_eq!(coord.channel_by_name("lobby").unwrap(), None);
  assert_eq!(coord.current_message_timestamp(ch).unwrap(), 0);
  assert!(matches!(coord.send(ch, None, vec![]), Err(ChannelError::ChannelNotFound)));
  assert!(rt.block_on(cluster.node(NodeId(2)).local_members(ch)).is_empty());
}

#[test]
fn non_member_sender_dropped() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(2));
  let _outsider = cluster.sessions.connect(SessionId(9), NodeId(2));
  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("quiet".to_string(), Delivery::Reliable).unwrap();

  // Queued before the join, so the sender is not a member yet when its turn comes.
  coord.send(ch, Some(SessionId(1)), b"early".to_vec()).unwrap();
  coord.join(ch, SessionId(1)).unwrap();
  coord.send(ch, Some(SessionId(9)), b"outsider".to_vec()).unwrap();
  coord.send(ch, Some(SessionId(1)), b"member".to_vec()).unwrap();
  coord.leave(ch, SessionId(1)).unwrap();
  coord.send(ch, None, b"after".to_vec()).unwrap();

  expect(&a, ProtocolEvent::Joined("quiet".to_string(), ch, Delivery::Reliable));
  expect(&a, ProtocolEvent::Message(ch, b"member".to_vec(), Delivery::Reliable));
  expect(&a, ProtocolEvent::Left(ch));
  assert_eq!(a.next_event(Duration::from_millis(300)), None);
  assert_eq!(coord.current_message_timestamp(ch).unwrap(), 2);
}

#[test]
fn unreliable_channel_saves_nothing() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(1));
  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("chatter".to_string(), Delivery::Unreliable).unwrap();
  coord.join(ch, SessionId(1)).unwrap();
  coord.send(ch, None, b"hi".to_vec()).unwrap();
  expect(&a, ProtocolEvent::Joined("chatter".to_string(), ch, Delivery::Unreliable));
  expect(&a, ProtocolEvent::Message(ch, b"hi".to_vec(), Delivery::Unreliable));
  assert!(coord.channel_messages(ch, 0, 10).unwrap().is_empty());
  assert_eq!(rt.block_on(coord.channel_sessions(ch)).unwrap(), vec![SessionId(1)]);
}

#[test]
fn failing_protocol_does_not_stop_others() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, config(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(1));
  let b = cluster.sessions.connect(SessionId(2), NodeId(1));
  let coord = cluster.node(NodeId(1));
  let ch = coord.create_channel("mixed".to_string(), Delivery::Reliable).unwrap();
  coord.join(ch, SessionId(1)).unwrap();
  coord.join(ch, SessionId(2)).unwrap();
  expect(&a, ProtocolEvent::Joined("mixed".to_string(), ch, Delivery::Reliable));
  expect(&b, ProtocolEvent::Joined("mixed".to_string(), ch, Delivery::Reliable));
  a.set_failing(true);
  coord.send(ch, None, b"x".to_vec()).unwrap();
  expect(&b, ProtocolEvent::Message(ch, b"x".to_vec(), Delivery::Reliable));
  assert!(a.messages(ch).is_empty());
}
