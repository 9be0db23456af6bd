use aurum_channels::core::{
  ChannelConfig, ChannelId, Delivery, MembershipStatus, NodeId, RpcError, SessionId,
};
use aurum_channels::testkit::{runtime, ProtocolEvent, TestCluster};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

// Drives node 2's channel server from node 1 over the wire, the way a coordinator does.
#[test]
fn remote_server_deduplicates_by_timestamp() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let cluster = TestCluster::start(&rt, ChannelConfig::default(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(2));
  let ch = ChannelId(77);
  let server = cluster.node(NodeId(1)).server_for(NodeId(2)).unwrap();

  rt.block_on(async {
    let joined = server.join("news".to_string(), ch, Delivery::Reliable, 9, SessionId(1)).await;
    assert!(joined.unwrap());
    // Not connected anywhere and not on its way: refused.
    let stranger = server.join("news".to_string(), ch, Delivery::Reliable, 9, SessionId(5)).await;
    assert!(!stranger.unwrap());
    assert_eq!(server.is_member(ch, SessionId(1)).await.unwrap(), MembershipStatus::Member);
    let other = server.is_member(ChannelId(1), SessionId(1)).await.unwrap();
    assert_eq!(other, MembershipStatus::NonMember);
    assert_eq!(server.is_member(ch, SessionId(5)).await.unwrap(), MembershipStatus::Unknown);

    server.send(ch, b"m1".to_vec(), 10).await.unwrap();
    // Retransmitted after a coordinator crash.
    server.send(ch, b"m1".to_vec(), 10).await.unwrap();
    server.send(ch, b"stale".to_vec(), 8).await.unwrap();
    server.send(ch, b"m2".to_vec(), 11).await.unwrap();
    assert_eq!(server.get_sessions(ch).await.unwrap(), vec![SessionId(1)]);
  });

  assert_eq!(
    a.next_event(TIMEOUT),
    Some(ProtocolEvent::Joined("news".to_string(), ch, Delivery::Reliable))
  );
  for msg in [b"m1", b"m2"].iter() {
    let expected = ProtocolEvent::Message(ch, msg.to_vec(), Delivery::Reliable);
    assert_eq!(a.next_event(TIMEOUT), Some(expected));
  }
  assert_eq!(a.next_event(Duration::from_millis(200)), None);

  rt.block_on(async {
    assert!(server.leave(ch, 11, SessionId(1)).await.unwrap());
    assert_eq!(server.is_member(ch, SessionId(1)).await.unwrap(), MembershipStatus::NonMember);
    server.close(ch, 11).await.unwrap();
    assert!(server.get_sessions(ch).await.unwrap().is_empty());
  });
  assert_eq!(a.next_event(TIMEOUT), Some(ProtocolEvent::Left(ch)));

  let (sent, _) = rt.block_on(cluster.node(NodeId(1)).logger().traffic()).unwrap();
  assert!(sent > 0);
}

#[test]
fn unpublished_node_is_unreachable() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, ChannelConfig::default(), &nodes[..]).unwrap();
  let node = cluster.node(NodeId(1));
  assert!(matches!(node.server_for(NodeId(3)), Err(RpcError::NoServer)));
  assert_eq!(
    cluster.directory.keys(),
    vec![format!("{}{}", node.config().directory_prefix, 1)]
  );
}

#[test]
fn stopped_node_fails_calls() {
  let rt = runtime();
  let nodes = [NodeId(1), NodeId(2)];
  let mut cluster = TestCluster::start(&rt, ChannelConfig::default(), &nodes[..]).unwrap();
  let server = cluster.node(NodeId(1)).server_for(NodeId(2)).unwrap();
  assert!(rt.block_on(server.get_sessions(ChannelId(1))).unwrap().is_empty());
  cluster.crash(NodeId(2));
  let server = cluster.node(NodeId(1)).server_for(NodeId(2)).unwrap();
  let res = rt.block_on(async {
    // The listener may take a moment to go away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.get_sessions(ChannelId(1)).await
  });
  assert!(res.is_err());
}

// A member slow to take m11 must not let m12 overtake it, on any member.
#[test]
fn overlapping_sends_deliver_in_order() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, ChannelConfig::default(), &nodes[..]).unwrap();
  let s1 = cluster.sessions.connect(SessionId(1), NodeId(1));
  let s2 = cluster.sessions.connect(SessionId(2), NodeId(1));
  let ch = ChannelId(5);
  let server = cluster.node(NodeId(1)).server_for(NodeId(1)).unwrap();
  rt.block_on(async {
    for s in [SessionId(1), SessionId(2)].iter() {
      assert!(server.join("slow".to_string(), ch, Delivery::Reliable, 10, *s).await.unwrap());
    }
  });
  s1.set_slow_message(b"m11".to_vec(), Duration::from_millis(300));

  let first = server.clone();
  let m11 = rt.spawn(async move { first.send(ch, b"m11".to_vec(), 11).await });
  std::thread::sleep(Duration::from_millis(50));
  let second = server.clone();
  let m12 = rt.spawn(async move { second.send(ch, b"m12".to_vec(), 12).await });
  rt.block_on(m11).unwrap().unwrap();
  rt.block_on(m12).unwrap().unwrap();

  for p in [&s1, &s2].iter() {
    assert_eq!(p.messages(ch), vec![b"m11".to_vec(), b"m12".to_vec()], "session {}", p.session());
  }
}

// Nothing local for the channel: both are logged and ignored.
#[test]
fn send_and_close_without_local_channel_do_nothing() {
  let rt = runtime();
  let nodes = [NodeId(1)];
  let cluster = TestCluster::start(&rt, ChannelConfig::default(), &nodes[..]).unwrap();
  let a = cluster.sessions.connect(SessionId(1), NodeId(1));
  let server = cluster.node(NodeId(1)).server_for(NodeId(1)).unwrap();
  let ch = ChannelId(404);
  rt.block_on(async {
    server.send(ch, b"lost".to_vec(), 3).await.unwrap();
    server.close(ch, 3).await.unwrap();
    assert!(server.get_sessions(ch).await.unwrap().is_empty());
  });
  assert_eq!(a.next_event(Duration::from_millis(200)), None);
}
