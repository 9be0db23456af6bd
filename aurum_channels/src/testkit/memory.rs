//! In-process stand-ins for the collaborators a [`ChannelService`](crate::channel::ChannelService)
//! needs, so whole clusters can run inside one test.

use crate::core::{
  ChannelError, ChannelId, ClusterMembership, Delivery, Directory, NodeId, SessionId,
  SessionProtocol, SessionService, Socket,
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// A multi-threaded runtime with one worker per core, I/O and timers enabled.
pub fn runtime() -> Runtime {
  Builder::new_multi_thread()
    .worker_threads(num_cpus::get().max(2))
    .enable_all()
    .build()
    .unwrap_or_else(|e| panic!("could not build runtime: {}", e))
}

#[derive(Default)]
pub struct MemoryDirectory {
  bindings: RwLock<HashMap<String, Socket>>,
}
impl MemoryDirectory {
  pub fn new() -> MemoryDirectory {
    Self::default()
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys = self.bindings.read().unwrap().keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
  }
}
impl Directory for MemoryDirectory {
  fn put(&self, key: String, endpoint: Socket) {
    self.bindings.write().unwrap().insert(key, endpoint);
  }

  fn get(&self, key: &str) -> Option<Socket> {
    self.bindings.read().unwrap().get(key).cloned()
  }

  fn remove_if_present(&self, key: &str) -> Option<Socket> {
    self.bindings.write().unwrap().remove(key)
  }
}

/// Which nodes are up. Tests fail nodes by hand instead of running a failure detector.
#[derive(Default)]
pub struct MemoryCluster {
  alive: RwLock<BTreeSet<NodeId>>,
}
impl MemoryCluster {
  pub fn new() -> Arc<MemoryCluster> {
    Arc::new(Self::default())
  }

  pub fn add_node(&self, node: NodeId) {
    self.alive.write().unwrap().insert(node);
  }

  pub fn fail(&self, node: NodeId) {
    self.alive.write().unwrap().remove(&node);
  }

  /// The cluster as seen from `local`.
  pub fn view(self: &Arc<Self>, local: NodeId) -> Arc<ClusterView> {
    self.add_node(local);
    Arc::new(ClusterView {
      cluster: self.clone(),
      local: local,
    })
  }
}

pub struct ClusterView {
  cluster: Arc<MemoryCluster>,
  local: NodeId,
}
impl ClusterMembership for ClusterView {
  fn local_node_id(&self) -> NodeId {
    self.local
  }

  fn is_alive(&self, node: NodeId) -> bool {
    self.cluster.alive.read().unwrap().contains(&node)
  }

  fn live_nodes(&self) -> Vec<NodeId> {
    self.cluster.alive.read().unwrap().iter().cloned().collect()
  }
}

/// What a client saw through its [`RecordingProtocol`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolEvent {
  Joined(String, ChannelId, Delivery),
  Left(ChannelId),
  Message(ChannelId, Vec<u8>, Delivery),
}

/// A session protocol that records everything sent to its client.
pub struct RecordingProtocol {
  session: SessionId,
  failing: AtomicBool,
  slow: Mutex<Option<(Vec<u8>, Duration)>>,
  tx: Sender<ProtocolEvent>,
  rx: Receiver<ProtocolEvent>,
  log: Mutex<Vec<ProtocolEvent>>,
}
impl RecordingProtocol {
  pub fn new(session: SessionId) -> Arc<RecordingProtocol> {
    let (tx, rx) = unbounded();
    Arc::new(RecordingProtocol {
      session: session,
      failing: AtomicBool::new(false),
      slow: Mutex::new(None),
      tx: tx,
      rx: rx,
      log: Mutex::new(Vec::new()),
    })
  }

  pub fn session(&self) -> SessionId {
    self.session
  }

  /// Makes every later call fail, as if the connection broke.
  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  /// Makes delivering `message` take `delay`, like a client with a congested connection.
  pub fn set_slow_message(&self, message: Vec<u8>, delay: Duration) {
    *self.slow.lock().unwrap() = Some((message, delay));
  }

  /// Waits for the next event not yet taken by a previous call.
  pub fn next_event(&self, timeout: Duration) -> Option<ProtocolEvent> {
    self.rx.recv_timeout(timeout).ok()
  }

  /// Every event so far, in order, whether taken by [`next_event`](Self::next_event) or not.
  pub fn events(&self) -> Vec<ProtocolEvent> {
    self.log.lock().unwrap().clone()
  }

  /// The payloads of every message so far on `channel`.
  pub fn messages(&self, channel: ChannelId) -> Vec<Vec<u8>> {
    self
      .events()
      .into_iter()
      .filter_map(|e| match e {
        ProtocolEvent::Message(ch, msg, _) if ch == channel => Some(msg),
        _ => None,
      })
      .collect()
  }

  fn record(&self, event: ProtocolEvent) -> Result<(), ChannelError> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(ChannelError::Protocol(format!("session {} is broken", self.session)));
    }
    self.log.lock().unwrap().push(event.clone());
    let _ = self.tx.send(event);
    Ok(())
  }
}
impl SessionProtocol for RecordingProtocol {
  fn channel_join(
    &self,
    name: &str,
    channel: ChannelId,
    delivery: Delivery,
  ) -> Result<(), ChannelError> {
    self.record(ProtocolEvent::Joined(name.to_string(), channel, delivery))
  }

  fn channel_leave(&self, channel: ChannelId) -> Result<(), ChannelError> {
    self.record(ProtocolEvent::Left(channel))
  }

  fn channel_message(
    &self,
    channel: ChannelId,
    message: &[u8],
    delivery: Delivery,
  ) -> Result<(), ChannelError> {
    let delay = match &*self.slow.lock().unwrap() {
      Some((slow, delay)) if &slow[..] == message => Some(*delay),
      _ => None,
    };
    if let Some(delay) = delay {
      std::thread::sleep(delay);
    }
    self.record(ProtocolEvent::Message(channel, message.to_vec(), delivery))
  }
}

#[derive(Default)]
struct SessionTable {
  assignments: HashMap<SessionId, NodeId>,
  connections: HashMap<(NodeId, SessionId), Arc<RecordingProtocol>>,
  relocating: HashMap<SessionId, NodeId>,
  disconnected: HashSet<SessionId>,
}

/// Where every client session of an in-process cluster is connected.
#[derive(Default)]
pub struct MemorySessions {
  table: RwLock<SessionTable>,
}
impl MemorySessions {
  pub fn new() -> Arc<MemorySessions> {
    Arc::new(Self::default())
  }

  /// The sessions as seen from `local`.
  pub fn view(self: &Arc<Self>, local: NodeId) -> Arc<NodeSessions> {
    Arc::new(NodeSessions {
      sessions: self.clone(),
      local: local,
    })
  }

  /// Connects a new session to `node`.
  pub fn connect(&self, session: SessionId, node: NodeId) -> Arc<RecordingProtocol> {
    let protocol = RecordingProtocol::new(session);
    let mut table = self.table.write().unwrap();
    table.assignments.insert(session, node);
    table.connections.insert((node, session), protocol.clone());
    table.disconnected.remove(&session);
    protocol
  }

  /// Announces that `session` is moving to `to`. Until [`arrive`](Self::arrive), `to` knows
  /// the session is coming but it is connected nowhere.
  pub fn depart(&self, session: SessionId, to: NodeId) {
    let mut table = self.table.write().unwrap();
    if let Some(from) = table.assignments.insert(session, to) {
      table.connections.remove(&(from, session));
    }
    table.relocating.insert(session, to);
  }

  /// Finishes a move started with [`depart`](Self::depart).
  pub fn arrive(&self, session: SessionId) -> Option<Arc<RecordingProtocol>> {
    let mut table = self.table.write().unwrap();
    let to = table.relocating.remove(&session)?;
    let protocol = RecordingProtocol::new(session);
    table.connections.insert((to, session), protocol.clone());
    Some(protocol)
  }

  /// Drops a session entirely.
  pub fn drop_session(&self, session: SessionId) {
    let mut table = self.table.write().unwrap();
    if let Some(node) = table.assignments.remove(&session) {
      table.connections.remove(&(node, session));
    }
    table.relocating.remove(&session);
  }

  /// Whether a channel service forcibly disconnected the session.
  pub fn was_disconnected(&self, session: SessionId) -> bool {
    self.table.read().unwrap().disconnected.contains(&session)
  }
}

pub struct NodeSessions {
  sessions: Arc<MemorySessions>,
  local: NodeId,
}
impl SessionService for NodeSessions {
  fn is_connected(&self, session: SessionId) -> bool {
    let table = self.sessions.table.read().unwrap();
    table.connections.contains_key(&(self.local, session))
  }

  fn is_relocating_to_local_node(&self, session: SessionId) -> bool {
    let table = self.sessions.table.read().unwrap();
    table.relocating.get(&session) == Some(&self.local)
  }

  fn session_protocol(&self, session: SessionId) -> Option<Arc<dyn SessionProtocol>> {
    let table = self.sessions.table.read().unwrap();
    let protocol = table.connections.get(&(self.local, session))?.clone();
    Some(protocol)
  }

  fn session_node(&self, session: SessionId) -> Option<NodeId> {
    self.sessions.table.read().unwrap().assignments.get(&session).cloned()
  }

  fn disconnect(&self, session: SessionId) {
    let mut table = self.sessions.table.write().unwrap();
    table.connections.remove(&(self.local, session));
    if table.relocating.get(&session) == Some(&self.local) {
      table.relocating.remove(&session);
    }
    if table.assignments.get(&session) == Some(&self.local) {
      table.assignments.remove(&session);
    }
    table.disconnected.insert(session);
  }
}

#[test]
fn test_session_moves() {
  let sessions = MemorySessions::new();
  let (a, b) = (sessions.view(NodeId(1)), sessions.view(NodeId(2)));
  let s = SessionId(7);
  sessions.connect(s, NodeId(1));
  assert!(a.is_connected(s));
  assert!(!b.is_relocating_to_local_node(s));
  sessions.depart(s, NodeId(2));
  assert!(!a.is_connected(s));
  assert!(b.is_relocating_to_local_node(s));
  assert!(!b.is_connected(s));
  assert_eq!(b.session_node(s), Some(NodeId(2)));
  let protocol = sessions.arrive(s).unwrap();
  assert!(b.is_connected(s));
  assert!(!b.is_relocating_to_local_node(s));
  protocol.channel_leave(ChannelId(1)).unwrap();
  assert_eq!(protocol.events(), vec![ProtocolEvent::Left(ChannelId(1))]);
  b.disconnect(s);
  assert!(sessions.was_disconnected(s));
  assert_eq!(a.session_node(s), None);
}
