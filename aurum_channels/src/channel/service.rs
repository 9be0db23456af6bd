use crate::channel::{ChannelNode, ChannelServer, LocalChannelServer, LOG_LEVEL};
use crate::core::{
  ChannelConfig, ChannelError, ChannelEventKind, ChannelId, ClusterMembership, Delivery,
  Directory, MembershipStatus, NodeId, RpcError, SessionId, SessionService, Socket, TaskScheduler,
  Timestamp, TransactionRunner,
};
use crate::info;
use crate::testkit::{Logger, LoggerRef};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// The services a [`ChannelService`] runs on top of.
#[derive(Clone)]
pub struct Collaborators {
  pub store: Arc<dyn TransactionRunner>,
  pub directory: Arc<dyn Directory>,
  pub sessions: Arc<dyn SessionService>,
  pub cluster: Arc<dyn ClusterMembership>,
  pub scheduler: Arc<dyn TaskScheduler>,
}

/// One node's channel subsystem. Application calls that change a channel run a transaction and
/// return once the event is queued. Delivery happens asynchronously, in channel order.
pub struct ChannelService {
  node: Arc<ChannelNode>,
  shutdown: Mutex<Option<oneshot::Sender<()>>>,
}
impl ChannelService {
  /// Binds the channel server, publishes it in the directory and starts answering peers. Must be
  /// called from within a tokio runtime.
  pub async fn start(
    config: ChannelConfig,
    collab: Collaborators,
  ) -> Result<ChannelService, ChannelError> {
    config.check()?;
    let local = collab.cluster.local_node_id();
    let logger = Logger::new(local, config.log_level).spawn();
    let bind = Socket::new(config.host.clone(), config.server_port);
    let addrs = bind.as_tcp_addr().await?;
    let listener = TcpListener::bind(&addrs[..]).await?;
    let endpoint = Socket::new(config.host.clone(), listener.local_addr()?.port());
    let node = Arc::new(ChannelNode::new(
      config,
      local,
      endpoint.clone(),
      logger.clone(),
      collab.store,
      collab.directory,
      collab.sessions,
      collab.cluster,
      collab.scheduler,
    ));
    node.directory.put(node.server_key(local), endpoint.clone());
    let (tx, rx) = oneshot::channel();
    let server: Arc<dyn ChannelServer> = Arc::new(LocalChannelServer::new(node.clone()));
    tokio::spawn(crate::channel::serve(
      listener,
      server,
      node.config.max_frame_bytes,
      logger.clone(),
      rx,
    ));
    info!(LOG_LEVEL, &logger, "channel server of node {} listening on {}", local, endpoint);
    Ok(ChannelService {
      node: node,
      shutdown: Mutex::new(Some(tx)),
    })
  }

  /// Creates a channel coordinated by this node.
  pub fn create_channel(
    &self,
    name: String,
    delivery: Delivery,
  ) -> Result<ChannelId, ChannelError> {
    self.node.create_channel(name, delivery)
  }

  pub fn channel_by_name(&self, name: &str) -> Result<Option<ChannelId>, ChannelError> {
    self.node.channel_by_name(name)
  }

  /// Queues a join, returning the event's timestamp.
  pub fn join(&self, channel: ChannelId, session: SessionId) -> Result<Timestamp, ChannelError> {
    self.node.enqueue_event(channel, |_| ChannelEventKind::Join(session))
  }

  pub fn leave(&self, channel: ChannelId, session: SessionId) -> Result<Timestamp, ChannelError> {
    self.node.enqueue_event(channel, |_| ChannelEventKind::Leave(session))
  }

  /// Queues a message. A message from a session is dropped unless the session is a member when
  /// the message's turn comes.
  pub fn send(
    &self,
    channel: ChannelId,
    sender: Option<SessionId>,
    message: Vec<u8>,
  ) -> Result<Timestamp, ChannelError> {
    self.node.enqueue_event(channel, |rec| ChannelEventKind::Send {
      sender: sender,
      sender_was_member: sender.map(|s| rec.is_member(s)).unwrap_or(true),
      message: message.clone(),
    })
  }

  pub fn close(&self, channel: ChannelId) -> Result<Timestamp, ChannelError> {
    self.node.enqueue_event(channel, |_| ChannelEventKind::Close)
  }

  /// Every member of the channel across the cluster.
  pub async fn channel_sessions(&self, channel: ChannelId) -> Result<Vec<SessionId>, ChannelError> {
    self.node.channel_sessions(channel).await
  }

  pub fn channel_messages(
    &self,
    channel: ChannelId,
    from: Timestamp,
    to: Timestamp,
  ) -> Result<BTreeMap<Timestamp, Vec<u8>>, ChannelError> {
    self.node.channel_messages(channel, from, to)
  }

  pub fn current_message_timestamp(&self, channel: ChannelId) -> Result<Timestamp, ChannelError> {
    self.node.current_message_timestamp(channel)
  }

  /// The session's membership of the channel as this node sees it.
  pub async fn local_membership(
    &self,
    channel: ChannelId,
    session: SessionId,
  ) -> MembershipStatus {
    LocalChannelServer::new(self.node.clone())
      .is_member(channel, session)
      .await
      .unwrap_or(MembershipStatus::Unknown)
  }

  /// The members of the channel connected to this node.
  pub async fn local_members(&self, channel: ChannelId) -> Vec<SessionId> {
    self.node.membership.members(channel).await
  }

  /// The channels the session is a member of on this node.
  pub fn session_channels(&self, session: SessionId) -> Vec<ChannelId> {
    self.node.membership.session_snapshot(session).into_iter().map(|m| m.channel).collect()
  }

  /// Starts moving the session's memberships to `new_node`. The receiver completes once they
  /// are there, and reports cancellation if the move was given up and the session disconnected.
  pub fn prepare_to_relocate(&self, session: SessionId, new_node: NodeId) -> oneshot::Receiver<()> {
    self.node.prepare_to_relocate(session, new_node)
  }

  /// The session, relocated here, is now connected.
  pub async fn relocated(&self, session: SessionId) {
    self.node.relocated(session).await
  }

  pub async fn disconnected(&self, session: SessionId) {
    self.node.disconnected(session).await
  }

  /// Called on every surviving node when `node` fails.
  pub fn node_failed(&self, node: NodeId) {
    self.node.node_failed(node)
  }

  /// Called on the node elected to recover `node`.
  pub fn recover(&self, node: NodeId) {
    self.node.recover(node)
  }

  /// Moves every channel coordinated by `node` elsewhere right away, returning the moves.
  pub fn reassign_coordinators(
    &self,
    node: NodeId,
  ) -> Result<Vec<(ChannelId, NodeId)>, ChannelError> {
    self.node.reassign_coordinators(node)
  }

  pub fn server_for(&self, node: NodeId) -> Result<Arc<dyn ChannelServer>, RpcError> {
    self.node.server_for(node)
  }

  pub fn local_node(&self) -> NodeId {
    self.node.local
  }

  pub fn endpoint(&self) -> &Socket {
    &self.node.endpoint
  }

  pub fn logger(&self) -> &LoggerRef {
    &self.node.logger
  }

  pub fn config(&self) -> &ChannelConfig {
    &self.node.config
  }

  /// How many coordinator and notification queues this node holds.
  pub fn queue_counts(&self) -> (usize, usize) {
    self.node.queues.len()
  }

  /// Stops answering peers and drops every registry. Idempotent.
  pub fn shutdown(&self) {
    if let Some(tx) = self.shutdown.lock().unwrap().take() {
      let _ = tx.send(());
      info!(LOG_LEVEL, &self.node.logger, "node {} shutting down", self.node.local);
    }
    self.node.clear_servers();
    self.node.queues.clear();
    self.node.snapshots.clear();
    self.node.relocations.clear();
  }
}
impl Drop for ChannelService {
  fn drop(&mut self) {
    self.shutdown();
  }
}
