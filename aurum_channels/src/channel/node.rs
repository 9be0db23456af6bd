use crate::channel::{
  ChannelQueues, ChannelServer, EventCache, LocalChannelServer, LocalMembershipTable,
  MembershipSnapshots, PendingRelocationQueue, RelocationTable, RemoteChannelServer, LOG_LEVEL,
};
use crate::core::{
  ChannelConfig, ClusterMembership, Directory, NodeId, RpcError, SessionService, Socket,
  TaskScheduler, TransactionRunner,
};
use crate::debug;
use crate::testkit::LoggerRef;
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

/// Everything one node's channel subsystem owns. Created at startup, torn down at shutdown, and
/// shared by the RPC server, the task queues and the public service handle.
pub(crate) struct ChannelNode {
  pub config: ChannelConfig,
  pub local: NodeId,
  pub endpoint: Socket,
  pub logger: LoggerRef,
  pub store: Arc<dyn TransactionRunner>,
  pub directory: Arc<dyn Directory>,
  pub sessions: Arc<dyn SessionService>,
  pub cluster: Arc<dyn ClusterMembership>,
  pub scheduler: Arc<dyn TaskScheduler>,
  pub membership: LocalMembershipTable,
  pub event_cache: EventCache,
  pub pending: PendingRelocationQueue,
  pub relocations: RelocationTable,
  pub queues: ChannelQueues,
  pub snapshots: MembershipSnapshots,
  servers: RwLock<HashMap<NodeId, Arc<RemoteChannelServer>>>,
}
impl ChannelNode {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    config: ChannelConfig,
    local: NodeId,
    endpoint: Socket,
    logger: LoggerRef,
    store: Arc<dyn TransactionRunner>,
    directory: Arc<dyn Directory>,
    sessions: Arc<dyn SessionService>,
    cluster: Arc<dyn ClusterMembership>,
    scheduler: Arc<dyn TaskScheduler>,
  ) -> ChannelNode {
    ChannelNode {
      snapshots: MembershipSnapshots::new(config.membership_cache_ttl),
      config: config,
      local: local,
      endpoint: endpoint,
      logger: logger,
      store: store,
      directory: directory,
      sessions: sessions,
      cluster: cluster,
      scheduler: scheduler,
      membership: LocalMembershipTable::new(),
      event_cache: EventCache::new(),
      pending: PendingRelocationQueue::new(),
      relocations: RelocationTable::new(),
      queues: ChannelQueues::new(),
      servers: RwLock::new(HashMap::new()),
    }
  }

  /// The directory key `node`'s channel server is published under.
  pub fn server_key(&self, node: NodeId) -> String {
    format!("{}{}", self.config.directory_prefix, node)
  }

  /// The channel server of `node`: this node's own implementation, a cached proxy, or a new
  /// proxy to the endpoint published in the directory.
  pub fn server_for(self: &Arc<Self>, node: NodeId) -> Result<Arc<dyn ChannelServer>, RpcError> {
    if node == self.local {
      return Ok(Arc::new(LocalChannelServer::new(self.clone())));
    }
    if let Some(server) = self.servers.read().unwrap().get(&node) {
      return Ok(server.clone());
    }
    let endpoint = self.directory.get(&self.server_key(node)).ok_or(RpcError::NoServer)?;
    debug!(LOG_LEVEL, &self.logger, "resolved channel server of node {} at {}", node, endpoint);
    let server = Arc::new(RemoteChannelServer::new(
      node,
      endpoint,
      self.config.rpc_timeout,
      self.config.max_frame_bytes,
      self.logger.clone(),
    ));
    let mut servers = self.servers.write().unwrap();
    Ok(servers.entry(node).or_insert(server).clone())
  }

  pub fn forget_server(&self, node: NodeId) {
    self.servers.write().unwrap().remove(&node);
  }

  pub fn clear_servers(&self) {
    self.servers.write().unwrap().clear();
  }
}
