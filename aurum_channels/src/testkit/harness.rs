use crate::channel::{ChannelService, Collaborators};
use crate::core::{ChannelConfig, ChannelError, MemoryStore, NodeId, TokioScheduler};
use crate::testkit::{MemoryCluster, MemoryDirectory, MemorySessions};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// A whole cluster of channel services on one runtime, sharing one store, directory, session
/// table and membership view. Peers still talk to each other over localhost TCP.
pub struct TestCluster {
  pub store: Arc<MemoryStore>,
  pub directory: Arc<MemoryDirectory>,
  pub sessions: Arc<MemorySessions>,
  pub cluster: Arc<MemoryCluster>,
  nodes: BTreeMap<NodeId, ChannelService>,
}
impl TestCluster {
  pub fn start(
    rt: &Runtime,
    config: ChannelConfig,
    nodes: &[NodeId],
  ) -> Result<TestCluster, ChannelError> {
    let mut cluster = TestCluster {
      store: Arc::new(MemoryStore::new()),
      directory: Arc::new(MemoryDirectory::new()),
      sessions: MemorySessions::new(),
      cluster: MemoryCluster::new(),
      nodes: BTreeMap::new(),
    };
    for node in nodes {
      cluster.add(rt, config.clone(), *node)?;
    }
    Ok(cluster)
  }

  pub fn add(
    &mut self,
    rt: &Runtime,
    config: ChannelConfig,
    node: NodeId,
  ) -> Result<(), ChannelError> {
    let collab = Collaborators {
      store: self.store.clone(),
      directory: self.directory.clone(),
      sessions: self.sessions.view(node),
      cluster: self.cluster.view(node),
      scheduler: Arc::new(TokioScheduler::with_handle(rt.handle().clone())),
    };
    let service = rt.block_on(ChannelService::start(config, collab))?;
    self.nodes.insert(node, service);
    Ok(())
  }

  /// Panics if the node is not running.
  pub fn node(&self, node: NodeId) -> &ChannelService {
    match self.nodes.get(&node) {
      Some(service) => service,
      None => panic!("node {} is not running", node),
    }
  }

  pub fn running(&self) -> Vec<NodeId> {
    self.nodes.keys().cloned().collect()
  }

  /// Crashes a node: its service stops and the cluster stops reporting it alive. The survivors
  /// are not told.
  pub fn crash(&mut self, node: NodeId) {
    if let Some(service) = self.nodes.remove(&node) {
      service.shutdown();
    }
    self.cluster.fail(node);
  }
}
