//! Cleaning up after a failed node. Every surviving node strips the failed node from the channels
//! it coordinates. The node elected to recover the failed one also moves the failed node's
//! channels to new coordinators and unpublishes its channel server.

use crate::channel::{ChannelNode, TxnContext, LOG_LEVEL};
use crate::core::{task, transact, ChannelError, ChannelId, NodeId};
use crate::{debug, info, warn};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use wyhash::{wyrng, WyHash};

/// Points each node is hashed to on the ring.
const VNODES: u32 = 16;

/// Consistent hashing of channels onto candidate coordinators. Every node that builds a ring from
/// the same nodes picks the same coordinator for a channel.
pub struct CoordinatorRing {
  ring: BTreeMap<u64, NodeId>,
}
impl CoordinatorRing {
  pub fn new<I: IntoIterator<Item = NodeId>>(nodes: I) -> CoordinatorRing {
    let mut ring = CoordinatorRing {
      ring: BTreeMap::new(),
    };
    for node in nodes {
      ring.insert(node);
    }
    ring
  }

  pub fn insert(&mut self, node: NodeId) {
    let mut key = hash_code(&node);
    self.ring.insert(key, node);
    for _ in 1..VNODES {
      key = wyrng(&mut key);
      self.ring.insert(key, node);
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ring.is_empty()
  }

  /// Up to `num` distinct nodes, in the order they follow the channel on the ring.
  pub fn successors(&self, channel: ChannelId, num: usize) -> Vec<NodeId> {
    let key = hash_code(&channel);
    self
      .ring
      .range(key..)
      .chain(self.ring.range(..key))
      .map(|(_, node)| *node)
      .unique()
      .take(num)
      .collect()
  }

  pub fn coordinator(&self, channel: ChannelId) -> Option<NodeId> {
    self.successors(channel, 1).into_iter().next()
  }
}

fn hash_code<H: Hash>(item: &H) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  item.hash(&mut hasher);
  hasher.finish()
}

impl ChannelNode {
  /// Runs on every surviving node when `failed` goes down.
  pub(crate) fn node_failed(self: &Arc<Self>, failed: NodeId) {
    info!(LOG_LEVEL, &self.logger, "node {} failed", failed);
    self.forget_server(failed);
    self.snapshots.clear();
    let node = self.clone();
    self.scheduler.schedule(task(async move {
      if let Err(e) = node.remove_failed_node_from_local_channels(failed) {
        warn!(LOG_LEVEL, &node.logger, "removing node {} from channels failed: {}", failed, e);
      }
    }));
  }

  /// Strips `failed` from the servers and durable members of every channel this node
  /// coordinates. Returns the channels that changed.
  pub(crate) fn remove_failed_node_from_local_channels(
    &self,
    failed: NodeId,
  ) -> Result<Vec<ChannelId>, ChannelError> {
    let local = self.local;
    let changed = transact(&*self.store, self.config.txn_timeout, |txn| {
      let mut changed = Vec::new();
      for channel in txn.channel_ids() {
        let rec = match txn.channel_mut(channel) {
          Some(rec) if rec.coordinator == local => rec,
          _ => continue,
        };
        if rec.remove_node(failed) {
          changed.push(channel);
        }
      }
      Ok(changed)
    })?;
    if !changed.is_empty() {
      debug!(LOG_LEVEL, &self.logger, "removed node {} from {:?}", failed, changed);
    }
    Ok(changed)
  }

  /// Runs on the node elected to recover `failed`.
  pub(crate) fn recover(self: &Arc<Self>, failed: NodeId) {
    info!(LOG_LEVEL, &self.logger, "recovering channels of node {}", failed);
    let node = self.clone();
    self.scheduler.schedule(task(async move {
      match node.reassign_coordinators(failed) {
        Ok(moved) => {
          for (channel, coordinator) in moved {
            info!(
              LOG_LEVEL,
              &node.logger,
              "channel {} now coordinated by node {}",
              channel,
              coordinator
            );
          }
        }
        Err(e) => {
          warn!(LOG_LEVEL, &node.logger, "reassigning channels of {} failed: {}", failed, e)
        }
      }
    }));
    self.directory.remove_if_present(&self.server_key(failed));
  }

  /// Moves every channel coordinated by `failed` to a live node and has the new coordinator
  /// retransmit its saved messages. Channels already moved are left alone, so running this
  /// again is a no-op.
  pub(crate) fn reassign_coordinators(
    self: &Arc<Self>,
    failed: NodeId,
  ) -> Result<Vec<(ChannelId, NodeId)>, ChannelError> {
    let live = self
      .cluster
      .live_nodes()
      .into_iter()
      .filter(|n| *n != failed)
      .sorted()
      .collect::<Vec<_>>();
    let everyone = CoordinatorRing::new(live.iter().cloned());
    let node = self.clone();
    transact(&*self.store, self.config.txn_timeout, |txn| {
      let mut ctx = TxnContext::new();
      let mut moved = Vec::new();
      for channel in txn.channel_ids() {
        let rec = match txn.channel_mut(channel) {
          Some(rec) if rec.coordinator == failed => rec,
          _ => continue,
        };
        rec.remove_node(failed);
        let live_servers = rec.servers.iter().cloned().filter(|n| node.cluster.is_alive(*n));
        let servers = CoordinatorRing::new(live_servers);
        let picked = servers.coordinator(channel).or_else(|| everyone.coordinator(channel));
        let coordinator = match picked {
          Some(coordinator) => coordinator,
          None => {
            warn!(LOG_LEVEL, &node.logger, "no live node to coordinate {}", channel);
            continue;
          }
        };
        rec.coordinator = coordinator;
        rec.retransmit = true;
        ctx.service(channel, coordinator);
        moved.push((channel, coordinator));
      }
      ctx.register(txn, &node);
      Ok(moved)
    })
  }
}

#[test]
fn test_ring_is_deterministic() {
  let nodes = (1..=5).map(NodeId).collect::<Vec<_>>();
  let a = CoordinatorRing::new(nodes.iter().cloned());
  let b = CoordinatorRing::new(nodes.iter().rev().cloned());
  for ch in 0..64 {
    let channel = ChannelId(ch);
    assert_eq!(a.coordinator(channel), b.coordinator(channel));
    let succ = a.successors(channel, 5);
    assert_eq!(succ.len(), 5);
    assert_eq!(succ.iter().unique().count(), 5);
  }
  assert_eq!(CoordinatorRing::new(Vec::new()).coordinator(ChannelId(1)), None);
}

#[test]
fn test_ring_moves_only_removed_nodes_channels() {
  let all = CoordinatorRing::new((1..=4).map(NodeId));
  let fewer = CoordinatorRing::new((1..=3).map(NodeId));
  for ch in 0..64 {
    let channel = ChannelId(ch);
    let before = all.coordinator(channel);
    if before != Some(NodeId(4)) {
      assert_eq!(fewer.coordinator(channel), before);
    }
  }
}
