//! Contracts of the collaborators the channel subsystem relies on but does not own.

use crate::core::{ChannelError, ChannelId, Delivery, NodeId, SessionId, Socket};
use std::sync::Arc;

/// Cluster-wide key to endpoint bindings. Channel servers publish themselves here under their
/// stringified node id.
pub trait Directory: Send + Sync {
  /// Binds `key`, replacing any previous binding.
  fn put(&self, key: String, endpoint: Socket);

  /// Looks up the endpoint bound to `key`.
  fn get(&self, key: &str) -> Option<Socket>;

  /// Removes the binding for `key`, returning it if there was one.
  fn remove_if_present(&self, key: &str) -> Option<Socket>;
}

/// The per-session protocol layer that actually writes to a client connection. Every call is
/// best effort: failures are logged by the caller and never retried.
pub trait SessionProtocol: Send + Sync {
  /// Tells the client it joined a channel.
  fn channel_join(
    &self,
    name: &str,
    channel: ChannelId,
    delivery: Delivery,
  ) -> Result<(), ChannelError>;

  /// Tells the client it left a channel.
  fn channel_leave(&self, channel: ChannelId) -> Result<(), ChannelError>;

  /// Delivers a channel message.
  fn channel_message(
    &self,
    channel: ChannelId,
    message: &[u8],
    delivery: Delivery,
  ) -> Result<(), ChannelError>;
}

/// What the channel subsystem needs to know about client sessions.
pub trait SessionService: Send + Sync {
  /// Whether the session has a live connection to the local node.
  fn is_connected(&self, session: SessionId) -> bool;

  /// Whether the session is known to be moving to the local node but is not connected yet.
  fn is_relocating_to_local_node(&self, session: SessionId) -> bool;

  /// The protocol of a session connected to the local node.
  fn session_protocol(&self, session: SessionId) -> Option<Arc<dyn SessionProtocol>>;

  /// The node a session is assigned to anywhere in the cluster.
  fn session_node(&self, session: SessionId) -> Option<NodeId>;

  /// Forcibly disconnects a session connected to the local node.
  fn disconnect(&self, session: SessionId);
}

/// Node identity and liveness, as reported by the cluster's failure detector.
pub trait ClusterMembership: Send + Sync {
  /// The id of this node.
  fn local_node_id(&self) -> NodeId;

  /// Whether the node is currently considered up.
  fn is_alive(&self, node: NodeId) -> bool;

  /// Every node currently considered up, including this one.
  fn live_nodes(&self) -> Vec<NodeId>;
}
