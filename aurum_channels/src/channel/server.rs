use crate::channel::{ChannelNode, ChannelRequest, MemberSnapshot, LOG_LEVEL};
use crate::core::{
  task, ChannelId, Delivery, MembershipStatus, NodeId, RpcError, SessionId, Timestamp,
};
use crate::{debug, trace, warn};
use async_trait::async_trait;
use std::sync::Arc;

/// The per-node surface peers call to apply coordinator decisions and hand sessions over. Every
/// method fails with an [`RpcError`] if the node cannot be reached, which callers treat as
/// "membership unknown", never as a refusal.
#[async_trait]
pub trait ChannelServer: Send + Sync {
  /// Queues a task to process the channel's durable event queue on this node.
  async fn service_event_queue(&self, channel: ChannelId) -> Result<(), RpcError>;

  async fn is_member(
    &self,
    channel: ChannelId,
    session: SessionId,
  ) -> Result<MembershipStatus, RpcError>;

  /// True if the join was applied to a connected session, or buffered for one relocating here.
  async fn join(
    &self,
    name: String,
    channel: ChannelId,
    delivery: Delivery,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError>;

  async fn leave(
    &self,
    channel: ChannelId,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError>;

  async fn send(
    &self,
    channel: ChannelId,
    message: Vec<u8>,
    timestamp: Timestamp,
  ) -> Result<(), RpcError>;

  async fn close(&self, channel: ChannelId, timestamp: Timestamp) -> Result<(), RpcError>;

  async fn get_sessions(&self, channel: ChannelId) -> Result<Vec<SessionId>, RpcError>;

  /// Called by `old_node` on the node a session is moving to, with the session's memberships.
  async fn relocate_channel_memberships(
    &self,
    session: SessionId,
    old_node: NodeId,
    memberships: Vec<MemberSnapshot>,
  ) -> Result<(), RpcError>;

  /// Called by `new_node` on the node a session is leaving, once it took over the memberships.
  async fn channel_memberships_updated(
    &self,
    session: SessionId,
    new_node: NodeId,
  ) -> Result<(), RpcError>;
}

/// This node's own [`ChannelServer`].
pub struct LocalChannelServer {
  node: Arc<ChannelNode>,
}
impl LocalChannelServer {
  pub(crate) fn new(node: Arc<ChannelNode>) -> LocalChannelServer {
    LocalChannelServer { node: node }
  }
}
#[async_trait]
impl ChannelServer for LocalChannelServer {
  async fn service_event_queue(&self, channel: ChannelId) -> Result<(), RpcError> {
    self.node.add_service_event_queue_task(channel);
    Ok(())
  }

  async fn is_member(
    &self,
    channel: ChannelId,
    session: SessionId,
  ) -> Result<MembershipStatus, RpcError> {
    let node = &self.node;
    if !node.sessions.is_connected(session) {
      Ok(MembershipStatus::Unknown)
    } else if node.membership.is_member(channel, session).await {
      Ok(MembershipStatus::Member)
    } else {
      Ok(MembershipStatus::NonMember)
    }
  }

  async fn join(
    &self,
    name: String,
    channel: ChannelId,
    delivery: Delivery,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError> {
    trace!(
      LOG_LEVEL,
      &self.node.logger,
      "join name: {} channel: {} session: {} timestamp: {}",
      name,
      channel,
      session,
      timestamp
    );
    let request = ChannelRequest::Join {
      name: name,
      channel: channel,
      delivery: delivery,
    };
    Ok(self.node.handle_channel_request(session, timestamp, request).await)
  }

  async fn leave(
    &self,
    channel: ChannelId,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError> {
    trace!(
      LOG_LEVEL,
      &self.node.logger,
      "leave channel: {} session: {} timestamp: {}",
      channel,
      session,
      timestamp
    );
    let request = ChannelRequest::Leave { channel: channel };
    Ok(self.node.handle_channel_request(session, timestamp, request).await)
  }

  async fn send(
    &self,
    channel: ChannelId,
    message: Vec<u8>,
    timestamp: Timestamp,
  ) -> Result<(), RpcError> {
    let node = &self.node;
    let info = match node.membership.channel(channel) {
      Some(info) => info,
      None => {
        debug!(
          LOG_LEVEL,
          &node.logger,
          "no local info for channel {}, dropping message with timestamp {}",
          channel,
          timestamp
        );
        return Ok(());
      }
    };
    // Held until every member has the message, so sends on one channel never overtake each
    // other. Joins and leaves only need the state lock and are not held up by a slow member.
    let _sending = info.sending.lock().await;
    let members = {
      let mut state = info.state.lock().await;
      if info.delivery == Delivery::Reliable && timestamp <= state.msg_timestamp {
        debug!(
          LOG_LEVEL,
          &node.logger,
          "dropping message on channel {} with old timestamp {}, current {}",
          channel,
          timestamp,
          state.msg_timestamp
        );
        return Ok(());
      }
      state.msg_timestamp = std::cmp::max(state.msg_timestamp, timestamp);
      state.members.iter().cloned().collect::<Vec<_>>()
    };
    let request = ChannelRequest::Send {
      channel: channel,
      delivery: info.delivery,
      message: Arc::new(message),
    };
    for session in members {
      // False means the session is gone or leaving, and its state here gets cleaned up by that.
      node.handle_channel_request(session, timestamp, request.clone()).await;
    }
    Ok(())
  }

  async fn close(&self, channel: ChannelId, timestamp: Timestamp) -> Result<(), RpcError> {
    let node = &self.node;
    let info = match node.membership.channel(channel) {
      Some(info) => info,
      None => {
        debug!(LOG_LEVEL, &node.logger, "no local info for closed channel {}", channel);
        return Ok(());
      }
    };
    let _sending = info.sending.lock().await;
    let members = info.state.lock().await.members.drain().collect::<Vec<_>>();
    for session in members {
      let request = ChannelRequest::Close { channel: channel };
      if !node.handle_channel_request(session, timestamp, request).await {
        node.membership.remove_member_info(session, channel);
      }
    }
    node.membership.remove_channel(channel);
    Ok(())
  }

  async fn get_sessions(&self, channel: ChannelId) -> Result<Vec<SessionId>, RpcError> {
    Ok(self.node.membership.members(channel).await)
  }

  async fn relocate_channel_memberships(
    &self,
    session: SessionId,
    old_node: NodeId,
    memberships: Vec<MemberSnapshot>,
  ) -> Result<(), RpcError> {
    let node = self.node.clone();
    self.node.scheduler.schedule(task(async move {
      node.add_relocating_session(session, old_node, memberships).await;
    }));
    Ok(())
  }

  async fn channel_memberships_updated(
    &self,
    session: SessionId,
    new_node: NodeId,
  ) -> Result<(), RpcError> {
    self.node.memberships_transferred(session, new_node).await;
    Ok(())
  }
}

impl ChannelNode {
  /// Routes a request for `session`. Rejects it if the session is leaving this node, buffers it
  /// if the session is on its way here, and otherwise runs it once anything buffered for the
  /// session has been applied.
  pub(crate) async fn handle_channel_request(
    self: &Arc<Self>,
    session: SessionId,
    timestamp: Timestamp,
    request: ChannelRequest,
  ) -> bool {
    if self.relocations.is_relocating(session) {
      return false;
    }
    let relocating_here = self.sessions.is_relocating_to_local_node(session);
    if self.sessions.session_protocol(session).is_none() {
      if !relocating_here {
        debug!(
          LOG_LEVEL,
          &self.logger,
          "dropping request for non-local session {} channel {} timestamp {}",
          session,
          request.channel(),
          timestamp
        );
        return false;
      }
      self.pending.enqueue(session, timestamp, request);
      // The session may have arrived between the check and the enqueue, after the buffer was
      // last drained.
      if self.sessions.session_protocol(session).is_some() {
        self.drain_pending(session).await;
      }
      return true;
    }
    if self.pending.has_pending(session) {
      let timeout = self.config.session_relocation_timeout;
      if !self.pending.wait_drained(session, timeout).await {
        warn!(
          LOG_LEVEL,
          &self.logger,
          "requests buffered for session {} not drained after {:?}, going ahead",
          session,
          timeout
        );
      }
    }
    self.run_request(session, timestamp, request).await;
    true
  }

  /// Applies a request to a session connected to this node.
  pub(crate) async fn run_request(
    self: &Arc<Self>,
    session: SessionId,
    timestamp: Timestamp,
    request: ChannelRequest,
  ) {
    match request {
      ChannelRequest::Join {
        name,
        channel,
        delivery,
      } => {
        self.add_local_member(channel, delivery, session, timestamp).await;
        if let Some(protocol) = self.sessions.session_protocol(session) {
          if let Err(e) = protocol.channel_join(&name, channel, delivery) {
            warn!(LOG_LEVEL, &self.logger, "channel_join to {} failed: {}", session, e);
          }
        }
      }
      ChannelRequest::Leave { channel } => {
        self.membership.remove_member_info(session, channel);
        self.membership.remove_member(channel, session).await;
        if let Some(protocol) = self.sessions.session_protocol(session) {
          if let Err(e) = protocol.channel_leave(channel) {
            warn!(LOG_LEVEL, &self.logger, "channel_leave to {} failed: {}", session, e);
          }
        }
      }
      ChannelRequest::Send {
        channel,
        delivery,
        message,
      } => {
        let protocol = match self.sessions.session_protocol(session) {
          Some(protocol) => protocol,
          None => return,
        };
        // Also drops messages sent before the session joined.
        if !self.membership.advance_member(session, channel, timestamp) {
          return;
        }
        if let Err(e) = protocol.channel_message(channel, &message[..], delivery) {
          warn!(
            LOG_LEVEL,
            &self.logger,
            "channel_message to {} on {} failed: {}",
            session,
            channel,
            e
          );
        }
      }
      ChannelRequest::Close { channel } => {
        if let Some(protocol) = self.sessions.session_protocol(session) {
          if let Err(e) = protocol.channel_leave(channel) {
            warn!(LOG_LEVEL, &self.logger, "channel_leave to {} failed: {}", session, e);
          }
          self.membership.remove_member_info(session, channel);
        }
      }
    }
  }

  /// Makes `session` a local member of `channel`, as of `timestamp`. Returns whether this call
  /// created the channel's local info.
  pub(crate) async fn add_local_member(
    &self,
    channel: ChannelId,
    delivery: Delivery,
    session: SessionId,
    timestamp: Timestamp,
  ) -> bool {
    let (info, created) = self.membership.channel_or_insert(channel, delivery, timestamp);
    self.membership.add_member(&info, session).await;
    self.membership.put_member_info(session, &info, timestamp);
    created
  }

  /// Applies everything buffered for a session that is now connected here, oldest timestamp
  /// first, then wakes anyone waiting on it.
  pub(crate) async fn drain_pending(self: &Arc<Self>, session: SessionId) {
    loop {
      let buckets = self.pending.take(session);
      if buckets.is_empty() {
        break;
      }
      for pending in buckets {
        let timestamp = pending.timestamp;
        for request in pending.into_ordered() {
          self.run_request(session, timestamp, request).await;
        }
      }
    }
    self.pending.finish(session);
  }
}
