//! Moving a session's channel memberships along with the session.
//!
//! The old node snapshots the session's memberships and hands them to the new node, which makes
//! the session a local member of each channel, catches it up on RELIABLE messages it missed, and
//! confirms. Until it confirms, the old node refuses new requests for the session, and the new
//! node buffers requests for it until its connection is up.

use crate::channel::{ChannelNode, ChannelRequest, MemberSnapshot, LOG_LEVEL};
use crate::core::{task, ChannelId, Delivery, NodeId, SessionId, Timestamp};
use crate::{debug, info, warn};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// A session on its way out of this node.
pub struct RelocationInfo {
  pub new_node: NodeId,
  completion: Option<oneshot::Sender<()>>,
  confirmed: watch::Sender<bool>,
}

#[derive(Default)]
pub struct RelocationTable {
  sessions: Mutex<HashMap<SessionId, RelocationInfo>>,
}
impl RelocationTable {
  pub fn new() -> RelocationTable {
    Self::default()
  }

  /// Marks the session as leaving. The receiver flips to true once the new node confirms.
  pub fn begin(
    &self,
    session: SessionId,
    new_node: NodeId,
    completion: oneshot::Sender<()>,
  ) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let info = RelocationInfo {
      new_node: new_node,
      completion: Some(completion),
      confirmed: tx,
    };
    self.sessions.lock().unwrap().insert(session, info);
    rx
  }

  pub fn is_relocating(&self, session: SessionId) -> bool {
    self.sessions.lock().unwrap().contains_key(&session)
  }

  pub fn new_node(&self, session: SessionId) -> Option<NodeId> {
    self.sessions.lock().unwrap().get(&session).map(|info| info.new_node)
  }

  /// Fires the completion of the session's relocation. Returns false if it was not relocating
  /// or was already completed.
  pub fn complete(&self, session: SessionId) -> bool {
    let mut sessions = self.sessions.lock().unwrap();
    match sessions.get_mut(&session) {
      Some(info) => {
        let _ = info.confirmed.send(true);
        match info.completion.take() {
          Some(completion) => {
            let _ = completion.send(());
            true
          }
          None => false,
        }
      }
      None => false,
    }
  }

  /// Forgets the session. Dropping an uncompleted relocation cancels its completion.
  pub fn remove(&self, session: SessionId) -> Option<RelocationInfo> {
    self.sessions.lock().unwrap().remove(&session)
  }

  pub fn clear(&self) {
    self.sessions.lock().unwrap().clear();
  }
}

async fn wait_confirmed(rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
  let wait = async {
    while !*rx.borrow() {
      if rx.changed().await.is_err() {
        return false;
      }
    }
    true
  };
  tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

impl ChannelNode {
  /// Starts moving `session`'s memberships to `new_node`. The receiver completes once `new_node`
  /// holds them, and is dropped without completing if the move is given up.
  pub(crate) fn prepare_to_relocate(
    self: &Arc<Self>,
    session: SessionId,
    new_node: NodeId,
  ) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    if !self.membership.has_session(session) {
      let _ = tx.send(());
      return rx;
    }
    // Marked first, so nothing is delivered here after the snapshot is taken.
    let confirmed = self.relocations.begin(session, new_node, tx);
    let snapshot = self.membership.session_snapshot(session);
    let node = self.clone();
    self.scheduler.schedule(task(async move {
      node.transfer_memberships(session, new_node, snapshot, confirmed).await;
    }));
    rx
  }

  async fn transfer_memberships(
    self: &Arc<Self>,
    session: SessionId,
    new_node: NodeId,
    snapshot: Vec<MemberSnapshot>,
    mut confirmed: watch::Receiver<bool>,
  ) {
    let timeout = self.config.session_relocation_timeout;
    for attempt in 0..=self.config.relocation_retries {
      let res = match self.server_for(new_node) {
        Ok(server) => {
          let memberships = snapshot.clone();
          server.relocate_channel_memberships(session, self.local, memberships).await
        }
        Err(e) => Err(e),
      };
      if let Err(e) = res {
        warn!(
          LOG_LEVEL,
          &self.logger,
          "relocating memberships of {} to node {} failed on attempt {}: {}",
          session,
          new_node,
          attempt,
          e
        );
      }
      if wait_confirmed(&mut confirmed, timeout).await {
        return;
      }
      if !self.relocations.is_relocating(session) {
        // Disconnected in the meantime.
        return;
      }
    }
    warn!(
      LOG_LEVEL,
      &self.logger,
      "node {} never took over the memberships of {}, disconnecting it",
      new_node,
      session
    );
    self.sessions.disconnect(session);
    self.membership.remove_session_from_all_channels(session).await;
    self.relocations.remove(session);
  }

  /// Runs on the new node: takes over the memberships, then confirms to the old node.
  pub(crate) async fn add_relocating_session(
    self: &Arc<Self>,
    session: SessionId,
    old_node: NodeId,
    memberships: Vec<MemberSnapshot>,
  ) {
    for member in memberships {
      self
        .add_relocating_member(member.channel, member.delivery, session, member.msg_timestamp)
        .await;
    }
    let res = match self.server_for(old_node) {
      Ok(server) => server.channel_memberships_updated(session, self.local).await,
      Err(e) => Err(e),
    };
    if let Err(e) = res {
      warn!(
        LOG_LEVEL,
        &self.logger,
        "confirming memberships of {} to node {} failed: {}",
        session,
        old_node,
        e
      );
    }
  }

  async fn add_relocating_member(
    self: &Arc<Self>,
    channel: ChannelId,
    delivery: Delivery,
    session: SessionId,
    timestamp: Timestamp,
  ) {
    let (info, created) = self.membership.channel_or_insert(channel, delivery, timestamp);
    self.membership.add_member(&info, session).await;
    self.membership.put_member_info(session, &info, timestamp);
    if created {
      match self.add_server_node(channel, self.local) {
        Ok(true) => {}
        Ok(false) => {
          debug!(LOG_LEVEL, &self.logger, "{} closed while {} relocated", channel, session);
          let request = ChannelRequest::Leave { channel: channel };
          self.handle_channel_request(session, timestamp, request).await;
          return;
        }
        Err(e) => warn!(LOG_LEVEL, &self.logger, "adding this node to {} failed: {}", channel, e),
      }
    }
    if delivery != Delivery::Reliable {
      return;
    }
    // Read after joining the server set: anything later is sent here anyway, and the overlap is
    // dropped by the member's timestamp.
    let current = match self.current_message_timestamp(channel) {
      Ok(current) => current,
      Err(e) => {
        warn!(LOG_LEVEL, &self.logger, "no current timestamp for {}: {}", channel, e);
        return;
      }
    };
    if current <= timestamp {
      return;
    }
    let missing = match self.channel_messages(channel, timestamp + 1, current) {
      Ok(missing) => missing,
      Err(e) => {
        warn!(LOG_LEVEL, &self.logger, "fetching missed messages of {} failed: {}", channel, e);
        return;
      }
    };
    for (ts, message) in missing {
      let request = ChannelRequest::Send {
        channel: channel,
        delivery: delivery,
        message: Arc::new(message),
      };
      self.handle_channel_request(session, ts, request).await;
    }
  }

  /// Runs on the old node once the new node holds the session's memberships.
  pub(crate) async fn memberships_transferred(&self, session: SessionId, new_node: NodeId) {
    self.membership.remove_session_from_all_channels(session).await;
    if self.relocations.complete(session) {
      info!(LOG_LEVEL, &self.logger, "memberships of {} now on node {}", session, new_node);
    }
    if !self.sessions.is_connected(session) {
      self.relocations.remove(session);
    }
  }

  /// The session's connection to this node is established.
  pub(crate) async fn relocated(self: &Arc<Self>, session: SessionId) {
    self.relocations.remove(session);
    self.drain_pending(session).await;
  }

  /// The session's connection to this node is gone.
  pub(crate) async fn disconnected(&self, session: SessionId) {
    self.membership.remove_session_from_all_channels(session).await;
    self.pending.finish(session);
    self.relocations.remove(session);
  }
}

#[test]
fn test_relocation_table_completes_once() {
  let table = RelocationTable::new();
  let (tx, mut rx) = oneshot::channel();
  let confirmed = table.begin(SessionId(1), NodeId(2), tx);
  assert!(table.is_relocating(SessionId(1)));
  assert_eq!(table.new_node(SessionId(1)), Some(NodeId(2)));
  assert!(table.complete(SessionId(1)));
  assert!(!table.complete(SessionId(1)));
  assert_eq!(rx.try_recv(), Ok(()));
  assert!(*confirmed.borrow());

  let (tx, mut rx) = oneshot::channel::<()>();
  table.begin(SessionId(3), NodeId(2), tx);
  table.remove(SessionId(3));
  assert!(rx.try_recv().is_err());
}
