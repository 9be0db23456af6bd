//! The coordinator side of a channel. Application operations append events to the channel's
//! durable event queue; the coordinator node services that queue one transaction at a time on
//! the channel's coordinator queue, and the notifications each transaction produces run in
//! commit order on the channel's notification queue, outside any transaction.

use crate::channel::{ChannelEventInfo, ChannelEventType, ChannelNode, LOG_LEVEL};
use crate::core::{
  task, transact, ChannelError, ChannelEventKind, ChannelId, ChannelRecord, Delivery, NodeId,
  SessionId, Task, TaskQueue, TaskScheduler, Timestamp, Transaction,
};
use crate::{debug, trace, warn};
use hashbrown::HashMap;
use linked_hash_map::LinkedHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// The two FIFO queues of every channel this node has touched. They are never merged: the
/// coordinator queue runs transactions over the event queue, the notification queue runs the
/// network calls those transactions decided on.
#[derive(Default)]
pub struct ChannelQueues {
  coordinator: RwLock<HashMap<ChannelId, Arc<dyn TaskQueue>>>,
  notification: Mutex<HashMap<ChannelId, Arc<dyn TaskQueue>>>,
}
impl ChannelQueues {
  pub fn new() -> ChannelQueues {
    Self::default()
  }

  pub fn coordinator_queue(
    &self,
    channel: ChannelId,
    scheduler: &dyn TaskScheduler,
  ) -> Arc<dyn TaskQueue> {
    if let Some(queue) = self.coordinator.read().unwrap().get(&channel) {
      return queue.clone();
    }
    let mut queues = self.coordinator.write().unwrap();
    queues.entry(channel).or_insert_with(|| scheduler.create_queue()).clone()
  }

  pub fn notification_queue(
    &self,
    channel: ChannelId,
    scheduler: &dyn TaskScheduler,
  ) -> Arc<dyn TaskQueue> {
    let mut queues = self.notification.lock().unwrap();
    queues.entry(channel).or_insert_with(|| scheduler.create_queue()).clone()
  }

  pub fn remove(&self, channel: ChannelId) {
    self.coordinator.write().unwrap().remove(&channel);
    self.notification.lock().unwrap().remove(&channel);
  }

  pub fn clear(&self) {
    self.coordinator.write().unwrap().clear();
    self.notification.lock().unwrap().clear();
  }

  /// How many coordinator and notification queues exist.
  pub fn len(&self) -> (usize, usize) {
    (self.coordinator.read().unwrap().len(), self.notification.lock().unwrap().len())
  }
}

/// Recently collected cluster-wide channel memberships.
pub struct MembershipSnapshots {
  ttl: Duration,
  entries: Mutex<HashMap<ChannelId, (Instant, Vec<SessionId>)>>,
}
impl MembershipSnapshots {
  pub fn new(ttl: Duration) -> MembershipSnapshots {
    MembershipSnapshots {
      ttl: ttl,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn get(&self, channel: ChannelId) -> Option<Vec<SessionId>> {
    let mut entries = self.entries.lock().unwrap();
    match entries.get(&channel) {
      Some((at, members)) if at.elapsed() < self.ttl => Some(members.clone()),
      Some(_) => {
        entries.remove(&channel);
        None
      }
      None => None,
    }
  }

  pub fn put(&self, channel: ChannelId, members: Vec<SessionId>) {
    self.entries.lock().unwrap().insert(channel, (Instant::now(), members));
  }

  pub fn remove(&self, channel: ChannelId) {
    self.entries.lock().unwrap().remove(&channel);
  }

  pub fn clear(&self) {
    self.entries.lock().unwrap().clear();
  }
}

/// A call a coordinator makes on a channel server once the transaction deciding on it commits.
#[derive(Clone, Debug)]
pub(crate) enum Notification {
  Join {
    name: String,
    delivery: Delivery,
    timestamp: Timestamp,
    session: SessionId,
  },
  Leave {
    timestamp: Timestamp,
    session: SessionId,
  },
  Send {
    message: Vec<u8>,
    timestamp: Timestamp,
  },
  Close {
    timestamp: Timestamp,
  },
}

/// What a transaction wants done once it commits, per channel, in the order it asked. Dropped
/// with the transaction if it aborts.
pub(crate) struct TxnContext {
  tasks: LinkedHashMap<ChannelId, Vec<Task>>,
  to_service: LinkedHashMap<ChannelId, NodeId>,
  cached: Vec<(ChannelId, ChannelEventInfo)>,
}
impl TxnContext {
  pub fn new() -> TxnContext {
    TxnContext {
      tasks: LinkedHashMap::new(),
      to_service: LinkedHashMap::new(),
      cached: Vec::new(),
    }
  }

  pub fn add_task(&mut self, channel: ChannelId, task: Task) {
    self.tasks.entry(channel).or_insert_with(Vec::new).push(task);
  }

  pub fn notify(
    &mut self,
    node: &Arc<ChannelNode>,
    channel: ChannelId,
    target: NodeId,
    notification: Notification,
  ) {
    let node = node.clone();
    self.add_task(
      channel,
      task(async move { node.deliver_notification(channel, target, notification).await }),
    );
  }

  /// Asks `coordinator` to service the channel's event queue.
  pub fn service(&mut self, channel: ChannelId, coordinator: NodeId) {
    self.to_service.insert(channel, coordinator);
  }

  pub fn cache_event(&mut self, channel: ChannelId, info: ChannelEventInfo) {
    self.cached.push((channel, info));
  }

  fn uncommitted(&self, channel: ChannelId) -> Vec<ChannelEventInfo> {
    self.cached.iter().filter(|(ch, _)| *ch == channel).map(|(_, info)| *info).collect()
  }

  fn is_empty(&self) -> bool {
    self.tasks.is_empty() && self.to_service.is_empty() && self.cached.is_empty()
  }

  /// Hands the context to `txn`'s commit hooks. A context with nothing in it registers nothing.
  pub fn register(self, txn: &mut Transaction, node: &Arc<ChannelNode>) {
    if self.is_empty() {
      return;
    }
    let node = node.clone();
    txn.on_commit(move || node.flush(self));
  }
}

impl ChannelNode {
  fn flush(self: &Arc<Self>, ctx: TxnContext) {
    for (channel, info) in ctx.cached {
      self.event_cache.cache_event(channel, info);
    }
    for (channel, tasks) in ctx.tasks {
      let queue = self.queues.notification_queue(channel, &*self.scheduler);
      for task in tasks {
        queue.add_task(task);
      }
    }
    for (channel, coordinator) in ctx.to_service {
      if coordinator == self.local {
        self.add_service_event_queue_task(channel);
      } else {
        let node = self.clone();
        self.scheduler.schedule(task(async move {
          node.forward_service_request(channel, coordinator).await;
        }));
      }
    }
  }

  async fn forward_service_request(self: &Arc<Self>, channel: ChannelId, coordinator: NodeId) {
    let res = match self.server_for(coordinator) {
      Ok(server) => server.service_event_queue(channel).await,
      Err(e) => Err(e),
    };
    if let Err(e) = res {
      warn!(
        LOG_LEVEL,
        &self.logger,
        "could not ask node {} to service channel {}: {}",
        coordinator,
        channel,
        e
      );
    }
  }

  /// Queues a task on the channel's coordinator queue to service its event queue.
  pub(crate) fn add_service_event_queue_task(self: &Arc<Self>, channel: ChannelId) {
    trace!(LOG_LEVEL, &self.logger, "add task to service event queue of {}", channel);
    let node = self.clone();
    let queue = self.queues.coordinator_queue(channel, &*self.scheduler);
    queue.add_task(task(async move { node.service_event_queue(channel) }));
  }

  /// Drops the queues and cached events of a channel whose close has been fully fanned out.
  pub(crate) fn closed_channel(&self, channel: ChannelId) {
    debug!(LOG_LEVEL, &self.logger, "channel {} closed", channel);
    self.queues.remove(channel);
    self.event_cache.remove_channel(channel);
    self.snapshots.remove(channel);
  }

  /// Processes up to `events_per_txn` events of the channel's durable event queue in one
  /// transaction.
  pub(crate) fn service_event_queue(self: &Arc<Self>, channel: ChannelId) {
    let node = self.clone();
    let res = transact(&*self.store, self.config.txn_timeout, |txn| {
      trace!(LOG_LEVEL, &node.logger, "servicing {} in transaction {}", channel, txn.id());
      let mut ctx = TxnContext::new();
      node.service_events(txn, &mut ctx, channel);
      ctx.register(txn, &node);
      Ok(())
    });
    if let Err(e) = res {
      warn!(LOG_LEVEL, &self.logger, "servicing event queue of {} failed: {}", channel, e);
      if let ChannelError::TransactionConflict | ChannelError::TransactionTimeout = e {
        self.add_service_event_queue_task(channel);
      }
    }
  }

  fn service_events(
    self: &Arc<Self>,
    txn: &mut Transaction,
    ctx: &mut TxnContext,
    channel: ChannelId,
  ) {
    let rec = match txn.channel_mut(channel) {
      Some(rec) => rec,
      None => return,
    };
    if rec.coordinator != self.local {
      ctx.service(channel, rec.coordinator);
      return;
    }
    if rec.retransmit {
      rec.retransmit = false;
      for (timestamp, message) in rec.saved.all() {
        for server in rec.servers.iter() {
          let notification = Notification::Send {
            message: message.clone(),
            timestamp: timestamp,
          };
          ctx.notify(self, channel, *server, notification);
        }
      }
    }
    let mut closed = false;
    for _ in 0..self.config.events_per_txn {
      let event = match rec.events.poll() {
        Some(event) => event,
        None => break,
      };
      match event.kind {
        ChannelEventKind::Join(session) => {
          let target = match self.sessions.session_node(session) {
            Some(target) => target,
            None => {
              debug!(
                LOG_LEVEL,
                &self.logger,
                "session {} gone before joining {}",
                session,
                channel
              );
              continue;
            }
          };
          rec.members.insert(session, target);
          rec.servers.insert(target);
          ctx.cache_event(
            channel,
            ChannelEventInfo {
              event_type: ChannelEventType::Join,
              session: session,
              event_timestamp: event.timestamp,
              expiration_timestamp: rec.events.next_timestamp(),
            },
          );
          let notification = Notification::Join {
            name: rec.name.clone(),
            delivery: rec.delivery,
            timestamp: rec.msg_timestamp,
            session: session,
          };
          ctx.notify(self, channel, target, notification);
        }
        ChannelEventKind::Leave(session) => {
          let target = rec.members.remove(&session).or_else(|| self.sessions.session_node(session));
          ctx.cache_event(
            channel,
            ChannelEventInfo {
              event_type: ChannelEventType::Leave,
              session: session,
              event_timestamp: event.timestamp,
              expiration_timestamp: rec.events.next_timestamp(),
            },
          );
          if let Some(target) = target {
            let notification = Notification::Leave {
              timestamp: rec.msg_timestamp,
              session: session,
            };
            ctx.notify(self, channel, target, notification);
          }
        }
        ChannelEventKind::Send {
          sender,
          sender_was_member,
          message,
        } => {
          if let Some(sender) = sender {
            let uncommitted = ctx.uncommitted(channel);
            let member = self.event_cache.is_channel_member_with(
              channel,
              sender,
              sender_was_member,
              event.timestamp,
              &uncommitted[..],
            );
            if !member {
              debug!(
                LOG_LEVEL,
                &self.logger,
                "dropping message from non-member {} on {}",
                sender,
                channel
              );
              continue;
            }
          }
          rec.msg_timestamp += 1;
          let timestamp = rec.msg_timestamp;
          if rec.delivery == Delivery::Reliable {
            rec.saved.push(timestamp, message.clone());
          }
          for server in rec.servers.iter() {
            let notification = Notification::Send {
              message: message.clone(),
              timestamp: timestamp,
            };
            ctx.notify(self, channel, *server, notification);
          }
        }
        ChannelEventKind::Close => {
          rec.closed = true;
          for server in rec.servers.iter() {
            let notification = Notification::Close {
              timestamp: rec.msg_timestamp,
            };
            ctx.notify(self, channel, *server, notification);
          }
          closed = true;
          break;
        }
      }
    }
    if closed {
      txn.remove_channel(channel);
      let node = self.clone();
      ctx.add_task(channel, task(async move { node.closed_channel(channel) }));
    } else if !rec.events.is_empty() {
      ctx.service(channel, self.local);
    }
  }

  pub(crate) async fn deliver_notification(
    self: &Arc<Self>,
    channel: ChannelId,
    target: NodeId,
    notification: Notification,
  ) {
    let server = match self.server_for(target) {
      Ok(server) => server,
      Err(e) => {
        warn!(LOG_LEVEL, &self.logger, "node {} unreachable for {}: {}", target, channel, e);
        return;
      }
    };
    let res = match notification {
      Notification::Join {
        name,
        delivery,
        timestamp,
        session,
      } => match server.join(name.clone(), channel, delivery, timestamp, session).await {
        Ok(true) => Ok(()),
        Ok(false) => {
          self
            .reroute(channel, target, session, move |server| {
              task(async move {
                let _ = server.join(name, channel, delivery, timestamp, session).await;
              })
            })
            .await;
          Ok(())
        }
        Err(e) => Err(e),
      },
      Notification::Leave { timestamp, session } => {
        match server.leave(channel, timestamp, session).await {
          Ok(true) => Ok(()),
          Ok(false) => {
            self
              .reroute(channel, target, session, move |server| {
                task(async move {
                  let _ = server.leave(channel, timestamp, session).await;
                })
              })
              .await;
            Ok(())
          }
          Err(e) => Err(e),
        }
      }
      Notification::Send { message, timestamp } => server.send(channel, message, timestamp).await,
      Notification::Close { timestamp } => server.close(channel, timestamp).await,
    };
    if let Err(e) = res {
      warn!(LOG_LEVEL, &self.logger, "notifying node {} for {} failed: {}", target, channel, e);
    }
  }

  /// Retries a join or leave refused by `refused_by` once, on the node the session is on now.
  async fn reroute<F>(
    self: &Arc<Self>,
    channel: ChannelId,
    refused_by: NodeId,
    session: SessionId,
    call: F,
  ) where
    F: FnOnce(Arc<dyn crate::channel::ChannelServer>) -> Task,
  {
    let now = match self.sessions.session_node(session) {
      Some(now) if now != refused_by => now,
      _ => {
        debug!(LOG_LEVEL, &self.logger, "session {} not found for {}", session, channel);
        return;
      }
    };
    match self.add_server_node(channel, now) {
      Ok(true) => {}
      Ok(false) => return,
      Err(e) => {
        warn!(LOG_LEVEL, &self.logger, "adding node {} to {} failed: {}", now, channel, e);
        return;
      }
    }
    match self.server_for(now) {
      Ok(server) => call(server).await,
      Err(e) => warn!(LOG_LEVEL, &self.logger, "node {} unreachable for {}: {}", now, channel, e),
    }
  }

  /// Adds `node` to the channel's server set. False if the channel is closed or gone.
  pub(crate) fn add_server_node(
    &self,
    channel: ChannelId,
    node: NodeId,
  ) -> Result<bool, ChannelError> {
    transact(&*self.store, self.config.txn_timeout, |txn| {
      match txn.channel(channel) {
        None => return Ok(false),
        Some(rec) if rec.closed => return Ok(false),
        Some(rec) if rec.servers.contains(&node) => return Ok(true),
        Some(_) => {}
      }
      if let Some(rec) = txn.channel_mut(channel) {
        rec.servers.insert(node);
      }
      Ok(true)
    })
  }

  pub(crate) fn create_channel(
    &self,
    name: String,
    delivery: Delivery,
  ) -> Result<ChannelId, ChannelError> {
    let local = self.local;
    let write_buffer_size = self.config.write_buffer_size;
    transact(&*self.store, self.config.txn_timeout, |txn| {
      if txn.channel_by_name(&name).is_some() {
        return Err(ChannelError::NameInUse(name.clone()));
      }
      let id = txn.allocate_channel_id();
      let record = ChannelRecord::new(id, name.clone(), delivery, local, write_buffer_size);
      txn.put_channel(record);
      Ok(id)
    })
  }

  pub(crate) fn channel_by_name(&self, name: &str) -> Result<Option<ChannelId>, ChannelError> {
    transact(&*self.store, self.config.txn_timeout, |txn| Ok(txn.channel_by_name(name)))
  }

  /// Appends an event to the channel's event queue and asks its coordinator to service it.
  pub(crate) fn enqueue_event<F>(
    self: &Arc<Self>,
    channel: ChannelId,
    make: F,
  ) -> Result<Timestamp, ChannelError>
  where
    F: Fn(&ChannelRecord) -> ChannelEventKind,
  {
    transact(&*self.store, self.config.txn_timeout, |txn| {
      let mut ctx = TxnContext::new();
      let rec = txn.channel_mut(channel).ok_or(ChannelError::ChannelNotFound)?;
      if rec.closed {
        return Err(ChannelError::ChannelClosed);
      }
      let kind = make(rec);
      let timestamp = rec.events.offer(kind);
      ctx.service(channel, rec.coordinator);
      ctx.register(txn, self);
      Ok(timestamp)
    })
  }

  /// The channel's current message timestamp, or 0 if it is closed or gone.
  pub(crate) fn current_message_timestamp(
    &self,
    channel: ChannelId,
  ) -> Result<Timestamp, ChannelError> {
    transact(&*self.store, self.config.txn_timeout, |txn| {
      Ok(match txn.channel(channel) {
        Some(rec) if !rec.closed => rec.msg_timestamp,
        _ => 0,
      })
    })
  }

  /// Saved messages with timestamps in `from..=to`.
  pub(crate) fn channel_messages(
    &self,
    channel: ChannelId,
    from: Timestamp,
    to: Timestamp,
  ) -> Result<BTreeMap<Timestamp, Vec<u8>>, ChannelError> {
    transact(&*self.store, self.config.txn_timeout, |txn| {
      Ok(match txn.channel(channel) {
        Some(rec) if !rec.closed => rec.saved.range(from, to),
        _ => BTreeMap::new(),
      })
    })
  }

  /// The channel's members across the cluster. Fails with a transaction timeout if the member
  /// nodes do not all answer (or time out) before the transaction's timeout runs out.
  pub(crate) async fn channel_sessions(
    self: &Arc<Self>,
    channel: ChannelId,
  ) -> Result<Vec<SessionId>, ChannelError> {
    let (servers, deadline) = transact(&*self.store, self.config.txn_timeout, |txn| {
      let rec = txn.channel(channel).ok_or(ChannelError::ChannelNotFound)?;
      if rec.closed {
        return Err(ChannelError::ChannelClosed);
      }
      let servers = rec.servers.iter().cloned().collect::<Vec<_>>();
      Ok((servers, Instant::now() + txn.remaining()))
    })?;
    if servers.is_empty() {
      return Ok(Vec::new());
    }
    if servers.len() == 1 && servers[0] == self.local {
      return Ok(self.membership.members(channel).await);
    }
    if let Some(members) = self.snapshots.get(channel) {
      return Ok(members);
    }
    let (tx, rx) = oneshot::channel();
    let node = self.clone();
    self.scheduler.schedule(task(async move {
      let members = node.collect_membership(channel, servers).await;
      node.snapshots.put(channel, members.clone());
      let _ = tx.send(members);
    }));
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, rx).await {
      Ok(Ok(members)) => Ok(members),
      _ => Err(ChannelError::TransactionTimeout),
    }
  }

  async fn collect_membership(
    self: &Arc<Self>,
    channel: ChannelId,
    servers: Vec<NodeId>,
  ) -> Vec<SessionId> {
    let mut members = BTreeSet::new();
    for node in servers {
      let res = match self.server_for(node) {
        Ok(server) => server.get_sessions(channel).await,
        Err(e) => Err(e),
      };
      match res {
        Ok(sessions) => members.extend(sessions),
        Err(e) => {
          debug!(LOG_LEVEL, &self.logger, "get_sessions on {} for {} failed: {}", node, channel, e)
        }
      }
    }
    members.into_iter().collect()
  }
}

#[test]
fn test_context_keeps_channel_order() {
  let mut ctx = TxnContext::new();
  ctx.service(ChannelId(2), NodeId(1));
  ctx.service(ChannelId(1), NodeId(1));
  ctx.service(ChannelId(2), NodeId(3));
  assert_eq!(
    ctx.to_service.iter().map(|(ch, n)| (*ch, *n)).collect::<Vec<_>>(),
    vec![(ChannelId(1), NodeId(1)), (ChannelId(2), NodeId(3))]
  );
  ctx.add_task(ChannelId(5), task(async {}));
  ctx.add_task(ChannelId(4), task(async {}));
  ctx.add_task(ChannelId(5), task(async {}));
  let order = ctx.tasks.iter().map(|(ch, t)| (*ch, t.len())).collect::<Vec<_>>();
  assert_eq!(order, vec![(ChannelId(5), 2), (ChannelId(4), 1)]);
}

#[test]
fn test_snapshots_expire() {
  let snapshots = MembershipSnapshots::new(Duration::from_millis(30));
  snapshots.put(ChannelId(1), vec![SessionId(1)]);
  assert_eq!(snapshots.get(ChannelId(1)), Some(vec![SessionId(1)]));
  std::thread::sleep(Duration::from_millis(40));
  assert_eq!(snapshots.get(ChannelId(1)), None);
}
