use crate::core::{ChannelId, SessionId, Timestamp};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelEventType {
  Join,
  Leave,
}

/// A processed join or leave, kept until durable membership reflects it for every event still
/// waiting in the channel's queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelEventInfo {
  pub event_type: ChannelEventType,
  pub session: SessionId,
  pub event_timestamp: Timestamp,
  /// The event queue position at which this event no longer matters.
  pub expiration_timestamp: Timestamp,
}

/// Folds `prior` with the events at or before `timestamp`. `events` must be in event timestamp
/// order.
pub fn fold_membership<'a, I>(
  events: I,
  session: SessionId,
  prior: bool,
  timestamp: Timestamp,
) -> bool
where
  I: IntoIterator<Item = &'a ChannelEventInfo>,
{
  let mut member = prior;
  for info in events {
    if info.event_timestamp > timestamp {
      break;
    }
    match info.event_type {
      ChannelEventType::Join => member = member || info.session == session,
      ChannelEventType::Leave => member = member && info.session != session,
    }
  }
  member
}

fn remove_expired(queue: &mut VecDeque<ChannelEventInfo>, timestamp: Timestamp) {
  while let Some(info) = queue.front() {
    if info.expiration_timestamp > timestamp {
      return;
    }
    queue.pop_front();
  }
}

/// Recently processed joins and leaves per channel, so a coordinator can tell whether a sender
/// was a member when its message was queued without asking every node.
#[derive(Default)]
pub struct EventCache {
  queues: RwLock<HashMap<ChannelId, Arc<Mutex<VecDeque<ChannelEventInfo>>>>>,
}
impl EventCache {
  pub fn new() -> EventCache {
    Self::default()
  }

  fn queue(&self, channel: ChannelId) -> Option<Arc<Mutex<VecDeque<ChannelEventInfo>>>> {
    self.queues.read().unwrap().get(&channel).cloned()
  }

  pub fn cache_event(&self, channel: ChannelId, info: ChannelEventInfo) {
    let queue = match self.queue(channel) {
      Some(queue) => queue,
      None => self.queues.write().unwrap().entry(channel).or_default().clone(),
    };
    let mut queue = queue.lock().unwrap();
    remove_expired(&mut queue, info.event_timestamp);
    queue.push_back(info);
  }

  /// Whether `session` was a member of `channel` at `timestamp`, given it was a member (or not)
  /// according to durable membership when the query's event was queued.
  pub fn is_channel_member(
    &self,
    channel: ChannelId,
    session: SessionId,
    prior: bool,
    timestamp: Timestamp,
  ) -> bool {
    self.is_channel_member_with(channel, session, prior, timestamp, &[])
  }

  /// Like [`is_channel_member`](Self::is_channel_member), also folding in `uncommitted` events
  /// that follow the cached ones.
  pub fn is_channel_member_with(
    &self,
    channel: ChannelId,
    session: SessionId,
    prior: bool,
    timestamp: Timestamp,
    uncommitted: &[ChannelEventInfo],
  ) -> bool {
    let mut member = prior;
    if let Some(queue) = self.queue(channel) {
      let mut queue = queue.lock().unwrap();
      remove_expired(&mut queue, timestamp);
      member = fold_membership(queue.iter(), session, member, timestamp);
    }
    let live = uncommitted.iter().filter(|info| info.expiration_timestamp > timestamp);
    fold_membership(live, session, member, timestamp)
  }

  pub fn remove_channel(&self, channel: ChannelId) {
    self.queues.write().unwrap().remove(&channel);
  }

  pub fn len(&self, channel: ChannelId) -> usize {
    self.queue(channel).map(|q| q.lock().unwrap().len()).unwrap_or(0)
  }
}

#[cfg(test)]
fn event(
  event_type: ChannelEventType,
  session: u64,
  event_timestamp: Timestamp,
  expiration_timestamp: Timestamp,
) -> ChannelEventInfo {
  ChannelEventInfo {
    event_type: event_type,
    session: SessionId(session),
    event_timestamp: event_timestamp,
    expiration_timestamp: expiration_timestamp,
  }
}

#[test]
fn test_membership_as_of_timestamp() {
  use ChannelEventType::*;
  let ch = ChannelId(1);
  let events = vec![
    event(Join, 1, 2, 100),
    event(Join, 2, 3, 100),
    event(Leave, 1, 5, 100),
    event(Join, 1, 8, 100),
  ];
  // The fold for every prior status and query point agrees with a plain replay.
  for prior in [false, true].iter().cloned() {
    for tq in 0..10 {
      let cache = EventCache::new();
      for e in events.iter() {
        cache.cache_event(ch, *e);
      }
      let mut expected = prior;
      for e in events.iter().filter(|e| e.event_timestamp <= tq) {
        if e.session == SessionId(1) {
          expected = e.event_type == Join;
        }
      }
      assert_eq!(cache.is_channel_member(ch, SessionId(1), prior, tq), expected, "tq {}", tq);
    }
  }
  // Another session's events never change the answer.
  let cache = EventCache::new();
  cache.cache_event(ch, event(Leave, 2, 1, 100));
  assert!(cache.is_channel_member(ch, SessionId(1), true, 5));
}

#[test]
fn test_expired_events_pruned() {
  use ChannelEventType::*;
  let ch = ChannelId(1);
  let cache = EventCache::new();
  cache.cache_event(ch, event(Join, 1, 1, 3));
  cache.cache_event(ch, event(Leave, 1, 2, 4));
  assert_eq!(cache.len(ch), 2);
  // Durable membership already reflects both events for anything queued at 4 or later.
  assert!(cache.is_channel_member(ch, SessionId(1), true, 4));
  assert_eq!(cache.len(ch), 0);
  cache.cache_event(ch, event(Join, 1, 4, 9));
  assert!(!cache.is_channel_member_with(ch, SessionId(1), false, 5, &[event(Leave, 1, 5, 9)]));
  cache.remove_channel(ch);
  assert_eq!(cache.len(ch), 0);
}
