use crate::core::{ChannelId, Delivery, SessionId, Timestamp};
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;

/// The members of a channel connected to this node, and the timestamp of the last message
/// delivered to them.
pub struct LocalChannelState {
  pub members: HashSet<SessionId>,
  pub msg_timestamp: Timestamp,
}

/// A channel with members on this node. The lock around the state is what keeps the member set
/// and the timestamp consistent while joins, leaves and sends race each other.
pub struct LocalChannelInfo {
  pub channel: ChannelId,
  pub delivery: Delivery,
  pub state: AsyncMutex<LocalChannelState>,
  /// Taken for the whole of a send or close, so deliveries on the channel happen one message at
  /// a time.
  pub sending: AsyncMutex<()>,
}
impl LocalChannelInfo {
  fn new(channel: ChannelId, delivery: Delivery, msg_timestamp: Timestamp) -> LocalChannelInfo {
    LocalChannelInfo {
      channel: channel,
      delivery: delivery,
      state: AsyncMutex::new(LocalChannelState {
        members: HashSet::new(),
        msg_timestamp: msg_timestamp,
      }),
      sending: AsyncMutex::new(()),
    }
  }
}

/// One session's membership in one local channel.
pub struct LocalMemberInfo {
  /// Does not keep the channel alive. Only the channel table owns it.
  pub channel_info: Weak<LocalChannelInfo>,
  pub delivery: Delivery,
  /// The last message timestamp this session received on the channel, or when it joined if it
  /// has not received anything since.
  pub msg_timestamp: Timestamp,
}

/// What a relocating session takes with it for each of its channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberSnapshot {
  pub channel: ChannelId,
  pub delivery: Delivery,
  pub msg_timestamp: Timestamp,
}

/// Both directions of local membership: channel to members, and session to channels.
#[derive(Default)]
pub struct LocalMembershipTable {
  channels: RwLock<HashMap<ChannelId, Arc<LocalChannelInfo>>>,
  sessions: Mutex<HashMap<SessionId, HashMap<ChannelId, LocalMemberInfo>>>,
}
impl LocalMembershipTable {
  pub fn new() -> LocalMembershipTable {
    Self::default()
  }

  pub fn channel(&self, channel: ChannelId) -> Option<Arc<LocalChannelInfo>> {
    self.channels.read().unwrap().get(&channel).cloned()
  }

  /// Returns the channel's info, creating it with `msg_timestamp` if missing. The flag is true if
  /// this call created it.
  pub fn channel_or_insert(
    &self,
    channel: ChannelId,
    delivery: Delivery,
    msg_timestamp: Timestamp,
  ) -> (Arc<LocalChannelInfo>, bool) {
    if let Some(info) = self.channel(channel) {
      return (info, false);
    }
    let mut channels = self.channels.write().unwrap();
    let mut created = false;
    let info = channels
      .entry(channel)
      .or_insert_with(|| {
        created = true;
        Arc::new(LocalChannelInfo::new(channel, delivery, msg_timestamp))
      })
      .clone();
    (info, created)
  }

  pub fn remove_channel(&self, channel: ChannelId) -> Option<Arc<LocalChannelInfo>> {
    self.channels.write().unwrap().remove(&channel)
  }

  pub fn channel_ids(&self) -> Vec<ChannelId> {
    self.channels.read().unwrap().keys().cloned().collect()
  }

  pub fn put_member_info(
    &self,
    session: SessionId,
    info: &Arc<LocalChannelInfo>,
    msg_timestamp: Timestamp,
  ) {
    let member = LocalMemberInfo {
      channel_info: Arc::downgrade(info),
      delivery: info.delivery,
      msg_timestamp: msg_timestamp,
    };
    let mut sessions = self.sessions.lock().unwrap();
    sessions.entry(session).or_default().insert(info.channel, member);
  }

  pub fn member_timestamp(&self, session: SessionId, channel: ChannelId) -> Option<Timestamp> {
    let sessions = self.sessions.lock().unwrap();
    sessions.get(&session)?.get(&channel).map(|m| m.msg_timestamp)
  }

  /// Records that `session` received the message at `timestamp`, unless it already received that
  /// message or a later one. Returns whether the message should be delivered.
  pub fn advance_member(
    &self,
    session: SessionId,
    channel: ChannelId,
    timestamp: Timestamp,
  ) -> bool {
    let mut sessions = self.sessions.lock().unwrap();
    match sessions.get_mut(&session).and_then(|m| m.get_mut(&channel)) {
      Some(member) if member.msg_timestamp < timestamp => {
        member.msg_timestamp = timestamp;
        true
      }
      _ => false,
    }
  }

  pub fn remove_member_info(
    &self,
    session: SessionId,
    channel: ChannelId,
  ) -> Option<LocalMemberInfo> {
    let mut sessions = self.sessions.lock().unwrap();
    let channels = sessions.get_mut(&session)?;
    let removed = channels.remove(&channel);
    if channels.is_empty() {
      sessions.remove(&session);
    }
    removed
  }

  pub fn has_session(&self, session: SessionId) -> bool {
    self.sessions.lock().unwrap().contains_key(&session)
  }

  /// The session's channels, delivery modes and last received timestamps, sorted by channel.
  pub fn session_snapshot(&self, session: SessionId) -> Vec<MemberSnapshot> {
    let sessions = self.sessions.lock().unwrap();
    let mut snapshot = sessions
      .get(&session)
      .map(|channels| {
        channels
          .iter()
          .map(|(channel, member)| MemberSnapshot {
            channel: *channel,
            delivery: member.delivery,
            msg_timestamp: member.msg_timestamp,
          })
          .collect::<Vec<_>>()
      })
      .unwrap_or_default();
    snapshot.sort_by_key(|m| m.channel);
    snapshot
  }

  pub fn remove_session(&self, session: SessionId) -> Option<HashMap<ChannelId, LocalMemberInfo>> {
    self.sessions.lock().unwrap().remove(&session)
  }

  pub async fn add_member(&self, info: &LocalChannelInfo, session: SessionId) {
    info.state.lock().await.members.insert(session);
  }

  pub async fn remove_member(&self, channel: ChannelId, session: SessionId) {
    if let Some(info) = self.channel(channel) {
      info.state.lock().await.members.remove(&session);
    }
  }

  pub async fn is_member(&self, channel: ChannelId, session: SessionId) -> bool {
    match self.channel(channel) {
      Some(info) => info.state.lock().await.members.contains(&session),
      None => false,
    }
  }

  pub async fn members(&self, channel: ChannelId) -> Vec<SessionId> {
    match self.channel(channel) {
      Some(info) => {
        let mut members = info.state.lock().await.members.iter().cloned().collect::<Vec<_>>();
        members.sort();
        members
      }
      None => Vec::new(),
    }
  }

  /// Drops every trace of `session` from this node's membership.
  pub async fn remove_session_from_all_channels(&self, session: SessionId) {
    let channels = match self.remove_session(session) {
      Some(channels) => channels,
      None => return,
    };
    for (channel, member) in channels {
      match member.channel_info.upgrade() {
        Some(info) => {
          info.state.lock().await.members.remove(&session);
        }
        None => self.remove_member(channel, session).await,
      }
    }
  }
}

#[test]
fn test_session_removal_clears_both_maps() {
  tokio_test::block_on(async {
    let table = LocalMembershipTable::new();
    let s = SessionId(1);
    for ch in 1..4u64 {
      let (info, created) = table.channel_or_insert(ChannelId(ch), Delivery::Reliable, 5);
      assert!(created);
      table.add_member(&info, s).await;
      table.put_member_info(s, &info, 5);
    }
    let (_, created) = table.channel_or_insert(ChannelId(1), Delivery::Reliable, 9);
    assert!(!created);
    assert_eq!(table.session_snapshot(s).len(), 3);
    assert!(table.is_member(ChannelId(2), s).await);
    table.remove_session_from_all_channels(s).await;
    assert!(!table.has_session(s));
    for ch in 1..4u64 {
      assert!(!table.is_member(ChannelId(ch), s).await);
    }
  });
}

#[test]
fn test_advance_member_is_at_most_once() {
  let table = LocalMembershipTable::new();
  let s = SessionId(1);
  let (info, _) = table.channel_or_insert(ChannelId(1), Delivery::Reliable, 10);
  table.put_member_info(s, &info, 10);
  assert!(!table.advance_member(s, ChannelId(1), 10));
  assert!(table.advance_member(s, ChannelId(1), 11));
  assert!(!table.advance_member(s, ChannelId(1), 11));
  assert!(!table.advance_member(s, ChannelId(2), 12));
  assert_eq!(table.member_timestamp(s, ChannelId(1)), Some(11));
}
