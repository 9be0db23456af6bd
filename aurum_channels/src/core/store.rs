//! The durable side of channels: channel metadata, the per-channel event queue, and the
//! transactions that read and modify them.

use crate::core::{ChannelError, ChannelId, Delivery, NodeId, SessionId, Timestamp};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_ATTEMPTS: usize = 8;

/// What happened to a channel, waiting in its event queue for the coordinator.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ChannelEventKind {
  Join(SessionId),
  Leave(SessionId),
  /// `sender_was_member` is the sender's durable membership when the event was queued. The
  /// coordinator folds later processed joins and leaves into it with the event cache.
  Send {
    sender: Option<SessionId>,
    sender_was_member: bool,
    message: Vec<u8>,
  },
  Close,
}

/// An event and its position in the channel's event queue.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChannelEvent {
  pub timestamp: Timestamp,
  pub kind: ChannelEventKind,
}

/// A channel's durable FIFO of events. Timestamps are handed out in queue order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventQueue {
  next_timestamp: Timestamp,
  events: im::Vector<ChannelEvent>,
}
impl EventQueue {
  fn new() -> EventQueue {
    EventQueue {
      next_timestamp: 1,
      events: im::Vector::new(),
    }
  }

  /// Appends an event, returning its timestamp.
  pub fn offer(&mut self, kind: ChannelEventKind) -> Timestamp {
    let timestamp = self.next_timestamp;
    self.next_timestamp += 1;
    self.events.push_back(ChannelEvent {
      timestamp: timestamp,
      kind: kind,
    });
    timestamp
  }

  pub fn poll(&mut self) -> Option<ChannelEvent> {
    self.events.pop_front()
  }

  /// The timestamp the next offered event will get. Events queued from now on already see every
  /// change committed so far.
  pub fn next_timestamp(&self) -> Timestamp {
    self.next_timestamp
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }
}

/// Recent RELIABLE messages by timestamp, bounded by their total size. The newest message is
/// always kept, even if it alone is over capacity.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SavedMessages {
  capacity: usize,
  bytes: usize,
  messages: im::OrdMap<Timestamp, Vec<u8>>,
}
impl SavedMessages {
  pub fn new(capacity: usize) -> SavedMessages {
    SavedMessages {
      capacity: capacity,
      bytes: 0,
      messages: im::OrdMap::new(),
    }
  }

  pub fn push(&mut self, timestamp: Timestamp, message: Vec<u8>) {
    self.bytes += message.len();
    self.messages.insert(timestamp, message);
    while self.bytes > self.capacity && self.messages.len() > 1 {
      let oldest = match self.messages.get_min() {
        Some((timestamp, _)) => *timestamp,
        None => break,
      };
      if let Some(message) = self.messages.remove(&oldest) {
        self.bytes -= message.len();
      }
    }
  }

  /// Messages with timestamps in `from..=to`.
  pub fn range(&self, from: Timestamp, to: Timestamp) -> BTreeMap<Timestamp, Vec<u8>> {
    self
      .messages
      .range(from..=to)
      .map(|(ts, msg)| (*ts, msg.clone()))
      .collect()
  }

  pub fn all(&self) -> BTreeMap<Timestamp, Vec<u8>> {
    self.messages.iter().map(|(ts, msg)| (*ts, msg.clone())).collect()
  }

  pub fn len(&self) -> usize {
    self.messages.len()
  }
}

/// Durable channel metadata.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChannelRecord {
  pub id: ChannelId,
  pub name: String,
  pub delivery: Delivery,
  /// The node that orders this channel's events.
  pub coordinator: NodeId,
  /// Every node that has, or recently had, members of this channel.
  pub servers: im::OrdSet<NodeId>,
  /// Durable membership: each member session and the node it was on when it joined.
  pub members: im::OrdMap<SessionId, NodeId>,
  /// The timestamp of the last message sent.
  pub msg_timestamp: Timestamp,
  pub closed: bool,
  pub events: EventQueue,
  pub saved: SavedMessages,
  /// Set when the coordinator is reassigned. The new coordinator re-sends its saved messages.
  pub retransmit: bool,
}
impl ChannelRecord {
  pub fn new(
    id: ChannelId,
    name: String,
    delivery: Delivery,
    coordinator: NodeId,
    write_buffer_size: usize,
  ) -> ChannelRecord {
    ChannelRecord {
      id: id,
      name: name,
      delivery: delivery,
      coordinator: coordinator,
      servers: im::OrdSet::new(),
      members: im::OrdMap::new(),
      msg_timestamp: 0,
      closed: false,
      events: EventQueue::new(),
      saved: SavedMessages::new(write_buffer_size),
      retransmit: false,
    }
  }

  pub fn is_member(&self, session: SessionId) -> bool {
    self.members.contains_key(&session)
  }

  /// Forgets `node` as a server and every member that was on it. True if anything changed.
  pub fn remove_node(&mut self, node: NodeId) -> bool {
    let stale = self
      .members
      .iter()
      .filter(|(_, n)| **n == node)
      .map(|(s, _)| *s)
      .collect::<Vec<_>>();
    for session in stale.iter() {
      self.members.remove(session);
    }
    self.servers.remove(&node).is_some() || !stale.is_empty()
  }
}

#[derive(Clone, Default)]
struct StoreState {
  channels: im::HashMap<ChannelId, ChannelRecord>,
  names: im::HashMap<String, ChannelId>,
  versions: im::HashMap<ChannelId, u64>,
  names_version: u64,
  next_id: u64,
}

type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// One attempt at a unit of work. Reads and writes go to a private copy of the store which is
/// published in full on commit, or thrown away.
pub struct Transaction {
  id: u64,
  created: Instant,
  timeout: Duration,
  state: StoreState,
  touched: HashSet<ChannelId>,
  written: HashSet<ChannelId>,
  names_touched: bool,
  names_written: bool,
  hooks: Vec<CommitHook>,
}
impl Transaction {
  fn begin(state: StoreState, timeout: Duration) -> Transaction {
    Transaction {
      id: rand::random(),
      created: Instant::now(),
      timeout: timeout,
      state: state,
      touched: HashSet::new(),
      written: HashSet::new(),
      names_touched: false,
      names_written: false,
      hooks: Vec::new(),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn created(&self) -> Instant {
    self.created
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// What is left of this transaction's timeout.
  pub fn remaining(&self) -> Duration {
    self.timeout.checked_sub(self.created.elapsed()).unwrap_or_default()
  }

  pub fn channel(&mut self, id: ChannelId) -> Option<&ChannelRecord> {
    self.touched.insert(id);
    self.state.channels.get(&id)
  }

  pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
    self.touched.insert(id);
    self.written.insert(id);
    self.state.channels.get_mut(&id)
  }

  pub fn channel_by_name(&mut self, name: &str) -> Option<ChannelId> {
    self.names_touched = true;
    self.state.names.get(name).cloned()
  }

  /// Every channel id in the store, in no particular order.
  pub fn channel_ids(&mut self) -> Vec<ChannelId> {
    let ids = self.state.channels.keys().cloned().collect::<Vec<_>>();
    self.touched.extend(ids.iter().cloned());
    ids
  }

  pub fn allocate_channel_id(&mut self) -> ChannelId {
    self.names_touched = true;
    self.names_written = true;
    self.state.next_id += 1;
    ChannelId(self.state.next_id)
  }

  pub fn put_channel(&mut self, record: ChannelRecord) {
    self.names_touched = true;
    self.names_written = true;
    self.touched.insert(record.id);
    self.written.insert(record.id);
    self.state.names.insert(record.name.clone(), record.id);
    self.state.channels.insert(record.id, record);
  }

  pub fn remove_channel(&mut self, id: ChannelId) -> Option<ChannelRecord> {
    self.touched.insert(id);
    self.written.insert(id);
    let record = self.state.channels.remove(&id)?;
    if self.state.names.get(&record.name) == Some(&id) {
      self.names_touched = true;
      self.names_written = true;
      self.state.names.remove(&record.name);
    }
    Some(record)
  }

  /// Runs `hook` after this transaction commits. Hooks run in commit order across transactions,
  /// and are dropped if the transaction aborts.
  pub fn on_commit<F: FnOnce() + Send + 'static>(&mut self, hook: F) {
    self.hooks.push(Box::new(hook));
  }

  fn read_only(&self) -> bool {
    self.written.is_empty() && !self.names_written
  }
}

/// Runs units of work atomically against the durable store.
pub trait TransactionRunner: Send + Sync {
  /// Runs `work` until it commits, fails, or times out. A unit of work that returns an error is
  /// aborted and its error returned. The work may be run more than once.
  fn run_transactionally(
    &self,
    timeout: Duration,
    work: &mut dyn FnMut(&mut Transaction) -> Result<(), ChannelError>,
  ) -> Result<(), ChannelError>;
}

/// Runs `work` with `runner` and hands back what the committed attempt returned.
pub fn transact<R, F>(
  runner: &dyn TransactionRunner,
  timeout: Duration,
  mut work: F,
) -> Result<R, ChannelError>
where
  F: FnMut(&mut Transaction) -> Result<R, ChannelError>,
{
  let mut out = None;
  runner.run_transactionally(timeout, &mut |txn| {
    out = Some(work(txn)?);
    Ok(())
  })?;
  out.ok_or(ChannelError::TransactionConflict)
}

struct Committed {
  state: StoreState,
  version: u64,
}

/// A [`TransactionRunner`] over in-memory persistent maps, shared by every node of an
/// in-process cluster. Concurrency control is optimistic: a transaction commits only if no
/// channel it read was committed by someone else since it started.
pub struct MemoryStore {
  committed: Mutex<Committed>,
}
impl MemoryStore {
  pub fn new() -> MemoryStore {
    MemoryStore {
      committed: Mutex::new(Committed {
        state: StoreState::default(),
        version: 0,
      }),
    }
  }

  /// How many transactions have committed changes.
  pub fn version(&self) -> u64 {
    self.committed.lock().map(|c| c.version).unwrap_or(0)
  }

  fn snapshot(&self) -> StoreState {
    match self.committed.lock() {
      Ok(c) => c.state.clone(),
      Err(poisoned) => poisoned.into_inner().state.clone(),
    }
  }

  fn try_commit(&self, snapshot_versions: &StoreState, txn: Transaction) -> bool {
    let mut committed = match self.committed.lock() {
      Ok(c) => c,
      Err(poisoned) => poisoned.into_inner(),
    };
    let cur = &committed.state;
    let stale = txn
      .touched
      .iter()
      .any(|id| cur.versions.get(id) != snapshot_versions.versions.get(id))
      || (txn.names_touched && cur.names_version != snapshot_versions.names_version);
    if stale {
      return false;
    }
    let Transaction {
      state, written, names_written, hooks, ..
    } = txn;
    if !written.is_empty() || names_written {
      let next = &mut committed.state;
      for id in written {
        match state.channels.get(&id) {
          Some(record) => {
            next.channels.insert(id, record.clone());
          }
          None => {
            next.channels.remove(&id);
          }
        }
        let version = next.versions.get(&id).cloned().unwrap_or(0) + 1;
        next.versions.insert(id, version);
      }
      if names_written {
        next.names = state.names.clone();
        next.names_version += 1;
        next.next_id = std::cmp::max(next.next_id, state.next_id);
      }
      committed.version += 1;
    }
    // Still holding the lock, so hooks of later commits cannot overtake these.
    for hook in hooks {
      hook();
    }
    true
  }
}
impl TransactionRunner for MemoryStore {
  fn run_transactionally(
    &self,
    timeout: Duration,
    work: &mut dyn FnMut(&mut Transaction) -> Result<(), ChannelError>,
  ) -> Result<(), ChannelError> {
    let start = Instant::now();
    for _ in 0..MAX_ATTEMPTS {
      let snapshot = self.snapshot();
      let mut txn = Transaction::begin(snapshot.clone(), timeout);
      work(&mut txn)?;
      if start.elapsed() > timeout {
        return Err(ChannelError::TransactionTimeout);
      }
      if txn.read_only() && txn.hooks.is_empty() {
        return Ok(());
      }
      if self.try_commit(&snapshot, txn) {
        return Ok(());
      }
    }
    Err(ChannelError::TransactionConflict)
  }
}

#[cfg(test)]
fn test_record(txn: &mut Transaction, name: &str) -> ChannelId {
  let id = txn.allocate_channel_id();
  txn.put_channel(ChannelRecord::new(id, name.to_string(), Delivery::Reliable, NodeId(1), 8192));
  id
}

#[test]
fn test_commit_and_abort() {
  let store = MemoryStore::new();
  let id = transact(&store, Duration::from_secs(1), |txn| Ok(test_record(txn, "a"))).unwrap();
  let res: Result<(), ChannelError> = transact(&store, Duration::from_secs(1), |txn| {
    txn.channel_mut(id).unwrap().msg_timestamp = 99;
    Err(ChannelError::ChannelClosed)
  });
  assert!(matches!(res, Err(ChannelError::ChannelClosed)));
  let ts = transact(&store, Duration::from_secs(1), |txn| {
    Ok(txn.channel(id).map(|c| c.msg_timestamp))
  })
  .unwrap();
  assert_eq!(ts, Some(0));
  let by_name =
    transact(&store, Duration::from_secs(1), |txn| Ok(txn.channel_by_name("a"))).unwrap();
  assert_eq!(by_name, Some(id));
}

#[test]
fn test_conflicting_commit_retries() {
  let store = MemoryStore::new();
  let id = transact(&store, Duration::from_secs(1), |txn| Ok(test_record(txn, "a"))).unwrap();
  let mut attempts = 0;
  transact(&store, Duration::from_secs(1), |txn| {
    attempts += 1;
    txn.channel_mut(id).unwrap().msg_timestamp += 1;
    if attempts == 1 {
      // Another node commits to the same channel in between.
      transact(&store, Duration::from_secs(1), |other| {
        other.channel_mut(id).unwrap().msg_timestamp += 10;
        Ok(())
      })?;
    }
    Ok(())
  })
  .unwrap();
  assert_eq!(attempts, 2);
  let ts =
    transact(&store, Duration::from_secs(1), |txn| Ok(txn.channel(id).unwrap().msg_timestamp))
      .unwrap();
  assert_eq!(ts, 11);
}

#[test]
fn test_hooks_run_only_on_commit() {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  let store = MemoryStore::new();
  let ran = Arc::new(AtomicUsize::new(0));
  let r = ran.clone();
  let _ = transact(&store, Duration::from_secs(1), move |txn| -> Result<(), ChannelError> {
    let r = r.clone();
    txn.on_commit(move || {
      r.fetch_add(1, Ordering::SeqCst);
    });
    Err(ChannelError::ChannelNotFound)
  });
  assert_eq!(ran.load(Ordering::SeqCst), 0);
  let r = ran.clone();
  transact(&store, Duration::from_secs(1), move |txn| {
    let r = r.clone();
    txn.on_commit(move || {
      r.fetch_add(1, Ordering::SeqCst);
    });
    Ok(())
  })
  .unwrap();
  assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_saved_messages_bounded() {
  let mut saved = SavedMessages::new(10);
  saved.push(1, vec![0; 4]);
  saved.push(2, vec![0; 4]);
  saved.push(3, vec![0; 4]);
  assert_eq!(saved.all().keys().cloned().collect::<Vec<_>>(), vec![2, 3]);
  saved.push(4, vec![0; 40]);
  assert_eq!(saved.all().keys().cloned().collect::<Vec<_>>(), vec![4]);
  assert!(saved.range(1, 3).is_empty());
}

#[test]
fn test_slow_work_times_out() {
  let store = MemoryStore::new();
  let timeout = Duration::from_millis(50);
  let mut ids = Vec::new();
  let res: Result<(), ChannelError> = transact(&store, timeout, |txn| {
    assert_eq!(txn.timeout(), timeout);
    assert!(txn.remaining() <= timeout);
    ids.push(txn.id());
    std::thread::sleep(timeout * 2);
    assert!(txn.created().elapsed() >= timeout);
    assert_eq!(txn.remaining(), Duration::from_secs(0));
    test_record(txn, "slow");
    Ok(())
  });
  assert!(matches!(res, Err(ChannelError::TransactionTimeout)));
  assert_eq!(ids.len(), 1);
  assert_eq!(store.version(), 0);
}
