use crate::core::{ChannelId, Delivery, SessionId, Timestamp};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A channel request addressed to one session, carried through the routing rule and possibly
/// buffered while the session relocates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelRequest {
  Join {
    name: String,
    channel: ChannelId,
    delivery: Delivery,
  },
  Leave {
    channel: ChannelId,
  },
  Send {
    channel: ChannelId,
    delivery: Delivery,
    message: Arc<Vec<u8>>,
  },
  Close {
    channel: ChannelId,
  },
}
impl ChannelRequest {
  pub fn channel(&self) -> ChannelId {
    match self {
      ChannelRequest::Join { channel, .. } => *channel,
      ChannelRequest::Leave { channel } => *channel,
      ChannelRequest::Send { channel, .. } => *channel,
      ChannelRequest::Close { channel } => *channel,
    }
  }

  pub fn is_send(&self) -> bool {
    matches!(self, ChannelRequest::Send { .. })
  }
}

/// The requests buffered for one timestamp.
#[derive(Debug)]
pub struct PendingRequests {
  pub timestamp: Timestamp,
  pub membership_updates: SmallVec<[ChannelRequest; 2]>,
  pub send_requests: SmallVec<[ChannelRequest; 4]>,
}
impl PendingRequests {
  fn new(timestamp: Timestamp) -> PendingRequests {
    PendingRequests {
      timestamp: timestamp,
      membership_updates: SmallVec::new(),
      send_requests: SmallVec::new(),
    }
  }

  fn add(&mut self, request: ChannelRequest) {
    if request.is_send() {
      self.send_requests.push(request);
    } else {
      self.membership_updates.push(request);
    }
  }

  /// Membership updates first, then sends, each in arrival order.
  pub fn into_ordered(self) -> impl Iterator<Item = ChannelRequest> {
    self.membership_updates.into_iter().chain(self.send_requests.into_iter())
  }
}

struct SessionBuffer {
  buckets: BTreeMap<Timestamp, PendingRequests>,
  drained: watch::Sender<bool>,
  // Keeps the flag alive so a subscriber never sees a closed channel before it is drained.
  _drained_rx: watch::Receiver<bool>,
}

/// Requests for sessions that are relocating into this node, buffered until the session's
/// connection is established here.
#[derive(Default)]
pub struct PendingRelocationQueue {
  sessions: Mutex<HashMap<SessionId, SessionBuffer>>,
}
impl PendingRelocationQueue {
  pub fn new() -> PendingRelocationQueue {
    Self::default()
  }

  pub fn enqueue(&self, session: SessionId, timestamp: Timestamp, request: ChannelRequest) {
    let mut sessions = self.sessions.lock().unwrap();
    let buffer = sessions.entry(session).or_insert_with(|| {
      let (tx, rx) = watch::channel(false);
      SessionBuffer {
        buckets: BTreeMap::new(),
        drained: tx,
        _drained_rx: rx,
      }
    });
    buffer
      .buckets
      .entry(timestamp)
      .or_insert_with(|| PendingRequests::new(timestamp))
      .add(request);
  }

  pub fn has_pending(&self, session: SessionId) -> bool {
    self.sessions.lock().unwrap().contains_key(&session)
  }

  /// Takes every bucket buffered so far, oldest timestamp first. The session stays marked as
  /// pending until [`finish`](Self::finish).
  pub fn take(&self, session: SessionId) -> Vec<PendingRequests> {
    let mut sessions = self.sessions.lock().unwrap();
    match sessions.get_mut(&session) {
      Some(buffer) => std::mem::take(&mut buffer.buckets).into_iter().map(|(_, p)| p).collect(),
      None => Vec::new(),
    }
  }

  /// Forgets the session and wakes everyone waiting for it to drain. Returns false if nothing
  /// was buffered for it.
  pub fn finish(&self, session: SessionId) -> bool {
    match self.sessions.lock().unwrap().remove(&session) {
      Some(buffer) => {
        let _ = buffer.drained.send(true);
        true
      }
      None => false,
    }
  }

  /// Waits until the session's buffered requests are drained or discarded, for at most
  /// `timeout`. Returns false if it timed out.
  pub async fn wait_drained(&self, session: SessionId, timeout: Duration) -> bool {
    let mut rx = match self.sessions.lock().unwrap().get(&session) {
      Some(buffer) => buffer.drained.subscribe(),
      None => return true,
    };
    let wait = async move {
      while !*rx.borrow() {
        if rx.changed().await.is_err() {
          break;
        }
      }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
  }
}

#[cfg(test)]
fn send(channel: u64, msg: u8) -> ChannelRequest {
  ChannelRequest::Send {
    channel: ChannelId(channel),
    delivery: Delivery::Reliable,
    message: Arc::new(vec![msg]),
  }
}

#[test]
fn test_buckets_ordered_membership_first() {
  let queue = PendingRelocationQueue::new();
  let s = SessionId(1);
  queue.enqueue(s, 7, send(1, 1));
  queue.enqueue(s, 5, send(1, 0));
  queue.enqueue(s, 7, ChannelRequest::Leave { channel: ChannelId(2) });
  queue.enqueue(s, 7, send(1, 2));
  let order = queue
    .take(s)
    .into_iter()
    .flat_map(|p| p.into_ordered())
    .collect::<Vec<_>>();
  assert_eq!(
    order,
    vec![
      send(1, 0),
      ChannelRequest::Leave { channel: ChannelId(2) },
      send(1, 1),
      send(1, 2)
    ]
  );
  assert!(queue.has_pending(s));
  assert!(queue.take(s).is_empty());
  assert!(queue.finish(s));
  assert!(!queue.has_pending(s));
}

#[test]
fn test_wait_drained() {
  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(2)
    .enable_time()
    .build()
    .unwrap();
  rt.block_on(async {
    let queue = Arc::new(PendingRelocationQueue::new());
    let s = SessionId(1);
    assert!(queue.wait_drained(s, Duration::from_millis(10)).await);
    queue.enqueue(s, 1, send(1, 1));
    assert!(!queue.wait_drained(s, Duration::from_millis(50)).await);
    let q = queue.clone();
    let waiter = tokio::spawn(async move { q.wait_drained(s, Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.finish(s);
    assert!(waiter.await.unwrap());
  });
}
