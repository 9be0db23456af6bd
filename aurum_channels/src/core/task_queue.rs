use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A unit of work handed to a [`TaskQueue`] or a [`TaskScheduler`].
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Boxes a future into a [`Task`].
pub fn task<F: Future<Output = ()> + Send + 'static>(f: F) -> Task {
  Box::pin(f)
}

/// Runs its tasks one at a time, in the order they were added.
pub trait TaskQueue: Send + Sync {
  /// Appends a task. Returns false if the queue no longer runs tasks.
  fn add_task(&self, task: Task) -> bool;
}

/// Creates task queues and runs independent tasks.
pub trait TaskScheduler: Send + Sync {
  /// Creates a new, empty FIFO queue.
  fn create_queue(&self) -> Arc<dyn TaskQueue>;

  /// Runs a task with no ordering relative to any other task.
  fn schedule(&self, task: Task);
}

/// A [`TaskScheduler`] backed by the tokio runtime it was created on.
#[derive(Clone)]
pub struct TokioScheduler {
  rt: Handle,
}
impl TokioScheduler {
  /// Must be called from within a tokio runtime.
  pub fn new() -> TokioScheduler {
    TokioScheduler {
      rt: Handle::current(),
    }
  }

  /// Uses a specific runtime.
  pub fn with_handle(rt: Handle) -> TokioScheduler {
    TokioScheduler { rt: rt }
  }
}
impl TaskScheduler for TokioScheduler {
  fn create_queue(&self) -> Arc<dyn TaskQueue> {
    let (tx, rx) = unbounded_channel();
    self.rt.spawn(run_queue(rx));
    Arc::new(TokioQueue { tx: tx })
  }

  fn schedule(&self, task: Task) {
    self.rt.spawn(task);
  }
}

struct TokioQueue {
  tx: UnboundedSender<Task>,
}
impl TaskQueue for TokioQueue {
  fn add_task(&self, task: Task) -> bool {
    self.tx.send(task).is_ok()
  }
}

// The queue dies once every handle to it is dropped and the backlog is done.
async fn run_queue(mut rx: UnboundedReceiver<Task>) {
  while let Some(task) = rx.recv().await {
    task.await;
  }
}

#[test]
fn test_queue_runs_in_order() {
  use std::sync::Mutex;
  use std::time::Duration;
  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(4)
    .enable_time()
    .build()
    .unwrap();
  let scheduler = TokioScheduler::with_handle(rt.handle().clone());
  let queue = scheduler.create_queue();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (done_tx, done_rx) = crossbeam::channel::bounded(1);
  for i in 0..20u64 {
    let seen = seen.clone();
    queue.add_task(task(async move {
      // Later tasks sleep less, so any overlap would reorder them.
      tokio::time::sleep(Duration::from_millis(20 - i)).await;
      seen.lock().unwrap().push(i);
    }));
  }
  queue.add_task(task(async move {
    done_tx.send(()).unwrap();
  }));
  done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
}
