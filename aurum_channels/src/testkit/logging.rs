use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use LoggerMsg::*;

#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize,
)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;
}

pub enum LogSpecial {
  SentBytes(u64),
  RecvdBytes(u64),
}

pub enum LoggerMsg {
  Log(LogLevel, Box<dyn ToString + Send + 'static>),
  SetLevel(LogLevel),
  Special(LogSpecial),
  /// Replies with the bytes sent and received over RPC so far.
  Traffic(oneshot::Sender<(u64, u64)>),
}

/// Prints log lines for one node. Runs as its own task, fed by [`LoggerRef`]s.
pub struct Logger {
  node: NodeId,
  bytes_sent: u64,
  bytes_recvd: u64,
  level: LogLevel,
}
impl Logger {
  pub fn new(node: NodeId, level: LogLevel) -> Self {
    Logger {
      node: node,
      bytes_sent: 0,
      bytes_recvd: 0,
      level: level,
    }
  }

  /// Must be called from within a tokio runtime.
  pub fn spawn(self) -> LoggerRef {
    let (tx, rx) = unbounded_channel();
    tokio::spawn(self.run(rx));
    LoggerRef { tx: Some(tx) }
  }

  fn recv(&mut self, msg: LoggerMsg) {
    match msg {
      Log(level, s) => {
        if level >= self.level {
          println!("[{:?}] node {}: {}", level, self.node, s.to_string());
        }
      }
      SetLevel(level) => self.level = level,
      Special(s) => match s {
        LogSpecial::SentBytes(b) => self.bytes_sent += b,
        LogSpecial::RecvdBytes(b) => self.bytes_recvd += b,
      },
      Traffic(tx) => {
        let _ = tx.send((self.bytes_sent, self.bytes_recvd));
      }
    }
  }

  async fn run(mut self, mut rx: UnboundedReceiver<LoggerMsg>) {
    while let Some(msg) = rx.recv().await {
      self.recv(msg);
    }
  }
}

/// A handle to a [`Logger`]. Cheap to clone. Sending to a logger that is gone does nothing.
#[derive(Clone)]
pub struct LoggerRef {
  tx: Option<UnboundedSender<LoggerMsg>>,
}
impl LoggerRef {
  /// A logger that drops everything.
  pub fn void() -> LoggerRef {
    LoggerRef { tx: None }
  }

  pub fn send(&self, msg: LoggerMsg) -> bool {
    match &self.tx {
      Some(tx) => tx.send(msg).is_ok(),
      None => false,
    }
  }

  pub fn log(&self, level: LogLevel, s: String) {
    self.send(Log(level, Box::new(s)));
  }

  pub fn set_level(&self, level: LogLevel) {
    self.send(SetLevel(level));
  }

  pub fn sent_bytes(&self, bytes: u64) {
    self.send(Special(LogSpecial::SentBytes(bytes)));
  }

  pub fn recvd_bytes(&self, bytes: u64) {
    self.send(Special(LogSpecial::RecvdBytes(bytes)));
  }

  /// Bytes sent and received over RPC, or `None` if the logger is gone.
  pub async fn traffic(&self) -> Option<(u64, u64)> {
    let (tx, rx) = oneshot::channel();
    if !self.send(Traffic(tx)) {
      return None;
    }
    rx.await.ok()
  }
}

#[macro_export]
macro_rules! log {
  ($env_level:expr, $logger:expr, $msg_level:expr, $($arg:tt)+) => {
    if $env_level <= $msg_level {
      $crate::testkit::LoggerRef::log($logger, $msg_level, format!($($arg)+));
    }
  };
}

#[macro_export]
macro_rules! trace {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Trace, $($arg)+)
  };
}

#[macro_export]
macro_rules! debug {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Debug, $($arg)+)
  };
}

#[macro_export]
macro_rules! info {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Info, $($arg)+)
  };
}

#[macro_export]
macro_rules! warn {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Warn, $($arg)+)
  };
}

#[macro_export]
macro_rules! error {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Error, $($arg)+)
  };
}

#[macro_export]
macro_rules! fatal {
  ($env_level:expr, $logger:expr, $($arg:tt)+) => {
    $crate::log!($env_level, $logger, $crate::testkit::LogLevel::Fatal, $($arg)+)
  };
}

#[test]
fn test_logger_counts_traffic() {
  let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
  rt.block_on(async {
    let logger = Logger::new(NodeId(1), LogLevel::Off).spawn();
    logger.sent_bytes(10);
    logger.recvd_bytes(3);
    logger.sent_bytes(5);
    crate::info!(LogLevel::Trace, &logger, "not printed at {:?}", LogLevel::Off);
    assert_eq!(logger.traffic().await, Some((15, 3)));
    assert_eq!(LoggerRef::void().traffic().await, None);
  });
}
