use std::fmt;

/// A failure talking to a peer's channel server. Callers treat every variant as "peer
/// unreachable", never as a denial.
#[derive(Debug)]
pub enum RpcError {
  /// Connecting, reading or writing failed.
  Io(std::io::Error),
  /// The peer did not answer within the configured RPC timeout.
  Timeout,
  /// A frame could not be encoded or decoded.
  Codec(String),
  /// The peer answered with a reply of the wrong shape.
  Unexpected,
  /// No endpoint is published for the node.
  NoServer,
}
impl fmt::Display for RpcError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RpcError::Io(e) => write!(f, "rpc io error: {}", e),
      RpcError::Timeout => write!(f, "rpc timed out"),
      RpcError::Codec(s) => write!(f, "rpc codec error: {}", s),
      RpcError::Unexpected => write!(f, "unexpected rpc reply"),
      RpcError::NoServer => write!(f, "no channel server published for node"),
    }
  }
}
impl std::error::Error for RpcError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      RpcError::Io(e) => Some(e),
      _ => None,
    }
  }
}
impl From<std::io::Error> for RpcError {
  fn from(e: std::io::Error) -> Self {
    RpcError::Io(e)
  }
}
impl From<serde_cbor::Error> for RpcError {
  fn from(e: serde_cbor::Error) -> Self {
    RpcError::Codec(e.to_string())
  }
}

/// Errors surfaced by the channel subsystem.
#[derive(Debug)]
pub enum ChannelError {
  /// A peer could not be reached.
  Rpc(RpcError),
  /// A transaction ran past its timeout, including a membership snapshot that did not complete
  /// within the remaining budget.
  TransactionTimeout,
  /// A transaction kept conflicting with concurrent commits and was given up.
  TransactionConflict,
  /// The channel has been closed.
  ChannelClosed,
  /// There is no channel with that id.
  ChannelNotFound,
  /// A channel with that name already exists.
  NameInUse(String),
  /// The session protocol layer failed to deliver.
  Protocol(String),
  /// The configuration did not validate.
  Config(String),
}
impl fmt::Display for ChannelError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ChannelError::Rpc(e) => write!(f, "{}", e),
      ChannelError::TransactionTimeout => write!(f, "transaction timed out"),
      ChannelError::TransactionConflict => write!(f, "transaction conflicted too many times"),
      ChannelError::ChannelClosed => write!(f, "channel is closed"),
      ChannelError::ChannelNotFound => write!(f, "channel not found"),
      ChannelError::NameInUse(n) => write!(f, "channel name already in use: {}", n),
      ChannelError::Protocol(s) => write!(f, "session protocol failure: {}", s),
      ChannelError::Config(s) => write!(f, "invalid configuration: {}", s),
    }
  }
}
impl std::error::Error for ChannelError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      ChannelError::Rpc(e) => Some(e),
      _ => None,
    }
  }
}
impl From<RpcError> for ChannelError {
  fn from(e: RpcError) -> Self {
    ChannelError::Rpc(e)
  }
}
impl From<std::io::Error> for ChannelError {
  fn from(e: std::io::Error) -> Self {
    ChannelError::Rpc(RpcError::Io(e))
  }
}
