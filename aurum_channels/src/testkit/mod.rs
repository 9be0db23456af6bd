//! Logging, plus in-memory collaborators for running a cluster of channel services in one
//! process.

mod harness;
mod logging;
mod memory;

#[rustfmt::skip]
pub use {
  harness::TestCluster,
  logging::Logger,
  logging::LoggerMsg,
  logging::LoggerRef,
  logging::LogLevel,
  logging::LogSpecial,
  memory::ClusterView,
  memory::MemoryCluster,
  memory::MemoryDirectory,
  memory::MemorySessions,
  memory::NodeSessions,
  memory::ProtocolEvent,
  memory::RecordingProtocol,
  memory::runtime,
};
