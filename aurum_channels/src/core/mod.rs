//! The pieces of the channel subsystem that are not about channels: identifiers, errors,
//! configuration, remoting, task queues, the transactional store and the contracts of external
//! collaborators.
//!
//! Everything here is re-exported flat, so `use aurum_channels::core::*` is enough for most code.

mod config;
mod error;
mod external;
mod ids;
mod remoting;
mod store;
mod task_queue;

#[rustfmt::skip]
pub use {
  config::ChannelConfig,
  error::ChannelError,
  error::RpcError,
  external::ClusterMembership,
  external::Directory,
  external::SessionProtocol,
  external::SessionService,
  ids::ChannelId,
  ids::Delivery,
  ids::MembershipStatus,
  ids::NodeId,
  ids::SessionId,
  ids::Timestamp,
  remoting::Host,
  remoting::Socket,
  remoting::FRAME_HEADER_LEN,
  remoting::read_frame,
  remoting::write_frame,
  store::ChannelEvent,
  store::ChannelEventKind,
  store::ChannelRecord,
  store::EventQueue,
  store::MemoryStore,
  store::SavedMessages,
  store::Transaction,
  store::TransactionRunner,
  store::transact,
  task_queue::Task,
  task_queue::TaskQueue,
  task_queue::TaskScheduler,
  task_queue::TokioScheduler,
  task_queue::task,
};
