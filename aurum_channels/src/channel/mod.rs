//! The channel subsystem proper. [`ChannelService`] is the entry point; [`ChannelServer`] is the
//! surface nodes call on each other.

use crate::testkit::LogLevel;

mod coordinator;
mod event_cache;
mod local_membership;
mod node;
mod pending;
mod recovery;
mod relocation;
mod rpc;
mod server;
mod service;

pub const LOG_LEVEL: LogLevel = LogLevel::Warn;

#[rustfmt::skip]
pub(crate) use {
  coordinator::TxnContext,
  node::ChannelNode,
};

#[rustfmt::skip]
pub use {
  coordinator::ChannelQueues,
  coordinator::MembershipSnapshots,
  event_cache::ChannelEventInfo,
  event_cache::ChannelEventType,
  event_cache::EventCache,
  event_cache::fold_membership,
  local_membership::LocalChannelInfo,
  local_membership::LocalChannelState,
  local_membership::LocalMemberInfo,
  local_membership::LocalMembershipTable,
  local_membership::MemberSnapshot,
  pending::ChannelRequest,
  pending::PendingRelocationQueue,
  pending::PendingRequests,
  recovery::CoordinatorRing,
  relocation::RelocationInfo,
  relocation::RelocationTable,
  rpc::RemoteChannelServer,
  rpc::ServerRequest,
  rpc::ServerResponse,
  rpc::dispatch,
  rpc::serve,
  server::ChannelServer,
  server::LocalChannelServer,
  service::ChannelService,
  service::Collaborators,
};
