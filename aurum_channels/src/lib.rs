//! Distributed channels for a cluster of [`Aurum`] nodes. A channel is a named multicast group
//! whose member sessions are spread across the cluster. One node at a time coordinates a channel:
//! it owns the channel's durable event queue and orders joins, leaves, sends and closes. Every
//! node with local members runs a [`ChannelServer`](crate::channel::ChannelServer) that applies
//! the coordinator's notifications to its local membership and delivers messages to connected
//! sessions.
//!
//! ### Layout
//! - [`core`](crate::core) holds the identifiers, configuration, errors, remoting, task queues,
//!   and the contracts of the collaborators this crate does not own (durable store, directory,
//!   session layer, cluster membership).
//! - [`channel`](crate::channel) is the subsystem itself: local membership, the event cache,
//!   buffering for relocating sessions, the coordinator, relocation and recovery.
//! - [`testkit`](crate::testkit) has the logger and in-memory collaborators used to run whole
//!   clusters inside one process.
//!
//! ### Starting a Node
//! ```ignore
//! let collab = Collaborators {
//!   store: store.clone(),
//!   directory: directory.clone(),
//!   sessions: sessions.clone(),
//!   cluster: cluster.clone(),
//!   scheduler: Arc::new(TokioScheduler::new()),
//! };
//! let service = ChannelService::start(ChannelConfig::default(), collab).await?;
//! let channel = service.create_channel("lobby".to_string(), Delivery::Reliable)?;
//! service.join(channel, session)?;
//! service.send(channel, None, b"welcome".to_vec())?;
//! ```
//!
//! ### Logging
//! Define a [`LogLevel`](crate::testkit::LogLevel) for your module and call one of the log
//! macros: [`trace`](crate::trace), [`debug`](crate::debug), [`info`](crate::info),
//! [`warn`](crate::warn), [`error`](crate::error) or [`fatal`](crate::fatal). They all take the
//! module level, a [`LoggerRef`](crate::testkit::LoggerRef) and format arguments.
//!
//! [`Aurum`]: https://github.com/arjunlalshukla/aurum_actors

pub mod channel;
pub mod core;
pub mod testkit;
