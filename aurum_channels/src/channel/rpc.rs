//! The wire side of [`ChannelServer`]: a proxy that calls a peer's server over TCP, and the accept
//! loop that answers those calls with the local server. Every call is one connection carrying one
//! request frame and one response frame.

use crate::channel::{ChannelServer, MemberSnapshot, LOG_LEVEL};
use crate::core::{
  read_frame, write_frame, ChannelId, Delivery, MembershipStatus, NodeId, RpcError, SessionId,
  Socket, Timestamp,
};
use crate::testkit::LoggerRef;
use crate::{debug, trace, warn};
use async_trait::async_trait;
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ServerRequest {
  ServiceEventQueue {
    channel: ChannelId,
  },
  IsMember {
    channel: ChannelId,
    session: SessionId,
  },
  Join {
    name: String,
    channel: ChannelId,
    delivery: Delivery,
    timestamp: Timestamp,
    session: SessionId,
  },
  Leave {
    channel: ChannelId,
    timestamp: Timestamp,
    session: SessionId,
  },
  Send {
    channel: ChannelId,
    message: Vec<u8>,
    timestamp: Timestamp,
  },
  Close {
    channel: ChannelId,
    timestamp: Timestamp,
  },
  GetSessions {
    channel: ChannelId,
  },
  RelocateChannelMemberships {
    session: SessionId,
    old_node: NodeId,
    channels: Vec<ChannelId>,
    deliveries: Vec<Delivery>,
    timestamps: Vec<Timestamp>,
  },
  ChannelMembershipsUpdated {
    session: SessionId,
    new_node: NodeId,
  },
}
impl ServerRequest {
  fn relocate(
    session: SessionId,
    old_node: NodeId,
    memberships: &[MemberSnapshot],
  ) -> ServerRequest {
    ServerRequest::RelocateChannelMemberships {
      session: session,
      old_node: old_node,
      channels: memberships.iter().map(|m| m.channel).collect(),
      deliveries: memberships.iter().map(|m| m.delivery).collect(),
      timestamps: memberships.iter().map(|m| m.msg_timestamp).collect(),
    }
  }
}

/// Rebuilds the snapshots of a relocation request. The three lists must be the same length.
fn memberships(
  channels: Vec<ChannelId>,
  deliveries: Vec<Delivery>,
  timestamps: Vec<Timestamp>,
) -> Result<Vec<MemberSnapshot>, RpcError> {
  if channels.len() != deliveries.len() || channels.len() != timestamps.len() {
    return Err(RpcError::Codec(format!(
      "mismatched membership lists: {} channels, {} deliveries, {} timestamps",
      channels.len(),
      deliveries.len(),
      timestamps.len()
    )));
  }
  Ok(
    izip!(channels, deliveries, timestamps)
      .map(|(channel, delivery, msg_timestamp)| MemberSnapshot {
        channel: channel,
        delivery: delivery,
        msg_timestamp: msg_timestamp,
      })
      .collect(),
  )
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ServerResponse {
  Done,
  Accepted(bool),
  Status(MembershipStatus),
  Sessions(Vec<SessionId>),
  Failed(String),
}

/// A peer's channel server, reached over TCP.
pub struct RemoteChannelServer {
  node: NodeId,
  endpoint: Socket,
  timeout: Duration,
  max_frame_bytes: usize,
  logger: LoggerRef,
}
impl RemoteChannelServer {
  pub fn new(
    node: NodeId,
    endpoint: Socket,
    timeout: Duration,
    max_frame_bytes: usize,
    logger: LoggerRef,
  ) -> RemoteChannelServer {
    RemoteChannelServer {
      node: node,
      endpoint: endpoint,
      timeout: timeout,
      max_frame_bytes: max_frame_bytes,
      logger: logger,
    }
  }

  async fn call(&self, request: ServerRequest) -> Result<ServerResponse, RpcError> {
    let exchange = async {
      let addrs = self.endpoint.as_tcp_addr().await?;
      let mut stream = TcpStream::connect(&addrs[..]).await?;
      let sent = write_frame(&mut stream, &request).await?;
      self.logger.sent_bytes(sent as u64);
      let response: ServerResponse = read_frame(&mut stream, self.max_frame_bytes).await?;
      Ok::<_, RpcError>(response)
    };
    let res = match tokio::time::timeout(self.timeout, exchange).await {
      Ok(res) => res,
      Err(_) => Err(RpcError::Timeout),
    };
    match res {
      Ok(ServerResponse::Failed(e)) => Err(RpcError::Codec(e)),
      Err(e) => {
        debug!(
          LOG_LEVEL,
          &self.logger,
          "call to node {} at {} failed: {}",
          self.node,
          self.endpoint,
          e
        );
        Err(e)
      }
      ok => ok,
    }
  }
}
#[async_trait]
impl ChannelServer for RemoteChannelServer {
  async fn service_event_queue(&self, channel: ChannelId) -> Result<(), RpcError> {
    match self.call(ServerRequest::ServiceEventQueue { channel: channel }).await? {
      ServerResponse::Done => Ok(()),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn is_member(
    &self,
    channel: ChannelId,
    session: SessionId,
  ) -> Result<MembershipStatus, RpcError> {
    let request = ServerRequest::IsMember {
      channel: channel,
      session: session,
    };
    match self.call(request).await? {
      ServerResponse::Status(status) => Ok(status),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn join(
    &self,
    name: String,
    channel: ChannelId,
    delivery: Delivery,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError> {
    let request = ServerRequest::Join {
      name: name,
      channel: channel,
      delivery: delivery,
      timestamp: timestamp,
      session: session,
    };
    match self.call(request).await? {
      ServerResponse::Accepted(accepted) => Ok(accepted),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn leave(
    &self,
    channel: ChannelId,
    timestamp: Timestamp,
    session: SessionId,
  ) -> Result<bool, RpcError> {
    let request = ServerRequest::Leave {
      channel: channel,
      timestamp: timestamp,
      session: session,
    };
    match self.call(request).await? {
      ServerResponse::Accepted(accepted) => Ok(accepted),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn send(
    &self,
    channel: ChannelId,
    message: Vec<u8>,
    timestamp: Timestamp,
  ) -> Result<(), RpcError> {
    let request = ServerRequest::Send {
      channel: channel,
      message: message,
      timestamp: timestamp,
    };
    match self.call(request).await? {
      ServerResponse::Done => Ok(()),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn close(&self, channel: ChannelId, timestamp: Timestamp) -> Result<(), RpcError> {
    let request = ServerRequest::Close {
      channel: channel,
      timestamp: timestamp,
    };
    match self.call(request).await? {
      ServerResponse::Done => Ok(()),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn get_sessions(&self, channel: ChannelId) -> Result<Vec<SessionId>, RpcError> {
    match self.call(ServerRequest::GetSessions { channel: channel }).await? {
      ServerResponse::Sessions(sessions) => Ok(sessions),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn relocate_channel_memberships(
    &self,
    session: SessionId,
    old_node: NodeId,
    memberships: Vec<MemberSnapshot>,
  ) -> Result<(), RpcError> {
    let request = ServerRequest::relocate(session, old_node, &memberships[..]);
    match self.call(request).await? {
      ServerResponse::Done => Ok(()),
      _ => Err(RpcError::Unexpected),
    }
  }

  async fn channel_memberships_updated(
    &self,
    session: SessionId,
    new_node: NodeId,
  ) -> Result<(), RpcError> {
    let request = ServerRequest::ChannelMembershipsUpdated {
      session: session,
      new_node: new_node,
    };
    match self.call(request).await? {
      ServerResponse::Done => Ok(()),
      _ => Err(RpcError::Unexpected),
    }
  }
}

/// Answers calls on `listener` with `server` until `shutdown` fires or is dropped.
pub async fn serve(
  listener: TcpListener,
  server: Arc<dyn ChannelServer>,
  max_frame_bytes: usize,
  logger: LoggerRef,
  mut shutdown: oneshot::Receiver<()>,
) {
  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          trace!(LOG_LEVEL, &logger, "accepted call from {}", peer);
          let server = server.clone();
          let logger = logger.clone();
          tokio::spawn(async move {
            if let Err(e) = answer(stream, &*server, max_frame_bytes, &logger).await {
              debug!(LOG_LEVEL, &logger, "call from {} failed: {}", peer, e);
            }
          });
        }
        Err(e) => warn!(LOG_LEVEL, &logger, "accept failed: {}", e),
      }
    }
  }
  debug!(LOG_LEVEL, &logger, "channel server stopped");
}

async fn answer(
  mut stream: TcpStream,
  server: &dyn ChannelServer,
  max_frame_bytes: usize,
  logger: &LoggerRef,
) -> Result<(), RpcError> {
  let request: ServerRequest = read_frame(&mut stream, max_frame_bytes).await?;
  let response = match dispatch(server, request).await {
    Ok(response) => response,
    Err(e) => ServerResponse::Failed(e.to_string()),
  };
  let sent = write_frame(&mut stream, &response).await?;
  logger.sent_bytes(sent as u64);
  Ok(())
}

pub async fn dispatch(
  server: &dyn ChannelServer,
  request: ServerRequest,
) -> Result<ServerResponse, RpcError> {
  Ok(match request {
    ServerRequest::ServiceEventQueue { channel } => {
      server.service_event_queue(channel).await?;
      ServerResponse::Done
    }
    ServerRequest::IsMember { channel, session } => {
      ServerResponse::Status(server.is_member(channel, session).await?)
    }
    ServerRequest::Join {
      name,
      channel,
      delivery,
      timestamp,
      session,
    } => ServerResponse::Accepted(server.join(name, channel, delivery, timestamp, session).await?),
    ServerRequest::Leave {
      channel,
      timestamp,
      session,
    } => ServerResponse::Accepted(server.leave(channel, timestamp, session).await?),
    ServerRequest::Send {
      channel,
      message,
      timestamp,
    } => {
      server.send(channel, message, timestamp).await?;
      ServerResponse::Done
    }
    ServerRequest::Close { channel, timestamp } => {
      server.close(channel, timestamp).await?;
      ServerResponse::Done
    }
    ServerRequest::GetSessions { channel } => {
      ServerResponse::Sessions(server.get_sessions(channel).await?)
    }
    ServerRequest::RelocateChannelMemberships {
      session,
      old_node,
      channels,
      deliveries,
      timestamps,
    } => {
      let memberships = memberships(channels, deliveries, timestamps)?;
      server.relocate_channel_memberships(session, old_node, memberships).await?;
      ServerResponse::Done
    }
    ServerRequest::ChannelMembershipsUpdated { session, new_node } => {
      server.channel_memberships_updated(session, new_node).await?;
      ServerResponse::Done
    }
  })
}

#[test]
fn test_relocation_request_lists() {
  let snapshots = vec![
    MemberSnapshot {
      channel: ChannelId(3),
      delivery: Delivery::Reliable,
      msg_timestamp: 9,
    },
    MemberSnapshot {
      channel: ChannelId(4),
      delivery: Delivery::Unreliable,
      msg_timestamp: 0,
    },
  ];
  let request = ServerRequest::relocate(SessionId(1), NodeId(2), &snapshots[..]);
  let bytes = serde_cbor::to_vec(&request).unwrap();
  match serde_cbor::from_slice::<ServerRequest>(&bytes[..]).unwrap() {
    ServerRequest::RelocateChannelMemberships {
      session,
      old_node,
      channels,
      deliveries,
      timestamps,
    } => {
      assert_eq!((session, old_node), (SessionId(1), NodeId(2)));
      assert_eq!(memberships(channels, deliveries, timestamps).unwrap(), snapshots);
    }
    other => panic!("unexpected request {:?}", other),
  }
  let res = memberships(vec![ChannelId(1)], vec![], vec![1]);
  assert!(matches!(res, Err(RpcError::Codec(_))));
}
