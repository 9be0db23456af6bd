use crate::core::RpcError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;

/// The DNS name or IP address of the machine hosting a node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}

/// The remote address of a node's channel server.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct Socket {
  /// The DNS name or IP address of the machine hosting the node.
  pub host: Host,
  /// The TCP port the channel server accepts calls on.
  pub tcp: u16,
}
impl Socket {
  /// Creates a new [`Socket`]
  pub fn new(host: Host, tcp: u16) -> Socket {
    Socket {
      host: host,
      tcp: tcp,
    }
  }

  /// Uses the TCP port of this [`Socket`] in a raw [`SocketAddr`]. If the [`Host`] for this
  /// [`Socket`] is a DNS name, this function will perform a DNS lookup. Only returns an error if
  /// the DNS lookup fails.
  pub async fn as_tcp_addr(&self) -> std::io::Result<Vec<SocketAddr>> {
    match &self.host {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, self.tcp)]),
      Host::DNS(s) => {
        lookup_host((s.as_str(), self.tcp)).await.map(|x| x.filter(|a| a.is_ipv4()).collect())
      }
    }
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.host {
      Host::DNS(s) => write!(f, "DNS({}):{}", s, self.tcp),
      Host::IP(ip) => write!(f, "IP({}):{}", ip, self.tcp),
    }
  }
}
impl Default for Socket {
  fn default() -> Self {
    Self {
      host: Host::IP(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
      tcp: 0,
    }
  }
}

/*
Frames are a 4 byte big endian length followed by that many bytes of CBOR. Serde doesn't tell us
where a value ends in a stream, so the length goes first.
 */
pub const FRAME_HEADER_LEN: usize = 4;

/// Writes one length-prefixed CBOR frame, returning how many bytes went out.
pub async fn write_frame<W, T>(writer: &mut W, item: &T) -> Result<usize, RpcError>
where
  W: AsyncWrite + Unpin,
  T: Serialize,
{
  let body = serde_cbor::to_vec(item)?;
  let len = body.len() as u32;
  writer.write_all(&len.to_be_bytes()).await?;
  writer.write_all(&body[..]).await?;
  writer.flush().await?;
  Ok(FRAME_HEADER_LEN + body.len())
}

/// Reads one length-prefixed CBOR frame, refusing bodies over `max_frame_bytes`.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<T, RpcError>
where
  R: AsyncRead + Unpin,
  T: DeserializeOwned,
{
  let mut header = [0u8; FRAME_HEADER_LEN];
  reader.read_exact(&mut header).await?;
  let len = u32::from_be_bytes(header) as usize;
  if len > max_frame_bytes {
    return Err(RpcError::Codec(format!(
      "frame too large: max {} got {}",
      max_frame_bytes, len
    )));
  }
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body[..]).await?;
  Ok(serde_cbor::from_slice(&body[..])?)
}

#[test]
fn test_host_from_string() {
  assert_eq!(
    Host::from("127.0.0.1".to_string()),
    Host::IP(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
  );
  assert_eq!(Host::from("localhost".to_string()), Host::DNS("localhost".to_string()));
}

#[test]
fn test_frame_rejects_oversized() {
  let mut buf = Vec::new();
  let written = tokio_test::block_on(write_frame(&mut buf, &vec![7u8; 2048])).unwrap();
  assert_eq!(written, buf.len());
  let mut reader = &buf[..];
  let res: Result<Vec<u8>, RpcError> = tokio_test::block_on(read_frame(&mut reader, 1024));
  assert!(matches!(res, Err(RpcError::Codec(_))));
  let mut reader = &buf[..];
  let res: Vec<u8> = tokio_test::block_on(read_frame(&mut reader, 4096)).unwrap();
  assert_eq!(res.len(), 2048);
}
