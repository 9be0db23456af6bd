use crate::core::{ChannelError, Host};
use crate::testkit::LogLevel;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Configures a [`ChannelService`](crate::channel::ChannelService).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ChannelConfig {
  /// The maximum number of channel events a coordinator services in a single transaction.
  ///
  /// default: `1`
  #[validate(range(min = 1))]
  pub events_per_txn: usize,
  /// The number of bytes of recent RELIABLE messages each channel keeps for catching up
  /// relocated sessions and for retransmission after recovery.
  ///
  /// default: `128 KiB`
  #[validate(range(min = 8192))]
  pub write_buffer_size: usize,
  /// How long a request waits for the buffered requests of a relocating session to drain before
  /// going ahead anyway. Also how long the old node waits for the new node to confirm a
  /// membership transfer before retrying.
  ///
  /// default: `5000 milliseconds`
  #[validate(custom = "validate_relocation_timeout")]
  pub session_relocation_timeout: Duration,
  /// How many times the old node re-sends a membership transfer before disconnecting the
  /// session.
  ///
  /// default: `2`
  pub relocation_retries: usize,
  /// The host peers use to reach this node's channel server.
  ///
  /// default: `127.0.0.1`
  pub host: Host,
  /// The TCP port the channel server listens on. `0` picks an ephemeral port.
  ///
  /// default: `0`
  pub server_port: u16,
  /// How long a single call to a peer's channel server may take.
  ///
  /// default: `1 second`
  pub rpc_timeout: Duration,
  /// The timeout of transactions run by this node, which also bounds membership snapshot
  /// collection.
  ///
  /// default: `1 second`
  pub txn_timeout: Duration,
  /// How long a collected channel membership snapshot is reused.
  ///
  /// default: `1 second`
  pub membership_cache_ttl: Duration,
  /// The largest RPC frame accepted.
  ///
  /// default: `16 MiB`
  #[validate(range(min = 1024))]
  pub max_frame_bytes: usize,
  /// The directory key prefix under which channel server endpoints are published.
  ///
  /// default: `"aurum.channels.server."`
  #[validate(length(min = 1))]
  pub directory_prefix: String,
  /// The level of this node's logger.
  ///
  /// default: `LogLevel::Warn`
  pub log_level: LogLevel,
}
impl Default for ChannelConfig {
  #[inline]
  fn default() -> Self {
    ChannelConfig {
      events_per_txn: 1,
      write_buffer_size: 128 * 1024,
      session_relocation_timeout: Duration::from_millis(5000),
      relocation_retries: 2,
      host: Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)),
      server_port: 0,
      rpc_timeout: Duration::from_millis(1000),
      txn_timeout: Duration::from_millis(1000),
      membership_cache_ttl: Duration::from_millis(1000),
      max_frame_bytes: 16 * 1024 * 1024,
      directory_prefix: "aurum.channels.server.".to_string(),
      log_level: LogLevel::Warn,
    }
  }
}
impl ChannelConfig {
  /// Validates every field, turning the failures into a [`ChannelError::Config`].
  pub fn check(&self) -> Result<(), ChannelError> {
    self.validate().map_err(|e| ChannelError::Config(e.to_string()))
  }
}

fn validate_relocation_timeout(timeout: &Duration) -> Result<(), ValidationError> {
  if *timeout < Duration::from_millis(500) {
    Err(ValidationError::new("session_relocation_timeout below 500ms"))
  } else {
    Ok(())
  }
}

#[test]
fn test_config_defaults_validate() {
  assert!(ChannelConfig::default().check().is_ok());
}

#[test]
fn test_config_rejects_out_of_range() {
  let mut config = ChannelConfig::default();
  config.events_per_txn = 0;
  assert!(config.check().is_err());

  let mut config = ChannelConfig::default();
  config.write_buffer_size = 100;
  assert!(config.check().is_err());

  let mut config = ChannelConfig::default();
  config.session_relocation_timeout = Duration::from_millis(20);
  assert!(matches!(config.check(), Err(ChannelError::Config(_))));
}
