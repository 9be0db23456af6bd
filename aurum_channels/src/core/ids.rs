use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel message and event timestamps. Both start at 1, 0 means "nothing yet".
pub type Timestamp = u64;

/// Identifies a node in the cluster.
#[derive(
  Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub struct NodeId(pub u64);
impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identifies a client session, wherever it is connected.
#[derive(
  Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub struct SessionId(pub u64);
impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#010x}", self.0)
  }
}

/// Opaque channel identifier, allocated by the durable store.
#[derive(
  Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub struct ChannelId(pub u64);
impl fmt::Display for ChannelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#010x}", self.0)
  }
}

/// The delivery guarantee of a channel. Serialized as its ordinal.
#[derive(
  Clone,
  Copy,
  Debug,
  Deserialize,
  Eq,
  Hash,
  IntoPrimitive,
  PartialEq,
  Serialize,
  TryFromPrimitive,
)]
#[repr(u8)]
#[serde(into = "u8", try_from = "u8")]
pub enum Delivery {
  /// Best effort. Messages may be lost or seen out of order.
  Unreliable = 0,
  /// Ordered by coordinator timestamp, deduplicated, caught up across relocation.
  Reliable = 1,
}
impl Delivery {
  /// Decodes a delivery ordinal, falling back to [`Delivery::Unreliable`] for unknown values.
  pub fn from_ordinal(ordinal: u8) -> Delivery {
    use std::convert::TryFrom;
    Delivery::try_from(ordinal).unwrap_or(Delivery::Unreliable)
  }

  /// The ordinal sent over the wire.
  pub fn ordinal(self) -> u8 {
    self.into()
  }
}

/// Local membership status of a session, as seen by one node.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum MembershipStatus {
  /// Connected here and a member.
  Member,
  /// Connected here and not a member.
  NonMember,
  /// Not connected to this node.
  Unknown,
}

#[test]
fn test_delivery_ordinals() {
  assert_eq!(Delivery::Reliable.ordinal(), 1);
  assert_eq!(Delivery::from_ordinal(0), Delivery::Unreliable);
  assert_eq!(Delivery::from_ordinal(1), Delivery::Reliable);
  assert_eq!(Delivery::from_ordinal(200), Delivery::Unreliable);
  let bytes = serde_cbor::to_vec(&Delivery::Reliable).unwrap();
  assert_eq!(bytes, serde_cbor::to_vec(&1u8).unwrap());
  assert!(serde_cbor::from_slice::<Delivery>(&serde_cbor::to_vec(&9u8).unwrap()).is_err());
}
