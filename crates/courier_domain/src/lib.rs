#![forbid(unsafe_code)]

pub mod model;
pub mod secret;
pub mod snowflake;

pub use secret::SecretString;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for constructing and parsing domain identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
	#[error("empty value")]
	Empty,
	#[error("instance id out of range (expected 0..=1023): {0}")]
	InstanceOutOfRange(u32),
	#[error("invalid message id: {0}")]
	InvalidMessageId(String),
	#[error("unknown channel kind: {0}")]
	UnknownChannelKind(String),
	#[error("unknown participant role: {0}")]
	UnknownRole(String),
}

/// Identity of one running instance, unique among live instances.
///
/// The value is claimed from the coordination service, never configured,
/// and must fit the 10-bit slot the snowflake layout reserves for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u16);

impl InstanceId {
	/// Highest valid instance id (10 bits).
	pub const MAX: u16 = 1023;

	pub fn new(raw: u16) -> Result<Self, IdError> {
		if raw > Self::MAX {
			return Err(IdError::InstanceOutOfRange(raw as u32));
		}
		Ok(Self(raw))
	}

	pub fn get(self) -> u16 {
		self.0
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

const TIMESTAMP_SHIFT: u32 = 22;
const INSTANCE_SHIFT: u32 = 12;
const INSTANCE_MASK: u64 = 0x3ff;
const SEQUENCE_MASK: u64 = 0xfff;

/// Cluster-unique, roughly time-ordered 64-bit message identifier.
///
/// Layout: `timestamp_ms << 22 | instance << 12 | sequence` (41/10/12 bits).
/// On the wire it travels as a decimal string so JSON clients never lose
/// precision past 2^53.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessageId(u64);

impl MessageId {
	pub fn from_parts(timestamp_ms: u64, instance: InstanceId, sequence: u16) -> Self {
		let ts = timestamp_ms << TIMESTAMP_SHIFT;
		let inst = ((instance.get() as u64) & INSTANCE_MASK) << INSTANCE_SHIFT;
		let seq = (sequence as u64) & SEQUENCE_MASK;
		Self(ts | inst | seq)
	}

	pub fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	pub fn as_u64(self) -> u64 {
		self.0
	}

	/// Storage representation (signed, for SQL bigint columns).
	pub fn as_i64(self) -> i64 {
		self.0 as i64
	}

	pub fn timestamp_ms(self) -> u64 {
		self.0 >> TIMESTAMP_SHIFT
	}

	pub fn instance(self) -> u16 {
		((self.0 >> INSTANCE_SHIFT) & INSTANCE_MASK) as u16
	}

	pub fn sequence(self) -> u16 {
		(self.0 & SEQUENCE_MASK) as u16
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(IdError::Empty);
		}
		s.parse::<u64>()
			.map(Self)
			.map_err(|_| IdError::InvalidMessageId(s.to_string()))
	}
}

impl From<MessageId> for String {
	fn from(id: MessageId) -> Self {
		id.to_string()
	}
}

impl TryFrom<String> for MessageId {
	type Error = IdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

/// Channel identifier.
pub type ChannelId = Uuid;

/// Opaque non-empty user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(IdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Kind of a chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
	Direct,
	Group,
}

impl ChannelKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ChannelKind::Direct => "direct",
			ChannelKind::Group => "group",
		}
	}
}

impl fmt::Display for ChannelKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ChannelKind {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"direct" => Ok(ChannelKind::Direct),
			"group" => Ok(ChannelKind::Group),
			other => Err(IdError::UnknownChannelKind(other.to_string())),
		}
	}
}

/// Role of a participant within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
	Admin,
	Member,
}

impl ParticipantRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			ParticipantRole::Admin => "admin",
			ParticipantRole::Member => "member",
		}
	}
}

impl fmt::Display for ParticipantRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ParticipantRole {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"admin" => Ok(ParticipantRole::Admin),
			"member" => Ok(ParticipantRole::Member),
			other => Err(IdError::UnknownRole(other.to_string())),
		}
	}
}

/// Fixed namespace for direct-channel id derivation.
const DIRECT_CHANNEL_NAMESPACE: Uuid = uuid::uuid!("1b671a64-40d5-491e-99b0-da01ff1f3341");

/// Deterministic channel id for the direct channel between two users.
///
/// The pair is sorted before hashing, so the same two users always resolve
/// to the same channel regardless of who initiates.
pub fn derive_direct_channel_id(a: &UserId, b: &UserId) -> ChannelId {
	let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
	let data = format!("{}-{}", lo.as_str(), hi.as_str());
	Uuid::new_v5(&DIRECT_CHANNEL_NAMESPACE, data.as_bytes())
}

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn instance_id_bound() {
		assert!(InstanceId::new(0).is_ok());
		assert!(InstanceId::new(1023).is_ok());
		assert_eq!(InstanceId::new(1024), Err(IdError::InstanceOutOfRange(1024)));
	}

	#[test]
	fn message_id_field_roundtrip() {
		let inst = InstanceId::new(512).unwrap();
		let id = MessageId::from_parts(1_700_000_000_000, inst, 4095);
		assert_eq!(id.timestamp_ms(), 1_700_000_000_000);
		assert_eq!(id.instance(), 512);
		assert_eq!(id.sequence(), 4095);
	}

	#[test]
	fn message_id_string_roundtrip() {
		let id = MessageId::from_parts(1_700_000_000_000, InstanceId::new(7).unwrap(), 42);
		let s = id.to_string();
		assert_eq!(s.parse::<MessageId>().unwrap(), id);
		assert!("".parse::<MessageId>().is_err());
		assert!("not-a-number".parse::<MessageId>().is_err());
	}

	#[test]
	fn direct_channel_id_is_order_independent() {
		let a = UserId::new("alice").unwrap();
		let b = UserId::new("bob").unwrap();
		assert_eq!(derive_direct_channel_id(&a, &b), derive_direct_channel_id(&b, &a));
		assert_eq!(derive_direct_channel_id(&a, &b), derive_direct_channel_id(&a, &b));
	}

	#[test]
	fn direct_channel_id_differs_per_pair() {
		let a = UserId::new("alice").unwrap();
		let b = UserId::new("bob").unwrap();
		let c = UserId::new("carol").unwrap();
		assert_ne!(derive_direct_channel_id(&a, &b), derive_direct_channel_id(&a, &c));
	}

	#[test]
	fn kind_and_role_parse() {
		assert_eq!("direct".parse::<ChannelKind>().unwrap(), ChannelKind::Direct);
		assert_eq!("group".parse::<ChannelKind>().unwrap(), ChannelKind::Group);
		assert!("dm".parse::<ChannelKind>().is_err());
		assert_eq!("admin".parse::<ParticipantRole>().unwrap(), ParticipantRole::Admin);
		assert!("owner".parse::<ParticipantRole>().is_err());
	}

	#[test]
	fn rejects_empty_user_id() {
		assert!(UserId::new("").is_err());
		assert!(UserId::new("   ").is_err());
	}

	proptest! {
		#[test]
		fn message_id_pack_unpack(ts in 0u64..(1u64 << 41), inst in 0u16..=1023, seq in 0u16..=4095) {
			let id = MessageId::from_parts(ts, InstanceId::new(inst).unwrap(), seq);
			prop_assert_eq!(id.timestamp_ms(), ts);
			prop_assert_eq!(id.instance(), inst);
			prop_assert_eq!(id.sequence(), seq);
		}

		#[test]
		fn direct_channel_symmetry(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
			let ua = UserId::new(a).unwrap();
			let ub = UserId::new(b).unwrap();
			prop_assert_eq!(derive_direct_channel_id(&ua, &ub), derive_direct_channel_id(&ub, &ua));
		}
	}
}
