//! Bidirectional codec for the external identifier grammar:
//!
//! ```text
//! member-id   = 32HEXDIGIT ":" 8HEXDIGIT ":" kind
//! kind        = "T" / "M" / "F" / "P" / "E"
//! location-id = member-id "@" 4HEXDIGIT
//! ```
//!
//! Encoding is total: every `(mvid, token, kind)` triple produces a 43-byte string.
//! Decoding is fallible and reports which part of the grammar rejected the input, so
//! callers can tell a malformed MVID apart from an unknown kind character.

use std::fmt::{Display, Formatter};

use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemberKind {
	Type,
	Method,
	Field,
	Property,
	Event,
}

impl MemberKind {
	pub fn as_char(self) -> char {
		match self {
			MemberKind::Type => 'T',
			MemberKind::Method => 'M',
			MemberKind::Field => 'F',
			MemberKind::Property => 'P',
			MemberKind::Event => 'E',
		}
	}

	pub fn from_char(c: char) -> Option<Self> {
		match c {
			'T' => Some(MemberKind::Type),
			'M' => Some(MemberKind::Method),
			'F' => Some(MemberKind::Field),
			'P' => Some(MemberKind::Property),
			'E' => Some(MemberKind::Event),
			_ => None,
		}
	}

	/// The metadata table a member of this kind is expected to live in. Used only to
	/// sanity-check a token's table tag against the identifier's kind suffix; it is
	/// not itself part of the codec's contract (a mismatch is still decodable, it is
	/// the caller's job to reject it via `belongs_to_assembly`/kind checks).
	pub fn expected_token_kind(self) -> MetadataTokenKind {
		match self {
			MemberKind::Type => MetadataTokenKind::TypeDef,
			MemberKind::Method => MetadataTokenKind::MethodDef,
			MemberKind::Field => MetadataTokenKind::Field,
			MemberKind::Property => MetadataTokenKind::Property,
			MemberKind::Event => MetadataTokenKind::Event,
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum DecodeError {
	#[error("identifier is empty")]
	Empty,
	#[error("expected 3 colon-separated parts, found {0}")]
	WrongPartCount(usize),
	#[error("MVID must be exactly 32 hex digits, found {0}")]
	BadMvidLength(usize),
	#[error("MVID contains non-hex characters")]
	BadMvidFormat,
	#[error("token must be exactly 8 hex digits, found {0}")]
	BadTokenLength(usize),
	#[error("token contains non-hex characters")]
	BadTokenFormat,
	#[error("unknown member kind character {0:?}")]
	UnknownKind(char),
	#[error("location offset must be exactly 4 hex digits, found {0}")]
	BadOffsetLength(usize),
	#[error("location offset contains non-hex characters")]
	BadOffsetFormat,
	#[error("location id is missing the '@' offset suffix")]
	MissingOffset,
}

/// A 128-bit Module Version Identifier, stored and compared as raw bytes so the
/// codec never depends on any particular UUID variant/version being set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Mvid(pub [u8; 16]);

impl Mvid {
	pub fn from_uuid(uuid: uuid::Uuid) -> Self {
		Self(*uuid.as_bytes())
	}

	pub fn to_uuid(self) -> uuid::Uuid {
		uuid::Uuid::from_bytes(self.0)
	}

	fn to_hex_lower(self) -> String {
		let mut s = String::with_capacity(32);
		for byte in self.0 {
			s.push_str(&format!("{byte:02x}"));
		}
		s
	}

	fn from_hex(s: &str) -> Result<Self, DecodeError> {
		if s.len() != 32 {
			return Err(DecodeError::BadMvidLength(s.len()));
		}
		let mut bytes = [0u8; 16];
		for i in 0..16 {
			bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| DecodeError::BadMvidFormat)?;
		}
		Ok(Self(bytes))
	}
}

impl Display for Mvid {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.to_hex_lower())
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MemberId {
	pub mvid: Mvid,
	pub token: MetadataToken,
	pub kind: MemberKind,
}

impl MemberId {
	pub fn new(mvid: Mvid, token: MetadataToken, kind: MemberKind) -> Self {
		Self { mvid, token, kind }
	}

	/// Total, infallible: `encode(mvid, token, kind) = lowercase-hex(mvid, 32) ":"
	/// uppercase-hex(token, 8) ":" kind-char`.
	pub fn encode(&self) -> String {
		format!("{}:{:08X}:{}", self.mvid, self.token.raw(), self.kind.as_char())
	}

	pub fn decode(s: &str) -> Result<Self, DecodeError> {
		if s.is_empty() {
			return Err(DecodeError::Empty);
		}

		let parts: Vec<&str> = s.split(':').collect();
		if parts.len() != 3 {
			return Err(DecodeError::WrongPartCount(parts.len()));
		}

		let mvid = Mvid::from_hex(parts[0])?;

		if parts[1].len() != 8 {
			return Err(DecodeError::BadTokenLength(parts[1].len()));
		}
		let raw = u32::from_str_radix(parts[1], 16).map_err(|_| DecodeError::BadTokenFormat)?;
		let token = MetadataToken::try_from(raw).map_err(|_| DecodeError::BadTokenFormat)?;

		let mut kind_chars = parts[2].chars();
		let (Some(kind_char), None) = (kind_chars.next(), kind_chars.next()) else {
			return Err(DecodeError::UnknownKind(parts[2].chars().next().unwrap_or('\0')));
		};
		let kind = MemberKind::from_char(kind_char).ok_or(DecodeError::UnknownKind(kind_char))?;

		Ok(Self { mvid, token, kind })
	}

	pub fn is_valid(s: &str) -> bool {
		Self::decode(s).is_ok()
	}

	pub fn belongs_to_assembly(&self, mvid: Mvid) -> bool {
		self.mvid == mvid
	}
}

impl Display for MemberId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.encode())
	}
}

/// A method member id plus a byte offset into its IL stream: `{member-id}@{offset-hex4}`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LocationId {
	pub member: MemberId,
	pub il_offset: u16,
}

impl LocationId {
	pub fn new(member: MemberId, il_offset: u16) -> Self {
		Self { member, il_offset }
	}

	pub fn encode(&self) -> String {
		format!("{}@{:04X}", self.member.encode(), self.il_offset)
	}

	/// Decodes the member-id component first and refuses on any member-id error,
	/// before ever looking at the offset suffix.
	pub fn decode(s: &str) -> Result<Self, DecodeError> {
		let Some((member_part, offset_part)) = s.split_once('@') else {
			// Still decode the member-id so a bad MVID/token is reported over a
			// generic "missing offset" error when both are wrong.
			MemberId::decode(s)?;
			return Err(DecodeError::MissingOffset);
		};

		let member = MemberId::decode(member_part)?;

		if offset_part.len() != 4 {
			return Err(DecodeError::BadOffsetLength(offset_part.len()));
		}
		let il_offset = u16::from_str_radix(offset_part, 16).map_err(|_| DecodeError::BadOffsetFormat)?;

		Ok(Self { member, il_offset })
	}

	pub fn is_valid(s: &str) -> bool {
		Self::decode(s).is_ok()
	}
}

impl Display for LocationId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.encode())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_mvid() -> Mvid {
		Mvid::from_hex("a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6").unwrap()
	}

	#[test]
	fn round_trips_member_id() {
		let token = MetadataToken::try_from(0x06001234u32).unwrap();
		let id = MemberId::new(sample_mvid(), token, MemberKind::Method);
		assert_eq!(id.encode(), "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6:06001234:M");
		assert_eq!(MemberId::decode(&id.encode()).unwrap(), id);
	}

	#[test]
	fn round_trips_location_id() {
		let token = MetadataToken::try_from(0x06001234u32).unwrap();
		let member = MemberId::new(sample_mvid(), token, MemberKind::Method);
		let loc = LocationId::new(member, 0x001A);
		assert_eq!(loc.encode(), "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6:06001234:M@001A");
		let decoded = LocationId::decode(&loc.encode()).unwrap();
		assert_eq!(decoded.member, member);
		assert_eq!(decoded.il_offset, 26);
	}

	#[test]
	fn rejects_empty_input() {
		assert_eq!(MemberId::decode(""), Err(DecodeError::Empty));
	}

	#[test]
	fn rejects_wrong_part_count() {
		assert_eq!(MemberId::decode("aa:bb"), Err(DecodeError::WrongPartCount(2)));
	}

	#[test]
	fn rejects_bad_mvid_length() {
		let err = MemberId::decode("abcd:06001234:M").unwrap_err();
		assert_eq!(err, DecodeError::BadMvidLength(4));
	}

	#[test]
	fn rejects_unknown_kind() {
		let mvid = sample_mvid();
		let s = format!("{mvid}:06001234:Z");
		assert_eq!(MemberId::decode(&s), Err(DecodeError::UnknownKind('Z')));
	}

	#[test]
	fn distinct_kinds_never_collide() {
		let token = MetadataToken::try_from(0x06000001u32).unwrap();
		let as_method = MemberId::new(sample_mvid(), token, MemberKind::Method).encode();
		let as_field = MemberId::new(sample_mvid(), token, MemberKind::Field).encode();
		assert_ne!(as_method, as_field);
	}

	#[test]
	fn is_valid_matches_decode() {
		let token = MetadataToken::try_from(0x02000001u32).unwrap();
		let id = MemberId::new(sample_mvid(), token, MemberKind::Type).encode();
		assert_eq!(MemberId::is_valid(&id), MemberId::decode(&id).is_ok());
		assert!(!MemberId::is_valid("garbage"));
	}
}
