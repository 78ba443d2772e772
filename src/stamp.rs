//! Stamps record who changed what, where and when.
//!
//! A stamp is itself stored at its own nid as a short append-only history of
//! [`StampFields`]; the last entry is the effective stamp. An uncommitted
//! stamp gains one more entry when it is committed or canceled. After that
//! its history is closed: committed stamps are immutable and canceled stamps
//! stay canceled.
//!
//! Stamp payload layout (big-endian):
//!
//! ```text
//! u8  tag (0x53)
//! u32 count
//! count * (u8 status, i64 time, i32 author, i32 module, i32 path)
//! ```

pub mod transaction;

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

pub use transaction::{Transaction, TransactionState};

use crate::codec::{put_i32, put_i64, put_u32, put_u8, Decode, Encode, Reader};
use crate::error::DecodeError;
use crate::id::Nid;

pub const TAG_STAMP: u8 = 0x53;

/// Time of a stamp that has not been committed yet.
///
/// Equal to [`LATEST`], so uncommitted work is only visible to coordinates
/// that look at the very latest state.
pub const UNCOMMITTED: i64 = i64::MAX;

/// The horizon that sees everything, including uncommitted work.
pub const LATEST: i64 = i64::MAX;

/// Time of a canceled stamp. No horizon ever reaches it.
pub const CANCELED: i64 = i64::MIN;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Status {
    Active = 1,
    Inactive = 2,
    Withdrawn = 3,
    Primordial = 4,
    Canceled = 5,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Active,
        Status::Inactive,
        Status::Withdrawn,
        Status::Primordial,
        Status::Canceled,
    ];

    /// The well-known UUID this status is registered under.
    pub const fn uuid(self) -> Uuid {
        match self {
            Status::Active => Uuid::from_u128(0x09f12f9f_3a5c_4d0e_8e13_3c5b3a1e7f01),
            Status::Inactive => Uuid::from_u128(0x09f12f9f_3a5c_4d0e_8e13_3c5b3a1e7f02),
            Status::Withdrawn => Uuid::from_u128(0x09f12f9f_3a5c_4d0e_8e13_3c5b3a1e7f03),
            Status::Primordial => Uuid::from_u128(0x09f12f9f_3a5c_4d0e_8e13_3c5b3a1e7f04),
            Status::Canceled => Uuid::from_u128(0x09f12f9f_3a5c_4d0e_8e13_3c5b3a1e7f05),
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Status::ALL
            .into_iter()
            .find(|status| status.code() == code)
            .ok_or(DecodeError::UnknownStatus(code))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
            Status::Withdrawn => "withdrawn",
            Status::Primordial => "primordial",
            Status::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// One (status, time, author, module, path) tuple.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StampFields {
    pub status: Status,
    pub time: i64,
    pub author: Nid,
    pub module: Nid,
    pub path: Nid,
}

impl StampFields {
    pub fn new(status: Status, time: i64, author: Nid, module: Nid, path: Nid) -> Self {
        Self {
            status,
            time,
            author,
            module,
            path,
        }
    }

    pub fn uncommitted(status: Status, author: Nid, module: Nid, path: Nid) -> Self {
        Self::new(status, UNCOMMITTED, author, module, path)
    }

    pub fn is_canceled(&self) -> bool {
        self.status == Status::Canceled || self.time == CANCELED
    }

    pub fn is_uncommitted(&self) -> bool {
        !self.is_canceled() && self.time == UNCOMMITTED
    }

    pub fn is_committed(&self) -> bool {
        !self.is_canceled() && self.time != UNCOMMITTED
    }

    pub fn committed_at(self, time: i64) -> Self {
        Self { time, ..self }
    }

    /// These fields with the canceled status and time. Author, module and
    /// path are kept.
    pub fn canceled(self) -> Self {
        Self {
            status: Status::Canceled,
            time: CANCELED,
            ..self
        }
    }

    /// A UUID derived from the fields alone, used to deduplicate identical
    /// committed stamps.
    pub fn content_uuid(&self) -> Uuid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"stampstore:stamp");
        let mut encoded = Vec::with_capacity(21);
        self.encode_into(&mut encoded);
        hasher.update(&encoded);
        let digest = hasher.finalize();
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&digest.as_bytes()[..16]);
        Uuid::from_bytes(raw)
    }
}

impl Encode for StampFields {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_u8(out, self.status.code());
        put_i64(out, self.time);
        put_i32(out, self.author.raw());
        put_i32(out, self.module.raw());
        put_i32(out, self.path.raw());
    }
}

impl Decode for StampFields {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            status: Status::from_code(reader.u8()?)?,
            time: reader.i64()?,
            author: Nid::new(reader.i32()?),
            module: Nid::new(reader.i32()?),
            path: Nid::new(reader.i32()?),
        })
    }
}

/// The history of one stamp. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StampChronology {
    versions: Vec<StampFields>,
}

impl StampChronology {
    pub fn new(fields: StampFields) -> Self {
        Self {
            versions: vec![fields],
        }
    }

    /// The effective stamp.
    pub fn current(&self) -> StampFields {
        // Decoding rejects empty histories and nothing removes entries.
        self.versions[self.versions.len() - 1]
    }

    pub fn versions(&self) -> &[StampFields] {
        &self.versions
    }

    /// Appends `fields` while the stamp is still uncommitted. Returns whether
    /// anything was appended.
    pub fn push(&mut self, fields: StampFields) -> bool {
        let current = self.current();
        if current == fields || !current.is_uncommitted() {
            return false;
        }
        self.versions.push(fields);
        true
    }
}

impl Encode for StampChronology {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_u8(out, TAG_STAMP);
        put_u32(out, self.versions.len() as u32);
        for fields in &self.versions {
            fields.encode_into(out);
        }
    }
}

impl Decode for StampChronology {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tag = reader.u8()?;
        if tag != TAG_STAMP {
            return Err(DecodeError::UnknownTag(tag));
        }
        let count = reader.u32()? as usize;
        if count == 0 {
            return Err(DecodeError::EmptyHistory);
        }
        let mut versions = Vec::with_capacity(count.min(reader.remaining() / 21));
        for _ in 0..count {
            versions.push(StampFields::decode_from(reader)?);
        }
        Ok(Self { versions })
    }
}

/// Merge function for stamp payloads: appends the update's entries onto the
/// existing history with [`StampChronology::push`].
///
/// An undecodable side leaves the existing payload untouched.
pub(crate) fn merge_stamp(existing: &Bytes, update: &Bytes) -> Bytes {
    let mut history = match StampChronology::decode(existing) {
        Ok(history) => history,
        Err(e) => {
            tracing::error!("stored stamp payload is undecodable, keeping it: {e}");
            return existing.clone();
        }
    };
    let update = match StampChronology::decode(update) {
        Ok(update) => update,
        Err(e) => {
            tracing::error!("stamp update is undecodable, ignoring it: {e}");
            return existing.clone();
        }
    };
    let mut appended = false;
    for fields in update.versions {
        appended |= history.push(fields);
    }
    if appended {
        history.encode()
    } else {
        existing.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(status: Status, time: i64) -> StampFields {
        StampFields::new(
            status,
            time,
            Nid::FIRST,
            Nid::new(Nid::FIRST.raw() + 1),
            Nid::new(Nid::FIRST.raw() + 2),
        )
    }

    #[test]
    fn status_codes_round_trip() {
        for status in Status::ALL {
            assert_eq!(Status::from_code(status.code()), Ok(status));
        }
        assert_eq!(Status::from_code(0), Err(DecodeError::UnknownStatus(0)));
    }

    #[test]
    fn commit_state() {
        let draft = StampFields::uncommitted(Status::Active, Nid::FIRST, Nid::FIRST, Nid::FIRST);
        assert!(draft.is_uncommitted());
        assert!(!draft.is_committed());

        let committed = draft.committed_at(10);
        assert!(committed.is_committed());

        let canceled = committed.canceled();
        assert!(canceled.is_canceled());
        assert_eq!(canceled.time, CANCELED);
        assert_eq!(canceled.module, committed.module);
    }

    #[test]
    fn content_uuid_depends_on_every_field() {
        let a = fields(Status::Active, 10);
        assert_eq!(a.content_uuid(), fields(Status::Active, 10).content_uuid());
        assert_ne!(a.content_uuid(), fields(Status::Active, 11).content_uuid());
        assert_ne!(a.content_uuid(), fields(Status::Inactive, 10).content_uuid());
        assert!(!a.content_uuid().is_nil());
    }

    #[test]
    fn merge_appends_and_is_idempotent() {
        let draft = fields(Status::Active, UNCOMMITTED);
        let existing = StampChronology::new(draft).encode();
        let commit = StampChronology::new(draft.committed_at(5)).encode();

        let merged = merge_stamp(&existing, &commit);
        let again = merge_stamp(&merged, &commit);
        assert_eq!(merged, again);

        let history = StampChronology::decode(&merged).unwrap();
        assert_eq!(history.versions(), &[draft, draft.committed_at(5)]);
        assert_eq!(history.current().time, 5);
    }

    #[test]
    fn canceled_stamps_stay_canceled() {
        let draft = fields(Status::Active, UNCOMMITTED);
        let mut history = StampChronology::new(draft);
        assert!(history.push(draft.canceled()));
        assert!(!history.push(draft.committed_at(5)));
        assert!(history.current().is_canceled());
        assert_eq!(history.versions().len(), 2);
    }

    #[test]
    fn committed_stamps_are_closed() {
        let draft = fields(Status::Active, UNCOMMITTED);
        let mut history = StampChronology::new(draft);
        assert!(history.push(draft.committed_at(5)));
        assert!(!history.push(draft.committed_at(6)));
        assert!(!history.push(draft.canceled()));
        assert_eq!(history.current(), draft.committed_at(5));

        let committed = StampChronology::new(draft.committed_at(5)).encode();
        let cancel = StampChronology::new(draft.canceled()).encode();
        assert_eq!(merge_stamp(&committed, &cancel), committed);
    }

    #[test]
    fn undecodable_payloads_are_kept() {
        let existing = Bytes::from_static(&[0x01, 0x02]);
        let update = StampChronology::new(fields(Status::Active, 1)).encode();
        assert_eq!(merge_stamp(&existing, &update), existing);

        let empty: Vec<u8> = vec![TAG_STAMP, 0, 0, 0, 0];
        assert_eq!(
            StampChronology::decode(&empty),
            Err(DecodeError::EmptyHistory)
        );
    }
}
