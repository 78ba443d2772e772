//! Append-only version histories of components.
//!
//! Field payloads are opaque here; a version is only a stamp nid and the bytes
//! the caller handed in.
//!
//! Chronology payload layout (big-endian):
//!
//! ```text
//! u8  tag (0x43)
//! u8  kind
//! i32 component nid
//! u32 count
//! count * (i32 stamp nid, u32 length, length bytes)
//! ```

use bytes::Bytes;

use crate::codec::{put_bytes, put_i32, put_u32, put_u8, Decode, Encode, Reader};
use crate::error::DecodeError;
use crate::id::Nid;

pub const TAG_CHRONOLOGY: u8 = 0x43;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ComponentKind {
    Concept = 1,
    Semantic = 2,
    Pattern = 3,
}

impl ComponentKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(ComponentKind::Concept),
            2 => Ok(ComponentKind::Semantic),
            3 => Ok(ComponentKind::Pattern),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    pub stamp: Nid,
    pub fields: Bytes,
}

impl Version {
    pub fn new(stamp: Nid, fields: impl Into<Bytes>) -> Self {
        Self {
            stamp,
            fields: fields.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chronology {
    nid: Nid,
    kind: ComponentKind,
    versions: Vec<Version>,
}

impl Chronology {
    pub fn new(nid: Nid, kind: ComponentKind, first: Version) -> Self {
        Self {
            nid,
            kind,
            versions: vec![first],
        }
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Versions in the order they were appended.
    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn version(&self, stamp: Nid) -> Option<&Version> {
        self.versions.iter().find(|version| version.stamp == stamp)
    }

    /// Appends `version`, or replaces the fields of the version already
    /// recorded for the same stamp. The version count never shrinks.
    pub fn insert(&mut self, version: Version) {
        match self.versions.iter_mut().find(|v| v.stamp == version.stamp) {
            Some(existing) => existing.fields = version.fields,
            None => self.versions.push(version),
        }
    }

    /// Appends `version` unless a version for the same stamp is already
    /// recorded. Returns whether it was appended.
    pub fn append(&mut self, version: Version) -> bool {
        if self.version(version.stamp).is_some() {
            return false;
        }
        self.versions.push(version);
        true
    }
}

impl Encode for Chronology {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_u8(out, TAG_CHRONOLOGY);
        put_u8(out, self.kind.code());
        put_i32(out, self.nid.raw());
        put_u32(out, self.versions.len() as u32);
        for version in &self.versions {
            put_i32(out, version.stamp.raw());
            put_bytes(out, &version.fields);
        }
    }
}

impl Decode for Chronology {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tag = reader.u8()?;
        if tag != TAG_CHRONOLOGY {
            return Err(DecodeError::UnknownTag(tag));
        }
        let kind = ComponentKind::from_code(reader.u8()?)?;
        let nid = Nid::new(reader.i32()?);
        let count = reader.u32()? as usize;
        if count == 0 {
            return Err(DecodeError::EmptyHistory);
        }
        let mut versions = Vec::with_capacity(count.min(reader.remaining() / 8));
        for _ in 0..count {
            let stamp = Nid::new(reader.i32()?);
            let fields = Bytes::copy_from_slice(reader.bytes()?);
            versions.push(Version { stamp, fields });
        }
        Ok(Self {
            nid,
            kind,
            versions,
        })
    }
}

/// Merge function for chronology payloads. Every version of `update` is
/// inserted into `existing` with [`Chronology::insert`] when `replace` is set,
/// and with [`Chronology::append`] otherwise, so recorded versions keep their
/// fields.
///
/// Re-running it on its own output changes nothing, so it is safe under
/// compare-and-swap retries. An undecodable side, or an update for another
/// component, leaves the existing payload untouched.
pub(crate) fn merge_chronology(existing: &Bytes, update: &Bytes, replace: bool) -> Bytes {
    let mut chronology = match Chronology::decode(existing) {
        Ok(chronology) => chronology,
        Err(e) => {
            tracing::error!("stored chronology is undecodable, keeping it: {e}");
            return existing.clone();
        }
    };
    let update = match Chronology::decode(update) {
        Ok(update) => update,
        Err(e) => {
            tracing::error!("chronology update is undecodable, ignoring it: {e}");
            return existing.clone();
        }
    };
    if update.nid != chronology.nid {
        tracing::error!(
            "chronology update for {} does not belong to {}, ignoring it",
            update.nid,
            chronology.nid
        );
        return existing.clone();
    }
    for version in update.versions {
        if replace {
            chronology.insert(version);
        } else {
            chronology.append(version);
        }
    }
    chronology.encode()
}
