//! Bidirectional mapping between public ids and nids.
//!
//! Lookups of already known UUIDs never lock. Allocating a nid, or folding new
//! aliases onto an existing one, happens under a single allocation lock so
//! that racing first-time callers for overlapping alias sets converge on the
//! same nid.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{put_i32, put_u32, put_uuid, Reader};
use crate::error::{ConfigurationError, DecodeError};
use crate::id::{Nid, PublicId};

const MAGIC_MARKER_IDENTITY: [u8; 16] = *b"stampstore:ident";

#[derive(Debug)]
pub struct IdentityRegistry {
    by_uuid: DashMap<Uuid, Nid>,
    by_nid: DashMap<Nid, PublicId>,
    next: AtomicI32,
    allocation: Mutex<()>,
    changed: AtomicBool,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            by_uuid: DashMap::new(),
            by_nid: DashMap::new(),
            next: AtomicI32::new(Nid::FIRST.raw()),
            allocation: Mutex::new(()),
            changed: AtomicBool::new(false),
        }
    }

    /// Returns the nid for `id`, allocating one if none of its aliases is known.
    ///
    /// If some aliases are already mapped, the nid of the first mapped alias
    /// (in `id`'s order) wins and every unmapped alias is folded onto it.
    pub fn resolve(&self, id: &PublicId) -> Result<Nid, ConfigurationError> {
        if let Some(nid) = self.fully_mapped(id) {
            return Ok(nid);
        }

        let _guard = self.allocation.lock();
        // Another caller may have won the race while we waited.
        if let Some(nid) = self.fully_mapped(id) {
            return Ok(nid);
        }

        let existing = id
            .uuids()
            .iter()
            .find_map(|uuid| self.by_uuid.get(uuid).map(|nid| *nid));
        let nid = match existing {
            Some(nid) => nid,
            None => {
                let nid = Nid::new(self.next.load(Ordering::Acquire));
                let next = nid.next().ok_or(ConfigurationError::NidSpaceExhausted)?;
                self.next.store(next.raw(), Ordering::Release);
                nid
            }
        };

        let mut added = Vec::new();
        for uuid in id.uuids() {
            match self.by_uuid.get(uuid).map(|mapped| *mapped) {
                None => added.push(*uuid),
                Some(mapped) if mapped != nid => {
                    tracing::warn!(
                        "uuid {uuid} is already mapped to {mapped}, not folding it onto {nid}"
                    );
                }
                Some(_) => {}
            }
        }

        let canonical = match self.by_nid.get(&nid).map(|known| known.clone()) {
            Some(known) if added.is_empty() => known,
            Some(known) => known.merged(&PublicId::new(added.iter().copied())?),
            None => PublicId::new(added.iter().copied())?,
        };
        // Publish the reverse mapping first so a reader that finds a uuid can
        // always find the public id as well.
        self.by_nid.insert(nid, canonical);
        for uuid in added {
            self.by_uuid.insert(uuid, nid);
        }
        self.changed.store(true, Ordering::Release);
        Ok(nid)
    }

    /// Convenience for [`resolve`](Self::resolve) over a raw alias slice.
    pub fn resolve_uuids(&self, uuids: &[Uuid]) -> Result<Nid, ConfigurationError> {
        self.resolve(&PublicId::new(uuids.iter().copied())?)
    }

    fn fully_mapped(&self, id: &PublicId) -> Option<Nid> {
        let mut found = None;
        for uuid in id.uuids() {
            let nid = *self.by_uuid.get(uuid)?;
            match found {
                None => found = Some(nid),
                Some(other) if other != nid => return None,
                Some(_) => {}
            }
        }
        found
    }

    /// Looks up a single alias without allocating.
    pub fn nid(&self, uuid: &Uuid) -> Option<Nid> {
        self.by_uuid.get(uuid).map(|nid| *nid)
    }

    /// Looks up any alias of `id` without allocating.
    pub fn nid_for(&self, id: &PublicId) -> Option<Nid> {
        id.uuids().iter().find_map(|uuid| self.nid(uuid))
    }

    pub fn public_id(&self, nid: Nid) -> Option<PublicId> {
        self.by_nid.get(&nid).map(|id| id.clone())
    }

    /// The nid the next allocation will hand out.
    pub fn next_nid(&self) -> Nid {
        Nid::new(self.next.load(Ordering::Acquire))
    }

    /// Number of allocated nids.
    pub fn len(&self) -> usize {
        self.by_nid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_nid.is_empty()
    }

    /// Whether the registry changed since the last [`encode_table`](Self::encode_table).
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Serializes the allocation counter and every nid's canonical public id.
    ///
    /// Clears the changed flag; callers that fail to persist the result should
    /// call [`mark_changed`](Self::mark_changed).
    pub fn encode_table(&self) -> Vec<u8> {
        let _guard = self.allocation.lock();
        self.changed.store(false, Ordering::Release);

        let mut entries: Vec<(Nid, PublicId)> = self
            .by_nid
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(nid, _)| *nid);

        let mut out = Vec::with_capacity(24 + entries.len() * 24);
        out.extend_from_slice(&MAGIC_MARKER_IDENTITY);
        put_i32(&mut out, self.next.load(Ordering::Acquire));
        put_u32(&mut out, entries.len() as u32);
        for (nid, id) in entries {
            put_i32(&mut out, nid.raw());
            put_u32(&mut out, id.uuids().len() as u32);
            for uuid in id.uuids() {
                put_uuid(&mut out, uuid);
            }
        }
        out
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Rebuilds a registry from [`encode_table`](Self::encode_table) output.
    pub fn decode_table(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        if reader.slice(MAGIC_MARKER_IDENTITY.len())? != MAGIC_MARKER_IDENTITY {
            return Err(DecodeError::BadMagic);
        }
        let registry = Self::new();
        registry.next.store(reader.i32()?, Ordering::Release);
        let count = reader.u32()?;
        for _ in 0..count {
            let nid = Nid::new(reader.i32()?);
            let aliases = reader.u32()?;
            let mut uuids = Vec::with_capacity((aliases as usize).min(reader.remaining() / 16));
            for _ in 0..aliases {
                let uuid = reader.uuid()?;
                registry.by_uuid.insert(uuid, nid);
                uuids.push(uuid);
            }
            let id = PublicId::new(uuids).map_err(|_| DecodeError::InvalidPublicId)?;
            registry.by_nid.insert(nid, id);
        }
        reader.finish()?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn allocates_monotonically() {
        let registry = IdentityRegistry::new();
        let a = registry.resolve_uuids(&[uuid(1)]).unwrap();
        let b = registry.resolve_uuids(&[uuid(2)]).unwrap();
        assert_eq!(a, Nid::FIRST);
        assert!(b > a);
        assert_eq!(registry.resolve_uuids(&[uuid(1)]).unwrap(), a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn aliases_fold_onto_existing_nid() {
        let registry = IdentityRegistry::new();
        let a = registry.resolve_uuids(&[uuid(1)]).unwrap();
        let merged = registry.resolve_uuids(&[uuid(7), uuid(1)]).unwrap();
        assert_eq!(a, merged);
        assert_eq!(registry.nid(&uuid(7)), Some(a));
        assert_eq!(registry.public_id(a).unwrap().uuids(), &[uuid(1), uuid(7)]);
        assert_eq!(registry.next_nid(), Nid::FIRST.next().unwrap());
    }

    #[test]
    fn empty_alias_set_is_rejected() {
        let registry = IdentityRegistry::new();
        assert!(matches!(
            registry.resolve_uuids(&[]),
            Err(ConfigurationError::EmptyAliasSet)
        ));
    }

    #[test]
    fn table_round_trip() {
        let registry = IdentityRegistry::new();
        registry.resolve_uuids(&[uuid(1), uuid(2)]).unwrap();
        registry.resolve_uuids(&[uuid(3)]).unwrap();
        assert!(registry.is_changed());

        let table = registry.encode_table();
        assert!(!registry.is_changed());

        let restored = IdentityRegistry::decode_table(&table).unwrap();
        assert_eq!(restored.next_nid(), registry.next_nid());
        assert_eq!(restored.nid(&uuid(2)), registry.nid(&uuid(2)));
        assert_eq!(
            restored.public_id(Nid::FIRST),
            registry.public_id(Nid::FIRST)
        );
        assert_eq!(restored.encode_table(), table);
    }

    #[test]
    fn corrupt_table_is_rejected() {
        assert_eq!(
            IdentityRegistry::decode_table(b"not a table at all").unwrap_err(),
            DecodeError::BadMagic
        );
    }
}
