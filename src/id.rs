//! Component identifiers.
//!
//! Components are named across systems by one or more UUIDs (a [`PublicId`])
//! and addressed inside a store by a dense 32 bit surrogate, the [`Nid`].
//! The [`registry`] keeps the two in sync.

pub mod registry;

use std::fmt::Display;
use std::sync::Arc;

use uuid::Uuid;

pub use registry::IdentityRegistry;

use crate::error::ConfigurationError;

/// A dense surrogate key for a component, stable for the lifetime of a store.
///
/// Nids are handed out in increasing order starting at [`Nid::FIRST`], so
/// `nid - FIRST` can be used directly as an index into chunked arrays.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nid(i32);

impl Nid {
    /// The first nid a fresh registry hands out.
    pub const FIRST: Nid = Nid(i32::MIN + 1);

    pub const fn new(raw: i32) -> Self {
        Nid(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Distance from [`Nid::FIRST`], or `None` for nids below it.
    pub fn offset(self) -> Option<u64> {
        let offset = self.0 as i64 - Self::FIRST.0 as i64;
        u64::try_from(offset).ok()
    }

    pub fn from_offset(offset: u64) -> Option<Self> {
        let raw = (Self::FIRST.0 as i64).checked_add(i64::try_from(offset).ok()?)?;
        i32::try_from(raw).ok().map(Nid)
    }

    pub(crate) fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Nid)
    }
}

impl Display for Nid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nid({})", self.0)
    }
}

/// One or more UUIDs naming a component. Additional UUIDs are known aliases.
///
/// The first UUID is the primary one. Duplicates are dropped on construction
/// and the nil UUID is rejected, mirroring how a nil id can never name
/// anything.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublicId {
    uuids: Arc<[Uuid]>,
}

impl PublicId {
    pub fn new<I>(uuids: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut unique: Vec<Uuid> = Vec::new();
        for uuid in uuids {
            if uuid.is_nil() {
                return Err(ConfigurationError::NilUuid);
            }
            if !unique.contains(&uuid) {
                unique.push(uuid);
            }
        }
        if unique.is_empty() {
            return Err(ConfigurationError::EmptyAliasSet);
        }
        Ok(Self {
            uuids: unique.into(),
        })
    }

    pub fn from_uuid(uuid: Uuid) -> Result<Self, ConfigurationError> {
        Self::new([uuid])
    }

    /// A fresh public id with a single random (v4) UUID.
    pub fn random() -> Self {
        Self {
            uuids: Arc::from([Uuid::new_v4()]),
        }
    }

    pub fn primary(&self) -> Uuid {
        self.uuids[0]
    }

    pub fn uuids(&self) -> &[Uuid] {
        &self.uuids
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.uuids.contains(uuid)
    }

    /// The union of both alias sets, `self`'s UUIDs first.
    pub fn merged(&self, other: &PublicId) -> PublicId {
        if other.uuids.iter().all(|uuid| self.contains(uuid)) {
            return self.clone();
        }
        let mut uuids = self.uuids.to_vec();
        uuids.extend(other.uuids.iter().filter(|uuid| !self.contains(uuid)));
        PublicId {
            uuids: uuids.into(),
        }
    }
}

impl TryFrom<Uuid> for PublicId {
    type Error = ConfigurationError;

    fn try_from(uuid: Uuid) -> Result<Self, ConfigurationError> {
        PublicId::from_uuid(uuid)
    }
}

impl Display for PublicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicId(")?;
        for (i, uuid) in self.uuids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{uuid}")?;
        }
        write!(f, ")")
    }
}

#[cfg(feature = "proptest")]
pub struct PublicIdValueTree(PublicId);

/// Generates public ids with one to three random aliases.
#[cfg(feature = "proptest")]
#[derive(Debug)]
pub struct RandPublicId();

#[cfg(feature = "proptest")]
impl proptest::strategy::Strategy for RandPublicId {
    type Tree = PublicIdValueTree;
    type Value = PublicId;

    fn new_tree(
        &self,
        runner: &mut proptest::prelude::prop::test_runner::TestRunner,
    ) -> proptest::prelude::prop::strategy::NewTree<Self> {
        use proptest::prelude::RngCore;

        let rng = runner.rng();
        let count = 1 + (rng.next_u32() % 3) as usize;
        let uuids: Vec<Uuid> = (0..count)
            .map(|_| {
                let mut raw = [0u8; 16];
                rng.fill_bytes(&mut raw);
                raw[0] |= 1;
                Uuid::from_bytes(raw)
            })
            .collect();
        let id = PublicId::new(uuids).map_err(|e| e.to_string())?;
        Ok(PublicIdValueTree(id))
    }
}

#[cfg(feature = "proptest")]
impl proptest::strategy::ValueTree for PublicIdValueTree {
    type Value = PublicId;

    fn simplify(&mut self) -> bool {
        false
    }
    fn complicate(&mut self) -> bool {
        false
    }
    fn current(&self) -> PublicId {
        self.0.clone()
    }
}
