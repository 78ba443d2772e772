//! The store facade.
//!
//! [`Store`] ties the identity registry, the spined payload store, the path
//! graph and the resolution caches together and owns their persistence. All
//! state hangs off one value; there are no process-wide caches, and
//! [`Store::reset_caches`] is the one way to invalidate resolution state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::calculator::{CalculatorCache, StampCalculator};
use crate::chronology::{merge_chronology, Chronology, ComponentKind, Version, TAG_CHRONOLOGY};
use crate::codec::{Decode, Encode};
use crate::config::{StampDedup, StoreConfig};
use crate::coordinate::StampCoordinate;
use crate::error::{ConfigurationError, NotFound, StoreError, TransactionError};
use crate::id::{IdentityRegistry, Nid, PublicId};
use crate::latest::Latest;
use crate::path::{PathGraph, PathOrigin};
use crate::spine::{open_storage, CancelToken, MemoryStorage, SpineStorage, SpinedStore};
use crate::stamp::{
    merge_stamp, StampChronology, StampFields, Status, Transaction, CANCELED, UNCOMMITTED,
};

pub const IDENTITY_TABLE: &str = "identity";
pub const PATH_TABLE: &str = "paths";

/// What a [`Store::flush`] wrote.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub spines: usize,
    pub tables: usize,
}

pub struct Store {
    root: Option<PathBuf>,
    config: StoreConfig,
    storage: Arc<dyn SpineStorage>,
    identity: IdentityRegistry,
    spines: Arc<SpinedStore>,
    paths: Arc<PathGraph>,
    calculators: CalculatorCache,
    statuses: [Nid; 5],
    closed: bool,
}

impl Store {
    /// Opens the store at `root`, reading `<root>/store.toml` if present.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let config = StoreConfig::load_for_root(root)?;
        Self::open_with(root, config)
    }

    pub fn open_with(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let storage = open_storage(config.backend, root)?;
        let store = Self::with_storage(storage, config, Some(root.to_path_buf()))?;
        tracing::info!(
            "opened store at {} ({} identities, {} persisted spines)",
            root.display(),
            store.identity.len(),
            store.spines.spine_limit()
        );
        Ok(store)
    }

    /// A store over a fresh in-memory backend.
    pub fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Self::with_storage(Arc::new(MemoryStorage::new()), config, None)
    }

    /// A store over an explicit backend.
    ///
    /// Reopening over a cloned [`MemoryStorage`] sees everything flushed
    /// through the previous store.
    pub fn with_storage(
        storage: Arc<dyn SpineStorage>,
        config: StoreConfig,
        root: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let identity = match storage.read_table(IDENTITY_TABLE)? {
            Some(table) => IdentityRegistry::decode_table(&table)?,
            None => IdentityRegistry::new(),
        };
        let paths = match storage.read_table(PATH_TABLE)? {
            Some(table) => PathGraph::decode_table(&table)?,
            None => PathGraph::new(),
        };

        let mut statuses = [Nid::FIRST; 5];
        for (slot, status) in statuses.iter_mut().zip(Status::ALL) {
            *slot = identity.resolve(&PublicId::from_uuid(status.uuid())?)?;
        }

        let spines = Arc::new(SpinedStore::new(storage.clone(), &config));
        let paths = Arc::new(paths);
        let calculators = CalculatorCache::new(spines.clone(), paths.clone(), &config);
        Ok(Self {
            root,
            config,
            storage,
            identity,
            spines,
            paths,
            calculators,
            statuses,
            closed: false,
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn spines(&self) -> &SpinedStore {
        &self.spines
    }

    // Identity

    /// The nid for an alias set, allocating one on first sight.
    pub fn resolve_nid(&self, uuids: &[Uuid]) -> Result<Nid, StoreError> {
        Ok(self.identity.resolve_uuids(uuids)?)
    }

    pub fn resolve(&self, id: &PublicId) -> Result<Nid, StoreError> {
        Ok(self.identity.resolve(id)?)
    }

    pub fn nid_if_known(&self, uuid: &Uuid) -> Option<Nid> {
        self.identity.nid(uuid)
    }

    pub fn nid(&self, uuid: &Uuid) -> Result<Nid, StoreError> {
        self.identity
            .nid(uuid)
            .ok_or_else(|| NotFound::Uuid(*uuid).into())
    }

    pub fn public_id(&self, nid: Nid) -> Result<PublicId, StoreError> {
        self.identity
            .public_id(nid)
            .ok_or_else(|| NotFound::Nid(nid).into())
    }

    pub fn status_nid(&self, status: Status) -> Nid {
        self.statuses[status.code() as usize - 1]
    }

    // Raw payloads

    pub fn get_bytes(&self, nid: Nid) -> Option<Bytes> {
        self.spines.get(nid)
    }

    pub fn merge<F>(&self, nid: Nid, payload: Bytes, merge: F) -> Result<Bytes, StoreError>
    where
        F: Fn(&Bytes, &Bytes) -> Bytes,
    {
        self.spines.merge(nid, payload, merge)
    }

    pub fn for_each<F>(&self, action: F)
    where
        F: FnMut(Nid, &Bytes),
    {
        self.spines.for_each(action)
    }

    pub fn for_each_parallel<F>(&self, action: F)
    where
        F: Fn(Nid, &Bytes) + Sync,
    {
        self.spines.for_each_parallel(action)
    }

    pub fn for_each_parallel_until<F>(&self, cancel: &CancelToken, action: F)
    where
        F: Fn(Nid, &Bytes) + Sync,
    {
        self.spines.for_each_parallel_until(cancel, action)
    }

    // Stamps

    /// Records a committed stamp and returns its nid.
    ///
    /// Under [`StampDedup::Committed`] identical tuples share one nid.
    pub fn commit_stamp(
        &self,
        status: Status,
        time: i64,
        author: Nid,
        module: Nid,
        path: Nid,
    ) -> Result<Nid, StoreError> {
        if time == UNCOMMITTED || time == CANCELED {
            return Err(ConfigurationError::SentinelTime(time).into());
        }
        let fields = StampFields::new(status, time, author, module, path);
        self.create_stamp(fields, self.config.stamp_dedup == StampDedup::Committed)
    }

    pub(crate) fn create_stamp(&self, fields: StampFields, dedup: bool) -> Result<Nid, StoreError> {
        let uuid = if dedup && fields.is_committed() {
            fields.content_uuid()
        } else {
            Uuid::new_v4()
        };
        let nid = self.identity.resolve(&PublicId::from_uuid(uuid)?)?;
        let stored = self
            .spines
            .merge(nid, StampChronology::new(fields).encode(), merge_stamp)?;
        let current = StampChronology::decode(&stored)?.current();
        if current != fields && current.is_canceled() {
            return Err(TransactionError::StampCanceled(nid).into());
        }
        Ok(nid)
    }

    /// Appends `fields` to a stamp's history and returns the effective stamp.
    fn update_stamp(&self, nid: Nid, fields: StampFields) -> Result<StampFields, StoreError> {
        let stored = self
            .spines
            .merge(nid, StampChronology::new(fields).encode(), merge_stamp)?;
        Ok(StampChronology::decode(&stored)?.current())
    }

    pub(crate) fn commit_member(&self, nid: Nid, time: i64) -> Result<(), StoreError> {
        let committed = self.stamp(nid)?.committed_at(time);
        let current = self.update_stamp(nid, committed)?;
        if current == committed {
            Ok(())
        } else if current.is_canceled() {
            Err(TransactionError::StampCanceled(nid).into())
        } else {
            Err(TransactionError::StampCommitted(nid).into())
        }
    }

    pub(crate) fn cancel_member(&self, nid: Nid) -> Result<(), StoreError> {
        let current = self.stamp(nid)?;
        if current.is_committed() {
            return Err(TransactionError::StampCommitted(nid).into());
        }
        // A commit may land between the read and the update.
        if self.update_stamp(nid, current.canceled())?.is_committed() {
            return Err(TransactionError::StampCommitted(nid).into());
        }
        Ok(())
    }

    /// Cancels an uncommitted stamp. Every version carrying it stops being
    /// visible; its history keeps the previous entries.
    ///
    /// Committed stamps are immutable and fail with
    /// [`TransactionError::StampCommitted`]. Retract committed content with
    /// [`cancel_version`](Self::cancel_version) or a newer version instead.
    pub fn cancel_stamp(&self, nid: Nid) -> Result<(), StoreError> {
        self.cancel_member(nid)?;
        self.reset_caches();
        Ok(())
    }

    /// The effective fields of stamp `nid`.
    pub fn stamp(&self, nid: Nid) -> Result<StampFields, StoreError> {
        Ok(self.stamp_history(nid)?.current())
    }

    pub fn stamp_history(&self, nid: Nid) -> Result<StampChronology, StoreError> {
        let payload = self.spines.get(nid).ok_or(NotFound::Stamp(nid))?;
        Ok(StampChronology::decode(&payload)?)
    }

    pub fn transaction(&self, name: impl Into<String>) -> Transaction<'_> {
        Transaction::new(self, name)
    }

    // Chronologies

    /// Appends `version` to the chronology at `nid`, creating it with `kind`
    /// if needed, and returns the chronology as stored afterwards.
    ///
    /// While `version.stamp` is uncommitted, appending again replaces that
    /// version's fields. Once the stamp is committed or canceled the recorded
    /// version is final, and appending different fields for it fails with
    /// [`StoreError::VersionRejected`]. The same error is returned when the
    /// slot at `nid` holds another component.
    pub fn append_version(
        &self,
        nid: Nid,
        kind: ComponentKind,
        version: Version,
    ) -> Result<Chronology, StoreError> {
        let replace = self.stamp(version.stamp)?.is_uncommitted();
        let stamp = version.stamp;
        let fields = version.fields.clone();
        let update = Chronology::new(nid, kind, version);
        let stored = self.spines.merge(nid, update.encode(), |existing, update| {
            merge_chronology(existing, update, replace)
        })?;
        let chronology = Chronology::decode(&stored)?;
        let recorded = chronology.version(stamp).map(|v| &v.fields);
        if chronology.nid() != nid || recorded != Some(&fields) {
            tracing::warn!("{nid} did not take the version for stamp {stamp}");
            return Err(StoreError::VersionRejected {
                component: nid,
                stamp,
            });
        }
        Ok(chronology)
    }

    pub fn chronology(&self, nid: Nid) -> Result<Chronology, StoreError> {
        let payload = self.spines.get(nid).ok_or(NotFound::Nid(nid))?;
        Ok(Chronology::decode(&payload)?)
    }

    /// Retracts the version of `nid` carrying `stamp`.
    ///
    /// Appends a copy of the version under a new canceled stamp that keeps
    /// author, module and path. If the original stamp is still uncommitted it
    /// is canceled as well, which hides the version. Returns the new stamp.
    pub fn cancel_version(&self, nid: Nid, stamp: Nid) -> Result<Nid, StoreError> {
        let chronology = self.chronology(nid)?;
        let version = chronology
            .version(stamp)
            .ok_or(NotFound::Stamp(stamp))?
            .clone();
        let fields = self.stamp(stamp)?;
        if fields.is_uncommitted() {
            self.cancel_member(stamp)?;
        }
        let canceled = self.create_stamp(fields.canceled(), false)?;
        self.append_version(
            nid,
            chronology.kind(),
            Version::new(canceled, version.fields),
        )?;
        self.reset_caches();
        Ok(canceled)
    }

    // Paths

    /// Lets `path` inherit `origin`'s history up to `time`.
    pub fn add_path_origin(&self, path: Nid, origin: Nid, time: i64) -> Result<(), StoreError> {
        if self.paths.add_origin(path, origin, time)? {
            self.reset_caches();
        }
        Ok(())
    }

    pub fn path_origins(&self, path: Nid) -> Vec<PathOrigin> {
        self.paths.origins(path)
    }

    // Resolution

    pub fn calculator(&self, coordinate: &StampCoordinate) -> Arc<StampCalculator> {
        self.calculators.calculator(coordinate)
    }

    pub fn intern(&self, coordinate: &StampCoordinate) -> Arc<StampCoordinate> {
        self.calculators.intern(coordinate)
    }

    pub fn latest(&self, coordinate: &StampCoordinate, nid: Nid) -> Latest<Version> {
        self.calculator(coordinate).latest(nid)
    }

    /// Like [`latest`](Self::latest) for callers that need exactly one
    /// answer.
    pub fn latest_single(&self, coordinate: &StampCoordinate, nid: Nid) -> Result<Version, StoreError> {
        match self.latest(coordinate, nid) {
            Latest::Single(version) => Ok(version),
            Latest::Absent => Err(NotFound::Latest(nid).into()),
            Latest::Contradiction(versions) => Err(StoreError::Contradiction {
                nid,
                count: versions.len(),
            }),
        }
    }

    /// Resolves every stored chronology in parallel.
    pub fn for_each_latest<F>(&self, coordinate: &StampCoordinate, action: F)
    where
        F: Fn(Nid, Latest<Version>) + Sync,
    {
        let calculator = self.calculator(coordinate);
        self.spines.for_each_parallel(|nid, payload| {
            if payload.first() == Some(&TAG_CHRONOLOGY) {
                action(nid, calculator.latest_payload(nid, payload));
            }
        });
    }

    /// Drops every cached calculator and interned coordinate.
    pub fn reset_caches(&self) {
        self.calculators.reset();
    }

    pub fn cache_generation(&self) -> u64 {
        self.calculators.generation()
    }

    // Persistence

    fn has_unflushed(&self) -> bool {
        self.spines.has_changes() || self.identity.is_changed() || self.paths.is_changed()
    }

    /// Writes changed tables, then changed spines.
    ///
    /// Spines hold nids the identity table assigns, so a failed table write
    /// returns before any spine is written. Both tables are attempted. Spine
    /// writes are all attempted and the first failure is returned. Whatever
    /// failed stays marked for the next flush.
    pub fn flush(&self) -> Result<FlushStats, StoreError> {
        let mut stats = FlushStats::default();
        let mut first_error: Option<StoreError> = None;

        if self.identity.is_changed() {
            let table = self.identity.encode_table();
            match self.storage.write_table(IDENTITY_TABLE, &table) {
                Ok(()) => stats.tables += 1,
                Err(e) => {
                    self.identity.mark_changed();
                    tracing::error!("writing the identity table failed: {e}");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if self.paths.is_changed() {
            let table = self.paths.encode_table();
            match self.storage.write_table(PATH_TABLE, &table) {
                Ok(()) => stats.tables += 1,
                Err(e) => {
                    self.paths.mark_changed();
                    tracing::error!("writing the path table failed: {e}");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_error {
            tracing::warn!("{} tables written, spines left for the next flush", stats.tables);
            return Err(e);
        }

        stats.spines = self.spines.write()?;

        tracing::debug!(
            "flushed {} spines and {} tables",
            stats.spines,
            stats.tables
        );
        Ok(stats)
    }

    /// Flushes and consumes the store.
    pub fn close(mut self) -> Result<(), StoreError> {
        let res = self.flush();
        self.closed = true;
        match &self.root {
            Some(root) => tracing::info!("closed store at {}", root.display()),
            None => tracing::info!("closed in-memory store"),
        }
        res.map(|_| ())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed && self.has_unflushed() {
            tracing::warn!("store dropped without close() or flush(); changes were not persisted");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("identities", &self.identity.len())
            .field("spines", &self.spines.spine_limit())
            .field("calculators", &self.calculators)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::StatusSet;
    use crate::spine::storage::FailingStorage;
    use crate::spine::Backend;

    fn config() -> StoreConfig {
        StoreConfig {
            spine_size: 8,
            workers: 2,
            backend: Backend::Memory,
            ..StoreConfig::default()
        }
    }

    fn concept(store: &Store) -> Nid {
        store.resolve(&PublicId::random()).unwrap()
    }

    #[test]
    fn statuses_are_registered() {
        let store = Store::in_memory(config()).unwrap();
        assert_eq!(store.status_nid(Status::Active), Nid::FIRST);
        for status in Status::ALL {
            assert_eq!(store.nid(&status.uuid()).unwrap(), store.status_nid(status));
        }
    }

    #[test]
    fn unknown_lookups_are_not_found() {
        let store = Store::in_memory(config()).unwrap();
        let stranger = Uuid::new_v4();
        assert_eq!(store.nid_if_known(&stranger), None);
        assert!(matches!(
            store.nid(&stranger),
            Err(StoreError::NotFound(NotFound::Uuid(_)))
        ));
        assert!(matches!(
            store.chronology(Nid::new(0)),
            Err(StoreError::NotFound(NotFound::Nid(_)))
        ));
        assert!(matches!(
            store.stamp(Nid::new(0)),
            Err(StoreError::NotFound(NotFound::Stamp(_)))
        ));
    }

    #[test]
    fn committed_stamps_are_deduplicated() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let a = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        let b = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        let c = store.commit_stamp(Status::Active, 11, author, module, path).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let never = Store::in_memory(StoreConfig {
            stamp_dedup: StampDedup::Never,
            ..config()
        })
        .unwrap();
        let a = never.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        let b = never.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn append_and_resolve() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let component = concept(&store);
        let s1 = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        let s2 = store.commit_stamp(Status::Active, 20, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(s1, &b"one"[..]))
            .unwrap();
        let chronology = store
            .append_version(component, ComponentKind::Concept, Version::new(s2, &b"two"[..]))
            .unwrap();
        assert_eq!(chronology.len(), 2);

        let coordinate = StampCoordinate::builder(path).at(15).build().unwrap();
        assert_eq!(
            store.latest_single(&coordinate, component).unwrap(),
            Version::new(s1, &b"one"[..])
        );
        assert!(matches!(
            store.latest_single(&coordinate.at(5), component),
            Err(StoreError::NotFound(NotFound::Latest(_)))
        ));
    }

    #[test]
    fn append_needs_a_stamp() {
        let store = Store::in_memory(config()).unwrap();
        let component = concept(&store);
        assert!(matches!(
            store.append_version(
                component,
                ComponentKind::Concept,
                Version::new(Nid::new(0), &b"x"[..])
            ),
            Err(StoreError::NotFound(NotFound::Stamp(_)))
        ));
    }

    #[test]
    fn contradiction_is_an_error_only_on_demand() {
        let store = Store::in_memory(config()).unwrap();
        let (author, path) = (concept(&store), concept(&store));
        let (module_a, module_b) = (concept(&store), concept(&store));
        let component = concept(&store);
        let a = store.commit_stamp(Status::Active, 10, author, module_a, path).unwrap();
        let b = store.commit_stamp(Status::Active, 10, author, module_b, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(a, &b"a"[..]))
            .unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(b, &b"b"[..]))
            .unwrap();

        let coordinate = StampCoordinate::builder(path).build().unwrap();
        assert!(store.latest(&coordinate, component).is_contradiction());
        assert!(matches!(
            store.latest_single(&coordinate, component),
            Err(StoreError::Contradiction { count: 2, .. })
        ));
    }

    #[test]
    fn canceled_uncommitted_version_disappears() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let component = concept(&store);
        let tx = store.transaction("draft");
        let draft = tx.stamp(Status::Active, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(draft, &b"d"[..]))
            .unwrap();

        let coordinate = StampCoordinate::builder(path).build().unwrap();
        assert!(store.latest(&coordinate, component).single().is_some());

        let canceled = store.cancel_version(component, draft).unwrap();
        assert!(store.stamp(draft).unwrap().is_canceled());
        assert!(store.stamp(canceled).unwrap().is_canceled());
        assert_eq!(store.chronology(component).unwrap().len(), 2);
        assert_eq!(store.latest(&coordinate, component), Latest::Absent);
    }

    #[test]
    fn committed_stamps_cannot_be_canceled() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let component = concept(&store);
        let stamp = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(stamp, &b"c"[..]))
            .unwrap();
        let coordinate = StampCoordinate::builder(path).build().unwrap();
        let before = store.latest(&coordinate, component);

        assert!(matches!(
            store.cancel_stamp(stamp),
            Err(StoreError::Transaction(TransactionError::StampCommitted(_)))
        ));
        assert_eq!(store.stamp(stamp).unwrap().time, 10);
        assert_eq!(store.stamp_history(stamp).unwrap().versions().len(), 1);
        assert_eq!(store.latest(&coordinate, component), before);
    }

    #[test]
    fn committed_versions_are_final() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let component = concept(&store);
        let stamp = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(stamp, &b"a"[..]))
            .unwrap();
        // Appending the same version again is a no-op.
        store
            .append_version(component, ComponentKind::Concept, Version::new(stamp, &b"a"[..]))
            .unwrap();

        assert!(matches!(
            store.append_version(component, ComponentKind::Concept, Version::new(stamp, &b"b"[..])),
            Err(StoreError::VersionRejected { .. })
        ));
        assert_eq!(
            store.chronology(component).unwrap().versions(),
            &[Version::new(stamp, &b"a"[..])]
        );

        let tx = store.transaction("draft");
        let draft = tx.stamp(Status::Active, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(draft, &b"d1"[..]))
            .unwrap();
        let chronology = store
            .append_version(component, ComponentKind::Concept, Version::new(draft, &b"d2"[..]))
            .unwrap();
        assert_eq!(chronology.version(draft).unwrap().fields, &b"d2"[..]);
    }

    #[test]
    fn append_into_another_component_is_rejected() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let stamp = store.commit_stamp(Status::Active, 10, author, module, path).unwrap();
        // The stamp's own slot holds a stamp history, not a chronology.
        assert!(matches!(
            store.append_version(stamp, ComponentKind::Concept, Version::new(stamp, &b"x"[..])),
            Err(StoreError::Decode(_))
        ));

        let (component, other) = (concept(&store), concept(&store));
        let foreign = Chronology::new(other, ComponentKind::Concept, Version::new(stamp, &b"f"[..]));
        store
            .merge(component, foreign.encode(), |existing, _| existing.clone())
            .unwrap();
        assert!(matches!(
            store.append_version(component, ComponentKind::Concept, Version::new(stamp, &b"x"[..])),
            Err(StoreError::VersionRejected { component: c, .. }) if c == component
        ));
        assert_eq!(store.chronology(component).unwrap(), foreign);
    }

    #[test]
    fn failed_table_write_holds_back_spines() {
        let storage = FailingStorage::over(MemoryStorage::new());
        let store = Store::with_storage(Arc::new(storage.clone()), config(), None).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let component = concept(&store);
        let stamp = store.commit_stamp(Status::Active, 1, author, module, path).unwrap();
        store
            .append_version(component, ComponentKind::Concept, Version::new(stamp, &b"c"[..]))
            .unwrap();

        storage.fail_table_writes(true);
        assert!(matches!(store.flush(), Err(StoreError::Io(_))));
        assert!(store.identity().is_changed());
        assert!(store.spines().has_changes());
        assert!(storage.spine_indices().unwrap().is_empty());

        storage.fail_table_writes(false);
        let stats = store.flush().unwrap();
        assert_eq!(stats.tables, 1);
        assert!(stats.spines > 0);
        assert!(!store.has_unflushed());
        store.close().unwrap();

        let reopened = Store::with_storage(Arc::new(storage), config(), None).unwrap();
        assert_eq!(
            reopened.latest_single(&StampCoordinate::builder(path).build().unwrap(), component).unwrap(),
            Version::new(stamp, &b"c"[..])
        );
    }

    #[test]
    fn path_changes_reset_caches() {
        let store = Store::in_memory(config()).unwrap();
        let (p, q) = (concept(&store), concept(&store));
        let coordinate = StampCoordinate::builder(q)
            .allowed(StatusSet::all())
            .build()
            .unwrap();
        let before = store.calculator(&coordinate);
        let generation = store.cache_generation();

        store.add_path_origin(q, p, 100).unwrap();
        assert_eq!(store.cache_generation(), generation + 1);
        store.add_path_origin(q, p, 100).unwrap();
        assert_eq!(store.cache_generation(), generation + 1);

        let after = store.calculator(&coordinate);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(store.path_origins(q), vec![PathOrigin { origin: p, time: 100 }]);
    }

    #[test]
    fn reopen_over_shared_memory() {
        let storage = MemoryStorage::new();
        let (component, stamp, alias) = {
            let store = Store::with_storage(Arc::new(storage.clone()), config(), None).unwrap();
            let (author, module, path) = (concept(&store), concept(&store), concept(&store));
            let alias = Uuid::new_v4();
            let component = store.resolve_nid(&[alias]).unwrap();
            let stamp = store.commit_stamp(Status::Active, 1, author, module, path).unwrap();
            store
                .append_version(component, ComponentKind::Pattern, Version::new(stamp, &b"p"[..]))
                .unwrap();
            store.add_path_origin(path, module, 5).unwrap();
            let stats = store.flush().unwrap();
            assert_eq!(stats.tables, 2);
            store.close().unwrap();
            (component, stamp, alias)
        };

        let reopened = Store::with_storage(Arc::new(storage), config(), None).unwrap();
        assert_eq!(reopened.nid(&alias).unwrap(), component);
        let chronology = reopened.chronology(component).unwrap();
        assert_eq!(chronology.kind(), ComponentKind::Pattern);
        assert_eq!(chronology.versions(), &[Version::new(stamp, &b"p"[..])]);
        assert_eq!(reopened.stamp(stamp).unwrap().time, 1);
    }

    #[test]
    fn for_each_latest_skips_stamps() {
        let store = Store::in_memory(config()).unwrap();
        let (author, module, path) = (concept(&store), concept(&store), concept(&store));
        let stamp = store.commit_stamp(Status::Active, 1, author, module, path).unwrap();
        let components: Vec<Nid> = (0..20).map(|_| concept(&store)).collect();
        for component in &components {
            store
                .append_version(*component, ComponentKind::Semantic, Version::new(stamp, &b"s"[..]))
                .unwrap();
        }

        let coordinate = StampCoordinate::builder(path).build().unwrap();
        let seen = parking_lot::Mutex::new(Vec::new());
        store.for_each_latest(&coordinate, |nid, latest| {
            assert!(latest.single().is_some());
            seen.lock().push(nid);
        });
        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, components);
    }
}
