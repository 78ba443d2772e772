//! Stamp coordinates: the view a resolution is computed under.
//!
//! A coordinate is a plain value. Equal coordinates hash equally, so they can
//! key caches directly; [`CoordinateInterner`] additionally hands out one
//! shared instance per distinct value.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use quick_cache::sync::Cache;

use crate::error::ConfigurationError;
use crate::id::Nid;
use crate::stamp::{Status, LATEST};

/// A set of [`Status`] values.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct StatusSet(u8);

impl StatusSet {
    pub const fn empty() -> Self {
        StatusSet(0)
    }

    pub const fn active_only() -> Self {
        StatusSet(1 << Status::Active as u8)
    }

    pub const fn active_and_inactive() -> Self {
        StatusSet((1 << Status::Active as u8) | (1 << Status::Inactive as u8))
    }

    /// Every status except canceled.
    pub const fn all() -> Self {
        StatusSet(
            (1 << Status::Active as u8)
                | (1 << Status::Inactive as u8)
                | (1 << Status::Withdrawn as u8)
                | (1 << Status::Primordial as u8),
        )
    }

    pub const fn with(self, status: Status) -> Self {
        StatusSet(self.0 | (1 << status as u8))
    }

    pub const fn without(self, status: Status) -> Self {
        StatusSet(self.0 & !(1 << status as u8))
    }

    pub const fn contains(&self, status: Status) -> bool {
        self.0 & (1 << status as u8) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Status> + '_ {
        Status::ALL
            .into_iter()
            .filter(move |status| self.contains(*status))
    }
}

impl FromIterator<Status> for StatusSet {
    fn from_iter<I: IntoIterator<Item = Status>>(iter: I) -> Self {
        iter.into_iter().fold(StatusSet::empty(), StatusSet::with)
    }
}

impl fmt::Debug for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A point in time on a path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StampPosition {
    pub time: i64,
    pub path: Nid,
}

impl StampPosition {
    pub fn new(time: i64, path: Nid) -> Self {
        Self { time, path }
    }

    /// The very latest state of `path`, including uncommitted work.
    pub fn latest(path: Nid) -> Self {
        Self::new(LATEST, path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StampCoordinate {
    allowed: StatusSet,
    position: StampPosition,
    module_priority: Vec<Nid>,
    module_exclusions: BTreeSet<Nid>,
}

impl StampCoordinate {
    pub fn builder(path: Nid) -> StampCoordinateBuilder {
        StampCoordinateBuilder {
            allowed: StatusSet::active_only(),
            position: StampPosition::latest(path),
            module_priority: Vec::new(),
            module_exclusions: BTreeSet::new(),
        }
    }

    pub fn allowed(&self) -> StatusSet {
        self.allowed
    }

    pub fn position(&self) -> StampPosition {
        self.position
    }

    pub fn time(&self) -> i64 {
        self.position.time
    }

    pub fn path(&self) -> Nid {
        self.position.path
    }

    /// Modules in order of preference, most preferred first.
    pub fn module_priority(&self) -> &[Nid] {
        &self.module_priority
    }

    pub fn module_exclusions(&self) -> &BTreeSet<Nid> {
        &self.module_exclusions
    }

    pub fn is_excluded(&self, module: Nid) -> bool {
        self.module_exclusions.contains(&module)
    }

    /// Rank of `module` in the preference order; unranked modules sort last.
    pub fn module_rank(&self, module: Nid) -> usize {
        self.module_priority
            .iter()
            .position(|preferred| *preferred == module)
            .unwrap_or(usize::MAX)
    }

    /// The same view at another time.
    pub fn at(&self, time: i64) -> StampCoordinate {
        StampCoordinate {
            position: StampPosition::new(time, self.position.path),
            ..self.clone()
        }
    }

    /// The same view on another path.
    pub fn on_path(&self, path: Nid) -> StampCoordinate {
        StampCoordinate {
            position: StampPosition::new(self.position.time, path),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
pub struct StampCoordinateBuilder {
    allowed: StatusSet,
    position: StampPosition,
    module_priority: Vec<Nid>,
    module_exclusions: BTreeSet<Nid>,
}

impl StampCoordinateBuilder {
    pub fn allowed(mut self, allowed: StatusSet) -> Self {
        self.allowed = allowed;
        self
    }

    pub fn at(mut self, time: i64) -> Self {
        self.position.time = time;
        self
    }

    /// Sets the preference order. Repeated modules keep their first rank.
    pub fn module_priority<I>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = Nid>,
    {
        self.module_priority.clear();
        for module in modules {
            if !self.module_priority.contains(&module) {
                self.module_priority.push(module);
            }
        }
        self
    }

    pub fn exclude_module(mut self, module: Nid) -> Self {
        self.module_exclusions.insert(module);
        self
    }

    /// Canceled stamps never resolve, so [`Status::Canceled`] is dropped from
    /// the allowed set. Fails with [`ConfigurationError::EmptyAllowedStates`]
    /// if nothing else is allowed.
    pub fn build(self) -> Result<StampCoordinate, ConfigurationError> {
        let allowed = self.allowed.without(Status::Canceled);
        if allowed.is_empty() {
            return Err(ConfigurationError::EmptyAllowedStates);
        }
        Ok(StampCoordinate {
            allowed,
            position: self.position,
            module_priority: self.module_priority,
            module_exclusions: self.module_exclusions,
        })
    }
}

/// Hands out one shared instance per distinct coordinate value.
///
/// Bounded: rarely used coordinates are evicted and re-interned on next use.
pub struct CoordinateInterner {
    interned: Cache<StampCoordinate, Arc<StampCoordinate>>,
}

impl CoordinateInterner {
    pub fn new(capacity: usize) -> Self {
        Self {
            interned: Cache::new(capacity),
        }
    }

    pub fn intern(&self, coordinate: &StampCoordinate) -> Arc<StampCoordinate> {
        match self
            .interned
            .get_or_insert_with::<_, Infallible>(coordinate, || Ok(Arc::new(coordinate.clone())))
        {
            Ok(interned) => interned,
            Err(never) => match never {},
        }
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    pub fn clear(&self) {
        self.interned.clear();
    }
}

impl fmt::Debug for CoordinateInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateInterner")
            .field("len", &self.interned.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(n: i32) -> Nid {
        Nid::new(Nid::FIRST.raw() + n)
    }

    #[test]
    fn status_sets() {
        let set: StatusSet = [Status::Active, Status::Withdrawn].into_iter().collect();
        assert!(set.contains(Status::Active));
        assert!(!set.contains(Status::Inactive));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Status::Active, Status::Withdrawn]);
        assert!(!StatusSet::all().contains(Status::Canceled));
        assert!(StatusSet::empty().is_empty());
    }

    #[test]
    fn empty_allowed_states_are_rejected() {
        assert!(matches!(
            StampCoordinate::builder(nid(0))
                .allowed(StatusSet::empty())
                .build(),
            Err(ConfigurationError::EmptyAllowedStates)
        ));
        assert!(matches!(
            StampCoordinate::builder(nid(0))
                .allowed(StatusSet::empty().with(Status::Canceled))
                .build(),
            Err(ConfigurationError::EmptyAllowedStates)
        ));
        let coordinate = StampCoordinate::builder(nid(0))
            .allowed(StatusSet::all().with(Status::Canceled))
            .build()
            .unwrap();
        assert_eq!(coordinate.allowed(), StatusSet::all());
    }

    #[test]
    fn builder_defaults_and_ranks() {
        let coordinate = StampCoordinate::builder(nid(0))
            .at(15)
            .module_priority([nid(3), nid(2), nid(3)])
            .exclude_module(nid(9))
            .build()
            .unwrap();
        assert_eq!(coordinate.time(), 15);
        assert_eq!(coordinate.allowed(), StatusSet::active_only());
        assert_eq!(coordinate.module_priority(), &[nid(3), nid(2)]);
        assert_eq!(coordinate.module_rank(nid(2)), 1);
        assert_eq!(coordinate.module_rank(nid(4)), usize::MAX);
        assert!(coordinate.is_excluded(nid(9)));
        assert_eq!(coordinate.at(LATEST).time(), LATEST);
        assert_eq!(coordinate.on_path(nid(1)).path(), nid(1));
    }

    #[test]
    fn interning_shares_equal_values() {
        let interner = CoordinateInterner::new(16);
        let a = StampCoordinate::builder(nid(0)).at(10).build().unwrap();
        let b = StampCoordinate::builder(nid(0)).at(10).build().unwrap();
        let c = StampCoordinate::builder(nid(0)).at(11).build().unwrap();

        let first = interner.intern(&a);
        assert!(Arc::ptr_eq(&first, &interner.intern(&b)));
        assert!(!Arc::ptr_eq(&first, &interner.intern(&c)));
        assert_eq!(interner.len(), 2);

        interner.clear();
        assert!(!Arc::ptr_eq(&first, &interner.intern(&a)));
    }
}
