//! Latest-version resolution.
//!
//! A [`StampCalculator`] answers "which version of this component does the
//! coordinate see?" It is built once per coordinate and shared:
//!
//! 1. The *route* is computed up front: every path reachable from the
//!    coordinate's path through origin edges, each with the latest time still
//!    visible on it (its cutoff) and its distance from the coordinate's path.
//!    The coordinate's own path has distance zero and the coordinate's horizon
//!    as cutoff; an origin reached over an edge with time `t` gets
//!    `min(cutoff, t)`, applied recursively. A path reachable several ways
//!    keeps its largest cutoff.
//! 2. A version is visible when its stamp's status is allowed, its module is
//!    not excluded, its path is on the route, and its time does not exceed
//!    that path's cutoff. Canceled stamps are never visible.
//! 3. Among visible versions the newest win; among those the nearest paths
//!    win, so the coordinate's own path shadows inherited history at equal
//!    time. Remaining ties are broken by module preference when exactly one
//!    version holds the best rank, and reported as a contradiction otherwise.
//!
//! Calculators are cached per coordinate in a [`CalculatorCache`]. Any change
//! to stamps or paths must go through [`CalculatorCache::reset`], which bumps a
//! generation counter: cached calculators are dropped, and a calculator
//! somebody still holds notices the new generation and rebuilds its route
//! before answering again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use itertools::Itertools;
use quick_cache::sync::Cache;

use crate::chronology::{Chronology, Version};
use crate::codec::Decode;
use crate::config::StoreConfig;
use crate::coordinate::{CoordinateInterner, StampCoordinate};
use crate::id::Nid;
use crate::latest::Latest;
use crate::path::PathGraph;
use crate::spine::SpinedStore;
use crate::stamp::{StampChronology, StampFields, TAG_STAMP};

/// How a path is reached from the coordinate's path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reach {
    /// Latest stamp time visible on the path.
    pub cutoff: i64,
    /// Number of origin edges between the coordinate's path and this one.
    pub depth: u32,
}

/// Where one stamp sits relative to another under a coordinate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelativePosition {
    Before,
    Equal,
    After,
    /// Same time, different edits, neither shadows the other.
    Contradiction,
    /// At least one of the stamps is unknown or off the route.
    Unreachable,
}

#[derive(Debug)]
struct Route {
    generation: u64,
    reach: HashMap<Nid, Reach>,
}

fn compute_route(coordinate: &StampCoordinate, paths: &PathGraph) -> HashMap<Nid, Reach> {
    let mut reach = HashMap::new();
    let start = Reach {
        cutoff: coordinate.time(),
        depth: 0,
    };
    reach.insert(coordinate.path(), start);
    let mut queue = VecDeque::from([(coordinate.path(), start)]);

    while let Some((path, from)) = queue.pop_front() {
        for edge in paths.origins(path) {
            let next = Reach {
                cutoff: from.cutoff.min(edge.time),
                depth: from.depth + 1,
            };
            let improved = match reach.get(&edge.origin) {
                None => true,
                Some(known) => {
                    next.cutoff > known.cutoff
                        || (next.cutoff == known.cutoff && next.depth < known.depth)
                }
            };
            // Cutoffs only grow and depths only shrink, so cycles terminate.
            if improved {
                reach.insert(edge.origin, next);
                queue.push_back((edge.origin, next));
            }
        }
    }
    reach
}

#[derive(Copy, Clone)]
struct Candidate<'a> {
    version: &'a Version,
    fields: StampFields,
    reach: Reach,
}

pub struct StampCalculator {
    coordinate: Arc<StampCoordinate>,
    spines: Arc<SpinedStore>,
    paths: Arc<PathGraph>,
    generation: Arc<AtomicU64>,
    route: ArcSwap<Route>,
    stamps: Cache<(u64, Nid), StampFields>,
}

impl StampCalculator {
    pub(crate) fn new(
        coordinate: Arc<StampCoordinate>,
        spines: Arc<SpinedStore>,
        paths: Arc<PathGraph>,
        generation: Arc<AtomicU64>,
        stamp_cache_capacity: usize,
    ) -> Self {
        let current = generation.load(Ordering::Acquire);
        let reach = compute_route(&coordinate, &paths);
        Self {
            coordinate,
            spines,
            paths,
            generation,
            route: ArcSwap::from_pointee(Route {
                generation: current,
                reach,
            }),
            stamps: Cache::new(stamp_cache_capacity),
        }
    }

    pub fn coordinate(&self) -> &Arc<StampCoordinate> {
        &self.coordinate
    }

    /// Whether a cache reset happened since this calculator last computed its
    /// route.
    pub fn is_stale(&self) -> bool {
        self.route.load().generation != self.generation.load(Ordering::Acquire)
    }

    fn route(&self) -> Arc<Route> {
        let current = self.generation.load(Ordering::Acquire);
        let route = self.route.load_full();
        if route.generation == current {
            return route;
        }
        let fresh = Arc::new(Route {
            generation: current,
            reach: compute_route(&self.coordinate, &self.paths),
        });
        self.route.store(fresh.clone());
        fresh
    }

    /// How the calculator reaches `path`, if at all.
    pub fn reach(&self, path: Nid) -> Option<Reach> {
        self.route().reach.get(&path).copied()
    }

    /// The effective fields of stamp `nid`.
    pub fn stamp(&self, nid: Nid) -> Option<StampFields> {
        let generation = self.route().generation;
        self.stamp_in(generation, nid)
    }

    fn stamp_in(&self, generation: u64, nid: Nid) -> Option<StampFields> {
        if let Some(fields) = self.stamps.get(&(generation, nid)) {
            return Some(fields);
        }
        let payload = self.spines.get(nid)?;
        match StampChronology::decode(&payload) {
            Ok(history) => {
                let fields = history.current();
                self.stamps.insert((generation, nid), fields);
                Some(fields)
            }
            Err(e) => {
                tracing::warn!("stamp {nid} is undecodable, treating it as absent: {e}");
                None
            }
        }
    }

    fn visible_reach(&self, route: &Route, fields: &StampFields) -> Option<Reach> {
        if fields.is_canceled()
            || !self.coordinate.allowed().contains(fields.status)
            || self.coordinate.is_excluded(fields.module)
        {
            return None;
        }
        let reach = *route.reach.get(&fields.path)?;
        (fields.time <= reach.cutoff).then_some(reach)
    }

    /// Whether versions carrying stamp `nid` are visible to the coordinate.
    pub fn is_visible(&self, nid: Nid) -> bool {
        let route = self.route();
        self.stamp_in(route.generation, nid)
            .is_some_and(|fields| self.visible_reach(&route, &fields).is_some())
    }

    /// Resolves the latest version of the component stored at `nid`.
    ///
    /// Missing components, stamp payloads and undecodable chronologies all
    /// resolve to [`Latest::Absent`].
    pub fn latest(&self, nid: Nid) -> Latest<Version> {
        match self.spines.get(nid) {
            Some(payload) => self.latest_payload(nid, &payload),
            None => Latest::Absent,
        }
    }

    pub(crate) fn latest_payload(&self, nid: Nid, payload: &Bytes) -> Latest<Version> {
        if payload.first() == Some(&TAG_STAMP) {
            return Latest::Absent;
        }
        match Chronology::decode(payload) {
            Ok(chronology) => self.latest_of(&chronology),
            Err(e) => {
                tracing::warn!("chronology {nid} is undecodable, treating it as absent: {e}");
                Latest::Absent
            }
        }
    }

    /// Resolves the latest version within an already decoded chronology.
    pub fn latest_of(&self, chronology: &Chronology) -> Latest<Version> {
        let route = self.route();
        let candidates: Vec<Candidate<'_>> = chronology
            .versions()
            .iter()
            .filter_map(|version| {
                let fields = self.stamp_in(route.generation, version.stamp)?;
                let reach = self.visible_reach(&route, &fields)?;
                Some(Candidate {
                    version,
                    fields,
                    reach,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Latest::Absent;
        }

        let newest = candidates.into_iter().max_set_by_key(|c| c.fields.time);
        let nearest = newest.into_iter().min_set_by_key(|c| c.reach.depth);
        if let [only] = nearest.as_slice() {
            return Latest::Single(only.version.clone());
        }

        let preferred = nearest
            .iter()
            .min_set_by_key(|c| self.coordinate.module_rank(c.fields.module));
        if let [only] = preferred.as_slice() {
            return Latest::Single(only.version.clone());
        }

        let mut tied: Vec<Version> = nearest.iter().map(|c| c.version.clone()).collect();
        tied.sort_by_key(|version| version.stamp);
        Latest::Contradiction(tied)
    }

    /// Orders stamp `a` relative to stamp `b` on this coordinate's route.
    ///
    /// Status and module filters do not apply; only position does.
    pub fn relative_position(&self, a: Nid, b: Nid) -> RelativePosition {
        let route = self.route();
        let placed = |nid: Nid| {
            let fields = self.stamp_in(route.generation, nid)?;
            if fields.is_canceled() {
                return None;
            }
            let reach = *route.reach.get(&fields.path)?;
            (fields.time <= reach.cutoff).then_some((fields, reach))
        };
        let (Some((fa, ra)), Some((fb, rb))) = (placed(a), placed(b)) else {
            return RelativePosition::Unreachable;
        };
        if a == b || fa == fb {
            return RelativePosition::Equal;
        }
        match fa.time.cmp(&fb.time) {
            std::cmp::Ordering::Less => RelativePosition::Before,
            std::cmp::Ordering::Greater => RelativePosition::After,
            std::cmp::Ordering::Equal => match ra.depth.cmp(&rb.depth) {
                std::cmp::Ordering::Less => RelativePosition::After,
                std::cmp::Ordering::Greater => RelativePosition::Before,
                std::cmp::Ordering::Equal => RelativePosition::Contradiction,
            },
        }
    }
}

impl fmt::Debug for StampCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = self.route.load();
        f.debug_struct("StampCalculator")
            .field("coordinate", &self.coordinate)
            .field("generation", &route.generation)
            .field("route", &route.reach)
            .finish()
    }
}

/// Calculators keyed by coordinate value, plus the coordinate interner.
pub struct CalculatorCache {
    spines: Arc<SpinedStore>,
    paths: Arc<PathGraph>,
    generation: Arc<AtomicU64>,
    coordinates: CoordinateInterner,
    calculators: Cache<StampCoordinate, Arc<StampCalculator>>,
    stamp_cache_capacity: usize,
}

impl CalculatorCache {
    pub(crate) fn new(spines: Arc<SpinedStore>, paths: Arc<PathGraph>, config: &StoreConfig) -> Self {
        Self {
            spines,
            paths,
            generation: Arc::new(AtomicU64::new(0)),
            coordinates: CoordinateInterner::new(config.coordinate_cache_capacity),
            calculators: Cache::new(config.calculator_cache_capacity),
            stamp_cache_capacity: config.stamp_cache_capacity,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The shared instance equal to `coordinate`.
    pub fn intern(&self, coordinate: &StampCoordinate) -> Arc<StampCoordinate> {
        self.coordinates.intern(coordinate)
    }

    /// A calculator for `coordinate`, cached unless a reset made it stale.
    pub fn calculator(&self, coordinate: &StampCoordinate) -> Arc<StampCalculator> {
        if let Some(calculator) = self.calculators.get(coordinate) {
            if !calculator.is_stale() {
                return calculator;
            }
        }
        let calculator = Arc::new(StampCalculator::new(
            self.intern(coordinate),
            self.spines.clone(),
            self.paths.clone(),
            self.generation.clone(),
            self.stamp_cache_capacity,
        ));
        self.calculators
            .insert(coordinate.clone(), calculator.clone());
        calculator
    }

    /// Invalidates every cached calculator and interned coordinate.
    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.calculators.clear();
        self.coordinates.clear();
        tracing::debug!("resolution caches reset, generation {generation}");
    }

    pub fn len(&self) -> usize {
        self.calculators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calculators.is_empty()
    }
}

impl fmt::Debug for CalculatorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatorCache")
            .field("generation", &self.generation())
            .field("calculators", &self.calculators.len())
            .field("coordinates", &self.coordinates)
            .finish()
    }
}
