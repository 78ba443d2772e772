//! A nid keyed map of opaque byte payloads, chunked into fixed-size spines.
//!
//! The logical array is split into spines of `spine_size` slots each; spine
//! `i` holds nids `FIRST + i * spine_size ..`. Spines are materialised on
//! first touch, loading their persisted blob (if any) through the configured
//! [`SpineStorage`]. Every slot is an independent atomic pointer, so readers
//! never lock and writers resolve contention with compare-and-swap retries.
//!
//! The directory of spines is itself swapped atomically when it grows, which
//! is rare enough that growth takes a mutex while readers keep going.
//!
//! Persisted spine layout (big-endian):
//!
//! ```text
//! i32 slot_count
//! slot_count * (i32 length, length bytes)   // length 0 = empty slot
//! ```

pub mod storage;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::{ArcSwap, ArcSwapOption, Guard};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub use storage::{open_storage, Backend, DirectoryStorage, MemoryStorage, SpineStorage};

use crate::codec::{put_i32, Reader};
use crate::config::StoreConfig;
use crate::error::{DecodeError, NotFound, StoreError};
use crate::id::Nid;

type Slot = ArcSwapOption<Bytes>;
type SpineCell = OnceLock<Spine>;

#[derive(Debug)]
struct Spine {
    slots: Box<[Slot]>,
    changed: AtomicBool,
    /// The persisted blob could not be loaded; writing this spine back would
    /// overwrite it.
    degraded: bool,
}

impl Spine {
    fn empty(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| ArcSwapOption::empty()).collect(),
            changed: AtomicBool::new(false),
            degraded: false,
        }
    }

    fn degraded(size: usize) -> Self {
        Self {
            degraded: true,
            ..Self::empty(size)
        }
    }

    fn decode(size: usize, blob: &Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(blob);
        let count = reader.i32()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::NegativeLength(count))?;
        if count > size {
            return Err(DecodeError::SlotCountMismatch {
                expected: size,
                found: count,
            });
        }
        let spine = Self::empty(size);
        for slot in spine.slots.iter().take(count) {
            let len = reader.i32()?;
            let len = usize::try_from(len).map_err(|_| DecodeError::NegativeLength(len))?;
            if len > 0 {
                let payload = blob.slice_ref(reader.slice(len)?);
                slot.store(Some(Arc::new(payload)));
            }
        }
        reader.finish()?;
        Ok(spine)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_i32(&mut out, self.slots.len() as i32);
        for slot in self.slots.iter() {
            match slot.load_full() {
                Some(payload) => {
                    put_i32(&mut out, payload.len() as i32);
                    out.extend_from_slice(&payload);
                }
                None => put_i32(&mut out, 0),
            }
        }
        out
    }
}

/// A counting semaphore bounding concurrent access to the persistent medium.
///
/// Tokens circulate through a bounded channel: acquiring receives one,
/// dropping the [`IoPermit`] sends it back.
#[derive(Debug)]
pub struct IoPermits {
    give: Sender<()>,
    take: Receiver<()>,
}

impl IoPermits {
    pub fn new(count: usize) -> Self {
        let (give, take) = crossbeam_channel::bounded(count);
        for _ in 0..count {
            let _ = give.try_send(());
        }
        Self { give, take }
    }

    /// Blocks until a permit is free.
    pub fn acquire(&self) -> IoPermit<'_> {
        // Cannot fail: `self` owns a sender for as long as the receiver lives.
        let _ = self.take.recv();
        IoPermit { permits: self }
    }

    pub fn available(&self) -> usize {
        self.take.len()
    }
}

pub struct IoPermit<'a> {
    permits: &'a IoPermits,
}

impl Drop for IoPermit<'_> {
    fn drop(&mut self) {
        let _ = self.permits.give.try_send(());
    }
}

/// Cooperative cancellation for parallel scans.
///
/// Workers check the token before taking the next spine; a spine that is
/// already being visited is finished.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SpinedStore {
    storage: Arc<dyn SpineStorage>,
    spine_size: usize,
    directory: ArcSwap<Vec<Arc<SpineCell>>>,
    grow: Mutex<()>,
    persisted: BTreeSet<u32>,
    permits: IoPermits,
    workers: usize,
    max_cas_retries: u32,
}

fn same(a: &Option<Arc<Bytes>>, b: &Option<Arc<Bytes>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl SpinedStore {
    /// Creates a store over `storage`. Nothing is read until a spine is touched.
    pub fn new(storage: Arc<dyn SpineStorage>, config: &StoreConfig) -> Self {
        let persisted = match storage.spine_indices() {
            Ok(indices) => indices.into_iter().collect(),
            Err(e) => {
                tracing::warn!("listing persisted spines failed, starting empty: {e}");
                BTreeSet::new()
            }
        };
        Self {
            storage,
            spine_size: config.spine_size,
            directory: ArcSwap::from_pointee(Vec::new()),
            grow: Mutex::new(()),
            persisted,
            permits: IoPermits::new(config.io_permits),
            workers: config.workers,
            max_cas_retries: config.max_cas_retries,
        }
    }

    pub fn spine_size(&self) -> usize {
        self.spine_size
    }

    pub fn permits(&self) -> &IoPermits {
        &self.permits
    }

    fn locate(&self, nid: Nid) -> Option<(usize, usize)> {
        let offset = usize::try_from(nid.offset()?).ok()?;
        Some((offset / self.spine_size, offset % self.spine_size))
    }

    /// Number of spine indices that may hold data, loaded or not.
    pub fn spine_limit(&self) -> usize {
        let loaded = self.directory.load().len();
        let persisted = self.persisted.last().map_or(0, |last| *last as usize + 1);
        loaded.max(persisted)
    }

    /// Number of spines currently materialised in memory.
    pub fn loaded_spines(&self) -> usize {
        self.directory
            .load()
            .iter()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    /// Whether any loaded spine has changes not yet written.
    pub fn has_changes(&self) -> bool {
        self.directory.load().iter().any(|cell| {
            cell.get()
                .is_some_and(|spine| spine.changed.load(Ordering::Acquire))
        })
    }

    fn known_cell(&self, index: usize) -> Option<Arc<SpineCell>> {
        if let Some(cell) = self.directory.load().get(index) {
            return Some(cell.clone());
        }
        if !self.persisted.contains(&(index as u32)) {
            return None;
        }
        Some(self.grow_to(index))
    }

    fn grow_to(&self, index: usize) -> Arc<SpineCell> {
        let _guard = self.grow.lock();
        let current = self.directory.load_full();
        if let Some(cell) = current.get(index) {
            return cell.clone();
        }
        let mut grown: Vec<Arc<SpineCell>> = current.iter().cloned().collect();
        grown.resize_with(index + 1, || Arc::new(OnceLock::new()));
        let cell = grown[index].clone();
        self.directory.store(Arc::new(grown));
        cell
    }

    fn cell(&self, index: usize) -> Arc<SpineCell> {
        match self.directory.load().get(index) {
            Some(cell) => cell.clone(),
            None => self.grow_to(index),
        }
    }

    fn spine<'a>(&self, cell: &'a SpineCell, index: usize) -> &'a Spine {
        cell.get_or_init(|| self.load_spine(index))
    }

    fn load_spine(&self, index: usize) -> Spine {
        if !self.persisted.contains(&(index as u32)) {
            return Spine::empty(self.spine_size);
        }
        let _permit = self.permits.acquire();
        match self.storage.read_spine(index as u32) {
            Ok(Some(blob)) => match Spine::decode(self.spine_size, &blob) {
                Ok(spine) => {
                    tracing::debug!("loaded spine {index} ({} bytes)", blob.len());
                    spine
                }
                Err(e) => {
                    tracing::warn!("spine {index} is unreadable, serving it as empty: {e}");
                    Spine::degraded(self.spine_size)
                }
            },
            Ok(None) => Spine::empty(self.spine_size),
            Err(e) => {
                tracing::warn!("reading spine {index} failed, serving it as empty: {e}");
                Spine::degraded(self.spine_size)
            }
        }
    }

    /// Returns the payload stored for `nid`.
    pub fn get(&self, nid: Nid) -> Option<Bytes> {
        let (index, slot) = self.locate(nid)?;
        let cell = self.known_cell(index)?;
        let spine = self.spine(&cell, index);
        spine.slots[slot].load_full().map(|payload| (*payload).clone())
    }

    /// Installs `payload` at `nid`, or `merge(existing, payload)` if the slot is
    /// occupied, and returns what was installed.
    ///
    /// `merge` may run several times when writers race on the same slot, so it
    /// must be a pure function of its arguments.
    pub fn merge<F>(&self, nid: Nid, payload: Bytes, merge: F) -> Result<Bytes, StoreError>
    where
        F: Fn(&Bytes, &Bytes) -> Bytes,
    {
        let (index, slot) = self.locate(nid).ok_or(NotFound::Nid(nid))?;
        let cell = self.cell(index);
        let spine = self.spine(&cell, index);
        let slot = &spine.slots[slot];

        let mut current = slot.load_full();
        for _ in 0..self.max_cas_retries {
            let next = Arc::new(match &current {
                None => payload.clone(),
                Some(existing) => merge(existing, &payload),
            });
            let previous = slot.compare_and_swap(&current, Some(next.clone()));
            if same(&previous, &current) {
                spine.changed.store(true, Ordering::Release);
                return Ok((*next).clone());
            }
            current = Guard::into_inner(previous);
        }
        Err(StoreError::ConcurrencyInvariant {
            nid,
            attempts: self.max_cas_retries,
        })
    }

    fn visit_spine<F>(&self, index: usize, action: &mut F)
    where
        F: FnMut(Nid, &Bytes),
    {
        let Some(cell) = self.known_cell(index) else {
            return;
        };
        let spine = self.spine(&cell, index);
        let base = (index * self.spine_size) as u64;
        for (offset, slot) in spine.slots.iter().enumerate() {
            let Some(payload) = slot.load_full() else {
                continue;
            };
            if let Some(nid) = Nid::from_offset(base + offset as u64) {
                action(nid, &payload);
            }
        }
    }

    /// Visits every stored payload in nid order.
    pub fn for_each<F>(&self, mut action: F)
    where
        F: FnMut(Nid, &Bytes),
    {
        for index in 0..self.spine_limit() {
            self.visit_spine(index, &mut action);
        }
    }

    /// Visits every stored payload, one spine at a time per worker.
    pub fn for_each_parallel<F>(&self, action: F)
    where
        F: Fn(Nid, &Bytes) + Sync,
    {
        self.for_each_parallel_until(&CancelToken::new(), action)
    }

    /// Like [`for_each_parallel`](Self::for_each_parallel) but stops handing out
    /// spines once `cancel` fires.
    pub fn for_each_parallel_until<F>(&self, cancel: &CancelToken, action: F)
    where
        F: Fn(Nid, &Bytes) + Sync,
    {
        let limit = self.spine_limit();
        if limit == 0 {
            return;
        }
        let (queue, work) = crossbeam_channel::unbounded();
        for index in 0..limit {
            let _ = queue.send(index);
        }
        drop(queue);

        let workers = self.workers.min(limit).max(1);
        let action = &action;
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work = work.clone();
                scope.spawn(move || {
                    let mut visit = |nid: Nid, payload: &Bytes| action(nid, payload);
                    while let Ok(index) = work.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.visit_spine(index, &mut visit);
                    }
                });
            }
        });
    }

    /// Writes every changed spine back to storage and returns how many were
    /// written.
    ///
    /// All changed spines are attempted; the first failure is returned and the
    /// failed spines stay marked as changed for a later retry. A spine whose
    /// persisted blob failed to load is never written and reports
    /// [`StoreError::DegradedSpine`].
    pub fn write(&self) -> Result<usize, StoreError> {
        let directory = self.directory.load_full();
        let mut written = 0;
        let mut first_error: Option<StoreError> = None;
        for (index, cell) in directory.iter().enumerate() {
            let Some(spine) = cell.get() else {
                continue;
            };
            if spine.degraded {
                if spine.changed.load(Ordering::Acquire) {
                    tracing::error!("spine {index} failed to load, not writing it back");
                    first_error.get_or_insert(StoreError::DegradedSpine(index as u32));
                }
                continue;
            }
            // Cleared before encoding so writes racing with us mark it again.
            if !spine.changed.swap(false, Ordering::AcqRel) {
                continue;
            }
            let blob = spine.encode();
            let _permit = self.permits.acquire();
            match self.storage.write_spine(index as u32, &blob) {
                Ok(()) => written += 1,
                Err(e) => {
                    spine.changed.store(true, Ordering::Release);
                    tracing::error!("writing spine {index} failed: {e}");
                    first_error.get_or_insert(e.into());
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}
