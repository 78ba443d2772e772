//! Path origin edges.
//!
//! A path inherits the committed history of each of its origins up to the
//! origin's cutoff time. Origins are few and change rarely, so they live in a
//! small concurrent map persisted as one table rather than in the spines.
//!
//! Path table layout (big-endian):
//!
//! ```text
//! [u8; 16] magic
//! u32 count
//! count * (i32 path, i32 origin, i64 time)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::codec::{put_i32, put_i64, put_u32, Reader};
use crate::error::{ConfigurationError, DecodeError};
use crate::id::Nid;

const MAGIC_MARKER_PATHS: [u8; 16] = *b"stampstore:paths";

/// `path` sees `origin`'s history up to and including `time`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathOrigin {
    pub origin: Nid,
    pub time: i64,
}

#[derive(Debug, Default)]
pub struct PathGraph {
    origins: DashMap<Nid, Vec<PathOrigin>>,
    changed: AtomicBool,
}

impl PathGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `path` inherits from `origin` up to `time`. An existing
    /// edge to the same origin has its time replaced.
    ///
    /// Returns whether the graph changed.
    pub fn add_origin(&self, path: Nid, origin: Nid, time: i64) -> Result<bool, ConfigurationError> {
        if path == origin {
            return Err(ConfigurationError::SelfOrigin(path));
        }
        let mut edges = self.origins.entry(path).or_default();
        let changed = match edges.iter().position(|edge| edge.origin == origin) {
            Some(i) if edges[i].time == time => false,
            Some(i) => {
                edges[i].time = time;
                true
            }
            None => {
                edges.push(PathOrigin { origin, time });
                true
            }
        };
        if changed {
            self.changed.store(true, Ordering::Release);
        }
        Ok(changed)
    }

    pub fn origins(&self, path: Nid) -> Vec<PathOrigin> {
        self.origins
            .get(&path)
            .map(|edges| edges.clone())
            .unwrap_or_default()
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Serializes every edge, sorted by path then origin. Clears the changed
    /// flag.
    pub fn encode_table(&self) -> Vec<u8> {
        self.changed.store(false, Ordering::Release);
        let mut edges: Vec<(Nid, PathOrigin)> = self
            .origins
            .iter()
            .flat_map(|entry| {
                let path = *entry.key();
                entry
                    .value()
                    .iter()
                    .map(move |edge| (path, *edge))
                    .collect::<Vec<_>>()
            })
            .collect();
        edges.sort_by_key(|(path, edge)| (*path, edge.origin));

        let mut out = Vec::with_capacity(20 + edges.len() * 16);
        out.extend_from_slice(&MAGIC_MARKER_PATHS);
        put_u32(&mut out, edges.len() as u32);
        for (path, edge) in edges {
            put_i32(&mut out, path.raw());
            put_i32(&mut out, edge.origin.raw());
            put_i64(&mut out, edge.time);
        }
        out
    }

    pub fn decode_table(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        if reader.slice(MAGIC_MARKER_PATHS.len())? != MAGIC_MARKER_PATHS {
            return Err(DecodeError::BadMagic);
        }
        let graph = Self::new();
        let count = reader.u32()?;
        for _ in 0..count {
            let path = Nid::new(reader.i32()?);
            let origin = Nid::new(reader.i32()?);
            let time = reader.i64()?;
            graph
                .origins
                .entry(path)
                .or_default()
                .push(PathOrigin { origin, time });
        }
        reader.finish()?;
        Ok(graph)
    }
}
