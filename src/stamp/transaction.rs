//! Grouped commit and cancel of stamps.
//!
//! Stamps created through a [`Transaction`] start out uncommitted. Commit gives
//! every member the same commit time; cancel cancels every member. Whichever
//! of the two runs first closes the transaction, and every later attempt fails
//! with [`TransactionError`].

use std::fmt;

use hifitime::Epoch;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{ConfigurationError, StoreError, TransactionError};
use crate::id::Nid;
use crate::stamp::{StampFields, Status, CANCELED, UNCOMMITTED};
use crate::store::Store;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Uncommitted,
    Committed,
    Canceled,
}

impl TransactionState {
    fn check_open(self) -> Result<(), TransactionError> {
        match self {
            TransactionState::Uncommitted => Ok(()),
            TransactionState::Committed => Err(TransactionError::AlreadyCommitted),
            TransactionState::Canceled => Err(TransactionError::AlreadyCanceled),
        }
    }
}

#[derive(Debug)]
struct Members {
    state: TransactionState,
    stamps: Vec<Nid>,
}

pub struct Transaction<'a> {
    store: &'a Store,
    id: Uuid,
    name: String,
    members: Mutex<Members>,
}

/// Milliseconds since the unix epoch, from the system clock.
pub fn now_millis() -> Result<i64, StoreError> {
    let now = Epoch::now().map_err(|e| {
        StoreError::Io(std::io::Error::other(format!(
            "system clock unavailable: {e}"
        )))
    })?;
    Ok(now.to_unix_milliseconds() as i64)
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a Store, name: impl Into<String>) -> Self {
        Self {
            store,
            id: Uuid::new_v4(),
            name: name.into(),
            members: Mutex::new(Members {
                state: TransactionState::Uncommitted,
                stamps: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransactionState {
        self.members.lock().state
    }

    /// Number of member stamps, for progress reporting.
    pub fn stamp_count(&self) -> usize {
        self.members.lock().stamps.len()
    }

    pub fn stamps(&self) -> Vec<Nid> {
        self.members.lock().stamps.clone()
    }

    /// Creates an uncommitted member stamp.
    pub fn stamp(
        &self,
        status: Status,
        author: Nid,
        module: Nid,
        path: Nid,
    ) -> Result<Nid, StoreError> {
        let mut members = self.members.lock();
        members.state.check_open()?;
        let fields = StampFields::uncommitted(status, author, module, path);
        let stamp = self.store.create_stamp(fields, false)?;
        members.stamps.push(stamp);
        Ok(stamp)
    }

    /// Commits every member at the current time and returns that time.
    pub fn commit(&self) -> Result<i64, StoreError> {
        self.commit_at(now_millis()?)
    }

    /// Commits every member at `time`.
    ///
    /// Members canceled individually in the meantime stay canceled; the first
    /// of them is reported as [`TransactionError::StampCanceled`] after all
    /// other members have been committed.
    pub fn commit_at(&self, time: i64) -> Result<i64, StoreError> {
        if time == UNCOMMITTED || time == CANCELED {
            return Err(ConfigurationError::SentinelTime(time).into());
        }
        let stamps = {
            let mut members = self.members.lock();
            members.state.check_open()?;
            members.state = TransactionState::Committed;
            members.stamps.clone()
        };

        let mut first_error = None;
        for stamp in &stamps {
            if let Err(e) = self.store.commit_member(*stamp, time) {
                first_error.get_or_insert(e);
            }
        }
        self.store.reset_caches();
        tracing::debug!(
            "transaction {} ({}) committed {} stamps at {time}",
            self.name,
            self.id,
            stamps.len()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(time),
        }
    }

    /// Cancels every member stamp.
    pub fn cancel(&self) -> Result<(), StoreError> {
        let stamps = {
            let mut members = self.members.lock();
            members.state.check_open()?;
            members.state = TransactionState::Canceled;
            members.stamps.clone()
        };

        let mut first_error = None;
        for stamp in &stamps {
            if let Err(e) = self.store.cancel_member(*stamp) {
                first_error.get_or_insert(e);
            }
        }
        self.store.reset_caches();
        tracing::debug!(
            "transaction {} ({}) canceled {} stamps",
            self.name,
            self.id,
            stamps.len()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &members.state)
            .field("stamps", &members.stamps.len())
            .finish()
    }
}
