//! Error types shared across the store.
//!
//! Storage read failures never show up here: they are logged and the affected
//! spine is treated as absent. Everything else propagates synchronously to the
//! caller that triggered it.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

use crate::id::Nid;

/// A malformed argument or an unusable store setup.
///
/// These are programmer or deployment errors and are raised at construction
/// time, never during resolution.
#[derive(Debug)]
pub enum ConfigurationError {
    EmptyAliasSet,
    NilUuid,
    EmptyAllowedStates,
    InvalidSpineSize(usize),
    InvalidPermitCount(usize),
    InvalidWorkerCount(usize),
    InvalidCacheCapacity(&'static str),
    InvalidRetryBound(u32),
    NidSpaceExhausted,
    /// A path cannot inherit from itself.
    SelfOrigin(Nid),
    /// A commit time that collides with the uncommitted or canceled sentinel.
    SentinelTime(i64),
    UnusableRoot { path: PathBuf, reason: String },
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::EmptyAliasSet => {
                write!(f, "a public id needs at least one uuid")
            }
            ConfigurationError::NilUuid => {
                write!(f, "the nil uuid (all zero bytes) cannot name a component")
            }
            ConfigurationError::EmptyAllowedStates => {
                write!(f, "a stamp coordinate needs at least one allowed status besides canceled")
            }
            ConfigurationError::InvalidSpineSize(size) => {
                write!(f, "spine size {size} must be a non-zero power of two")
            }
            ConfigurationError::InvalidPermitCount(count) => {
                write!(f, "io permit count {count} must be non-zero")
            }
            ConfigurationError::InvalidWorkerCount(count) => {
                write!(f, "worker count {count} must be non-zero")
            }
            ConfigurationError::InvalidCacheCapacity(name) => {
                write!(f, "cache capacity `{name}` must be non-zero")
            }
            ConfigurationError::InvalidRetryBound(bound) => {
                write!(f, "compare-and-set retry bound {bound} must be non-zero")
            }
            ConfigurationError::NidSpaceExhausted => {
                write!(f, "every 32 bit nid has been allocated")
            }
            ConfigurationError::SelfOrigin(path) => {
                write!(f, "path {path} cannot be its own origin")
            }
            ConfigurationError::SentinelTime(time) => {
                write!(f, "{time} is reserved and cannot be used as a commit time")
            }
            ConfigurationError::UnusableRoot { path, reason } => {
                write!(f, "store root {} is unusable: {reason}", path.display())
            }
            ConfigurationError::Parse(err) => write!(f, "invalid configuration: {err}"),
        }
    }
}

impl Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigurationError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for ConfigurationError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err)
    }
}

/// A persisted payload that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { needed: usize, remaining: usize },
    UnknownTag(u8),
    UnknownStatus(u8),
    UnknownKind(u8),
    BadMagic,
    InvalidPublicId,
    NegativeLength(i32),
    Trailing(usize),
    SlotCountMismatch { expected: usize, found: usize },
    /// A chronology with no versions.
    EmptyHistory,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, remaining } => {
                write!(f, "truncated payload: needed {needed} bytes, {remaining} left")
            }
            DecodeError::UnknownTag(tag) => write!(f, "unknown payload tag {tag:#04x}"),
            DecodeError::UnknownStatus(status) => write!(f, "unknown status {status}"),
            DecodeError::UnknownKind(kind) => write!(f, "unknown component kind {kind}"),
            DecodeError::BadMagic => write!(f, "table does not start with the expected marker"),
            DecodeError::InvalidPublicId => write!(f, "persisted public id is empty or nil"),
            DecodeError::NegativeLength(len) => write!(f, "negative length prefix {len}"),
            DecodeError::Trailing(len) => write!(f, "{len} trailing bytes after payload"),
            DecodeError::SlotCountMismatch { expected, found } => {
                write!(f, "spine holds {found} slots, expected at most {expected}")
            }
            DecodeError::EmptyHistory => write!(f, "chronology has no versions"),
        }
    }
}

impl Error for DecodeError {}

/// Returned when a transaction or one of its stamps has already left the
/// uncommitted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    AlreadyCommitted,
    AlreadyCanceled,
    StampCanceled(Nid),
    /// Committed stamps are immutable.
    StampCommitted(Nid),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::AlreadyCommitted => write!(f, "transaction is already committed"),
            TransactionError::AlreadyCanceled => write!(f, "transaction is already canceled"),
            TransactionError::StampCanceled(nid) => {
                write!(f, "stamp {nid} was canceled before it could be committed")
            }
            TransactionError::StampCommitted(nid) => {
                write!(f, "stamp {nid} is committed and can no longer change")
            }
        }
    }
}

impl Error for TransactionError {}

/// What was looked up and not found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    Nid(Nid),
    Uuid(Uuid),
    Stamp(Nid),
    Latest(Nid),
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFound::Nid(nid) => write!(f, "no component is stored at {nid}"),
            NotFound::Uuid(uuid) => write!(f, "uuid {uuid} has no nid"),
            NotFound::Stamp(nid) => write!(f, "no stamp is stored at {nid}"),
            NotFound::Latest(nid) => write!(f, "{nid} has no version visible to the coordinate"),
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(NotFound),
    /// A single answer was demanded but the coordinate sees `count` tied versions.
    Contradiction { nid: Nid, count: usize },
    Configuration(ConfigurationError),
    Io(std::io::Error),
    /// A compare-and-set loop gave up after the configured retry bound.
    ConcurrencyInvariant { nid: Nid, attempts: u32 },
    Transaction(TransactionError),
    Decode(DecodeError),
    /// A spine whose persisted blob could not be loaded holds changes.
    /// Writing it would replace data that was never read.
    DegradedSpine(u32),
    /// The chronology at `component` did not record the version for `stamp`,
    /// either because the slot holds another component or because the stamp
    /// is committed with different fields.
    VersionRejected { component: Nid, stamp: Nid },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::Contradiction { nid, count } => {
                write!(f, "{nid} resolves to {count} contradicting versions")
            }
            StoreError::Configuration(err) => write!(f, "configuration error: {err}"),
            StoreError::Io(err) => write!(f, "IO error: {err}"),
            StoreError::ConcurrencyInvariant { nid, attempts } => write!(
                f,
                "merge into {nid} did not converge after {attempts} attempts"
            ),
            StoreError::Transaction(err) => write!(f, "transaction error: {err}"),
            StoreError::Decode(err) => write!(f, "decode error: {err}"),
            StoreError::DegradedSpine(index) => write!(
                f,
                "spine {index} failed to load and is not written back"
            ),
            StoreError::VersionRejected { component, stamp } => write!(
                f,
                "{component} did not record the version for stamp {stamp}"
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Configuration(err) => Some(err),
            StoreError::Io(err) => Some(err),
            StoreError::Transaction(err) => Some(err),
            StoreError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ConfigurationError> for StoreError {
    fn from(err: ConfigurationError) -> Self {
        Self::Configuration(err)
    }
}

impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        Self::Transaction(err)
    }
}

impl From<NotFound> for StoreError {
    fn from(err: NotFound) -> Self {
        Self::NotFound(err)
    }
}
