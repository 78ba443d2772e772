//! The types most callers need, for glob import as
//! `use stampstore::prelude::*;`.
//!
//! # Retraction
//!
//! Versions are never removed. An edit still under an uncommitted stamp is
//! retracted by canceling that stamp, which hides every version carrying it
//! while keeping the stamp's history. Committed stamps are immutable, so a
//! committed edit is superseded by a newer version, usually with an inactive
//! status. Either way the old state stays reachable through coordinates that
//! look at an earlier time.

pub use crate::calculator::{RelativePosition, StampCalculator};
pub use crate::chronology::{Chronology, ComponentKind, Version};
pub use crate::config::{StampDedup, StoreConfig};
pub use crate::coordinate::{StampCoordinate, StampPosition, StatusSet};
pub use crate::error::{NotFound, StoreError, TransactionError};
pub use crate::id::{Nid, PublicId};
pub use crate::latest::Latest;
pub use crate::spine::{Backend, CancelToken};
pub use crate::stamp::{StampFields, Status, Transaction, LATEST};
pub use crate::store::Store;
