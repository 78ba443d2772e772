//! A versioned component store with coordinate-driven resolution.
//!
//! Components are named by UUIDs and addressed by dense [`Nid`](id::Nid)s.
//! Every edit is recorded under a stamp (status, time, author, module, path)
//! and appended to the component's chronology; nothing is overwritten.
//! Readers ask for the version that is latest under a
//! [`StampCoordinate`](coordinate::StampCoordinate) and get back a
//! [`Latest`](latest::Latest): absent, a single version, or a contradiction.
//!
//! ```
//! use stampstore::prelude::*;
//!
//! let store = Store::in_memory(StoreConfig::default()).unwrap();
//! let author = store.resolve(&PublicId::random()).unwrap();
//! let module = store.resolve(&PublicId::random()).unwrap();
//! let path = store.resolve(&PublicId::random()).unwrap();
//! let concept = store.resolve(&PublicId::random()).unwrap();
//!
//! let stamp = store
//!     .commit_stamp(Status::Active, 10, author, module, path)
//!     .unwrap();
//! store
//!     .append_version(concept, ComponentKind::Concept, Version::new(stamp, &b"fields"[..]))
//!     .unwrap();
//!
//! let view = StampCoordinate::builder(path).at(15).build().unwrap();
//! assert_eq!(
//!     store.latest(&view, concept),
//!     Latest::Single(Version::new(stamp, &b"fields"[..]))
//! );
//! assert!(store.latest(&view.at(5), concept).is_absent());
//! ```

pub mod calculator;
pub mod chronology;
pub mod codec;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod id;
pub mod latest;
pub mod path;
pub mod prelude;
pub mod spine;
pub mod stamp;
pub mod store;

pub use store::Store;
