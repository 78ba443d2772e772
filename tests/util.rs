#![allow(dead_code)]

use stampstore::prelude::*;

pub fn config() -> StoreConfig {
    StoreConfig {
        spine_size: 16,
        workers: 4,
        ..StoreConfig::default()
    }
}

pub fn concept(store: &Store) -> Nid {
    store.resolve(&PublicId::random()).unwrap()
}

/// A store with one author and two modules ready to stamp with.
pub struct Editor {
    pub store: Store,
    pub author: Nid,
    pub module_a: Nid,
    pub module_b: Nid,
}

impl Editor {
    pub fn new(store: Store) -> Self {
        let author = concept(&store);
        let module_a = concept(&store);
        let module_b = concept(&store);
        Self {
            store,
            author,
            module_a,
            module_b,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Store::in_memory(config()).unwrap())
    }

    pub fn path(&self) -> Nid {
        concept(&self.store)
    }

    pub fn stamp(&self, time: i64, module: Nid, path: Nid) -> Nid {
        self.store
            .commit_stamp(Status::Active, time, self.author, module, path)
            .unwrap()
    }

    pub fn version(&self, component: Nid, stamp: Nid, fields: &'static [u8]) -> Version {
        let version = Version::new(stamp, fields);
        self.store
            .append_version(component, ComponentKind::Concept, version.clone())
            .unwrap();
        version
    }
}
