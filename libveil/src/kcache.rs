use crate::crypto::TlfCryptKey;
use crate::id::{KeyGen, TlfId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Process-wide cache of unmasked folder keys. Shared across engines; an
/// engine must tolerate entries appearing and disappearing underneath it.
#[derive(Default)]
pub struct KeyCache {
    keys: RwLock<FxHashMap<(TlfId, KeyGen), TlfCryptKey>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tlf: TlfId, key_gen: KeyGen) -> Option<TlfCryptKey> {
        self.keys.read().get(&(tlf, key_gen)).copied()
    }

    pub fn put(&self, tlf: TlfId, key_gen: KeyGen, key: TlfCryptKey) {
        self.keys.write().insert((tlf, key_gen), key);
    }
}
