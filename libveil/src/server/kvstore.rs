use crate::error::VeilResult;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// The embedded key-value store the local servers persist into. The
/// concrete engine is injected; only ordered prefix scans and point ops are
/// assumed. `table` namespaces independent databases within one store.
pub trait KvStore: Send + Sync {
    fn get(&self, table: &str, key: &[u8]) -> VeilResult<Option<Vec<u8>>>;
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> VeilResult<()>;
    fn delete(&self, table: &str, key: &[u8]) -> VeilResult<()>;
    /// key-ordered scan of every entry whose key starts with `prefix`
    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> VeilResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Heap-backed store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemKv {
    tables: RwLock<FxHashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKv {
    fn get(&self, table: &str, key: &[u8]) -> VeilResult<Option<Vec<u8>>> {
        Ok(self.tables.read().get(table).and_then(|t| t.get(key).cloned()))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> VeilResult<()> {
        self.tables.write().entry(table.to_owned()).or_default().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, key: &[u8]) -> VeilResult<()> {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, table: &str, prefix: &[u8]) -> VeilResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else { return Ok(vec![]) };
        Ok(t.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
