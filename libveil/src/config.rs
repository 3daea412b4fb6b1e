use crate::bcache::BlockCache;
use crate::bops::BlockOps;
use crate::crypto::{Crypto, DeviceKid, UserId};
use crate::identity::IdentityService;
use crate::kcache::KeyCache;
use crate::kmgr::KeyManager;
use crate::mdcache::MdCache;
use crate::mdops::MdOps;
use crate::server::{BlockServer, KeyServer, MdServer};
use crate::splitter::BlockSplitter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a folder engine needs injected: the process-wide caches, the
/// per-device crypto provider, the three remote services and the policy
/// knobs. Engines never own any of it exclusively.
pub struct VeilConfig {
    crypto: Arc<Crypto>,
    block_cache: Arc<BlockCache>,
    md_cache: Arc<MdCache>,
    key_cache: Arc<KeyCache>,
    identity: Arc<dyn IdentityService>,
    mdserver: Arc<dyn MdServer>,
    splitter: BlockSplitter,
    kmgr: Arc<KeyManager>,
    bops: Arc<BlockOps>,
    mdops: Arc<MdOps>,
    // defaults newly-built engines start from; tests flip these
    cr_default: AtomicBool,
    updates_default: AtomicBool,
}

impl VeilConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Crypto,
        mdserver: Arc<dyn MdServer>,
        bserver: Arc<dyn BlockServer>,
        keyserver: Arc<dyn KeyServer>,
        identity: Arc<dyn IdentityService>,
        block_cache: Arc<BlockCache>,
        key_cache: Arc<KeyCache>,
        splitter: BlockSplitter,
    ) -> Arc<Self> {
        let crypto = Arc::new(crypto);
        let md_cache = Arc::new(MdCache::new());
        let kmgr = Arc::new(KeyManager::new(
            Arc::clone(&crypto),
            Arc::clone(&key_cache),
            keyserver,
            Arc::clone(&identity),
        ));
        let bops = Arc::new(BlockOps::new(
            bserver,
            Arc::clone(&crypto),
            Arc::clone(&kmgr),
            true,
        ));
        let mdops = Arc::new(MdOps::new(
            Arc::clone(&mdserver),
            Arc::clone(&crypto),
            Arc::clone(&kmgr),
            Arc::clone(&md_cache),
            Arc::clone(&identity),
        ));
        Arc::new(Self {
            crypto,
            block_cache,
            md_cache,
            key_cache,
            identity,
            mdserver,
            splitter,
            kmgr,
            bops,
            mdops,
            cr_default: AtomicBool::new(true),
            updates_default: AtomicBool::new(true),
        })
    }

    /// whether engines built from this config resolve conflicts on their
    /// own; tests turn this off to inspect staged state
    pub fn set_default_cr_enabled(&self, enabled: bool) {
        self.cr_default.store(enabled, Ordering::SeqCst);
    }

    pub fn default_cr_enabled(&self) -> bool {
        self.cr_default.load(Ordering::SeqCst)
    }

    pub fn set_default_updates_enabled(&self, enabled: bool) {
        self.updates_default.store(enabled, Ordering::SeqCst);
    }

    pub fn default_updates_enabled(&self) -> bool {
        self.updates_default.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn crypto(&self) -> &Crypto {
        &self.crypto
    }

    #[inline]
    pub fn uid(&self) -> UserId {
        self.crypto.uid()
    }

    #[inline]
    pub fn device_kid(&self) -> DeviceKid {
        self.crypto.device_kid()
    }

    #[inline]
    pub fn block_cache(&self) -> &BlockCache {
        &self.block_cache
    }

    #[inline]
    pub fn md_cache(&self) -> &MdCache {
        &self.md_cache
    }

    #[inline]
    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    #[inline]
    pub fn identity(&self) -> &dyn IdentityService {
        self.identity.as_ref()
    }

    #[inline]
    pub fn mdserver(&self) -> &dyn MdServer {
        self.mdserver.as_ref()
    }

    #[inline]
    pub fn splitter(&self) -> BlockSplitter {
        self.splitter
    }

    #[inline]
    pub fn kmgr(&self) -> &KeyManager {
        &self.kmgr
    }

    #[inline]
    pub fn bops(&self) -> &BlockOps {
        &self.bops
    }

    #[inline]
    pub fn mdops(&self) -> &MdOps {
        &self.mdops
    }
}
