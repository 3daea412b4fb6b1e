use crate::bcache::BlockCache;
use crate::config::VeilConfig;
use crate::crypto::{BlockCryptKeyServerHalf, Crypto, SealedBytes};
use crate::error::VeilResult;
use crate::handle::TlfHandle;
use crate::id::{BlockId, BranchId, Revision, TlfId};
use crate::identity::LocalIdentity;
use crate::kcache::KeyCache;
use crate::md::SignedMd;
use crate::server::{
    BlockContext, BlockServer, BlockServerLocal, KeyServerLocal, KvStore, MdServer,
    MdServerLocal, MdStatus, MemKv, UpdateSignal,
};
use crate::splitter::BlockSplitter;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A whole in-process deployment: one identity service, one set of server
/// stores, any number of user devices hanging off them.
pub struct TestUniverse {
    pub identity: Arc<LocalIdentity>,
    pub server_store: Arc<dyn KvStore>,
    pub mdserver: MdServerLocal,
    pub bserver: Arc<BlockServerLocal>,
}

impl TestUniverse {
    pub fn new() -> Self {
        let server_store: Arc<dyn KvStore> = Arc::new(MemKv::new());
        Self {
            identity: Arc::new(LocalIdentity::new()),
            mdserver: MdServerLocal::new(Arc::clone(&server_store)),
            bserver: Arc::new(BlockServerLocal::new(Arc::clone(&server_store))),
            server_store,
        }
    }

    pub fn add_user(&self, name: &str) -> TestDevice {
        let uid = self.identity.add_user(name);
        self.add_device(uid)
    }

    /// a brand-new device for an existing user
    pub fn add_device(&self, uid: crate::crypto::UserId) -> TestDevice {
        let crypto = Crypto::new_random_device(uid);
        self.identity.add_device(uid, crypto.crypt_public_key(), crypto.verifying_key());
        TestDevice { crypto }
    }

    pub async fn handle(&self, name: &str) -> TlfHandle {
        TlfHandle::parse(self.identity.as_ref(), name).await.unwrap()
    }

    /// plain config for a device: small blocks so multi-block files are
    /// cheap to construct in tests
    pub fn config_for(&self, device: &TestDevice) -> Arc<VeilConfig> {
        self.config_for_with(device, |mdserver, bserver| (mdserver, bserver))
    }

    /// like [`Self::config_for`], letting the caller wrap either server
    pub fn config_for_with(
        &self,
        device: &TestDevice,
        wrap: impl FnOnce(
            Arc<dyn MdServer>,
            Arc<dyn BlockServer>,
        ) -> (Arc<dyn MdServer>, Arc<dyn BlockServer>),
    ) -> Arc<VeilConfig> {
        let uid = device.crypto.uid();
        let mdserver: Arc<dyn MdServer> =
            Arc::new(self.mdserver.logged_in_as(uid, device.crypto.device_kid()));
        let bserver: Arc<dyn BlockServer> = Arc::clone(&self.bserver) as Arc<dyn BlockServer>;
        let (mdserver, bserver) = wrap(mdserver, bserver);
        VeilConfig::new(
            device.crypto.clone(),
            mdserver,
            bserver,
            Arc::new(KeyServerLocal::new(Arc::clone(&self.server_store)).logged_in_as(uid)),
            Arc::clone(&self.identity) as Arc<dyn crate::identity::IdentityService>,
            Arc::new(BlockCache::new(100)),
            Arc::new(KeyCache::new()),
            BlockSplitter::new(5, 8 << 10),
        )
    }
}

pub struct TestDevice {
    pub crypto: Crypto,
}

impl TestDevice {
    pub fn uid(&self) -> crate::crypto::UserId {
        self.crypto.uid()
    }
}

/// While held, parks every `put` on a gate; other calls pass through.
/// Lets a test freeze a sync at the metadata-put linearization point.
pub struct GatedMdServer {
    inner: Arc<dyn MdServer>,
    gated: std::sync::atomic::AtomicBool,
    gate: Semaphore,
    pub put_attempts: AtomicUsize,
}

impl GatedMdServer {
    pub fn new(inner: Arc<dyn MdServer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gated: std::sync::atomic::AtomicBool::new(false),
            gate: Semaphore::new(0),
            put_attempts: AtomicUsize::new(0),
        })
    }

    /// park subsequent puts until released
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// let `n` parked puts through
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn release_all(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// wait until `n` puts have reached the gate
    pub async fn wait_for_attempts(&self, n: usize) {
        while self.put_attempts.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl MdServer for GatedMdServer {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MdStatus,
    ) -> VeilResult<(TlfId, Option<SignedMd>)> {
        self.inner.get_for_handle(handle, status).await
    }

    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
    ) -> VeilResult<Option<SignedMd>> {
        self.inner.get_for_tlf(tlf, branch, status).await
    }

    async fn get_range(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
        start: Revision,
        stop: Revision,
    ) -> VeilResult<Vec<SignedMd>> {
        self.inner.get_range(tlf, branch, status, start, stop).await
    }

    async fn put(&self, signed: SignedMd) -> VeilResult<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?;
            permit.forget();
        }
        self.inner.put(signed).await
    }

    async fn prune_branch(&self, tlf: TlfId, branch: BranchId) -> VeilResult<()> {
        self.inner.prune_branch(tlf, branch).await
    }

    async fn register_for_update(&self, tlf: TlfId, curr: Revision) -> VeilResult<UpdateSignal> {
        self.inner.register_for_update(tlf, curr).await
    }
}

/// Counts `get_for_tlf`/`get_for_handle` calls that reach the server, and
/// can hold them at a gate. For cache-dedup assertions.
pub struct CountingMdServer {
    inner: Arc<dyn MdServer>,
    pub head_gets: AtomicUsize,
    gate: Semaphore,
}

impl CountingMdServer {
    pub fn new(inner: Arc<dyn MdServer>) -> Arc<Self> {
        Self::new_gated(inner, usize::MAX >> 4)
    }

    pub fn new_gated(inner: Arc<dyn MdServer>, permits: usize) -> Arc<Self> {
        Arc::new(Self { inner, head_gets: AtomicUsize::new(0), gate: Semaphore::new(permits) })
    }

    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl MdServer for CountingMdServer {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MdStatus,
    ) -> VeilResult<(TlfId, Option<SignedMd>)> {
        self.head_gets.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?;
        permit.forget();
        self.inner.get_for_handle(handle, status).await
    }

    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
    ) -> VeilResult<Option<SignedMd>> {
        self.head_gets.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?;
        permit.forget();
        self.inner.get_for_tlf(tlf, branch, status).await
    }

    async fn get_range(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
        start: Revision,
        stop: Revision,
    ) -> VeilResult<Vec<SignedMd>> {
        self.inner.get_range(tlf, branch, status, start, stop).await
    }

    async fn put(&self, signed: SignedMd) -> VeilResult<()> {
        self.inner.put(signed).await
    }

    async fn prune_branch(&self, tlf: TlfId, branch: BranchId) -> VeilResult<()> {
        self.inner.prune_branch(tlf, branch).await
    }

    async fn register_for_update(&self, tlf: TlfId, curr: Revision) -> VeilResult<UpdateSignal> {
        self.inner.register_for_update(tlf, curr).await
    }
}

/// While held, lets a budget of block puts through and parks the rest on a
/// gate. Gets pass through untouched.
pub struct GatedBlockServer {
    inner: Arc<dyn BlockServer>,
    gated: std::sync::atomic::AtomicBool,
    free_puts: AtomicUsize,
    gate: Semaphore,
    pub puts_started: AtomicUsize,
    pub puts_finished: AtomicUsize,
}

impl GatedBlockServer {
    pub fn new(inner: Arc<dyn BlockServer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gated: std::sync::atomic::AtomicBool::new(false),
            free_puts: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            puts_started: AtomicUsize::new(0),
            puts_finished: AtomicUsize::new(0),
        })
    }

    /// let the next `n` puts through, park everything after them
    pub fn hold_after(&self, n: usize) {
        self.free_puts.store(n, Ordering::SeqCst);
        self.puts_started.store(0, Ordering::SeqCst);
        self.puts_finished.store(0, Ordering::SeqCst);
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn release_all(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub async fn wait_for_finished(&self, n: usize) {
        while self.puts_finished.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl BlockServer for GatedBlockServer {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        ctx: BlockContext,
    ) -> VeilResult<(SealedBytes, BlockCryptKeyServerHalf)> {
        self.inner.get(tlf, id, ctx).await
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        ctx: BlockContext,
        data: SealedBytes,
        half: BlockCryptKeyServerHalf,
    ) -> VeilResult<()> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            let free = {
                let mut current = self.free_puts.load(Ordering::SeqCst);
                loop {
                    if current == 0 {
                        break false;
                    }
                    match self.free_puts.compare_exchange(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break true,
                        Err(now) => current = now,
                    }
                }
            };
            if !free {
                let permit = self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?;
                permit.forget();
            }
        }
        let result = self.inner.put(tlf, id, ctx, data, half).await;
        self.puts_finished.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn add_reference(&self, tlf: TlfId, id: BlockId, ctx: BlockContext) -> VeilResult<()> {
        self.inner.add_reference(tlf, id, ctx).await
    }

    async fn remove_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()> {
        self.inner.remove_references(tlf, refs).await
    }

    async fn archive_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()> {
        self.inner.archive_references(tlf, refs).await
    }
}
