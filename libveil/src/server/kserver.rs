use crate::codec;
use crate::crypto::{
    CryptPublicKey, DeviceKid, ServerHalfId, TlfCryptKeyServerHalf, UserId,
};
use crate::error::VeilResult;
use crate::server::kvstore::KvStore;
use std::sync::Arc;

/// Stores the server halves of folder keys, released only to the device a
/// half was stored for.
#[async_trait]
pub trait KeyServer: Send + Sync {
    async fn get_server_half(
        &self,
        id: ServerHalfId,
        device: CryptPublicKey,
    ) -> VeilResult<TlfCryptKeyServerHalf>;

    async fn put_server_halves(
        &self,
        halves: Vec<(UserId, DeviceKid, TlfCryptKeyServerHalf)>,
    ) -> VeilResult<()>;

    async fn delete_server_half(
        &self,
        uid: UserId,
        kid: DeviceKid,
        id: ServerHalfId,
    ) -> VeilResult<()>;
}

const HALF_TABLE: &str = "key_halves";

/// KV-backed key server bound to the requesting user, mirroring a session
/// on the real service.
#[derive(Clone)]
pub struct KeyServerLocal {
    store: Arc<dyn KvStore>,
    uid: UserId,
}

impl KeyServerLocal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, uid: UserId::default() }
    }

    pub fn logged_in_as(&self, uid: UserId) -> Self {
        Self { store: Arc::clone(&self.store), uid }
    }

    fn key_for(id: ServerHalfId) -> VeilResult<Vec<u8>> {
        codec::encode(&id)
    }
}

#[async_trait]
impl KeyServer for KeyServerLocal {
    async fn get_server_half(
        &self,
        id: ServerHalfId,
        device: CryptPublicKey,
    ) -> VeilResult<TlfCryptKeyServerHalf> {
        let bytes = self
            .store
            .get(HALF_TABLE, &Self::key_for(id)?)?
            .ok_or_else(|| anyhow!("no server half stored under `{}`", id))?;
        let half: TlfCryptKeyServerHalf = codec::decode(&bytes)?;
        // release only if the id recomputes for the requesting device
        ensure!(
            id.verify(half, self.uid, device.kid()),
            "server half id does not match the requesting device"
        );
        Ok(half)
    }

    async fn put_server_halves(
        &self,
        halves: Vec<(UserId, DeviceKid, TlfCryptKeyServerHalf)>,
    ) -> VeilResult<()> {
        for (uid, kid, half) in halves {
            let id = ServerHalfId::derive(half, uid, kid)?;
            self.store.put(HALF_TABLE, &Self::key_for(id)?, &codec::encode(&half)?)?;
        }
        Ok(())
    }

    async fn delete_server_half(
        &self,
        _uid: UserId,
        _kid: DeviceKid,
        id: ServerHalfId,
    ) -> VeilResult<()> {
        self.store.delete(HALF_TABLE, &Self::key_for(id)?)
    }
}
