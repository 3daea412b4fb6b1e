use crate::crypto::{CryptPublicKey, DeviceKid, UserId, VerifyingKey};
use crate::error::{VeilError, VeilResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Whether a verifying key belongs (or ever belonged) to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidity {
    Valid,
    /// the key was the user's but has since been revoked; metadata signed
    /// with it is suspect, not merely unverifiable
    Retired,
    Unknown,
}

/// User identification and key discovery. The real implementation talks to
/// an external service; the engine only depends on this interface.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// resolve a username or `user@service` social assertion to a uid
    async fn resolve(&self, assertion: &str) -> VeilResult<UserId>;

    async fn username(&self, uid: UserId) -> VeilResult<String>;

    /// the user's current (non-revoked) device crypt public keys
    async fn crypt_public_keys(&self, uid: UserId) -> VeilResult<Vec<CryptPublicKey>>;

    async fn verifying_key_validity(
        &self,
        uid: UserId,
        key: VerifyingKey,
    ) -> VeilResult<KeyValidity>;
}

#[derive(Debug, Clone)]
struct Device {
    crypt_key: CryptPublicKey,
    verifying_key: VerifyingKey,
    revoked: bool,
}

#[derive(Debug, Default)]
struct UserRecord {
    name: String,
    devices: Vec<Device>,
}

/// In-process identity fixture: a handful of users, each with devices that
/// can be added and revoked. Tests drive membership changes through this.
#[derive(Default)]
pub struct LocalIdentity {
    users: RwLock<FxHashMap<UserId, UserRecord>>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, name: &str) -> UserId {
        let uid = UserId::new_random();
        self.users
            .write()
            .insert(uid, UserRecord { name: name.to_owned(), devices: Vec::new() });
        uid
    }

    pub fn add_device(
        &self,
        uid: UserId,
        crypt_key: CryptPublicKey,
        verifying_key: VerifyingKey,
    ) -> DeviceKid {
        let mut users = self.users.write();
        let record = users.get_mut(&uid).expect("adding device for unknown user");
        record.devices.push(Device { crypt_key, verifying_key, revoked: false });
        crypt_key.kid()
    }

    pub fn revoke_device(&self, uid: UserId, kid: DeviceKid) {
        let mut users = self.users.write();
        let record = users.get_mut(&uid).expect("revoking device of unknown user");
        for device in &mut record.devices {
            if device.crypt_key.kid() == kid {
                device.revoked = true;
            }
        }
    }
}

#[async_trait]
impl IdentityService for LocalIdentity {
    async fn resolve(&self, assertion: &str) -> VeilResult<UserId> {
        // social assertions (`user@service`) resolve by their user part here
        let name = assertion.split('@').next().unwrap_or(assertion);
        self.users
            .read()
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(&uid, _)| uid)
            .ok_or_else(|| anyhow!(VeilError::HandleNotFound(assertion.to_owned())))
    }

    async fn username(&self, uid: UserId) -> VeilResult<String> {
        self.users
            .read()
            .get(&uid)
            .map(|record| record.name.clone())
            .ok_or_else(|| anyhow!("unknown uid `{}`", uid))
    }

    async fn crypt_public_keys(&self, uid: UserId) -> VeilResult<Vec<CryptPublicKey>> {
        let users = self.users.read();
        let record = users.get(&uid).ok_or_else(|| anyhow!("unknown uid `{}`", uid))?;
        Ok(record
            .devices
            .iter()
            .filter(|device| !device.revoked)
            .map(|device| device.crypt_key)
            .collect())
    }

    async fn verifying_key_validity(
        &self,
        uid: UserId,
        key: VerifyingKey,
    ) -> VeilResult<KeyValidity> {
        let users = self.users.read();
        let record = users.get(&uid).ok_or_else(|| anyhow!("unknown uid `{}`", uid))?;
        for device in &record.devices {
            if device.verifying_key == key {
                return Ok(if device.revoked { KeyValidity::Retired } else { KeyValidity::Valid });
            }
        }
        Ok(KeyValidity::Unknown)
    }
}
