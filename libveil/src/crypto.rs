use crate::error::{VeilError, VeilGenericError, VeilResult};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, Verifier};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

pub const HASH_SIZE: usize = 32;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Copy, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Hash256([u8; HASH_SIZE]);

impl Hash256 {
    pub const ZERO: Self = Self([0; HASH_SIZE]);

    #[inline]
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[0..8].to_owned()
    }
}

impl Default for Hash256 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for Hash256 {
    type Err = VeilGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        ensure!(s.len() == 2 * HASH_SIZE, "creating hash with invalid hex string (incorrect length)");
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; HASH_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if f.alternate() { write!(f, "{}", &hex[..8]) } else { write!(f, "{}", hex) }
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash256::new(hasher.finalize().into())
}

fn random_key_bytes() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    bytes
}

macro_rules! key_type {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            #[inline]
            pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn new_random() -> Self {
                Self(random_key_bytes())
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }
        }

        // keys render as an opaque marker, never their bytes
        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

key_type! {
    /// The symmetric key protecting a folder's blocks and private metadata
    /// for one key generation. Never stored whole anywhere but in process
    /// memory; it is split into a client half and a server half.
    TlfCryptKey
}

key_type! {
    TlfCryptKeyClientHalf
}

key_type! {
    TlfCryptKeyServerHalf
}

key_type! {
    /// Random per-block key half stored in the clear alongside the
    /// ciphertext on the block server.
    BlockCryptKeyServerHalf
}

fn xor_keys(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = a[i] ^ b[i];
    }
    out
}

impl TlfCryptKey {
    /// reconstitute the folder key from its two halves
    pub fn unmask(client: TlfCryptKeyClientHalf, server: TlfCryptKeyServerHalf) -> Self {
        Self(xor_keys(&client.0, &server.0))
    }

    /// split off the client half against a freshly generated server half
    pub fn mask(self, server: TlfCryptKeyServerHalf) -> TlfCryptKeyClientHalf {
        TlfCryptKeyClientHalf(xor_keys(&self.0, &server.0))
    }
}

impl BlockCryptKeyServerHalf {
    /// the effective key a block ciphertext is sealed under
    pub fn block_key(self, tlf_key: TlfCryptKey) -> TlfCryptKey {
        TlfCryptKey(xor_keys(&self.0, &tlf_key.0))
    }
}

/// `HMAC-SHA256(serverHalf; uid ‖ kid)`; the key server refuses to release
/// a half whose id does not recompute.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ServerHalfId(Hash256);

impl ServerHalfId {
    pub fn derive(
        half: TlfCryptKeyServerHalf,
        uid: UserId,
        kid: DeviceKid,
    ) -> VeilResult<Self> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(half.as_bytes())
            .map_err(|_| anyhow!("hmac key of invalid length"))?;
        mac.update(uid.as_bytes());
        mac.update(kid.hash().as_bytes());
        Ok(Self(Hash256::new(mac.finalize().into_bytes().into())))
    }

    pub fn verify(self, half: TlfCryptKeyServerHalf, uid: UserId, kid: DeviceKid) -> bool {
        matches!(Self::derive(half, uid, kid), Ok(derived) if derived == self)
    }
}

impl Display for ServerHalfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

pub const USER_ID_SIZE: usize = 16;

#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UserId([u8; USER_ID_SIZE]);

impl UserId {
    pub fn new_random() -> Self {
        let mut bytes = [0u8; USER_ID_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; USER_ID_SIZE] {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identifies one device key (signing or crypt) of a user: the hash of the
/// public key bytes.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DeviceKid(Hash256);

impl DeviceKid {
    pub fn from_public_key_bytes(bytes: &[u8]) -> Self {
        Self(hash_bytes(bytes))
    }

    #[inline]
    pub fn hash(self) -> Hash256 {
        self.0
    }
}

impl Display for DeviceKid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "{:#}", self.0) } else { write!(f, "{}", self.0) }
    }
}

impl Debug for DeviceKid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self)
    }
}

/// An Ed25519 public key a device signs metadata with.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VerifyingKey([u8; KEY_SIZE]);

impl VerifyingKey {
    pub fn kid(self) -> DeviceKid {
        DeviceKid::from_public_key_bytes(&self.0)
    }

    pub fn verify(self, message: &[u8], sig: &SigInfo) -> VeilResult<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|err| anyhow!(VeilError::BadSignature(err.to_string())))?;
        let signature = Signature::from_slice(&sig.signature)
            .map_err(|err| anyhow!(VeilError::BadSignature(err.to_string())))?;
        key.verify(message, &signature)
            .map_err(|err| anyhow!(VeilError::BadSignature(err.to_string())))
    }
}

impl Debug for VerifyingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({:#})", self.kid())
    }
}

/// A device's Ed25519 signing key.
#[derive(Clone)]
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    pub fn new_random() -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&random_key_bytes()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> SigInfo {
        SigInfo {
            signature: self.0.sign(message).to_bytes().to_vec(),
            verifying_key: self.verifying_key(),
        }
    }
}

impl Debug for SigningKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey(..)")
    }
}

/// A detached signature along with the key that made it. Verification
/// against the *claimed* key is only half the story; callers must also
/// check the key actually belonged to the signer at signing time.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SigInfo {
    pub signature: Vec<u8>,
    pub verifying_key: VerifyingKey,
}

impl Default for VerifyingKey {
    fn default() -> Self {
        Self([0; KEY_SIZE])
    }
}

impl SigInfo {
    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}

/// An X25519 public key other parties encrypt key halves to.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CryptPublicKey([u8; KEY_SIZE]);

impl CryptPublicKey {
    pub fn kid(self) -> DeviceKid {
        DeviceKid::from_public_key_bytes(&self.0)
    }
}

impl Debug for CryptPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptPublicKey({:#})", self.kid())
    }
}

/// A device's X25519 secret key.
#[derive(Clone)]
pub struct CryptPrivateKey(x25519_dalek::StaticSecret);

impl CryptPrivateKey {
    pub fn new_random() -> Self {
        Self(x25519_dalek::StaticSecret::from(random_key_bytes()))
    }

    pub fn public_key(&self) -> CryptPublicKey {
        CryptPublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    fn shared_key(&self, theirs: CryptPublicKey) -> TlfCryptKey {
        let shared = self.0.diffie_hellman(&x25519_dalek::PublicKey::from(theirs.0));
        TlfCryptKey::new(*hash_bytes(shared.as_bytes()).as_bytes())
    }
}

impl Debug for CryptPrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptPrivateKey(..)")
    }
}

/// Sealed bytes: an XChaCha20-Poly1305 ciphertext with its nonce. The MAC
/// is part of the ciphertext.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SealedBytes {
    pub nonce: [u8; NONCE_SIZE],
    pub data: Vec<u8>,
}

impl SealedBytes {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn seal(key: TlfCryptKey, plaintext: &[u8]) -> VeilResult<SealedBytes> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_SIZE];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce[..]);
    let data = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("aead seal failed"))?;
    Ok(SealedBytes { nonce, data })
}

fn open(key: TlfCryptKey, sealed: &SealedBytes) -> VeilResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(&sealed.nonce), sealed.data.as_slice())
        .map_err(|_| anyhow!("aead open failed (wrong key or corrupted ciphertext)"))
}

/// A client key half encrypted to one device, tagged with the index of the
/// ephemeral key pair used for the exchange.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedClientHalf {
    pub sealed: SealedBytes,
    pub ephemeral_index: usize,
}

/// The per-device crypto provider: this device's long-lived keys plus every
/// primitive the engine needs. Deliberately the only place private key
/// material lives.
#[derive(Debug, Clone)]
pub struct Crypto {
    uid: UserId,
    signing_key: SigningKey,
    crypt_key: CryptPrivateKey,
}

impl Crypto {
    pub fn new(uid: UserId, signing_key: SigningKey, crypt_key: CryptPrivateKey) -> Self {
        Self { uid, signing_key, crypt_key }
    }

    pub fn new_random_device(uid: UserId) -> Self {
        Self::new(uid, SigningKey::new_random(), CryptPrivateKey::new_random())
    }

    #[inline]
    pub fn uid(&self) -> UserId {
        self.uid
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn crypt_public_key(&self) -> CryptPublicKey {
        self.crypt_key.public_key()
    }

    /// the kid this device is identified by in key bundles
    pub fn device_kid(&self) -> DeviceKid {
        self.crypt_public_key().kid()
    }

    pub fn sign(&self, message: &[u8]) -> SigInfo {
        self.signing_key.sign(message)
    }

    pub fn seal_with_key(&self, key: TlfCryptKey, plaintext: &[u8]) -> VeilResult<SealedBytes> {
        seal(key, plaintext)
    }

    pub fn open_with_key(&self, key: TlfCryptKey, sealed: &SealedBytes) -> VeilResult<Vec<u8>> {
        open(key, sealed)
    }

    /// encrypt a block's plaintext; a fresh server half per block keeps
    /// equal plaintexts under the same folder key from colliding
    pub fn seal_block(
        &self,
        tlf_key: TlfCryptKey,
        plaintext: &[u8],
    ) -> VeilResult<(SealedBytes, BlockCryptKeyServerHalf)> {
        let half = BlockCryptKeyServerHalf::new_random();
        let sealed = seal(half.block_key(tlf_key), plaintext)?;
        Ok((sealed, half))
    }

    pub fn open_block(
        &self,
        tlf_key: TlfCryptKey,
        half: BlockCryptKeyServerHalf,
        sealed: &SealedBytes,
    ) -> VeilResult<Vec<u8>> {
        open(half.block_key(tlf_key), sealed)
    }

    /// encrypt a client half to a device using a shared secret between the
    /// rekeying writer's ephemeral key and the device's crypt key
    pub fn seal_client_half(
        ephemeral: &CryptPrivateKey,
        device: CryptPublicKey,
        half: TlfCryptKeyClientHalf,
        ephemeral_index: usize,
    ) -> VeilResult<EncryptedClientHalf> {
        let sealed = seal(ephemeral.shared_key(device), half.as_bytes())?;
        Ok(EncryptedClientHalf { sealed, ephemeral_index })
    }

    /// the receiving side of [`Self::seal_client_half`]
    pub fn open_client_half(
        &self,
        ephemeral_public: CryptPublicKey,
        enc: &EncryptedClientHalf,
    ) -> VeilResult<TlfCryptKeyClientHalf> {
        let plaintext = open(self.crypt_key.shared_key(ephemeral_public), &enc.sealed)?;
        ensure!(plaintext.len() == KEY_SIZE, "client half of unexpected length");
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&plaintext);
        Ok(TlfCryptKeyClientHalf::new(bytes))
    }
}
