//! Crypto provider boundary.  The envelope and certificate code talk to a
//! `CapabilityRegistry`, a thin façade over a `CryptoProvider` trait
//! object, and stay unaware of which concrete provider services a context.

pub mod keywrap;
#[cfg(feature = "soft")]
pub mod soft;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::algid::AlgoParams;
use crate::cert::spki::{PublicKeyInfo, KEYID_SIZE};
use crate::cms::kek::KeyDerivationInfo;
use crate::error::{err, Error, ErrorKind, Result};
use crate::oid::{AlgorithmId, Mode};
use crate::secure::SecretBuffer;

/// Largest conventional key in bytes.
pub const MAX_KEY_SIZE: usize = 64;

/// Static description of one `(algorithm, mode)` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub algorithm: AlgorithmId,
    pub mode: Mode,
    /// Cipher block size, or hash/MAC output size.
    pub block_size: usize,
    pub min_key_size: usize,
    pub default_key_size: usize,
    pub max_key_size: usize,
    /// Required IV length; zero when the mode carries no IV.
    pub iv_size: usize,
}

/// Snapshot of a context's public state.
#[derive(Debug, Clone)]
pub struct ContextQueryInfo {
    pub algorithm: AlgorithmId,
    pub mode: Mode,
    pub block_size: usize,
    pub iv: Vec<u8>,
    pub key_loaded: bool,
    pub key_size: usize,
    pub key_setup: Option<KeyDerivationInfo>,
    pub params: AlgoParams,
    pub public_key: Option<PublicKeyInfo>,
    /// Completed hash or MAC value, present once the context is finalised.
    pub hash_value: Option<Vec<u8>>,
}

/// Provider-private half of a context.
pub trait ContextState: Send {
    fn as_any(&mut self) -> &mut dyn Any;
    /// Clone for envelope use.  With `public_only` set, private key state
    /// is not carried across.
    fn clone_state(&self, public_only: bool) -> Result<Box<dyn ContextState>>;
}

/// Inert state for data-only contexts (e.g. a public key parsed from a
/// certificate before any provider is attached).
pub struct NullState;

impl ContextState for NullState {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_state(&self, _public_only: bool) -> Result<Box<dyn ContextState>> {
        Ok(Box::new(NullState))
    }
}

/// A handle into the provider, bound to `(algorithm, mode)` and optionally
/// holding a loaded key, an IV and algorithm tunables.
pub struct CryptContext {
    pub algorithm: AlgorithmId,
    pub mode: Mode,
    pub block_size: usize,
    pub iv: Vec<u8>,
    pub iv_size: usize,
    pub key_loaded: bool,
    pub key_size: usize,
    pub params: AlgoParams,
    /// PBKDF2 parameters recorded when the key was derived from a
    /// password; the KEK writer mirrors them onto the wire.
    pub key_setup: Option<KeyDerivationInfo>,
    pub public_key: Option<PublicKeyInfo>,
    pub(crate) state: Box<dyn ContextState>,
}

impl std::fmt::Debug for CryptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptContext")
            .field("algorithm", &self.algorithm)
            .field("mode", &self.mode)
            .field("block_size", &self.block_size)
            .field("iv", &self.iv)
            .field("iv_size", &self.iv_size)
            .field("key_loaded", &self.key_loaded)
            .field("key_size", &self.key_size)
            .field("params", &self.params)
            .field("key_setup", &self.key_setup)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl CryptContext {
    pub fn query(&self) -> ContextQueryInfo {
        ContextQueryInfo {
            algorithm: self.algorithm,
            mode: self.mode,
            block_size: self.block_size,
            iv: self.iv.clone(),
            key_loaded: self.key_loaded,
            key_size: self.key_size,
            key_setup: self.key_setup.clone(),
            params: self.params,
            public_key: self.public_key.clone(),
            hash_value: None,
        }
    }
}

/// Contexts are shared between the caller and envelope action lists by
/// reference counting; the envelope's lock is the caller's.
pub type ContextHandle = Arc<Mutex<CryptContext>>;

pub fn handle(context: CryptContext) -> ContextHandle {
    Arc::new(Mutex::new(context))
}

/// Whether two contexts represent the same cryptographic transformation:
/// PKC contexts compare by key ID, keyless hash contexts by algorithm.  A
/// context and a certificate never compare equal even when they hold the
/// same key, since reissued certs make the pairing ambiguous.
pub fn contexts_represent_same_key(a: &ContextHandle, b: &ContextHandle) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    let a = a.lock().expect("context lock");
    let b = b.lock().expect("context lock");
    match (&a.public_key, &b.public_key) {
        (Some(x), Some(y)) => x.key_id64().ok() == y.key_id64().ok(),
        (None, None) if a.algorithm.is_hash() || a.algorithm.is_mac() => {
            a.algorithm == b.algorithm
        }
        _ => false,
    }
}

/// The provider service interface.  Providers must be re-entrant across
/// envelopes; a single context is only ever driven from one thread at a
/// time.
pub trait CryptoProvider: Send + Sync {
    fn query_capability(&self, algorithm: AlgorithmId, mode: Mode) -> Result<CapabilityInfo>;
    fn create_context(&self, algorithm: AlgorithmId, mode: Mode) -> Result<CryptContext>;
    fn load_key(&self, context: &mut CryptContext, key: &[u8]) -> Result<()>;
    fn derive_key(
        &self,
        context: &mut CryptContext,
        passphrase: &[u8],
        derivation: &KeyDerivationInfo,
    ) -> Result<()>;
    /// In-place bulk transform.  For hash contexts, `hash` below is used
    /// instead.
    fn encrypt(&self, context: &mut CryptContext, data: &mut [u8]) -> Result<()>;
    fn decrypt(&self, context: &mut CryptContext, data: &mut [u8]) -> Result<()>;
    /// Feed data into a hash or MAC context; an empty slice finalises it.
    fn hash(&self, context: &mut CryptContext, data: &[u8]) -> Result<()>;
    /// Completed hash value of a finalised context.
    fn hash_value(&self, context: &mut CryptContext) -> Result<Vec<u8>>;
    fn sign(
        &self,
        context: &mut CryptContext,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
    ) -> Result<Vec<u8>>;
    fn verify(
        &self,
        context: &mut CryptContext,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
        signature: &[u8],
    ) -> Result<()>;
    /// Wrap the session key under a KEK or PKC context.
    fn export_key(
        &self,
        wrap_context: &mut CryptContext,
        session_context: &mut CryptContext,
    ) -> Result<Vec<u8>>;
    /// Unwrap into a fresh session context.
    fn import_key(
        &self,
        wrap_context: &mut CryptContext,
        wrapped: &[u8],
        session_algorithm: AlgorithmId,
        session_mode: Mode,
    ) -> Result<CryptContext>;
    /// Long-running key generation, polled by `KeyGenTask`.
    fn generate_key_blocking(
        &self,
        algorithm: AlgorithmId,
        mode: Mode,
        bits: usize,
        cancelled: &AtomicBool,
    ) -> Result<CryptContext>;
    /// Raw session-key bytes for provider-internal wrap operations.
    fn export_session_key_bytes(&self, context: &mut CryptContext) -> Result<SecretBuffer>;
}

/// Status of a background key generation.
#[derive(Clone, Debug)]
pub enum KeyGenStatus {
    Pending,
    Done(ContextHandle),
    Cancelled,
    Failed(Error),
}

/// Handle on a provider-owned key-generation worker.  The context must not
/// be used until `poll_status` reports `Done`.
pub struct KeyGenTask {
    receiver: mpsc::Receiver<Result<CryptContext>>,
    cancelled: Arc<AtomicBool>,
    terminal: Option<KeyGenStatus>,
}

impl std::fmt::Debug for KeyGenTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGenTask")
            .field("cancelled", &self.cancelled)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl KeyGenTask {
    pub fn poll_status(&mut self) -> KeyGenStatus {
        if let Some(status) = &self.terminal {
            return status.clone();
        }
        let status = match self.receiver.try_recv() {
            Ok(Ok(context)) => {
                if self.cancelled.load(Ordering::SeqCst) {
                    KeyGenStatus::Cancelled
                } else {
                    KeyGenStatus::Done(handle(context))
                }
            }
            Ok(Err(error)) => KeyGenStatus::Failed(error),
            Err(mpsc::TryRecvError::Empty) => return KeyGenStatus::Pending,
            Err(mpsc::TryRecvError::Disconnected) => {
                KeyGenStatus::Failed(Error::new(ErrorKind::Signalled))
            }
        };
        self.terminal = Some(status.clone());
        status
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Thin façade over the provider: algorithm lookup, context management and
/// the primitive operations, all keyed by `ContextHandle`.
#[derive(Clone)]
pub struct CapabilityRegistry {
    provider: Arc<dyn CryptoProvider>,
}

impl CapabilityRegistry {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        CapabilityRegistry { provider }
    }

    /// Registry over the built-in software provider.
    #[cfg(feature = "soft")]
    pub fn software() -> Self {
        CapabilityRegistry::new(Arc::new(soft::SoftwareProvider::new()))
    }

    pub fn query_capability(&self, algorithm: AlgorithmId, mode: Mode) -> Result<CapabilityInfo> {
        self.provider.query_capability(algorithm, mode)
    }

    pub fn create_context(&self, algorithm: AlgorithmId, mode: Mode) -> Result<ContextHandle> {
        Ok(handle(self.provider.create_context(algorithm, mode)?))
    }

    pub fn clone_context(&self, context: &ContextHandle, public_only: bool) -> Result<ContextHandle> {
        let guard = context.lock().expect("context lock");
        let state = guard.state.clone_state(public_only)?;
        Ok(handle(CryptContext {
            algorithm: guard.algorithm,
            mode: guard.mode,
            block_size: guard.block_size,
            iv: guard.iv.clone(),
            iv_size: guard.iv_size,
            key_loaded: guard.key_loaded,
            key_size: guard.key_size,
            params: guard.params,
            key_setup: guard.key_setup.clone(),
            public_key: guard.public_key.clone(),
            state,
        }))
    }

    /// Load an IV, rejecting lengths the algorithm cannot take.
    pub fn load_iv(&self, context: &ContextHandle, iv: &[u8]) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        if guard.iv_size == 0 {
            return err(ErrorKind::NotAllowed);
        }
        if iv.len() != guard.iv_size {
            return err(ErrorKind::BadData);
        }
        guard.iv = iv.to_vec();
        Ok(())
    }

    pub fn load_key(&self, context: &ContextHandle, key: &[u8]) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.load_key(&mut guard, key)
    }

    pub fn derive_key(
        &self,
        context: &ContextHandle,
        passphrase: &[u8],
        derivation: &KeyDerivationInfo,
    ) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.derive_key(&mut guard, passphrase, derivation)
    }

    pub fn encrypt(&self, context: &ContextHandle, data: &mut [u8]) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.encrypt(&mut guard, data)
    }

    pub fn decrypt(&self, context: &ContextHandle, data: &mut [u8]) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.decrypt(&mut guard, data)
    }

    pub fn hash(&self, context: &ContextHandle, data: &[u8]) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.hash(&mut guard, data)
    }

    pub fn hash_value(&self, context: &ContextHandle) -> Result<Vec<u8>> {
        let mut guard = context.lock().expect("context lock");
        self.provider.hash_value(&mut guard)
    }

    /// One-shot hash of a buffer.
    pub fn hash_buffer(&self, algorithm: AlgorithmId, data: &[u8]) -> Result<Vec<u8>> {
        let mut context = self.provider.create_context(algorithm, Mode::None)?;
        self.provider.hash(&mut context, data)?;
        self.provider.hash(&mut context, &[])?;
        self.provider.hash_value(&mut context)
    }

    pub fn sign(
        &self,
        context: &ContextHandle,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
    ) -> Result<Vec<u8>> {
        let mut guard = context.lock().expect("context lock");
        self.provider.sign(&mut guard, hash_algorithm, hash)
    }

    pub fn verify(
        &self,
        context: &ContextHandle,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let mut guard = context.lock().expect("context lock");
        self.provider.verify(&mut guard, hash_algorithm, hash, signature)
    }

    pub fn export_key(
        &self,
        wrap_context: &ContextHandle,
        session_context: &ContextHandle,
    ) -> Result<Vec<u8>> {
        let mut wrap = wrap_context.lock().expect("context lock");
        let mut session = session_context.lock().expect("context lock");
        self.provider.export_key(&mut wrap, &mut session)
    }

    pub fn import_key(
        &self,
        wrap_context: &ContextHandle,
        wrapped: &[u8],
        session_algorithm: AlgorithmId,
        session_mode: Mode,
    ) -> Result<ContextHandle> {
        let mut wrap = wrap_context.lock().expect("context lock");
        Ok(handle(self.provider.import_key(
            &mut wrap,
            wrapped,
            session_algorithm,
            session_mode,
        )?))
    }

    pub fn query_context(&self, context: &ContextHandle) -> Result<ContextQueryInfo> {
        let mut guard = context.lock().expect("context lock");
        let mut info = guard.query();
        // The hash value is only available once the context finalised;
        // surface it when the provider has one.
        if let Ok(value) = self.provider.hash_value(&mut guard) {
            info.hash_value = Some(value);
        }
        Ok(info)
    }

    /// 64-bit key ID of a PKC context.
    pub fn context_key_id(&self, context: &ContextHandle) -> Result<[u8; KEYID_SIZE]> {
        let guard = context.lock().expect("context lock");
        let public = guard.public_key.as_ref().ok_or(ErrorKind::NotInitialized)?;
        public.key_id64()
    }

    /// Kick off key generation on a provider worker thread.
    pub fn generate_key(
        &self,
        algorithm: AlgorithmId,
        mode: Mode,
        bits: usize,
    ) -> Result<KeyGenTask> {
        // Fail fast on capabilities with no handler before spawning: a
        // mechanism listed in the template table may still be unserviced.
        self.provider.create_context(algorithm, mode)?;
        let provider = Arc::clone(&self.provider);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let result = provider.generate_key_blocking(algorithm, mode, bits, &flag);
            let _ = sender.send(result);
        });
        Ok(KeyGenTask { receiver, cancelled, terminal: None })
    }

    pub(crate) fn export_session_key_bytes(&self, context: &ContextHandle) -> Result<SecretBuffer> {
        let mut guard = context.lock().expect("context lock");
        self.provider.export_session_key_bytes(&mut guard)
    }
}
