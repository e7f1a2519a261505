//! Software crypto provider over the RustCrypto legacy-cipher stack.
//!
//! The capability table also lists algorithms with no handler attached
//! (RC2/RC4/RC5, Safer, Skipjack, MD2/MD4/MDC-2, DSA/DH/Elgamal): the
//! mechanism query reports them but any attempt to create a context fails
//! fast with `NoAlgorithm`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser};
use cipher::{BlockCipher, KeyInit, KeyIvInit, StreamCipher};
use hmac::Mac;
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use ripemd::Ripemd160;
use rsa::traits::PublicKeyParts as _;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use super::keywrap::{decode_key_material, encode_key_material};
use super::{CapabilityInfo, ContextState, CryptContext, CryptoProvider};
use crate::algid::AlgorithmInfo;
use crate::cert::spki::{PublicKeyInfo, PublicKeyParts, RsaPrivateParts};
use crate::cms::kek::KeyDerivationInfo;
use crate::cms::signature::MessageDigest;
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, Mode};
use crate::secure::SecretBuffer;

struct CapabilityRow {
    algorithm: AlgorithmId,
    modes: &'static [Mode],
    block_size: usize,
    min_key_size: usize,
    default_key_size: usize,
    max_key_size: usize,
    has_handler: bool,
}

#[rustfmt::skip]
static CAPABILITIES: &[CapabilityRow] = &[
    // Conventional ciphers
    CapabilityRow { algorithm: AlgorithmId::Des, modes: CONV_MODES, block_size: 8, min_key_size: 8, default_key_size: 8, max_key_size: 8, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::TripleDes, modes: CONV_MODES, block_size: 8, min_key_size: 24, default_key_size: 24, max_key_size: 24, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Idea, modes: CONV_MODES, block_size: 8, min_key_size: 16, default_key_size: 16, max_key_size: 16, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Cast, modes: CONV_MODES, block_size: 8, min_key_size: 5, default_key_size: 16, max_key_size: 16, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Blowfish, modes: CONV_MODES, block_size: 8, min_key_size: 4, default_key_size: 16, max_key_size: 56, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Rc2, modes: CONV_MODES, block_size: 8, min_key_size: 1, default_key_size: 16, max_key_size: 128, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Rc4, modes: &[Mode::Stream], block_size: 1, min_key_size: 1, default_key_size: 16, max_key_size: 256, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Rc5, modes: CONV_MODES, block_size: 8, min_key_size: 1, default_key_size: 16, max_key_size: 255, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Safer, modes: CONV_MODES, block_size: 8, min_key_size: 8, default_key_size: 16, max_key_size: 16, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Skipjack, modes: CONV_MODES, block_size: 8, min_key_size: 10, default_key_size: 10, max_key_size: 10, has_handler: false },
    // Hashes
    CapabilityRow { algorithm: AlgorithmId::Md2, modes: HASH_MODES, block_size: 16, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Md4, modes: HASH_MODES, block_size: 16, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Md5, modes: HASH_MODES, block_size: 16, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Sha1, modes: HASH_MODES, block_size: 20, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Ripemd160, modes: HASH_MODES, block_size: 20, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Mdc2, modes: HASH_MODES, block_size: 16, min_key_size: 0, default_key_size: 0, max_key_size: 0, has_handler: false },
    // MACs
    CapabilityRow { algorithm: AlgorithmId::HmacMd5, modes: HASH_MODES, block_size: 16, min_key_size: 8, default_key_size: 16, max_key_size: 64, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::HmacSha1, modes: HASH_MODES, block_size: 20, min_key_size: 8, default_key_size: 20, max_key_size: 64, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::HmacRipemd160, modes: HASH_MODES, block_size: 20, min_key_size: 8, default_key_size: 20, max_key_size: 64, has_handler: true },
    // Public-key
    CapabilityRow { algorithm: AlgorithmId::Rsa, modes: PKC_MODES, block_size: 64, min_key_size: 64, default_key_size: 128, max_key_size: 512, has_handler: true },
    CapabilityRow { algorithm: AlgorithmId::Dsa, modes: PKC_MODES, block_size: 64, min_key_size: 64, default_key_size: 128, max_key_size: 512, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Dh, modes: PKC_MODES, block_size: 64, min_key_size: 64, default_key_size: 128, max_key_size: 512, has_handler: false },
    CapabilityRow { algorithm: AlgorithmId::Elgamal, modes: PKC_MODES, block_size: 64, min_key_size: 64, default_key_size: 128, max_key_size: 512, has_handler: false },
];

static CONV_MODES: &[Mode] = &[Mode::Ecb, Mode::Cbc, Mode::Cfb, Mode::Ofb];
static HASH_MODES: &[Mode] = &[Mode::None];
static PKC_MODES: &[Mode] = &[Mode::Pkc];

fn find_row(algorithm: AlgorithmId, mode: Mode) -> Result<&'static CapabilityRow> {
    let row = CAPABILITIES
        .iter()
        .find(|row| row.algorithm == algorithm)
        .ok_or(ErrorKind::NoAlgorithm)?;
    if !row.modes.contains(&mode) {
        return err(ErrorKind::NoMode);
    }
    Ok(row)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Streaming transform with whatever internal state the mode needs.
trait CipherEngine: Send {
    fn process(&mut self, data: &mut [u8]) -> Result<()>;
}

struct EncEngine<M>(M);

impl<M: BlockEncryptMut + Send> CipherEngine for EncEngine<M> {
    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = M::block_size();
        if data.len() % bs != 0 {
            return err(ErrorKind::BadData);
        }
        for chunk in data.chunks_exact_mut(bs) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

struct DecEngine<M>(M);

impl<M: BlockDecryptMut + Send> CipherEngine for DecEngine<M> {
    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = M::block_size();
        if data.len() % bs != 0 {
            return err(ErrorKind::BadData);
        }
        for chunk in data.chunks_exact_mut(bs) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }
}

struct CfbEncEngine<C: BlockEncryptMut + BlockCipher>(cfb_mode::BufEncryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> CipherEngine for CfbEncEngine<C> {
    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        self.0.encrypt(data);
        Ok(())
    }
}

struct CfbDecEngine<C: BlockEncryptMut + BlockCipher>(cfb_mode::BufDecryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> CipherEngine for CfbDecEngine<C> {
    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        self.0.decrypt(data);
        Ok(())
    }
}

struct StreamEngine<S>(S);

impl<S: StreamCipher + Send> CipherEngine for StreamEngine<S> {
    fn process(&mut self, data: &mut [u8]) -> Result<()> {
        self.0.apply_keystream(data);
        Ok(())
    }
}

fn build_engine(
    algorithm: AlgorithmId,
    mode: Mode,
    direction: Direction,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn CipherEngine>> {
    match algorithm {
        AlgorithmId::Des => typed_engine::<des::Des>(mode, direction, key, iv),
        AlgorithmId::TripleDes => typed_engine::<des::TdesEde3>(mode, direction, key, iv),
        AlgorithmId::Idea => typed_engine::<idea::Idea>(mode, direction, key, iv),
        AlgorithmId::Cast => typed_engine::<cast5::Cast5>(mode, direction, key, iv),
        AlgorithmId::Blowfish => typed_engine::<blowfish::Blowfish>(mode, direction, key, iv),
        _ => err(ErrorKind::NoAlgorithm),
    }
}

fn typed_engine<C>(
    mode: Mode,
    direction: Direction,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn CipherEngine>>
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + KeyInit + Send + 'static,
    C::BlockSize: cipher::typenum::IsLess<cipher::consts::U256>,
    cipher::typenum::Le<C::BlockSize, cipher::consts::U256>: cipher::typenum::NonZero,
{
    let bad = |_| crate::error::Error::new(ErrorKind::BadData);
    Ok(match (mode, direction) {
        (Mode::Ecb, Direction::Encrypt) => {
            Box::new(EncEngine(ecb::Encryptor::<C>::new_from_slice(key).map_err(bad)?))
        }
        (Mode::Ecb, Direction::Decrypt) => {
            Box::new(DecEngine(ecb::Decryptor::<C>::new_from_slice(key).map_err(bad)?))
        }
        (Mode::Cbc, Direction::Encrypt) => {
            Box::new(EncEngine(cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(bad)?))
        }
        (Mode::Cbc, Direction::Decrypt) => {
            Box::new(DecEngine(cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(bad)?))
        }
        (Mode::Cfb, Direction::Encrypt) => Box::new(CfbEncEngine(
            cfb_mode::BufEncryptor::<C>::new_from_slices(key, iv).map_err(bad)?,
        )),
        (Mode::Cfb, Direction::Decrypt) => Box::new(CfbDecEngine(
            cfb_mode::BufDecryptor::<C>::new_from_slices(key, iv).map_err(bad)?,
        )),
        (Mode::Ofb, _) => {
            Box::new(StreamEngine(ofb::Ofb::<C>::new_from_slices(key, iv).map_err(bad)?))
        }
        _ => return err(ErrorKind::NoMode),
    })
}

enum HashState {
    Md5(Md5),
    Sha1(Sha1),
    Ripemd160(Ripemd160),
    Done(Vec<u8>),
}

impl HashState {
    fn new(algorithm: AlgorithmId) -> Result<Self> {
        Ok(match algorithm {
            AlgorithmId::Md5 => HashState::Md5(Md5::new()),
            AlgorithmId::Sha1 => HashState::Sha1(Sha1::new()),
            AlgorithmId::Ripemd160 => HashState::Ripemd160(Ripemd160::new()),
            _ => return err(ErrorKind::NoAlgorithm),
        })
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        match self {
            HashState::Md5(h) => h.update(data),
            HashState::Sha1(h) => h.update(data),
            HashState::Ripemd160(h) => h.update(data),
            HashState::Done(_) => return err(ErrorKind::NotAllowed),
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let value = match std::mem::replace(self, HashState::Done(Vec::new())) {
            HashState::Md5(h) => h.finalize().to_vec(),
            HashState::Sha1(h) => h.finalize().to_vec(),
            HashState::Ripemd160(h) => h.finalize().to_vec(),
            HashState::Done(_) => return err(ErrorKind::NotAllowed),
        };
        *self = HashState::Done(value);
        Ok(())
    }

    fn clone_running(&self) -> Result<Self> {
        Ok(match self {
            HashState::Md5(h) => HashState::Md5(h.clone()),
            HashState::Sha1(h) => HashState::Sha1(h.clone()),
            HashState::Ripemd160(h) => HashState::Ripemd160(h.clone()),
            HashState::Done(v) => HashState::Done(v.clone()),
        })
    }
}

enum MacState {
    Unkeyed(AlgorithmId),
    Md5(hmac::Hmac<Md5>),
    Sha1(hmac::Hmac<Sha1>),
    Ripemd160(hmac::Hmac<Ripemd160>),
    Done(Vec<u8>),
}

impl MacState {
    fn keyed(algorithm: AlgorithmId, key: &[u8]) -> Result<Self> {
        let bad = |_| crate::error::Error::new(ErrorKind::BadData);
        Ok(match algorithm {
            AlgorithmId::HmacMd5 => MacState::Md5(Mac::new_from_slice(key).map_err(bad)?),
            AlgorithmId::HmacSha1 => MacState::Sha1(Mac::new_from_slice(key).map_err(bad)?),
            AlgorithmId::HmacRipemd160 => {
                MacState::Ripemd160(Mac::new_from_slice(key).map_err(bad)?)
            }
            _ => return err(ErrorKind::NoAlgorithm),
        })
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        match self {
            MacState::Md5(m) => m.update(data),
            MacState::Sha1(m) => m.update(data),
            MacState::Ripemd160(m) => m.update(data),
            _ => return err(ErrorKind::NotInitialized),
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let value = match std::mem::replace(self, MacState::Done(Vec::new())) {
            MacState::Md5(m) => m.finalize().into_bytes().to_vec(),
            MacState::Sha1(m) => m.finalize().into_bytes().to_vec(),
            MacState::Ripemd160(m) => m.finalize().into_bytes().to_vec(),
            _ => return err(ErrorKind::NotInitialized),
        };
        *self = MacState::Done(value);
        Ok(())
    }
}

enum SoftState {
    Conv {
        key: Option<SecretBuffer>,
        engine: Option<Box<dyn CipherEngine>>,
        direction: Option<Direction>,
    },
    Hash(HashState),
    Mac(MacState),
    Pkc {
        private: Option<RsaPrivateKey>,
        public: Option<RsaPublicKey>,
    },
}

impl ContextState for SoftState {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_state(&self, public_only: bool) -> Result<Box<dyn ContextState>> {
        Ok(Box::new(match self {
            SoftState::Conv { key, engine, direction: _ } => {
                // A context mid-stream cannot be meaningfully cloned.
                if engine.is_some() {
                    return err(ErrorKind::NotAllowed);
                }
                SoftState::Conv {
                    key: key.as_ref().map(|k| SecretBuffer::from_slice(k.as_slice())),
                    engine: None,
                    direction: None,
                }
            }
            SoftState::Hash(state) => SoftState::Hash(state.clone_running()?),
            SoftState::Mac(_) => return err(ErrorKind::NotAllowed),
            SoftState::Pkc { private, public } => SoftState::Pkc {
                private: if public_only { None } else { private.clone() },
                public: public.clone(),
            },
        }))
    }
}

fn soft_state(context: &mut CryptContext) -> Result<&mut SoftState> {
    context
        .state
        .as_any()
        .downcast_mut::<SoftState>()
        .ok_or_else(|| ErrorKind::Signalled.into())
}

fn biguint(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

pub struct SoftwareProvider;

impl SoftwareProvider {
    pub fn new() -> Self {
        SoftwareProvider
    }

    fn conv_transform(
        &self,
        context: &mut CryptContext,
        data: &mut [u8],
        direction: Direction,
    ) -> Result<()> {
        let algorithm = context.algorithm;
        let mode = context.mode;
        let iv = context.iv.clone();
        if mode.needs_iv() && iv.len() != context.iv_size {
            return err(ErrorKind::NotInitialized);
        }
        let state = soft_state(context)?;
        let SoftState::Conv { key, engine, direction: dir } = state else {
            return err(ErrorKind::NotAllowed);
        };
        if engine.is_none() {
            let key = key.as_ref().ok_or(ErrorKind::NotInitialized)?;
            *engine = Some(build_engine(algorithm, mode, direction, key.as_slice(), &iv)?);
            *dir = Some(direction);
        }
        if *dir != Some(direction) {
            return err(ErrorKind::NotAllowed);
        }
        engine.as_mut().expect("engine built above").process(data)
    }
}

impl Default for SoftwareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for SoftwareProvider {
    fn query_capability(&self, algorithm: AlgorithmId, mode: Mode) -> Result<CapabilityInfo> {
        let row = find_row(algorithm, mode)?;
        Ok(CapabilityInfo {
            algorithm,
            mode,
            block_size: row.block_size,
            min_key_size: row.min_key_size,
            default_key_size: row.default_key_size,
            max_key_size: row.max_key_size,
            iv_size: if mode.needs_iv() { row.block_size } else { 0 },
        })
    }

    fn create_context(&self, algorithm: AlgorithmId, mode: Mode) -> Result<CryptContext> {
        let row = find_row(algorithm, mode)?;
        if !row.has_handler {
            // Present in the mechanism table but not serviceable.
            return err(ErrorKind::NoAlgorithm);
        }
        let state: SoftState = if algorithm.is_hash() {
            SoftState::Hash(HashState::new(algorithm)?)
        } else if algorithm.is_mac() {
            SoftState::Mac(MacState::Unkeyed(algorithm))
        } else if algorithm.is_pkc() {
            SoftState::Pkc { private: None, public: None }
        } else {
            SoftState::Conv { key: None, engine: None, direction: None }
        };
        Ok(CryptContext {
            algorithm,
            mode,
            block_size: row.block_size,
            iv: Vec::new(),
            iv_size: if mode.needs_iv() { row.block_size } else { 0 },
            key_loaded: false,
            key_size: 0,
            params: Default::default(),
            key_setup: None,
            public_key: None,
            state: Box::new(state),
        })
    }

    fn load_key(&self, context: &mut CryptContext, key: &[u8]) -> Result<()> {
        let algorithm = context.algorithm;
        let row = find_row(algorithm, context.mode)?;
        if algorithm.is_pkc() {
            if algorithm != AlgorithmId::Rsa {
                return err(ErrorKind::NoAlgorithm);
            }
            // Either a DER SubjectPublicKeyInfo or our private component
            // record; try the public form first.
            let mut reader = crate::ber::BerReader::new(key);
            if let Ok(info) = PublicKeyInfo::read(&mut reader) {
                let PublicKeyParts::Rsa { n, e } = &info.parts else {
                    return err(ErrorKind::NoAlgorithm);
                };
                let public = RsaPublicKey::new(biguint(n), biguint(e))
                    .map_err(|_| ErrorKind::BadData)?;
                let key_size = n.len();
                let state = soft_state(context)?;
                *state = SoftState::Pkc { private: None, public: Some(public) };
                context.public_key = Some(info);
                context.key_loaded = true;
                context.key_size = key_size;
                return Ok(());
            }
            let parts = RsaPrivateParts::from_der(key)?;
            let private = RsaPrivateKey::from_components(
                biguint(&parts.n),
                biguint(&parts.e),
                biguint(&parts.d),
                vec![biguint(&parts.p), biguint(&parts.q)],
            )
            .map_err(|_| ErrorKind::BadData)?;
            let public = private.to_public_key();
            let key_size = parts.n.len();
            let info = parts.public();
            let state = soft_state(context)?;
            *state = SoftState::Pkc { private: Some(private), public: Some(public) };
            context.public_key = Some(info);
            context.key_loaded = true;
            context.key_size = key_size;
            return Ok(());
        }
        if key.len() < row.min_key_size || key.len() > row.max_key_size {
            return err(ErrorKind::BadData);
        }
        let state = soft_state(context)?;
        match state {
            SoftState::Conv { key: slot, engine, .. } => {
                if engine.is_some() {
                    return err(ErrorKind::AlreadyInited);
                }
                *slot = Some(SecretBuffer::from_slice(key));
            }
            SoftState::Mac(mac) => *mac = MacState::keyed(algorithm, key)?,
            _ => return err(ErrorKind::NotAllowed),
        }
        context.key_loaded = true;
        context.key_size = key.len();
        Ok(())
    }

    fn derive_key(
        &self,
        context: &mut CryptContext,
        passphrase: &[u8],
        derivation: &KeyDerivationInfo,
    ) -> Result<()> {
        let row = find_row(context.algorithm, context.mode)?;
        if !context.algorithm.is_conventional() && !context.algorithm.is_mac() {
            return err(ErrorKind::NotAllowed);
        }
        if derivation.hash_algorithm != AlgorithmId::Sha1 {
            return err(ErrorKind::NoAlgorithm);
        }
        let mut key = vec![0u8; row.default_key_size];
        pbkdf2::pbkdf2::<hmac::Hmac<Sha1>>(
            passphrase,
            &derivation.salt,
            derivation.iterations,
            &mut key,
        )
        .map_err(|_| ErrorKind::BadData)?;
        self.load_key(context, &key)?;
        use zeroize::Zeroize;
        key.zeroize();
        context.key_setup = Some(derivation.clone());
        Ok(())
    }

    fn encrypt(&self, context: &mut CryptContext, data: &mut [u8]) -> Result<()> {
        self.conv_transform(context, data, Direction::Encrypt)
    }

    fn decrypt(&self, context: &mut CryptContext, data: &mut [u8]) -> Result<()> {
        self.conv_transform(context, data, Direction::Decrypt)
    }

    fn hash(&self, context: &mut CryptContext, data: &[u8]) -> Result<()> {
        let state = soft_state(context)?;
        match state {
            SoftState::Hash(hash) => {
                if data.is_empty() {
                    hash.finalize()
                } else {
                    hash.update(data)
                }
            }
            SoftState::Mac(mac) => {
                if data.is_empty() {
                    mac.finalize()
                } else {
                    mac.update(data)
                }
            }
            _ => err(ErrorKind::NotAllowed),
        }
    }

    fn hash_value(&self, context: &mut CryptContext) -> Result<Vec<u8>> {
        let state = soft_state(context)?;
        match state {
            SoftState::Hash(HashState::Done(value)) => Ok(value.clone()),
            SoftState::Mac(MacState::Done(value)) => Ok(value.clone()),
            SoftState::Hash(_) | SoftState::Mac(_) => err(ErrorKind::NotInitialized),
            _ => err(ErrorKind::NotAllowed),
        }
    }

    fn sign(
        &self,
        context: &mut CryptContext,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
    ) -> Result<Vec<u8>> {
        let state = soft_state(context)?;
        let SoftState::Pkc { private: Some(private), .. } = state else {
            return err(ErrorKind::NotInitialized);
        };
        // PKCS #1 v1.5 with an explicit DigestInfo, so the hash algorithm
        // is authenticated along with the value.
        let digest_info = MessageDigest {
            algorithm: hash_algorithm,
            is_sha0: false,
            value: hash.to_vec(),
        }
        .to_der()?;
        private
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest_info)
            .map_err(|_| ErrorKind::Signalled.into())
    }

    fn verify(
        &self,
        context: &mut CryptContext,
        hash_algorithm: AlgorithmId,
        hash: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let state = soft_state(context)?;
        let SoftState::Pkc { public: Some(public), .. } = state else {
            return err(ErrorKind::NotInitialized);
        };
        let digest_info = MessageDigest {
            algorithm: hash_algorithm,
            is_sha0: false,
            value: hash.to_vec(),
        }
        .to_der()?;
        public
            .verify(Pkcs1v15Sign::new_unprefixed(), &digest_info, signature)
            .map_err(|_| ErrorKind::BadSignature.into())
    }

    fn export_key(
        &self,
        wrap_context: &mut CryptContext,
        session_context: &mut CryptContext,
    ) -> Result<Vec<u8>> {
        let session_key = self.export_session_key_bytes(session_context)?;
        let algorithm = AlgorithmInfo {
            algorithm: session_context.algorithm,
            mode: session_context.mode,
            params: session_context.params,
        };
        if wrap_context.algorithm.is_pkc() {
            let state = soft_state(wrap_context)?;
            let SoftState::Pkc { public: Some(public), .. } = state else {
                return err(ErrorKind::NotInitialized);
            };
            return public
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, session_key.as_slice())
                .map_err(|_| ErrorKind::Signalled.into());
        }
        let material = encode_key_material(&algorithm, session_key.as_slice())?;
        let mut buffer = material.as_slice().to_vec();
        self.encrypt(wrap_context, &mut buffer)?;
        Ok(buffer)
    }

    fn import_key(
        &self,
        wrap_context: &mut CryptContext,
        wrapped: &[u8],
        session_algorithm: AlgorithmId,
        session_mode: Mode,
    ) -> Result<CryptContext> {
        if wrap_context.algorithm.is_pkc() {
            let state = soft_state(wrap_context)?;
            let SoftState::Pkc { private: Some(private), .. } = state else {
                return err(ErrorKind::NotInitialized);
            };
            let key = private
                .decrypt(Pkcs1v15Encrypt, wrapped)
                .map_err(|_| ErrorKind::WrongKey)?;
            let mut session = self.create_context(session_algorithm, session_mode)?;
            self.load_key(&mut session, &key)?;
            return Ok(session);
        }

        let mut buffer = wrapped.to_vec();
        self.decrypt(wrap_context, &mut buffer)?;
        // Garbage from a wrong KEK shows up as a structural error here.
        let (algorithm, key) = decode_key_material(&buffer)
            .map_err(|_| crate::error::Error::new(ErrorKind::WrongKey))?;
        let mut session = self.create_context(algorithm.algorithm, algorithm.mode)?;
        session.params = algorithm.params;
        self.load_key(&mut session, key.as_slice())?;
        Ok(session)
    }

    fn generate_key_blocking(
        &self,
        algorithm: AlgorithmId,
        mode: Mode,
        bits: usize,
        cancelled: &AtomicBool,
    ) -> Result<CryptContext> {
        let mut context = self.create_context(algorithm, mode)?;
        if algorithm.is_pkc() {
            if algorithm != AlgorithmId::Rsa {
                return err(ErrorKind::NoAlgorithm);
            }
            let private = RsaPrivateKey::new(&mut OsRng, bits)
                .map_err(|_| ErrorKind::Signalled)?;
            if cancelled.load(Ordering::SeqCst) {
                return err(ErrorKind::Signalled);
            }
            let n = private.n().to_bytes_be();
            let e = private.e().to_bytes_be();
            let public = private.to_public_key();
            context.public_key = Some(PublicKeyInfo {
                parts: PublicKeyParts::Rsa { n: n.clone(), e },
            });
            context.key_loaded = true;
            context.key_size = n.len();
            let state = soft_state(&mut context)?;
            *state = SoftState::Pkc { private: Some(private), public: Some(public) };
            return Ok(context);
        }
        let row = find_row(algorithm, mode)?;
        let mut key = vec![0u8; row.default_key_size];
        OsRng.fill_bytes(&mut key);
        if cancelled.load(Ordering::SeqCst) {
            return err(ErrorKind::Signalled);
        }
        self.load_key(&mut context, &key)?;
        use zeroize::Zeroize;
        key.zeroize();
        Ok(context)
    }

    fn export_session_key_bytes(&self, context: &mut CryptContext) -> Result<SecretBuffer> {
        let state = soft_state(context)?;
        match state {
            SoftState::Conv { key: Some(key), .. } => {
                Ok(SecretBuffer::from_slice(key.as_slice()))
            }
            _ => err(ErrorKind::NotInitialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CapabilityRegistry;

    #[test]
    fn absent_handler_fails_fast() {
        let registry = CapabilityRegistry::software();
        // The mechanism is known...
        assert!(registry
            .query_capability(AlgorithmId::Skipjack, Mode::Cbc)
            .is_ok());
        // ...but there is no handler behind it.
        assert_eq!(
            registry
                .create_context(AlgorithmId::Skipjack, Mode::Cbc)
                .unwrap_err()
                .kind(),
            ErrorKind::NoAlgorithm
        );
    }

    #[test]
    fn cbc_roundtrip_streams_across_calls() {
        let registry = CapabilityRegistry::software();
        let key = [0x13u8; 24];
        let iv = [0x24u8; 8];

        let enc = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&enc, &key).unwrap();
        registry.load_iv(&enc, &iv).unwrap();
        let mut a = [0u8; 16];
        let mut b = [0u8; 8];
        registry.encrypt(&enc, &mut a).unwrap();
        registry.encrypt(&enc, &mut b).unwrap();

        let dec = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&dec, &key).unwrap();
        registry.load_iv(&dec, &iv).unwrap();
        let mut joined = [a.as_slice(), b.as_slice()].concat();
        registry.decrypt(&dec, &mut joined).unwrap();
        assert_eq!(joined, [0u8; 24]);
    }

    #[test]
    fn cfb_handles_partial_blocks() {
        let registry = CapabilityRegistry::software();
        let key = [0x77u8; 24];
        let iv = [0x31u8; 8];
        let plain = b"Some test data\0";

        let enc = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cfb)
            .unwrap();
        registry.load_key(&enc, &key).unwrap();
        registry.load_iv(&enc, &iv).unwrap();
        let mut data = plain.to_vec();
        registry.encrypt(&enc, &mut data).unwrap();
        assert_ne!(&data, plain);

        let dec = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cfb)
            .unwrap();
        registry.load_key(&dec, &key).unwrap();
        registry.load_iv(&dec, &iv).unwrap();
        registry.decrypt(&dec, &mut data).unwrap();
        assert_eq!(&data, plain);
    }

    #[test]
    fn short_iv_rejected() {
        let registry = CapabilityRegistry::software();
        let ctx = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        assert_eq!(
            registry.load_iv(&ctx, &[0u8; 4]).unwrap_err().kind(),
            ErrorKind::BadData
        );
    }

    #[test]
    fn kek_wrap_unwrap_detects_wrong_key() {
        let registry = CapabilityRegistry::software();
        let session = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&session, &[0x42u8; 24]).unwrap();

        let kek = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&kek, &[0x10u8; 24]).unwrap();
        registry.load_iv(&kek, &[0u8; 8]).unwrap();
        let wrapped = registry.export_key(&kek, &session).unwrap();

        let unwrap_ok = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&unwrap_ok, &[0x10u8; 24]).unwrap();
        registry.load_iv(&unwrap_ok, &[0u8; 8]).unwrap();
        let session2 = registry
            .import_key(&unwrap_ok, &wrapped, AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        let q = registry.query_context(&session2).unwrap();
        assert!(q.key_loaded);

        let unwrap_bad = registry
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry.load_key(&unwrap_bad, &[0x11u8; 24]).unwrap();
        registry.load_iv(&unwrap_bad, &[0u8; 8]).unwrap();
        assert_eq!(
            registry
                .import_key(&unwrap_bad, &wrapped, AlgorithmId::TripleDes, Mode::Cbc)
                .unwrap_err()
                .kind(),
            ErrorKind::WrongKey
        );
    }

    #[test]
    fn rsa_sign_verify_roundtrip() {
        let registry = CapabilityRegistry::software();
        let key = crate::testkeys::rsa512_private_parts();
        let ctx = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
        registry.load_key(&ctx, &key.to_der()).unwrap();

        let hash = registry.hash_buffer(AlgorithmId::Sha1, b"data to sign").unwrap();
        let signature = registry.sign(&ctx, AlgorithmId::Sha1, &hash).unwrap();
        registry.verify(&ctx, AlgorithmId::Sha1, &hash, &signature).unwrap();

        let mut bad = signature.clone();
        bad[0] ^= 1;
        assert_eq!(
            registry
                .verify(&ctx, AlgorithmId::Sha1, &hash, &bad)
                .unwrap_err()
                .kind(),
            ErrorKind::BadSignature
        );
    }
}
