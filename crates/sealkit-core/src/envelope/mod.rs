//! The enveloping pipeline: a streaming state machine that orders
//! cryptographic actions so data pushed in one end emerges enveloped or
//! de-enveloped at the other.
//!
//! Every call on an envelope runs on one thread at a time; the envelope's
//! lock is the caller's.  Push ordering is preserved byte-for-byte through
//! compression and cipher, and hash actions see the plaintext in the same
//! order the cipher does.

pub mod action;
pub mod content;
pub mod pgp;

use std::sync::Arc;

use crate::algid::AlgorithmInfo;
use crate::ber::{
    sizeof_object, sizeof_short_integer, BerReader, BerWriter, Length, BER_OCTETSTRING,
    BER_SEQUENCE, BER_SET,
};
use crate::cert::chain::CertChain;
use crate::cert::Certificate;
use crate::cms::attributes::CmsAttributes;
use crate::cms::header::{
    read_cms_encr_header, read_cms_header, write_cms_encr_header, write_cms_header, ContentKind,
    OidSelection, PayloadSize,
};
use crate::cms::kek::{write_kek_info, KeyDerivationInfo};
use crate::cms::keytrans::{write_key_trans_info, RecipientId};
use crate::cms::query::{query_object, ObjectKind};
use crate::cms::signature::{write_signer_info, SignerId};
use crate::cms::FormatType;
use crate::error::{err, Error, ErrorKind, Result};
use crate::keystore::{KeyQuery, KeyStore};
use crate::oid::{
    AlgorithmId, Mode, Oid, OID_CMS_DATA, OID_CMS_ENCRYPTEDDATA, OID_CMS_ENVELOPEDDATA,
    OID_CMS_SIGNEDDATA,
};
use crate::provider::{CapabilityRegistry, ContextHandle};
use crate::secure::{secure_random, SecretBuffer};
use tracing::{debug, trace};

use action::{ActionList, ActionType};
use content::{ContentList, ContentListEntry, RequiredInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeMode {
    Envelope,
    Deenvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Body,
    Postamble,
    Finished,
}

/// Compression is an opaque byte-stream transform supplied from outside.
pub trait Compressor: Send {
    fn process(&mut self, data: &[u8], eof: bool) -> Result<Vec<u8>>;
}

/// A public/private key object: a bare context, or a certificate with its
/// context attached.
pub enum PkcObject {
    Context(ContextHandle),
    Certificate {
        certificate: Arc<Certificate>,
        context: ContextHandle,
    },
}

impl PkcObject {
    fn context(&self) -> &ContextHandle {
        match self {
            PkcObject::Context(context) => context,
            PkcObject::Certificate { context, .. } => context,
        }
    }

    fn certificate(&self) -> Option<&Arc<Certificate>> {
        match self {
            PkcObject::Context(_) => None,
            PkcObject::Certificate { certificate, .. } => Some(certificate),
        }
    }
}

/// Enveloping information.
///
/// On the de-enveloping side, the PGP format folds session-key, password
/// and raw-key resolution together: any of `SessionKey`, `Password` or
/// `Key` satisfies a PGP session-key requirement and advances the same
/// internal state.
pub enum EnvelopeInfo<'a> {
    /// Exact payload size; enables definite-length encoding throughout.
    DataSize(usize),
    ContentType(Oid),
    DetachedSignature(bool),
    Password(&'a [u8]),
    PrivateKey(PkcObject),
    PublicKey(PkcObject),
    Signature(PkcObject),
    SessionKey(ContextHandle),
    Key(ContextHandle),
    Hash(ContextHandle),
    SignatureExtraData(CmsAttributes),
    Compression(Box<dyn Compressor>),
    KeysetEncrypt(Arc<dyn KeyStore>),
    KeysetDecrypt(Arc<dyn KeyStore>),
    KeysetSigcheck(Arc<dyn KeyStore>),
}

/// De-envelope parsing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeParse {
    Header,
    RecipientSet,
    EncrContentHeader,
    SignedDigestAlgos,
    SignedContentHeader,
    AwaitResolve,
    Payload,
    DetachedContent,
    Trailer,
    Done,
}

static TOP_SELECTION: &[OidSelection] = &[
    OidSelection { oid: &OID_CMS_DATA, versions: None, selection: ContentKind::Data },
    OidSelection {
        oid: &OID_CMS_SIGNEDDATA,
        versions: Some((1, 3)),
        selection: ContentKind::SignedData,
    },
    OidSelection {
        oid: &OID_CMS_ENVELOPEDDATA,
        versions: Some((0, 2)),
        selection: ContentKind::EnvelopedData,
    },
    OidSelection {
        oid: &OID_CMS_ENCRYPTEDDATA,
        versions: Some((0, 0)),
        selection: ContentKind::EncryptedData,
    },
];

static DATA_SELECTION: &[OidSelection] = &[OidSelection {
    oid: &OID_CMS_DATA,
    versions: None,
    selection: ContentKind::Data,
}];

/// The top-level stateful object.
pub struct Envelope {
    registry: CapabilityRegistry,
    format: FormatType,
    mode: EnvelopeMode,
    state: State,

    pre_actions: ActionList,
    actions: ActionList,
    post_actions: ActionList,
    content_list: ContentList,

    payload_size: Option<usize>,
    content_type: Oid,
    detached_signature: bool,
    error_state: Option<Error>,

    default_algo: AlgorithmId,
    default_mode: Mode,
    default_hash: AlgorithmId,

    crypt_context: Option<ContextHandle>,
    block_size: usize,

    encrypt_keyset: Option<Arc<dyn KeyStore>>,
    decrypt_keyset: Option<Arc<dyn KeyStore>>,
    sigcheck_keyset: Option<Arc<dyn KeyStore>>,
    compressor: Option<Box<dyn Compressor>>,

    /// Unprocessed input.
    in_buffer: SecretBuffer,
    /// Output waiting for `pop`.
    out_buffer: SecretBuffer,
    /// Partial cipher block between pushes.
    block_buffer: SecretBuffer,
    bytes_in: usize,

    // De-envelope side
    de_parse: DeParse,
    de_kind: Option<ContentKind>,
    de_payload_remaining: Option<usize>,
    de_segment_remaining: usize,
    recipient_set_remaining: Option<usize>,
    recipient_set_started: bool,
    /// Decrypted block held back until the payload end is known, so the
    /// final padding block can be stripped.
    held_plain: SecretBuffer,
    cert_chain: Option<CertChain>,
    hashes_finalized: bool,
}

impl Envelope {
    pub fn new(registry: CapabilityRegistry, format: FormatType, mode: EnvelopeMode) -> Self {
        let deenvelope = mode == EnvelopeMode::Deenvelope;
        Envelope {
            registry,
            format,
            mode,
            state: State::Preamble,
            pre_actions: ActionList::new(),
            actions: if deenvelope { ActionList::new_descending() } else { ActionList::new() },
            post_actions: ActionList::new(),
            content_list: ContentList::new(),
            payload_size: None,
            content_type: OID_CMS_DATA.clone(),
            detached_signature: false,
            error_state: None,
            default_algo: AlgorithmId::TripleDes,
            default_mode: Mode::Cbc,
            default_hash: AlgorithmId::Sha1,
            crypt_context: None,
            block_size: 1,
            encrypt_keyset: None,
            decrypt_keyset: None,
            sigcheck_keyset: None,
            compressor: None,
            in_buffer: SecretBuffer::new(),
            out_buffer: SecretBuffer::new(),
            block_buffer: SecretBuffer::new(),
            bytes_in: 0,
            de_parse: DeParse::Header,
            de_kind: None,
            de_payload_remaining: None,
            de_segment_remaining: 0,
            recipient_set_remaining: None,
            recipient_set_started: false,
            held_plain: SecretBuffer::new(),
            cert_chain: None,
            hashes_finalized: false,
        }
    }

    pub fn mode(&self) -> EnvelopeMode {
        self.mode
    }

    pub fn format(&self) -> FormatType {
        self.format
    }

    pub fn error_state(&self) -> Option<&Error> {
        self.error_state.as_ref()
    }

    /// Content list exposed for resource iteration.
    pub fn content_list(&self) -> &ContentList {
        &self.content_list
    }

    pub fn next_required(&mut self) -> bool {
        self.content_list.next_entry()
    }

    /// Certificate chain captured from a de-enveloped SignedData.
    pub fn certificate_chain(&self) -> Option<&CertChain> {
        self.cert_chain.as_ref()
    }

    /// Keyset registered for envelope-side public-key lookups.
    pub fn encryption_keyset(&self) -> Option<&Arc<dyn KeyStore>> {
        self.encrypt_keyset.as_ref()
    }

    /// Signed attributes recovered from the first verified signature.
    pub fn signature_attributes(&self) -> Option<&CmsAttributes> {
        self.content_list
            .entries()
            .iter()
            .find_map(|e| e.extra_data.as_ref())
    }

    fn poison(&mut self, error: Error) -> Error {
        // `ResourceRequired` is self-clearing: the next successful push
        // after a resource is added proceeds normally.
        if error.kind() != ErrorKind::ResourceRequired {
            self.error_state = Some(error.clone());
        }
        error
    }

    fn check_poisoned(&self) -> Result<()> {
        match &self.error_state {
            Some(original) if original.kind() == ErrorKind::ResourceRequired => {
                Err(original.clone())
            }
            Some(original) => Err(Error {
                kind: ErrorKind::IncompleteOperation,
                locus: original.locus.clone(),
            }),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Adding information
    // ------------------------------------------------------------------

    pub fn add_info(&mut self, info: EnvelopeInfo<'_>) -> Result<()> {
        match self.mode {
            EnvelopeMode::Envelope => self.add_envelope_info(info),
            EnvelopeMode::Deenvelope => self.add_deenvelope_info(info),
        }
    }

    fn set_keyset(&mut self, slot: KeysetSlot, keyset: Arc<dyn KeyStore>) -> Result<()> {
        let target = match slot {
            KeysetSlot::Encrypt => &mut self.encrypt_keyset,
            KeysetSlot::Decrypt => &mut self.decrypt_keyset,
            KeysetSlot::Sigcheck => &mut self.sigcheck_keyset,
        };
        if target.is_some() {
            return err(ErrorKind::AlreadyInited);
        }
        *target = Some(keyset);
        Ok(())
    }

    fn check_pgp_usage(&self, info: &EnvelopeInfo<'_>) -> Result<()> {
        if self.format != FormatType::Pgp {
            return Ok(());
        }
        match info {
            EnvelopeInfo::PublicKey(obj)
            | EnvelopeInfo::PrivateKey(obj)
            | EnvelopeInfo::Signature(obj) => {
                // PGP only speaks RSA for key exchange and signatures.
                let q = self.registry.query_context(obj.context())?;
                if q.algorithm != AlgorithmId::Rsa {
                    return err(ErrorKind::NotAllowed);
                }
            }
            EnvelopeInfo::Key(context) | EnvelopeInfo::SessionKey(context) => {
                // Only IDEA/CFB, and only a single bulk cipher instance.
                let q = self.registry.query_context(context)?;
                if q.algorithm != AlgorithmId::Idea || q.mode != Mode::Cfb {
                    return err(ErrorKind::NotAllowed);
                }
                if self.pre_actions.find(ActionType::KeyExchangePkc).is_some()
                    || self.actions.find(ActionType::Crypt).is_some()
                {
                    return err(ErrorKind::AlreadyInited);
                }
            }
            EnvelopeInfo::Hash(context) => {
                // Only MD5, and only one of it.
                let q = self.registry.query_context(context)?;
                if q.algorithm != AlgorithmId::Md5 {
                    return err(ErrorKind::NotAllowed);
                }
                if self.actions.find(ActionType::Hash).is_some() {
                    return err(ErrorKind::AlreadyInited);
                }
            }
            EnvelopeInfo::Compression(_) => return err(ErrorKind::NotAllowed),
            _ => {}
        }
        Ok(())
    }

    fn add_envelope_info(&mut self, info: EnvelopeInfo<'_>) -> Result<()> {
        if self.state != State::Preamble {
            return err(ErrorKind::NotAllowed);
        }
        self.check_pgp_usage(&info)?;
        match info {
            EnvelopeInfo::DataSize(size) => {
                self.payload_size = Some(size);
                Ok(())
            }
            EnvelopeInfo::ContentType(oid) => {
                self.content_type = oid;
                Ok(())
            }
            EnvelopeInfo::DetachedSignature(value) => {
                self.detached_signature = value;
                Ok(())
            }
            EnvelopeInfo::KeysetEncrypt(ks) => self.set_keyset(KeysetSlot::Encrypt, ks),
            EnvelopeInfo::KeysetDecrypt(ks) => self.set_keyset(KeysetSlot::Decrypt, ks),
            EnvelopeInfo::KeysetSigcheck(ks) => self.set_keyset(KeysetSlot::Sigcheck, ks),
            EnvelopeInfo::SignatureExtraData(attributes) => {
                // Attach to the last signature action added.
                let last_sign = self
                    .post_actions
                    .indices()
                    .filter(|&i| self.post_actions.entry(i).action == ActionType::Sign)
                    .last();
                let Some(index) = last_sign else {
                    return err(ErrorKind::NotInitialized);
                };
                let entry = self.post_actions.entry_mut(index);
                if entry.extra_data.is_some() {
                    return err(ErrorKind::AlreadyInited);
                }
                entry.extra_data = Some(attributes);
                Ok(())
            }
            EnvelopeInfo::Compression(compressor) => {
                if self.compressor.is_some() {
                    return err(ErrorKind::AlreadyInited);
                }
                self.compressor = Some(compressor);
                self.actions.check_and_add(ActionType::Compress, None)?;
                Ok(())
            }
            EnvelopeInfo::Password(password) => {
                if self.format == FormatType::Pgp {
                    // PGP derives the bulk key straight from the password;
                    // there is no key-exchange action.
                    let context = pgp::password_to_key(&self.registry, password)?;
                    if self.actions.find(ActionType::Crypt).is_some() {
                        return err(ErrorKind::AlreadyInited);
                    }
                    self.actions.check_and_add(ActionType::Crypt, Some(context))?;
                    return Ok(());
                }
                let context = self
                    .registry
                    .create_context(self.default_algo, self.default_mode)?;
                let mut salt = vec![0u8; 8];
                secure_random(&mut salt)?;
                let derivation = KeyDerivationInfo {
                    hash_algorithm: AlgorithmId::Sha1,
                    salt,
                    iterations: 5000,
                };
                self.registry.derive_key(&context, password, &derivation)?;
                self.pre_actions
                    .check_and_add(ActionType::KeyExchange, Some(context))?;
                Ok(())
            }
            EnvelopeInfo::Key(context) => {
                if self.format == FormatType::Pgp {
                    if self.actions.find(ActionType::Crypt).is_some() {
                        return err(ErrorKind::AlreadyInited);
                    }
                    let clone = self.registry.clone_context(&context, false)?;
                    self.actions.check_and_add(ActionType::Crypt, Some(clone))?;
                    return Ok(());
                }
                let clone = self.registry.clone_context(&context, false)?;
                self.pre_actions
                    .check_and_add(ActionType::KeyExchange, Some(clone))?;
                Ok(())
            }
            // A private key used for public-key encryption (the
            // encrypt-to-self case) only carries its public half into the
            // envelope.
            EnvelopeInfo::PublicKey(obj) => self.add_pkc_recipient(obj, false),
            EnvelopeInfo::PrivateKey(obj) => self.add_pkc_recipient(obj, true),
            EnvelopeInfo::SessionKey(context) => {
                if self.actions.find(ActionType::Crypt).is_some() {
                    // Multiple session keys means multiple layers of
                    // encryption; that is done with nested envelopes, not
                    // by pushing two keys.
                    return err(ErrorKind::AlreadyInited);
                }
                let clone = self.registry.clone_context(&context, false)?;
                self.actions.check_and_add(ActionType::Crypt, Some(clone))?;
                Ok(())
            }
            EnvelopeInfo::Hash(context) => {
                let clone = self.registry.clone_context(&context, false)?;
                let index = self.actions.check_and_add(ActionType::Hash, Some(clone))?;
                // A standalone hash needs a controlling signature before
                // the envelope can emit data.
                self.actions.entry_mut(index).needs_controller = true;
                Ok(())
            }
            EnvelopeInfo::Signature(obj) => {
                let clone = self.registry.clone_context(obj.context(), false)?;
                let sign_index = self
                    .post_actions
                    .check_and_add(ActionType::Sign, Some(clone))?;
                if let Some(certificate) = obj.certificate() {
                    self.post_actions.entry_mut(sign_index).certificate =
                        Some(Arc::clone(certificate));
                }

                // Hook the signature up to a hash action, creating a
                // default one when none exists yet.
                let hash_index = match self.actions.find(ActionType::Hash) {
                    Some(_) => {
                        // Use the last hash in the group.
                        self.actions
                            .indices()
                            .filter(|&i| self.actions.entry(i).action == ActionType::Hash)
                            .last()
                            .expect("group nonempty")
                    }
                    None => {
                        let hash_context = self
                            .registry
                            .create_context(self.default_hash, Mode::None)?;
                        let index = self
                            .actions
                            .check_and_add(ActionType::Hash, Some(hash_context))?;
                        // Added invisibly: the caller's own later add of
                        // the same hash is not an error.
                        self.actions.entry_mut(index).added_automatically = true;
                        index
                    }
                };
                self.post_actions.entry_mut(sign_index).associated_action = Some(hash_index);
                self.actions.entry_mut(hash_index).needs_controller = false;
                Ok(())
            }
        }
    }

    fn add_pkc_recipient(&mut self, obj: PkcObject, public_only: bool) -> Result<()> {
        let clone = self.registry.clone_context(obj.context(), public_only)?;
        let index = self
            .pre_actions
            .check_and_add(ActionType::KeyExchangePkc, Some(clone))?;
        if let Some(certificate) = obj.certificate() {
            self.pre_actions.entry_mut(index).certificate = Some(Arc::clone(certificate));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // De-enveloping resolution
    // ------------------------------------------------------------------

    fn add_deenvelope_info(&mut self, info: EnvelopeInfo<'_>) -> Result<()> {
        match info {
            // Datasize, compression and hashing make no sense here.
            EnvelopeInfo::DataSize(_)
            | EnvelopeInfo::Compression(_)
            | EnvelopeInfo::Hash(_)
            | EnvelopeInfo::ContentType(_)
            | EnvelopeInfo::PublicKey(_) => err(ErrorKind::NotAllowed),
            EnvelopeInfo::DetachedSignature(value) => {
                self.detached_signature = value;
                Ok(())
            }
            EnvelopeInfo::KeysetEncrypt(ks) => self.set_keyset(KeysetSlot::Encrypt, ks),
            EnvelopeInfo::KeysetDecrypt(ks) => self.set_keyset(KeysetSlot::Decrypt, ks),
            EnvelopeInfo::KeysetSigcheck(ks) => self.set_keyset(KeysetSlot::Sigcheck, ks),
            EnvelopeInfo::SignatureExtraData(_) => err(ErrorKind::NotAllowed),
            EnvelopeInfo::Signature(obj) => self.resolve_signature(obj),
            EnvelopeInfo::Password(password) => self.resolve_password(password),
            EnvelopeInfo::PrivateKey(obj) => {
                let index = self
                    .select_entry(RequiredInfo::PrivateKey)
                    .ok_or(ErrorKind::NotAllowed)?;
                self.resolve_private_key(index, obj.context().clone())
            }
            EnvelopeInfo::Key(context) => self.resolve_raw_key(context),
            EnvelopeInfo::SessionKey(context) => self.resolve_session_key(context),
        }
    }

    /// Match the supplied information against the current content-list
    /// entry, or the first entry of the right kind when the caller never
    /// positioned the cursor.  PGP treats session-key, password and raw
    /// key as fungible.
    fn select_entry(&self, required: RequiredInfo) -> Option<usize> {
        if let Some(current) = self.content_list.cursor() {
            let entry = &self.content_list.entries()[current];
            let matches = entry.required == required
                || (self.format == FormatType::Pgp
                    && entry.required == RequiredInfo::SessionKey
                    && matches!(
                        required,
                        RequiredInfo::SessionKey | RequiredInfo::Password | RequiredInfo::Key
                    ))
                || (entry.required == RequiredInfo::PrivateKey
                    && required == RequiredInfo::Password);
            return matches.then_some(current);
        }
        if self.format == FormatType::Pgp
            && matches!(
                required,
                RequiredInfo::SessionKey | RequiredInfo::Password | RequiredInfo::Key
            )
        {
            if let Some(index) = self.content_list.find(RequiredInfo::SessionKey) {
                return Some(index);
            }
        }
        if required == RequiredInfo::Password {
            // A password can also unlock a private key pulled from the
            // decryption keyset.
            if let Some(index) = self
                .content_list
                .entries()
                .iter()
                .position(|e| e.required == RequiredInfo::Password && !e.processed)
            {
                return Some(index);
            }
            return self
                .content_list
                .entries()
                .iter()
                .position(|e| e.required == RequiredInfo::PrivateKey && !e.processed);
        }
        if required == RequiredInfo::Signature {
            // Processed signature entries stay addressable; a repeat query
            // answers from the cached result.
            return self.content_list.find(RequiredInfo::Signature);
        }
        self.content_list
            .entries()
            .iter()
            .position(|e| e.required == required && !e.processed)
    }

    fn resolve_password(&mut self, password: &[u8]) -> Result<()> {
        let index = self
            .select_entry(RequiredInfo::Password)
            .ok_or(ErrorKind::NotAllowed)?;
        let entry = &self.content_list.entries()[index];

        match entry.required {
            RequiredInfo::PrivateKey => {
                // The password unlocks a private key in the decryption
                // keyset rather than deriving a KEK.
                let Some(keyset) = self.decrypt_keyset.clone() else {
                    return err(ErrorKind::ResourceRequired);
                };
                let query_context = if let Some(span) = entry.issuer_and_serial() {
                    keyset.get_private_key(&KeyQuery::IssuerAndSerial(span), Some(password))?
                } else if let Some(key_id) = entry.info.key_id {
                    keyset.get_private_key(&KeyQuery::KeyId(&key_id), Some(password))?
                } else {
                    return err(ErrorKind::DataNotFound);
                };
                self.resolve_private_key(index, query_context)
            }
            RequiredInfo::SessionKey if self.format == FormatType::Pgp => {
                let context = pgp::password_to_key(&self.registry, password)?;
                self.install_session_context(context, false)
            }
            RequiredInfo::Password => {
                // Derive the KEK and unwrap the session key with it.
                let algorithm = entry.info.crypt_algorithm.ok_or(ErrorKind::BadData)?;
                let mode = entry.info.crypt_mode;
                let derivation =
                    entry.info.derivation.clone().ok_or(ErrorKind::BadData)?;
                let iv = entry.info.iv.clone();
                let kek = self.registry.create_context(algorithm, mode)?;
                self.registry.derive_key(&kek, password, &derivation)?;
                if !iv.is_empty() {
                    self.registry.load_iv(&kek, &iv)?;
                }
                let entry = &self.content_list.entries()[index];
                let session = self.registry.import_key(
                    &kek,
                    entry.data(),
                    self.default_algo,
                    self.default_mode,
                )?;
                self.install_session_context(session, false)
            }
            _ => err(ErrorKind::NotAllowed),
        }
    }

    fn resolve_private_key(&mut self, index: usize, context: ContextHandle) -> Result<()> {
        // For CMS enveloped data the session-key parameters live in the
        // encrypted-content header; without it there is nothing to import
        // into yet.
        let session_entry = self.content_list.find(RequiredInfo::SessionKey);
        let entry = &self.content_list.entries()[index];
        if entry.format == FormatType::Cms && session_entry.is_none() {
            return err(ErrorKind::Underflow);
        }
        let (session_algorithm, session_mode) = match session_entry {
            Some(i) => {
                let info = &self.content_list.entries()[i].info;
                (
                    info.crypt_algorithm.ok_or(ErrorKind::BadData)?,
                    info.crypt_mode,
                )
            }
            None => (self.default_algo, self.default_mode),
        };
        let entry = &self.content_list.entries()[index];
        let session = self.registry.import_key(
            &context,
            entry.data(),
            session_algorithm,
            session_mode,
        )?;
        self.install_session_context(session, false)
    }

    fn resolve_raw_key(&mut self, context: ContextHandle) -> Result<()> {
        let index = self
            .select_entry(RequiredInfo::Key)
            .or_else(|| self.select_entry(RequiredInfo::SessionKey))
            .ok_or(ErrorKind::NotAllowed)?;
        let entry = &self.content_list.entries()[index];
        if self.format == FormatType::Pgp {
            // No encrypted session key exists; the supplied key is the
            // bulk context itself.
            let clone = self.registry.clone_context(&context, false)?;
            return self.install_session_context(clone, false);
        }
        if entry.required != RequiredInfo::Key {
            return err(ErrorKind::NotAllowed);
        }
        let iv = entry.info.iv.clone();
        if !iv.is_empty() {
            self.registry.load_iv(&context, &iv)?;
        }
        let entry = &self.content_list.entries()[index];
        let session = self.registry.import_key(
            &context,
            entry.data(),
            self.default_algo,
            self.default_mode,
        )?;
        self.install_session_context(session, false)
    }

    fn resolve_session_key(&mut self, context: ContextHandle) -> Result<()> {
        let index = self
            .select_entry(RequiredInfo::SessionKey)
            .ok_or(ErrorKind::NotAllowed)?;
        let entry = &self.content_list.entries()[index];
        // The caller handed us the session key directly; make sure it is
        // what the header says it should be.
        let q = self.registry.query_context(&context)?;
        if let Some(expected) = entry.info.crypt_algorithm {
            if self.format != FormatType::Pgp
                && (q.algorithm != expected || q.mode != entry.info.crypt_mode)
            {
                // Corrupted data, or the caller answered a KEK request
                // with a session key.
                return err(ErrorKind::WrongKey);
            }
        }
        let clone = self.registry.clone_context(&context, false)?;
        self.install_session_context(clone, true)
    }

    /// Install the recovered session-key context as the bulk decryption
    /// action and discard the now-irrelevant key-exchange records.
    fn install_session_context(
        &mut self,
        context: ContextHandle,
        _copied: bool,
    ) -> Result<()> {
        // Load the IV recorded in the encrypted-content header.  PGP has
        // no explicit IV; the cipher runs from zero with a random prefix
        // block.
        if let Some(index) = self.content_list.find(RequiredInfo::SessionKey) {
            let entry = &self.content_list.entries()[index];
            let iv = entry.info.iv.clone();
            let q = self.registry.query_context(&context)?;
            if q.mode.needs_iv() {
                if !iv.is_empty() {
                    self.registry.load_iv(&context, &iv)?;
                } else if self.format == FormatType::Pgp {
                    self.registry.load_iv(&context, &vec![0u8; q.block_size])?;
                } else {
                    return err(ErrorKind::BadData);
                }
            }
            self.block_size = if matches!(q.mode, Mode::Cbc | Mode::Ecb) {
                q.block_size
            } else {
                1
            };
        }

        // At most one bulk decryption action may exist.
        if self.actions.find(ActionType::Crypt).is_some() {
            return err(ErrorKind::AlreadyInited);
        }
        self.actions.check_and_add(ActionType::Crypt, Some(context.clone()))?;
        self.crypt_context = Some(context);
        self.content_list.retain_signatures();
        debug!("session key resolved, bulk decryption installed");

        // An outstanding information-required state is now resolved.
        if let Some(error) = &self.error_state {
            if error.kind() == ErrorKind::ResourceRequired {
                self.error_state = None;
            }
        }
        if self.de_parse == DeParse::AwaitResolve {
            self.de_parse = DeParse::Payload;
        }
        Ok(())
    }

    fn resolve_signature(&mut self, obj: PkcObject) -> Result<()> {
        let index = self
            .select_entry(RequiredInfo::Signature)
            .ok_or(ErrorKind::NotAllowed)?;

        // A previously processed entry answers from its cache.
        if self.content_list.entries()[index].processed {
            return self.content_list.entries()[index]
                .processing_result
                .clone()
                .unwrap_or(Ok(()));
        }
        let result = self.check_signature_entry(index, obj.context());
        let entry = self.content_list.entry_mut(index);
        entry.processed = true;
        entry.processing_result = Some(result.clone());
        if result.is_ok() {
            entry.sig_check_key = Some(obj.context().clone());
        }
        result
    }

    /// Verify the signature entry against the hash actions.
    fn check_signature_entry(
        &mut self,
        index: usize,
        key: &ContextHandle,
    ) -> Result<()> {
        let hash_algorithm = {
            let entry = &self.content_list.entries()[index];
            entry.info.hash_algorithm.ok_or(ErrorKind::BadData)?
        };

        // Find the hash action matching the signature's digest algorithm.
        let mut hash_context = None;
        for i in self.actions.indices().collect::<Vec<_>>() {
            let entry = self.actions.entry(i);
            if entry.action != ActionType::Hash {
                continue;
            }
            if let Some(context) = &entry.context {
                let q = self.registry.query_context(context)?;
                if q.algorithm == hash_algorithm {
                    hash_context = Some(context.clone());
                    break;
                }
            }
        }
        // No matching hash action means something altered the algorithm
        // identifier.
        let Some(hash_context) = hash_context else {
            return err(ErrorKind::BadSignature);
        };
        let content_hash = self.registry.hash_value(&hash_context)?;

        let entry = &self.content_list.entries()[index];
        let signature = entry.data().to_vec();
        let attribute_bytes = entry.signed_attribute_bytes().map(<[u8]>::to_vec);

        let hash_to_verify = match &attribute_bytes {
            Some(bytes) => {
                let attributes = CmsAttributes::parse(bytes)?;
                // Authenticated attributes must carry the content type and
                // the message digest, and both must match the content.
                let content_type =
                    attributes.content_type().ok_or(ErrorKind::BadSignature)?;
                if content_type != self.content_type {
                    return err(ErrorKind::BadSignature);
                }
                let digest =
                    attributes.message_digest().ok_or(ErrorKind::BadSignature)?;
                if digest != content_hash {
                    return err(ErrorKind::BadSignature);
                }
                let full_set = {
                    let mut writer = BerWriter::new();
                    writer.write_header(BER_SET, bytes.len());
                    writer.write_raw(bytes);
                    writer.into_bytes()
                };
                self.content_list.entry_mut(index).extra_data = Some(attributes);
                self.registry.hash_buffer(hash_algorithm, &full_set)?
            }
            None => content_hash,
        };
        self.registry
            .verify(key, hash_algorithm, &hash_to_verify, &signature)
    }

    /// Verify the current signature using keys the envelope already holds:
    /// the captured certificate chain, or the signature-check keyset.
    pub fn verify_signature(&mut self) -> Result<()> {
        let index = self
            .select_entry(RequiredInfo::Signature)
            .ok_or(ErrorKind::DataNotFound)?;
        let entry = &self.content_list.entries()[index];

        let key_info = if let Some(chain) = &self.cert_chain {
            let leaf_matches = match (entry.issuer_and_serial(), entry.info.key_id) {
                (Some(span), _) => chain.leaf().matches_issuer_and_serial(span),
                (None, Some(id)) => chain.leaf().key_id64().ok() == Some(id),
                _ => false,
            };
            if !leaf_matches {
                return err(ErrorKind::DataNotFound);
            }
            chain.leaf().spki.clone()
        } else if let Some(keyset) = self.sigcheck_keyset.clone() {
            let cert = if let Some(span) = entry.issuer_and_serial() {
                keyset.get_sigcheck_cert(&KeyQuery::IssuerAndSerial(span))?
            } else if let Some(id) = entry.info.key_id {
                keyset.get_sigcheck_cert(&KeyQuery::KeyId(&id))?
            } else {
                return err(ErrorKind::DataNotFound);
            };
            cert.spki.clone()
        } else {
            return err(ErrorKind::ResourceRequired);
        };

        let context = self
            .registry
            .create_context(key_info.algorithm(), Mode::Pkc)?;
        self.registry.load_key(&context, &key_info.to_der()?)?;
        self.resolve_signature(PkcObject::Context(context))
    }

    // ------------------------------------------------------------------
    // Push / pop
    // ------------------------------------------------------------------

    /// Push data into the envelope.  All input is always consumed; output
    /// accumulates for `pop`.
    pub fn push(&mut self, data: &[u8]) -> Result<usize> {
        self.check_poisoned()?;
        if self.state == State::Finished {
            return err(ErrorKind::NotAllowed);
        }
        let result = match self.mode {
            EnvelopeMode::Envelope => self.envelope_push(data, false),
            EnvelopeMode::Deenvelope => self.deenvelope_push(data, false),
        };
        match result {
            Ok(()) => Ok(data.len()),
            Err(error) => Err(self.poison(error)),
        }
    }

    /// Signal end of input and emit the trailer.
    pub fn flush(&mut self) -> Result<()> {
        self.check_poisoned()?;
        if self.state == State::Finished {
            return Ok(());
        }
        let result = match self.mode {
            EnvelopeMode::Envelope => self.envelope_push(&[], true),
            EnvelopeMode::Deenvelope => self.deenvelope_push(&[], true),
        };
        result.map_err(|error| self.poison(error))
    }

    /// Pop processed output.
    pub fn pop(&mut self, out: &mut [u8]) -> Result<usize> {
        let take = out.len().min(self.out_buffer.len());
        let drained = self.out_buffer.drain_front(take);
        out[..take].copy_from_slice(&drained);
        Ok(take)
    }

    pub fn pending(&self) -> usize {
        self.out_buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    // ------------------------------------------------------------------
    // Envelope side
    // ------------------------------------------------------------------

    fn envelope_push(&mut self, data: &[u8], eof: bool) -> Result<()> {
        if self.state == State::Preamble {
            self.emit_preamble()?;
            self.state = State::Body;
        }
        if !data.is_empty() {
            if let Some(limit) = self.payload_size {
                if self.bytes_in + data.len() > limit {
                    return err(ErrorKind::Overflow);
                }
            }
            self.bytes_in += data.len();
            self.in_buffer.extend_from_slice(data);
        }
        self.process_body(eof)?;
        if eof {
            if let Some(expected) = self.payload_size {
                if self.bytes_in != expected {
                    return err(ErrorKind::IncompleteOperation);
                }
            }
            self.state = State::Postamble;
            self.emit_postamble()?;
            self.state = State::Finished;
        }
        Ok(())
    }

    fn usage(&self) -> Result<ContentKind> {
        let has_recipients = !self.pre_actions.is_empty();
        let has_crypt = self.actions.find(ActionType::Crypt).is_some();
        let has_sign = !self.post_actions.is_empty();
        if has_sign && (has_crypt || has_recipients) {
            // Signing and encryption stack through nested envelopes.
            return err(ErrorKind::NotAllowed);
        }
        Ok(if has_sign {
            ContentKind::SignedData
        } else if has_recipients {
            ContentKind::EnvelopedData
        } else if has_crypt {
            ContentKind::EncryptedData
        } else {
            ContentKind::Data
        })
    }

    /// Size of the payload after block padding, when known.
    fn padded_payload_size(&self) -> Option<usize> {
        let size = self.payload_size?;
        if self.block_size > 1 {
            Some((size / self.block_size + 1) * self.block_size)
        } else {
            Some(size)
        }
    }

    fn emit_preamble(&mut self) -> Result<()> {
        if self.actions.has_uncontrolled_hash() {
            return err(ErrorKind::NotInitialized);
        }
        if self.format == FormatType::Pgp {
            return self.emit_pgp_preamble();
        }
        let usage = self.usage()?;

        // Make sure the bulk encryption context exists and is ready before
        // any sizes are computed.
        if usage == ContentKind::EnvelopedData || usage == ContentKind::EncryptedData {
            self.prepare_bulk_context(usage)?;
        }

        debug!(?usage, payload_size = ?self.payload_size, "emitting envelope preamble");
        let mut writer = BerWriter::new();
        match usage {
            ContentKind::Data => {
                write_cms_header(&mut writer, &OID_CMS_DATA, self.payload_size);
            }
            ContentKind::EncryptedData => {
                self.emit_encrypted_header(&mut writer, None)?;
            }
            ContentKind::EnvelopedData => {
                let recipients = self.emit_recipient_infos()?;
                self.emit_encrypted_header(&mut writer, Some(&recipients))?;
            }
            ContentKind::SignedData => {
                self.emit_signed_header(&mut writer)?;
            }
            ContentKind::DigestedData => return err(ErrorKind::NotAllowed),
        }
        self.out_buffer.extend_from_slice(writer.as_bytes());
        Ok(())
    }

    /// Create (or validate) the bulk crypt context and give it an IV.
    fn prepare_bulk_context(&mut self, usage: ContentKind) -> Result<()> {
        let crypt_index = match self.actions.find(ActionType::Crypt) {
            Some(index) => index,
            None => {
                if usage != ContentKind::EnvelopedData {
                    return err(ErrorKind::NotInitialized);
                }
                // Recipients but no session key: create the default one.
                let context = self
                    .registry
                    .create_context(self.default_algo, self.default_mode)?;
                let capability = self
                    .registry
                    .query_capability(self.default_algo, self.default_mode)?;
                let mut key = vec![0u8; capability.default_key_size];
                secure_random(&mut key)?;
                self.registry.load_key(&context, &key)?;
                use zeroize::Zeroize;
                key.zeroize();
                let index = self.actions.check_and_add(ActionType::Crypt, Some(context))?;
                self.actions.entry_mut(index).added_automatically = true;
                index
            }
        };
        let context = self
            .actions
            .entry(crypt_index)
            .context
            .clone()
            .ok_or(ErrorKind::NotInitialized)?;
        let q = self.registry.query_context(&context)?;
        if !q.key_loaded {
            return err(ErrorKind::NotInitialized);
        }
        if q.mode.needs_iv() && q.iv.len() != q.block_size {
            let mut iv = vec![0u8; q.block_size];
            secure_random(&mut iv)?;
            self.registry.load_iv(&context, &iv)?;
        }
        self.block_size = if matches!(q.mode, Mode::Cbc | Mode::Ecb) {
            q.block_size
        } else {
            1
        };
        self.crypt_context = Some(context);
        Ok(())
    }

    /// Serialize one recipient info per key-exchange action.
    fn emit_recipient_infos(&mut self) -> Result<Vec<u8>> {
        let session = self.crypt_context.clone().ok_or(ErrorKind::NotInitialized)?;
        let mut writer = BerWriter::new();
        for index in self.pre_actions.indices().collect::<Vec<_>>() {
            let entry = self.pre_actions.entry(index);
            let context = entry.context.clone().ok_or(ErrorKind::NotInitialized)?;
            let certificate = entry.certificate.clone();
            match entry.action {
                ActionType::KeyExchange => {
                    let q = self.registry.query_context(&context)?;
                    if q.mode.needs_iv() && q.iv.len() != q.block_size {
                        let mut iv = vec![0u8; q.block_size];
                        secure_random(&mut iv)?;
                        self.registry.load_iv(&context, &iv)?;
                    }
                    let q = self.registry.query_context(&context)?;
                    let wrapped = self.registry.export_key(&context, &session)?;
                    let algorithm = AlgorithmInfo {
                        algorithm: q.algorithm,
                        mode: q.mode,
                        params: q.params,
                    };
                    let iv = q.mode.needs_iv().then_some(q.iv.as_slice());
                    write_kek_info(
                        &mut writer,
                        &algorithm,
                        q.key_setup.as_ref(),
                        iv,
                        &wrapped,
                    )?;
                }
                ActionType::KeyExchangePkc => {
                    let wrapped = self.registry.export_key(&context, &session)?;
                    let q = self.registry.query_context(&context)?;
                    let ias;
                    let recipient = match (&certificate, self.format) {
                        (Some(cert), FormatType::Cms) => {
                            ias = cert.issuer_and_serial_der();
                            RecipientId::IssuerAndSerial(&ias)
                        }
                        _ => {
                            let public =
                                q.public_key.as_ref().ok_or(ErrorKind::NotInitialized)?;
                            RecipientId::KeyId(public.key_id64()?)
                        }
                    };
                    write_key_trans_info(&mut writer, &recipient, q.algorithm, &wrapped)?;
                }
                _ => {}
            }
        }
        Ok(writer.into_bytes())
    }

    /// Any cryptlib-format recipient bumps the content version to 2.
    fn enveloped_version(&self) -> i64 {
        let all_cms = self
            .pre_actions
            .iter()
            .all(|entry| entry.certificate.is_some() && self.format == FormatType::Cms);
        if all_cms {
            0
        } else {
            2
        }
    }

    fn emit_encrypted_header(
        &mut self,
        writer: &mut BerWriter,
        recipients: Option<&[u8]>,
    ) -> Result<()> {
        let context = self.crypt_context.clone().ok_or(ErrorKind::NotInitialized)?;
        let q = self.registry.query_context(&context)?;
        let padded = self.padded_payload_size();
        let content_oid = self.content_type.clone();

        let (outer_oid, version) = match recipients {
            Some(_) => (OID_CMS_ENVELOPEDDATA.clone(), self.enveloped_version()),
            None => (OID_CMS_ENCRYPTEDDATA.clone(), 0),
        };

        match padded {
            Some(padded_size) => {
                let encr_header_size = crate::cms::header::sizeof_cms_encr_header(
                    &content_oid,
                    Some(padded_size),
                    q.algorithm,
                    q.mode,
                    q.iv.len(),
                )?;
                let mut body = sizeof_short_integer(version)
                    + encr_header_size
                    + padded_size;
                if let Some(recipients) = recipients {
                    body += sizeof_object(recipients.len());
                }
                // Outer: SEQ { OID, [0] { SEQ { body } } }.
                writer.write_sequence(
                    outer_oid.encoded_len() + sizeof_object(sizeof_object(body)),
                );
                writer.write_oid(&outer_oid);
                writer.write_ctag(0, sizeof_object(body));
                writer.write_header(BER_SEQUENCE, body);
                writer.write_short_integer(version);
                if let Some(recipients) = recipients {
                    writer.write_header(BER_SET, recipients.len());
                    writer.write_raw(recipients);
                }
                write_cms_encr_header(
                    writer,
                    &content_oid,
                    Some(padded_size),
                    q.algorithm,
                    q.mode,
                    &q.iv,
                )?;
            }
            None => {
                writer.write_sequence_indef();
                writer.write_oid(&outer_oid);
                writer.write_ctag_indef(0);
                writer.write_sequence_indef();
                writer.write_short_integer(version);
                if let Some(recipients) = recipients {
                    writer.write_header(BER_SET, recipients.len());
                    writer.write_raw(recipients);
                }
                write_cms_encr_header(writer, &content_oid, None, q.algorithm, q.mode, &q.iv)?;
            }
        }
        Ok(())
    }

    /// SignedData always uses the indefinite outer form: the signature
    /// sizes are unknown until the trailer.
    fn emit_signed_header(&mut self, writer: &mut BerWriter) -> Result<()> {
        writer.write_sequence_indef();
        writer.write_oid(&OID_CMS_SIGNEDDATA);
        writer.write_ctag_indef(0);
        writer.write_sequence_indef();
        writer.write_short_integer(1);

        // SET OF digest algorithm identifiers, one per hash action.
        let mut algos = BerWriter::new();
        for entry in self.actions.iter() {
            if entry.action != ActionType::Hash {
                continue;
            }
            let context = entry.context.as_ref().ok_or(ErrorKind::NotInitialized)?;
            let q = self.registry.query_context(context)?;
            crate::algid::write_algorithm_identifier(&mut algos, q.algorithm, None, false, 0)?;
        }
        writer.write_header(BER_SET, algos.len());
        writer.write_raw(algos.as_bytes());

        // Encapsulated content header; omitted entirely for a detached
        // signature.
        if self.detached_signature {
            write_cms_header(writer, &self.content_type.clone(), Some(0));
        } else {
            write_cms_header(writer, &self.content_type.clone(), self.payload_size);
        }
        Ok(())
    }

    fn emit_pgp_preamble(&mut self) -> Result<()> {
        let crypt_index = self
            .actions
            .find(ActionType::Crypt)
            .ok_or(ErrorKind::NotInitialized)?;
        let Some(size) = self.payload_size else {
            // The old packet format carries an up-front length.
            return err(ErrorKind::NotInitialized);
        };
        let context = self
            .actions
            .entry(crypt_index)
            .context
            .clone()
            .ok_or(ErrorKind::NotInitialized)?;
        let q = self.registry.query_context(&context)?;
        if q.mode.needs_iv() && q.iv.len() != q.block_size {
            // PGP runs CFB from an all-zero IV with a random prefix block.
            self.registry.load_iv(&context, &vec![0u8; q.block_size])?;
        }
        self.crypt_context = Some(context.clone());
        self.block_size = 1;

        let header = pgp::encrypted_packet_header(size)?;
        self.out_buffer.extend_from_slice(&header);
        let mut prefix = pgp::make_prefix()?.to_vec();
        self.registry.encrypt(&context, &mut prefix)?;
        self.out_buffer.extend_from_slice(&prefix);
        Ok(())
    }

    /// Run buffered plaintext through compression, hashing and encryption,
    /// then emit it.
    fn process_body(&mut self, eof: bool) -> Result<()> {
        let input = self.in_buffer.drain_front(self.in_buffer.len());
        let mut data = if let Some(compressor) = &mut self.compressor {
            if input.is_empty() && !eof {
                Vec::new()
            } else {
                compressor.process(&input, eof)?
            }
        } else {
            input
        };

        // Hash actions see the plaintext in push order.
        for index in self.actions.indices().collect::<Vec<_>>() {
            let entry = self.actions.entry(index);
            if entry.action != ActionType::Hash {
                continue;
            }
            if let Some(context) = entry.context.clone() {
                if !data.is_empty() {
                    self.registry.hash(&context, &data)?;
                }
            }
        }

        if let Some(context) = self.crypt_context.clone() {
            if self.block_size > 1 {
                // Carry a partial block between pushes; pad on EOF.
                let mut staged = self.block_buffer.drain_front(self.block_buffer.len());
                staged.extend_from_slice(&data);
                use zeroize::Zeroize;
                data.zeroize();
                let keep = staged.len() % self.block_size;
                let processed_len = staged.len() - keep;
                let mut chunk = staged[..processed_len].to_vec();
                self.block_buffer.extend_from_slice(&staged[processed_len..]);
                staged.zeroize();
                if eof {
                    let mut tail = self.block_buffer.drain_front(self.block_buffer.len());
                    let pad = self.block_size - (tail.len() % self.block_size);
                    tail.extend(std::iter::repeat(pad as u8).take(pad));
                    chunk.extend_from_slice(&tail);
                    tail.zeroize();
                }
                if !chunk.is_empty() {
                    self.registry.encrypt(&context, &mut chunk)?;
                    self.emit_payload_chunk(&chunk);
                }
            } else if !data.is_empty() {
                self.registry.encrypt(&context, &mut data)?;
                self.emit_payload_chunk(&data);
            }
        } else if !data.is_empty() {
            if self.detached_signature {
                // Detached signatures hash the content without emitting it.
            } else {
                self.emit_payload_chunk(&data);
            }
        }
        Ok(())
    }

    fn emit_payload_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.format == FormatType::Pgp || self.payload_size.is_some() {
            self.out_buffer.extend_from_slice(chunk);
        } else {
            // Indefinite form: each chunk is an OCTET STRING segment.
            let mut writer = BerWriter::new();
            writer.write_header(BER_OCTETSTRING, chunk.len());
            self.out_buffer.extend_from_slice(writer.as_bytes());
            self.out_buffer.extend_from_slice(chunk);
        }
    }

    fn emit_postamble(&mut self) -> Result<()> {
        if self.format == FormatType::Pgp {
            return Ok(());
        }
        let usage = self.usage()?;
        let mut writer = BerWriter::new();
        match usage {
            ContentKind::Data => {
                if self.payload_size.is_none() {
                    // Close the OCTET STRING, [0] and outer SEQUENCE.
                    writer.write_eoc();
                    writer.write_eoc();
                    writer.write_eoc();
                }
            }
            ContentKind::EncryptedData | ContentKind::EnvelopedData => {
                if self.payload_size.is_none() {
                    // [0] content, encrypted-content SEQ, body SEQ, outer
                    // [0], outer SEQ.
                    for _ in 0..5 {
                        writer.write_eoc();
                    }
                }
            }
            ContentKind::SignedData => {
                if self.payload_size.is_none() && !self.detached_signature {
                    // Close the content OCTET STRING, [0] and encap SEQ.
                    writer.write_eoc();
                    writer.write_eoc();
                    writer.write_eoc();
                }
                self.emit_signer_infos(&mut writer)?;
                // Close the signed-data SEQ, [0] and outer SEQ.
                writer.write_eoc();
                writer.write_eoc();
                writer.write_eoc();
            }
            ContentKind::DigestedData => return err(ErrorKind::NotAllowed),
        }
        self.out_buffer.extend_from_slice(writer.as_bytes());
        Ok(())
    }

    /// Close each hash, sign, and serialize one signer info per signature
    /// action, preceded by the signing certificates when present.
    fn emit_signer_infos(&mut self, writer: &mut BerWriter) -> Result<()> {
        // Finalize every hash action.
        for index in self.actions.indices().collect::<Vec<_>>() {
            let entry = self.actions.entry(index);
            if entry.action != ActionType::Hash {
                continue;
            }
            if let Some(context) = entry.context.clone() {
                self.registry.hash(&context, &[])?;
            }
        }

        // Certificates ride in the [0] set ahead of the signer infos.
        let mut certs = BerWriter::new();
        for index in self.post_actions.indices().collect::<Vec<_>>() {
            if let Some(certificate) = &self.post_actions.entry(index).certificate {
                certs.write_raw(certificate.to_der());
            }
        }
        if !certs.is_empty() {
            writer.write_ctag(0, certs.len());
            writer.write_raw(certs.as_bytes());
        }

        let mut infos = BerWriter::new();
        for index in self.post_actions.indices().collect::<Vec<_>>() {
            let entry = self.post_actions.entry(index);
            let context = entry.context.clone().ok_or(ErrorKind::NotInitialized)?;
            let certificate = entry.certificate.clone();
            let hash_index = entry.associated_action.ok_or(ErrorKind::NotInitialized)?;
            let mut attributes = entry.extra_data.clone();
            let hash_context = self
                .actions
                .entry(hash_index)
                .context
                .clone()
                .ok_or(ErrorKind::NotInitialized)?;
            let hash_q = self.registry.query_context(&hash_context)?;
            let content_hash = self.registry.hash_value(&hash_context)?;
            let sign_q = self.registry.query_context(&context)?;

            // CMS-format signatures carry the default authenticated
            // attribute set; the cryptlib form goes without.
            if self.format == FormatType::Cms && attributes.is_none() {
                attributes = Some(CmsAttributes::new());
            }
            let (attr_bytes, hash_to_sign) = match &mut attributes {
                Some(attributes) => {
                    attributes.add_defaults(&self.content_type, &content_hash)?;
                    let content = attributes.encode_content();
                    let hashed = self
                        .registry
                        .hash_buffer(hash_q.algorithm, &attributes.encode_for_hashing())?;
                    (Some(content), hashed)
                }
                None => (None, content_hash),
            };
            let signature = self
                .registry
                .sign(&context, hash_q.algorithm, &hash_to_sign)?;

            let ias;
            let signer = match (&certificate, self.format) {
                (Some(cert), FormatType::Cms) => {
                    ias = cert.issuer_and_serial_der();
                    SignerId::IssuerAndSerial(&ias)
                }
                _ => {
                    let public =
                        sign_q.public_key.as_ref().ok_or(ErrorKind::NotInitialized)?;
                    SignerId::KeyId(public.key_id64()?)
                }
            };
            write_signer_info(
                &mut infos,
                &signer,
                hash_q.algorithm,
                sign_q.algorithm,
                attr_bytes.as_deref(),
                &signature,
            )?;
        }
        writer.write_header(BER_SET, infos.len());
        writer.write_raw(infos.as_bytes());
        Ok(())
    }

    // ------------------------------------------------------------------
    // De-envelope side
    // ------------------------------------------------------------------

    fn deenvelope_push(&mut self, data: &[u8], eof: bool) -> Result<()> {
        if !data.is_empty() {
            self.in_buffer.extend_from_slice(data);
        }
        loop {
            let before = (self.de_parse, self.in_buffer.len());
            let step = self.deenvelope_step(eof);
            match step {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::Underflow => {
                    // Need more input; everything pushed so far is
                    // buffered.
                    if eof && self.de_parse != DeParse::Done {
                        return err(ErrorKind::Underflow);
                    }
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
            if self.de_parse == DeParse::Done {
                self.state = State::Finished;
                return Ok(());
            }
            if self.de_parse == DeParse::AwaitResolve {
                let error = Error::new(ErrorKind::ResourceRequired);
                self.error_state = Some(error.clone());
                return Err(error);
            }
            if (self.de_parse, self.in_buffer.len()) == before && !eof {
                // No progress possible with the data at hand.
                return Ok(());
            }
            if (self.de_parse, self.in_buffer.len()) == before && eof {
                match self.de_parse {
                    DeParse::DetachedContent | DeParse::Trailer | DeParse::Payload => {
                        // Handled inside the step functions.
                        return Ok(());
                    }
                    _ => return err(ErrorKind::Underflow),
                }
            }
        }
    }

    fn deenvelope_step(&mut self, eof: bool) -> Result<()> {
        match self.de_parse {
            DeParse::Header => self.de_parse_header(),
            DeParse::RecipientSet => self.de_parse_recipients(),
            DeParse::EncrContentHeader => self.de_parse_encr_header(),
            DeParse::SignedDigestAlgos => self.de_parse_digest_algos(),
            DeParse::SignedContentHeader => self.de_parse_signed_content(),
            DeParse::AwaitResolve => Ok(()),
            DeParse::Payload => self.de_process_payload(eof),
            DeParse::DetachedContent => self.de_process_detached(eof),
            DeParse::Trailer => self.de_parse_trailer(eof),
            DeParse::Done => Ok(()),
        }
    }

    /// Run a parse attempt against the buffered input; on success consume
    /// the bytes the reader used.
    fn consume<T>(
        &mut self,
        parse: impl FnOnce(&mut BerReader) -> Result<T>,
    ) -> Result<T> {
        let buffered = self.in_buffer.as_slice().to_vec();
        let mut reader = BerReader::new(&buffered);
        let value = parse(&mut reader)?;
        let used = reader.pos();
        drop(reader);
        self.in_buffer.drain_front(used);
        Ok(value)
    }

    fn de_parse_header(&mut self) -> Result<()> {
        if self.format == FormatType::Pgp {
            return self.de_parse_pgp_header();
        }
        let (kind, size) = self.consume(|reader| read_cms_header(reader, TOP_SELECTION))?;
        debug!(?kind, ?size, "content-info header parsed");
        self.de_kind = Some(kind);
        match size {
            PayloadSize::Definite(len) => {
                self.de_payload_remaining = Some(len);
            }
            PayloadSize::Unknown => {
                self.de_payload_remaining = None;
            }
            PayloadSize::Absent => {
                self.de_payload_remaining = Some(0);
            }
        }
        match kind {
            ContentKind::Data => {
                self.de_parse = DeParse::Payload;
            }
            ContentKind::EnvelopedData => {
                // The size reported covers the whole EnvelopedData body,
                // not the payload; the encrypted-content header supplies
                // the real payload size later.
                self.de_payload_remaining = None;
                self.de_parse = DeParse::RecipientSet;
                self.recipient_set_remaining = None;
            }
            ContentKind::EncryptedData => {
                self.de_payload_remaining = None;
                self.de_parse = DeParse::EncrContentHeader;
            }
            ContentKind::SignedData => {
                self.de_payload_remaining = None;
                self.de_parse = DeParse::SignedDigestAlgos;
            }
            ContentKind::DigestedData => return err(ErrorKind::BadData),
        }
        Ok(())
    }

    fn de_parse_pgp_header(&mut self) -> Result<()> {
        let (ctb, length, header) = pgp::read_packet_header(self.in_buffer.as_slice())?;
        if !pgp::is_encrypted_packet(ctb) {
            return err(ErrorKind::BadData);
        }
        if length < pgp::PREFIX_LEN {
            return err(ErrorKind::BadData);
        }
        self.in_buffer.drain_front(header);
        self.de_payload_remaining = Some(length);

        // One fungible session-key requirement: password, raw key or
        // session key all resolve it.
        let mut info = crate::cms::query::ObjectInfo::default();
        info.crypt_algorithm = Some(AlgorithmId::Idea);
        info.crypt_mode = Mode::Cfb;
        info.format = FormatType::Pgp;
        self.content_list
            .push(ContentListEntry::new(RequiredInfo::SessionKey, &[], info));
        self.de_parse = DeParse::AwaitResolve;
        Ok(())
    }

    fn de_parse_recipients(&mut self) -> Result<()> {
        // First call: consume the SET header.
        if !self.recipient_set_started {
            let length = self.consume(|reader| {
                let length = reader.read_constructed(BER_SET)?;
                Ok(length)
            })?;
            self.recipient_set_remaining = match length {
                Length::Definite(len) => Some(len),
                Length::Indefinite => None,
            };
            self.recipient_set_started = true;
        }
        loop {
            // Indefinite set: EOC terminates.
            if self.recipient_set_remaining.is_none() {
                let mut reader = BerReader::new(self.in_buffer.as_slice());
                if reader.check_eoc() {
                    self.in_buffer.drain_front(2);
                    break;
                }
                if reader.is_empty() {
                    return err(ErrorKind::Underflow);
                }
            } else if self.recipient_set_remaining == Some(0) {
                break;
            }
            let info = query_object(self.in_buffer.as_slice())?;
            let required = match info.kind {
                Some(ObjectKind::EncryptedKey) => {
                    if info.derivation.is_some() {
                        RequiredInfo::Password
                    } else {
                        RequiredInfo::Key
                    }
                }
                Some(ObjectKind::PkcEncryptedKey) | Some(ObjectKind::KeyAgreement) => {
                    RequiredInfo::PrivateKey
                }
                _ => return err(ErrorKind::BadData),
            };
            let size = info.size;
            trace!(?required, size, "recipient info parsed");
            let object = self.in_buffer.drain_front(size);
            self.content_list
                .push(ContentListEntry::new(required, &object, info));
            if let Some(remaining) = &mut self.recipient_set_remaining {
                *remaining = remaining.saturating_sub(size);
            }
        }
        self.de_parse = DeParse::EncrContentHeader;
        Ok(())
    }

    fn de_parse_encr_header(&mut self) -> Result<()> {
        let (kind, size, params) =
            self.consume(|reader| read_cms_encr_header(reader, DATA_SELECTION))?;
        if kind != ContentKind::Data {
            return err(ErrorKind::BadData);
        }
        match size {
            PayloadSize::Definite(len) => {
                self.de_payload_remaining = Some(len);
            }
            PayloadSize::Unknown => {
                self.de_payload_remaining = None;
            }
            PayloadSize::Absent => return err(ErrorKind::BadData),
        }

        let mut info = crate::cms::query::ObjectInfo::default();
        info.crypt_algorithm = Some(params.algorithm);
        info.crypt_mode = params.mode;
        info.iv = params.iv;
        info.format = self.format;
        self.content_list
            .push(ContentListEntry::new(RequiredInfo::SessionKey, &[], info));
        self.de_parse = DeParse::AwaitResolve;
        Ok(())
    }

    fn de_parse_digest_algos(&mut self) -> Result<()> {
        let algorithms = self.consume(|reader| {
            let length = reader.read_set()?.definite()?;
            let end = reader.pos() + length;
            let mut algorithms = Vec::new();
            while reader.pos() < end {
                let alg = crate::algid::read_algorithm_identifier(reader)?;
                algorithms.push(alg.algorithm);
            }
            Ok(algorithms)
        })?;
        for algorithm in algorithms {
            let context = self.registry.create_context(algorithm, Mode::None)?;
            let index = self.actions.check_and_add(ActionType::Hash, Some(context))?;
            self.actions.entry_mut(index).added_automatically = true;
        }
        self.de_parse = DeParse::SignedContentHeader;
        Ok(())
    }

    fn de_parse_signed_content(&mut self) -> Result<()> {
        let (_, size) = self.consume(|reader| read_cms_header(reader, DATA_SELECTION))?;
        match size {
            PayloadSize::Definite(len) => {
                self.de_payload_remaining = Some(len);
                self.de_parse = DeParse::Payload;
            }
            PayloadSize::Unknown => {
                self.de_payload_remaining = None;
                self.de_parse = DeParse::Payload;
            }
            PayloadSize::Absent => {
                // Detached signature: the content arrives out of band.
                self.de_payload_remaining = Some(0);
                self.de_parse = DeParse::Trailer;
            }
        }
        Ok(())
    }

    /// Stream payload bytes: consume transport framing, decrypt, hash and
    /// emit plaintext.
    fn de_process_payload(&mut self, eof: bool) -> Result<()> {
        loop {
            // Figure out how many raw payload bytes are available in this
            // segment.
            let available = if let Some(remaining) = self.de_payload_remaining {
                remaining.min(self.in_buffer.len())
            } else {
                // Indefinite: walk OCTET STRING segments.
                if self.de_segment_remaining == 0 {
                    let mut reader = BerReader::new(self.in_buffer.as_slice());
                    if reader.check_eoc() {
                        self.in_buffer.drain_front(2);
                        return self.finish_payload(eof);
                    }
                    if reader.is_empty() {
                        if eof {
                            return err(ErrorKind::Underflow);
                        }
                        return Ok(());
                    }
                    let tag = reader.read_tag()?;
                    if tag != BER_OCTETSTRING {
                        return err(ErrorKind::BadData);
                    }
                    let length = reader.read_length()?.definite()?;
                    let header = reader.pos();
                    self.in_buffer.drain_front(header);
                    self.de_segment_remaining = length;
                }
                self.de_segment_remaining.min(self.in_buffer.len())
            };

            if available == 0 {
                return match self.de_payload_remaining {
                    Some(0) => self.finish_payload(eof),
                    // Out of input mid-payload: truncated at EOF, otherwise
                    // wait for the next push.
                    _ if eof => err(ErrorKind::Underflow),
                    _ => Ok(()),
                };
            }

            let chunk = self.in_buffer.drain_front(available);
            if let Some(remaining) = &mut self.de_payload_remaining {
                *remaining -= available;
            } else {
                self.de_segment_remaining -= available;
            }
            self.de_handle_payload_bytes(&chunk)?;
        }
    }

    /// Decrypt (if needed), hash and emit one run of payload bytes.
    fn de_handle_payload_bytes(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(context) = self.crypt_context.clone() {
            if self.block_size > 1 {
                let mut staged = self.block_buffer.drain_front(self.block_buffer.len());
                staged.extend_from_slice(chunk);
                let keep = staged.len() % self.block_size;
                let split = staged.len() - keep;
                let mut cipher = staged[..split].to_vec();
                self.block_buffer.extend_from_slice(&staged[split..]);
                use zeroize::Zeroize;
                staged.zeroize();
                if !cipher.is_empty() {
                    self.registry.decrypt(&context, &mut cipher)?;
                    // Hold the final decrypted block back until the payload
                    // end is known, it may carry the padding.
                    let mut plain = self.held_plain.drain_front(self.held_plain.len());
                    plain.extend_from_slice(&cipher);
                    cipher.zeroize();
                    let hold = self.block_size.min(plain.len());
                    let emit_len = plain.len() - hold;
                    self.held_plain.extend_from_slice(&plain[emit_len..]);
                    self.de_emit_plaintext(&plain[..emit_len])?;
                    plain.zeroize();
                }
            } else {
                let mut data = chunk.to_vec();
                self.registry.decrypt(&context, &mut data)?;
                self.de_emit_pgp_aware(&data)?;
            }
        } else {
            self.de_emit_plaintext(chunk)?;
        }
        Ok(())
    }

    /// PGP payloads start with the random prefix; check and strip it.
    fn de_emit_pgp_aware(&mut self, data: &[u8]) -> Result<()> {
        if self.format != FormatType::Pgp {
            return self.de_emit_plaintext(data);
        }
        if self.held_plain.len() < pgp::PREFIX_LEN {
            let needed = pgp::PREFIX_LEN - self.held_plain.len();
            let take = needed.min(data.len());
            self.held_plain.extend_from_slice(&data[..take]);
            if self.held_plain.len() == pgp::PREFIX_LEN {
                pgp::check_prefix(self.held_plain.as_slice())?;
                self.held_plain.clear();
            }
            if take < data.len() {
                return self.de_emit_plaintext(&data[take..]);
            }
            return Ok(());
        }
        self.de_emit_plaintext(data)
    }

    fn de_emit_plaintext(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        for index in self.actions.indices().collect::<Vec<_>>() {
            let entry = self.actions.entry(index);
            if entry.action != ActionType::Hash {
                continue;
            }
            if let Some(context) = entry.context.clone() {
                self.registry.hash(&context, data)?;
            }
        }
        self.out_buffer.extend_from_slice(data);
        Ok(())
    }

    /// Payload exhausted: strip padding, finalize hashes, move on to the
    /// trailer.
    fn finish_payload(&mut self, _eof: bool) -> Result<()> {
        if self.crypt_context.is_some() && self.block_size > 1 {
            if !self.block_buffer.is_empty() {
                // Ciphertext was not a whole number of blocks.
                return err(ErrorKind::BadData);
            }
            let mut tail = self.held_plain.drain_front(self.held_plain.len());
            if !tail.is_empty() {
                let pad = *tail.last().expect("nonempty") as usize;
                if pad == 0 || pad > self.block_size || pad > tail.len() {
                    return err(ErrorKind::BadData);
                }
                if !tail[tail.len() - pad..].iter().all(|&b| b == pad as u8) {
                    return err(ErrorKind::BadData);
                }
                let keep = tail.len() - pad;
                self.de_emit_plaintext(&tail[..keep].to_vec())?;
                use zeroize::Zeroize;
                tail.zeroize();
            }
        }
        self.finalize_hashes()?;
        match self.de_kind {
            Some(ContentKind::SignedData) => {
                self.de_parse = DeParse::Trailer;
            }
            _ if self.format == FormatType::Pgp => {
                self.de_parse = DeParse::Done;
            }
            _ => {
                self.de_parse = DeParse::Trailer;
            }
        }
        Ok(())
    }

    fn finalize_hashes(&mut self) -> Result<()> {
        if self.hashes_finalized {
            return Ok(());
        }
        for index in self.actions.indices().collect::<Vec<_>>() {
            let entry = self.actions.entry(index);
            if entry.action != ActionType::Hash {
                continue;
            }
            if let Some(context) = entry.context.clone() {
                self.registry.hash(&context, &[])?;
            }
        }
        self.hashes_finalized = true;
        Ok(())
    }

    /// Detached-signature content arrives as raw pushes after the envelope
    /// itself has been parsed.
    fn de_process_detached(&mut self, eof: bool) -> Result<()> {
        let data = self.in_buffer.drain_front(self.in_buffer.len());
        if !data.is_empty() {
            for index in self.actions.indices().collect::<Vec<_>>() {
                let entry = self.actions.entry(index);
                if entry.action != ActionType::Hash {
                    continue;
                }
                if let Some(context) = entry.context.clone() {
                    self.registry.hash(&context, &data)?;
                }
            }
        }
        if eof {
            self.finalize_hashes()?;
            self.de_parse = DeParse::Done;
        }
        Ok(())
    }

    /// Parse the SignedData trailer (certificates, signer infos) and eat
    /// the closing EOCs.
    fn de_parse_trailer(&mut self, eof: bool) -> Result<()> {
        if self.de_kind == Some(ContentKind::SignedData) {
            // Optional [0] certificate set.
            {
                let mut reader = BerReader::new(self.in_buffer.as_slice());
                if !reader.is_empty() && reader.peek_byte()? == crate::ber::ctag(0) {
                    let chain = self.consume(|reader| {
                        let length = reader.read_constructed(crate::ber::ctag(0))?.definite()?;
                        CertChain::read_cert_bag(reader, length)
                    })?;
                    self.cert_chain = Some(chain);
                }
            }
            // SET OF signer infos.
            {
                let mut reader = BerReader::new(self.in_buffer.as_slice());
                if !reader.is_empty() && reader.peek_byte()? == BER_SET {
                    let entries = self.consume(|reader| {
                        let length = reader.read_set()?.definite()?;
                        let end = reader.pos() + length;
                        let mut spans = Vec::new();
                        while reader.pos() < end {
                            let start = reader.pos();
                            let remaining = end - start;
                            let data = reader.take(remaining)?;
                            let info = query_object(data)?;
                            let size = info.size;
                            spans.push((data[..size].to_vec(), info));
                            reader.seek(start + size);
                        }
                        Ok(spans)
                    })?;
                    for (object, info) in entries {
                        if info.kind != Some(ObjectKind::Signature) {
                            return err(ErrorKind::BadData);
                        }
                        self.content_list
                            .push(ContentListEntry::new(RequiredInfo::Signature, &object, info));
                    }
                }
            }
        }

        // Consume closing EOCs.
        loop {
            let mut reader = BerReader::new(self.in_buffer.as_slice());
            if reader.check_eoc() {
                self.in_buffer.drain_front(2);
                continue;
            }
            break;
        }

        // A detached signature still expects its content.
        if self.detached_signature
            && self.de_kind == Some(ContentKind::SignedData)
            && !self.hashes_finalized
        {
            self.de_parse = DeParse::DetachedContent;
            return Ok(());
        }

        if self.de_kind == Some(ContentKind::SignedData)
            && self.content_list.find(RequiredInfo::Signature).is_none()
        {
            // The signer infos have not arrived yet.
            return err(ErrorKind::Underflow);
        }

        if eof || self.de_kind != Some(ContentKind::SignedData) {
            if self.in_buffer.is_empty() {
                self.de_parse = DeParse::Done;
                return Ok(());
            }
            if eof {
                return err(ErrorKind::BadData);
            }
        }
        if self.de_kind == Some(ContentKind::SignedData)
            && self.content_list.find(RequiredInfo::Signature).is_some()
        {
            self.de_parse = DeParse::Done;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum KeysetSlot {
    Encrypt,
    Decrypt,
    Sigcheck,
}

impl Drop for Envelope {
    fn drop(&mut self) {
        // Buffered plaintext and key bytes zeroise through SecretBuffer.
        self.in_buffer.clear();
        self.out_buffer.clear();
        self.block_buffer.clear();
        self.held_plain.clear();
    }
}
