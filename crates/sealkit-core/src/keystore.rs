//! Keystore boundary.  Real keysets (files, databases, devices) live
//! outside this crate; the envelope only needs a lookup contract plus an
//! in-memory implementation for tests.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretVec};

use crate::cert::spki::KEYID_SIZE;
use crate::cert::Certificate;
use crate::error::{err, ErrorKind, Result};
use crate::provider::{CapabilityRegistry, ContextHandle};
use crate::secure::SecretBuffer;

/// How a key is identified during lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyQuery<'a> {
    KeyId(&'a [u8; KEYID_SIZE]),
    IssuerAndSerial(&'a [u8]),
}

/// Lookup contract the envelope consults for automatic key resolution.
pub trait KeyStore: Send + Sync {
    /// Fetch a private-key context.  `WrongKey` when the stored key is
    /// password-protected and the password is absent or wrong.
    fn get_private_key(
        &self,
        query: &KeyQuery<'_>,
        password: Option<&[u8]>,
    ) -> Result<ContextHandle>;

    fn get_public_key(&self, query: &KeyQuery<'_>) -> Result<ContextHandle>;

    fn get_sigcheck_cert(&self, query: &KeyQuery<'_>) -> Result<Arc<Certificate>>;
}

struct MemoryEntry {
    key_id: [u8; KEYID_SIZE],
    issuer_and_serial: Option<Vec<u8>>,
    private_der: SecretBuffer,
    password: Option<SecretVec<u8>>,
    certificate: Option<Arc<Certificate>>,
}

/// In-memory keyset for tests and simple callers.
pub struct MemoryKeyStore {
    registry: CapabilityRegistry,
    entries: Vec<MemoryEntry>,
}

impl MemoryKeyStore {
    pub fn new(registry: CapabilityRegistry) -> Self {
        MemoryKeyStore { registry, entries: Vec::new() }
    }

    /// Register a private key given its component record, an optional
    /// protecting password and an optional certificate.
    pub fn add_private_key(
        &mut self,
        key_id: [u8; KEYID_SIZE],
        private_der: &[u8],
        password: Option<&[u8]>,
        certificate: Option<Arc<Certificate>>,
    ) {
        let issuer_and_serial = certificate.as_ref().map(|c| c.issuer_and_serial_der());
        self.entries.push(MemoryEntry {
            key_id,
            issuer_and_serial,
            private_der: SecretBuffer::from_slice(private_der),
            password: password.map(|p| SecretVec::new(p.to_vec())),
            certificate,
        });
    }

    fn find(&self, query: &KeyQuery<'_>) -> Result<&MemoryEntry> {
        self.entries
            .iter()
            .find(|entry| match query {
                KeyQuery::KeyId(id) => &entry.key_id == *id,
                KeyQuery::IssuerAndSerial(span) => {
                    entry.issuer_and_serial.as_deref() == Some(*span)
                }
            })
            .ok_or_else(|| ErrorKind::DataNotFound.into())
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_private_key(
        &self,
        query: &KeyQuery<'_>,
        password: Option<&[u8]>,
    ) -> Result<ContextHandle> {
        let entry = self.find(query)?;
        if let Some(expected) = &entry.password {
            match password {
                Some(given)
                    if crate::secure::constant_time_eq(given, expected.expose_secret()) => {}
                _ => return err(ErrorKind::WrongKey),
            }
        }
        let context = self
            .registry
            .create_context(crate::oid::AlgorithmId::Rsa, crate::oid::Mode::Pkc)?;
        self.registry.load_key(&context, entry.private_der.as_slice())?;
        Ok(context)
    }

    fn get_public_key(&self, query: &KeyQuery<'_>) -> Result<ContextHandle> {
        let entry = self.find(query)?;
        let certificate = entry.certificate.as_ref().ok_or(ErrorKind::DataNotFound)?;
        let context = self
            .registry
            .create_context(certificate.spki.algorithm(), crate::oid::Mode::Pkc)?;
        self.registry.load_key(&context, &certificate.spki.to_der()?)?;
        Ok(context)
    }

    fn get_sigcheck_cert(&self, query: &KeyQuery<'_>) -> Result<Arc<Certificate>> {
        let entry = self.find(query)?;
        entry
            .certificate
            .clone()
            .ok_or_else(|| ErrorKind::DataNotFound.into())
    }
}
