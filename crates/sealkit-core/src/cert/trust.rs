//! Trust anchors: keys trusted by configuration rather than by signature.
//! The store is a value passed explicitly into verify operations; wrap it
//! in an `RwLock` for process-wide sharing (reads are frequent, updates
//! rare).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::cert::spki::PublicKeyInfo;
use crate::cert::Certificate;
use crate::error::{err, ErrorKind, Result};

/// One trusted key, looked up by the hash of the subject DN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    pub subject_dn_hash: String,
    /// DER SubjectPublicKeyInfo, base64.
    pub public_key: String,
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    pub entries: HashMap<String, TrustEntry>,
}

fn dn_hash(dn_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(dn_der);
    hex::encode(hasher.finalize())
}

impl TrustStore {
    pub fn new() -> Self {
        TrustStore { entries: HashMap::new() }
    }

    /// Missing file reads as an empty store.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(TrustStore::new());
        }
        let data = std::fs::read_to_string(path).map_err(|_| ErrorKind::DataNotFound)?;
        serde_json::from_str(&data).map_err(|_| ErrorKind::BadData.into())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self).map_err(|_| ErrorKind::BadData)?;
        std::fs::write(path, data).map_err(|_| ErrorKind::Signalled.into())
    }

    pub fn add_trusted_key(
        &mut self,
        subject_dn_der: &[u8],
        public_key: &PublicKeyInfo,
        note: &str,
    ) -> Result<()> {
        let hash = dn_hash(subject_dn_der);
        let der = public_key.to_der()?;
        self.entries.insert(
            hash.clone(),
            TrustEntry {
                subject_dn_hash: hash,
                public_key: general_purpose::STANDARD.encode(der),
                note: note.to_owned(),
            },
        );
        Ok(())
    }

    pub fn add_trusted_cert(&mut self, certificate: &Certificate, note: &str) -> Result<()> {
        self.add_trusted_key(certificate.subject_dn_der(), &certificate.spki, note)
    }

    pub fn remove(&mut self, subject_dn_der: &[u8]) -> bool {
        self.entries.remove(&dn_hash(subject_dn_der)).is_some()
    }

    pub fn is_trusted(&self, subject_dn_der: &[u8]) -> bool {
        self.entries.contains_key(&dn_hash(subject_dn_der))
    }

    /// Trusted public key for a DN, decoded from the stored entry.
    pub fn trusted_key(&self, subject_dn_der: &[u8]) -> Result<Option<PublicKeyInfo>> {
        let Some(entry) = self.entries.get(&dn_hash(subject_dn_der)) else {
            return Ok(None);
        };
        let der = general_purpose::STANDARD
            .decode(&entry.public_key)
            .map_err(|_| ErrorKind::BadData)?;
        let mut reader = crate::ber::BerReader::new(&der);
        Ok(Some(PublicKeyInfo::read(&mut reader)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Default on-disk location for a process-wide store.
pub fn default_trust_store_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(ErrorKind::DataNotFound)?;
    let dir = home.join(".sealkit");
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|_| ErrorKind::Signalled)?;
    }
    Ok(dir.join("trustdb"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkeys::rsa512_public_info;

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustdb");

        let mut store = TrustStore::new();
        store
            .add_trusted_key(b"fake-dn-der", &rsa512_public_info(), "test anchor")
            .unwrap();
        store.save_to_file(&path).unwrap();

        let loaded = TrustStore::load_from_file(&path).unwrap();
        assert!(loaded.is_trusted(b"fake-dn-der"));
        assert!(!loaded.is_trusted(b"other-dn"));
        let key = loaded.trusted_key(b"fake-dn-der").unwrap().unwrap();
        assert_eq!(key, rsa512_public_info());
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::load_from_file(dir.path().join("nonexistent")).unwrap();
        assert!(store.is_empty());
    }
}
