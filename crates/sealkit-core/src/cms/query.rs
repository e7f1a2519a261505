//! Low-level object query.  The de-enveloper uses this to classify the
//! next object in a partially-filled buffer and to confirm that enough of
//! it is present before running the full import.

use super::kek::{read_kek_info, KeyDerivationInfo};
use super::keyagree::read_key_agree_info;
use super::keytrans::read_key_trans_info;
use super::signature::read_signer_info;
use super::{
    FormatType, CTAG_RI_KEK, CTAG_RI_KEYAGREE, KEYTRANS_EX_VERSION, KEYTRANS_VERSION,
    SIGNATURE_EX_VERSION, SIGNATURE_VERSION,
};
use crate::algid::{AlgoParams, AlgorithmInfo};
use crate::ber::{ctag, BerReader, BER_SEQUENCE};
use crate::cert::spki::{PublicKeyInfo, KEYID_SIZE};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// KEK-wrapped (conventionally encrypted) session key.
    EncryptedKey,
    /// Key-transport (PKC-encrypted) session key.
    PkcEncryptedKey,
    KeyAgreement,
    Signature,
}

/// Summary of one wire object, extracted without side effects.  Spans are
/// offsets into the queried slice so the caller can hold on to them after
/// the reader goes away.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub kind: Option<ObjectKind>,
    pub format: FormatType,
    /// Total encoded size of the object, header included.
    pub size: usize,
    pub crypt_algorithm: Option<AlgorithmId>,
    pub crypt_mode: Mode,
    pub algo_params: AlgoParams,
    pub hash_algorithm: Option<AlgorithmId>,
    pub key_id: Option<[u8; KEYID_SIZE]>,
    /// Offset and length of the raw IssuerAndSerialNumber span.
    pub issuer_and_serial: Option<(usize, usize)>,
    pub derivation: Option<KeyDerivationInfo>,
    pub iv: Vec<u8>,
    /// Offset and length of the encrypted key or signature bytes.
    pub data: (usize, usize),
    /// Offset and length of the signed-attributes bytes, when present.
    pub signed_attributes: Option<(usize, usize)>,
    pub originator_key: Option<PublicKeyInfo>,
    pub session_algorithm: Option<AlgorithmInfo>,
}

fn span_of(outer: &[u8], inner: &[u8]) -> (usize, usize) {
    let offset = inner.as_ptr() as usize - outer.as_ptr() as usize;
    (offset, inner.len())
}

/// Peek at the object type without consuming input.
fn read_object_type(reader: &mut BerReader) -> Result<(ObjectKind, FormatType, usize)> {
    let start = reader.pos();
    let tag = reader.read_tag()?;
    let length = reader.read_length()?.definite()?;
    let header_len = reader.pos() - start;
    let mut format = FormatType::Cryptlib;
    let kind = if tag == BER_SEQUENCE {
        // A signature or a PKC-encrypted key; the version number that
        // follows tells them apart.
        let version = reader.read_short_integer()?;
        if version == KEYTRANS_VERSION || version == SIGNATURE_VERSION {
            format = FormatType::Cms;
        }
        match version {
            KEYTRANS_VERSION | KEYTRANS_EX_VERSION => ObjectKind::PkcEncryptedKey,
            SIGNATURE_VERSION | SIGNATURE_EX_VERSION => ObjectKind::Signature,
            _ => return err(ErrorKind::BadData),
        }
    } else if tag == ctag(CTAG_RI_KEYAGREE) {
        ObjectKind::KeyAgreement
    } else if tag == ctag(CTAG_RI_KEK) {
        ObjectKind::EncryptedKey
    } else {
        return err(ErrorKind::BadData);
    };
    reader.seek(start);
    Ok((kind, format, header_len + length))
}

/// Classify and summarise the object at the reader's position.  The reader
/// is left where it started; `Underflow` means the object is not entirely
/// present in the buffer yet.
pub fn query_object(data: &[u8]) -> Result<ObjectInfo> {
    let mut reader = BerReader::new(data);
    let (kind, format, size) = read_object_type(&mut reader)?;
    if size > data.len() {
        return err(ErrorKind::Underflow);
    }

    let mut info = ObjectInfo {
        kind: Some(kind),
        format,
        size,
        crypt_mode: Mode::None,
        ..Default::default()
    };
    match kind {
        ObjectKind::EncryptedKey => {
            let kek = read_kek_info(&mut reader)?;
            info.crypt_algorithm = Some(kek.algorithm.algorithm);
            info.crypt_mode = kek.algorithm.mode;
            info.algo_params = kek.algorithm.params;
            info.derivation = kek.derivation;
            info.iv = kek.iv;
            info.data = span_of(data, kek.encrypted_key);
        }
        ObjectKind::PkcEncryptedKey => {
            let kt = read_key_trans_info(&mut reader)?;
            info.format = kt.format;
            info.crypt_algorithm = Some(kt.algorithm);
            info.crypt_mode = Mode::Pkc;
            match kt.recipient {
                super::keytrans::RecipientId::KeyId(id) => info.key_id = Some(id),
                super::keytrans::RecipientId::IssuerAndSerial(span) => {
                    info.issuer_and_serial = Some(span_of(data, span))
                }
            }
            info.data = span_of(data, kt.encrypted_key);
        }
        ObjectKind::KeyAgreement => {
            let ka = read_key_agree_info(&mut reader)?;
            info.crypt_algorithm = Some(ka.originator.algorithm());
            info.crypt_mode = Mode::Pkc;
            info.key_id = Some(ka.originator.key_id64()?);
            info.session_algorithm = Some(ka.session_algorithm);
            info.originator_key = Some(ka.originator);
        }
        ObjectKind::Signature => {
            let si = read_signer_info(&mut reader)?;
            info.format = si.format;
            info.hash_algorithm = Some(si.hash_algorithm);
            info.crypt_algorithm = Some(si.signature_algorithm);
            match si.signer {
                super::signature::SignerId::KeyId(id) => info.key_id = Some(id),
                super::signature::SignerId::IssuerAndSerial(span) => {
                    info.issuer_and_serial = Some(span_of(data, span))
                }
            }
            if let Some(attrs) = si.signed_attributes {
                info.signed_attributes = Some(span_of(data, attrs));
            }
            info.data = span_of(data, si.signature);
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::BerWriter;
    use crate::cms::keytrans::{write_key_trans_info, RecipientId};
    use crate::cms::signature::{write_signer_info, SignerId};

    #[test]
    fn classifies_key_trans_and_extracts_key_span() {
        let mut w = BerWriter::new();
        write_key_trans_info(
            &mut w,
            &RecipientId::KeyId([1; 8]),
            AlgorithmId::Rsa,
            &[0x77; 64],
        )
        .unwrap();
        let bytes = w.into_bytes();
        let info = query_object(&bytes).unwrap();
        assert_eq!(info.kind, Some(ObjectKind::PkcEncryptedKey));
        assert_eq!(info.format, FormatType::Cryptlib);
        assert_eq!(info.size, bytes.len());
        let (off, len) = info.data;
        assert_eq!(&bytes[off..off + len], &[0x77; 64]);
    }

    #[test]
    fn underflow_when_object_truncated() {
        let mut w = BerWriter::new();
        write_signer_info(
            &mut w,
            &SignerId::KeyId([2; 8]),
            AlgorithmId::Sha1,
            AlgorithmId::Rsa,
            None,
            &[0x11; 64],
        )
        .unwrap();
        let bytes = w.into_bytes();
        let truncated = &bytes[..bytes.len() - 10];
        assert_eq!(
            query_object(truncated).unwrap_err().kind(),
            ErrorKind::Underflow
        );
    }

    #[test]
    fn classifies_signature_with_format() {
        let mut w = BerWriter::new();
        write_signer_info(
            &mut w,
            &SignerId::KeyId([2; 8]),
            AlgorithmId::Sha1,
            AlgorithmId::Rsa,
            None,
            &[0x11; 64],
        )
        .unwrap();
        let bytes = w.into_bytes();
        let info = query_object(&bytes).unwrap();
        assert_eq!(info.kind, Some(ObjectKind::Signature));
        assert_eq!(info.format, FormatType::Cryptlib);
        assert_eq!(info.hash_algorithm, Some(AlgorithmId::Sha1));
        assert_eq!(info.key_id, Some([2; 8]));
    }
}
