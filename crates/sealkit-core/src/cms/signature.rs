//! Signature records.  Three shapes share one codec: the CMS signer-info
//! (version 1, IssuerAndSerialNumber), the extended signer-info (version 3,
//! key ID) and the raw X.509 form used on certificates.

use super::{FormatType, CTAG_SI_SKI, SIGNATURE_EX_VERSION, SIGNATURE_VERSION};
use crate::algid::{
    read_algorithm_identifier, sizeof_algorithm_identifier, write_algorithm_identifier,
};
use crate::ber::{
    ctag, ctag_primitive, sizeof_object, sizeof_short_integer, BerReader, BerWriter,
    BER_SEQUENCE,
};
use crate::cert::spki::KEYID_SIZE;
use crate::error::{err, ErrorKind, Result};
use crate::oid::AlgorithmId;

/// Hash value with its algorithm, the `DigestInfo` composite.  The SHA-0
/// flag survives a round-trip through the sub-algorithm slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDigest {
    pub algorithm: AlgorithmId,
    pub is_sha0: bool,
    pub value: Vec<u8>,
}

pub const MAX_HASH_SIZE: usize = 32;

impl MessageDigest {
    pub fn sizeof(&self) -> Result<usize> {
        Ok(sizeof_object(
            sizeof_algorithm_identifier(self.algorithm, None, self.is_sha0, 0)?
                + sizeof_object(self.value.len()),
        ))
    }

    pub fn write(&self, writer: &mut BerWriter) -> Result<()> {
        writer.write_sequence(
            sizeof_algorithm_identifier(self.algorithm, None, self.is_sha0, 0)?
                + sizeof_object(self.value.len()),
        );
        write_algorithm_identifier(writer, self.algorithm, None, self.is_sha0, 0)?;
        writer.write_octet_string(&self.value);
        Ok(())
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        let mut writer = BerWriter::new();
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn read(reader: &mut BerReader) -> Result<Self> {
        reader.read_constructed(BER_SEQUENCE)?.definite()?;
        let alg = read_algorithm_identifier(reader)?;
        if alg.sub.is_some() {
            return err(ErrorKind::BadData);
        }
        let value = reader.read_octet_string(MAX_HASH_SIZE)?.to_vec();
        Ok(MessageDigest { algorithm: alg.algorithm, is_sha0: alg.is_sha0, value })
    }
}

/// Who signed: the signer-identification half of a signer-info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerId<'a> {
    /// CMS version 1: raw IssuerAndSerialNumber span.
    IssuerAndSerial(&'a [u8]),
    /// Extended version 3: 64-bit key ID.
    KeyId([u8; KEYID_SIZE]),
}

/// A decoded CMS or extended signer-info.
#[derive(Debug, Clone)]
pub struct SignerInfo<'a> {
    pub format: FormatType,
    pub signer: SignerId<'a>,
    pub hash_algorithm: AlgorithmId,
    pub signature_algorithm: AlgorithmId,
    /// Raw DER of the signed-attributes SET, `[0]` tag replaced by SET for
    /// hashing, exactly as signed.  `None` when no attributes are present.
    pub signed_attributes: Option<&'a [u8]>,
    pub signature: &'a [u8],
}

/// Write a CMS (version 1) or extended (version 3) signer-info.
/// `signed_attributes` is the content of the attribute SET; it is emitted
/// under the implicit `[0]` tag.
pub fn write_signer_info(
    writer: &mut BerWriter,
    signer: &SignerId<'_>,
    hash_algorithm: AlgorithmId,
    signature_algorithm: AlgorithmId,
    signed_attributes: Option<&[u8]>,
    signature: &[u8],
) -> Result<()> {
    let hash_id_size = sizeof_algorithm_identifier(hash_algorithm, None, false, 0)?;
    let sig_id_size = sizeof_algorithm_identifier(signature_algorithm, None, false, 0)?;
    let attrs_size = signed_attributes.map_or(0, |a| sizeof_object(a.len()));
    let content = match signer {
        SignerId::KeyId(_) => {
            sizeof_short_integer(SIGNATURE_EX_VERSION) + sizeof_object(KEYID_SIZE)
        }
        SignerId::IssuerAndSerial(span) => {
            sizeof_short_integer(SIGNATURE_VERSION) + span.len()
        }
    } + hash_id_size
        + attrs_size
        + sig_id_size
        + sizeof_object(signature.len());

    writer.write_sequence(content);
    match signer {
        SignerId::KeyId(key_id) => {
            writer.write_short_integer(SIGNATURE_EX_VERSION);
            writer.write_octet_string_tagged(ctag_primitive(CTAG_SI_SKI), key_id);
        }
        SignerId::IssuerAndSerial(span) => {
            writer.write_short_integer(SIGNATURE_VERSION);
            writer.write_raw(span);
        }
    }
    write_algorithm_identifier(writer, hash_algorithm, None, false, 0)?;
    if let Some(attrs) = signed_attributes {
        writer.write_ctag(0, attrs.len());
        writer.write_raw(attrs);
    }
    write_algorithm_identifier(writer, signature_algorithm, None, false, 0)?;
    writer.write_octet_string(signature);
    Ok(())
}

pub fn sizeof_signer_info(
    signer: &SignerId<'_>,
    hash_algorithm: AlgorithmId,
    signature_algorithm: AlgorithmId,
    signed_attributes_len: Option<usize>,
    signature_len: usize,
) -> Result<usize> {
    let mut sink = BerWriter::null();
    let attrs = signed_attributes_len.map(|len| vec![0u8; len]);
    write_signer_info(
        &mut sink,
        signer,
        hash_algorithm,
        signature_algorithm,
        attrs.as_deref(),
        &vec![0u8; signature_len],
    )?;
    Ok(sink.len())
}

pub fn read_signer_info<'a>(reader: &mut BerReader<'a>) -> Result<SignerInfo<'a>> {
    reader.read_constructed(BER_SEQUENCE)?.definite()?;
    let version = reader.read_short_integer()?;
    let (format, signer) = match version {
        SIGNATURE_VERSION => {
            let span = reader.read_raw_sequence()?;
            (FormatType::Cms, SignerId::IssuerAndSerial(span))
        }
        SIGNATURE_EX_VERSION => {
            let id =
                reader.read_octet_string_tagged(ctag_primitive(CTAG_SI_SKI), KEYID_SIZE)?;
            if id.len() != KEYID_SIZE {
                return err(ErrorKind::BadData);
            }
            let mut key_id = [0u8; KEYID_SIZE];
            key_id.copy_from_slice(id);
            (FormatType::Cryptlib, SignerId::KeyId(key_id))
        }
        _ => return err(ErrorKind::BadData),
    };

    let hash_alg = read_algorithm_identifier(reader)?;
    let mut signed_attributes = None;
    if !reader.is_empty() && reader.peek_byte()? == ctag(0) {
        reader.read_byte()?;
        let len = reader.read_length()?.definite()?;
        signed_attributes = Some(reader.take(len)?);
    }
    let sig_alg = read_algorithm_identifier(reader)?;
    let signature = reader.read_octet_string(1024)?;
    Ok(SignerInfo {
        format,
        signer,
        hash_algorithm: hash_alg.algorithm,
        signature_algorithm: sig_alg.algorithm,
        signed_attributes,
        signature,
    })
}

/// Raw X.509 signature: hash+signature AlgorithmIdentifier and a BIT
/// STRING.  Appended to a TBS to form a signed object.
pub fn write_x509_signature(
    writer: &mut BerWriter,
    signature_algorithm: AlgorithmId,
    hash_algorithm: AlgorithmId,
    signature: &[u8],
) -> Result<()> {
    write_algorithm_identifier(writer, signature_algorithm, Some(hash_algorithm), false, 0)?;
    writer.write_bit_string(signature);
    Ok(())
}

pub fn sizeof_x509_signature(
    signature_algorithm: AlgorithmId,
    hash_algorithm: AlgorithmId,
    signature_len: usize,
) -> Result<usize> {
    Ok(
        sizeof_algorithm_identifier(signature_algorithm, Some(hash_algorithm), false, 0)?
            + sizeof_object(signature_len + 1),
    )
}

pub struct X509Signature<'a> {
    pub signature_algorithm: AlgorithmId,
    pub hash_algorithm: AlgorithmId,
    pub signature: &'a [u8],
}

pub fn read_x509_signature<'a>(reader: &mut BerReader<'a>) -> Result<X509Signature<'a>> {
    let alg = read_algorithm_identifier(reader)?;
    let hash_algorithm = alg.sub.ok_or(ErrorKind::BadData)?;
    let signature = reader.read_bit_string(1024)?;
    Ok(X509Signature {
        signature_algorithm: alg.algorithm,
        hash_algorithm,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_digest_roundtrip_with_sha0_flag() {
        let md = MessageDigest {
            algorithm: AlgorithmId::Sha1,
            is_sha0: true,
            value: vec![0xAB; 20],
        };
        let der = md.to_der().unwrap();
        assert_eq!(der.len(), md.sizeof().unwrap());
        let mut r = BerReader::new(&der);
        assert_eq!(MessageDigest::read(&mut r).unwrap(), md);
    }

    #[test]
    fn extended_signer_info_roundtrip() {
        let signer = SignerId::KeyId([8, 7, 6, 5, 4, 3, 2, 1]);
        let sig = vec![0x5Cu8; 64];
        let mut w = BerWriter::new();
        write_signer_info(&mut w, &signer, AlgorithmId::Sha1, AlgorithmId::Rsa, None, &sig)
            .unwrap();
        assert_eq!(
            w.len(),
            sizeof_signer_info(&signer, AlgorithmId::Sha1, AlgorithmId::Rsa, None, sig.len())
                .unwrap()
        );
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_signer_info(&mut r).unwrap();
        assert_eq!(info.format, FormatType::Cryptlib);
        assert_eq!(info.signer, signer);
        assert_eq!(info.hash_algorithm, AlgorithmId::Sha1);
        assert_eq!(info.signature_algorithm, AlgorithmId::Rsa);
        assert!(info.signed_attributes.is_none());
        assert_eq!(info.signature, sig);
    }

    #[test]
    fn cms_signer_info_keeps_attribute_bytes() {
        let ias = [0x30, 0x05, 0x30, 0x00, 0x02, 0x01, 0x09];
        let attrs = [0x31, 0x02, 0x30, 0x00]; // placeholder SET content
        let signer = SignerId::IssuerAndSerial(&ias);
        let mut w = BerWriter::new();
        write_signer_info(
            &mut w,
            &signer,
            AlgorithmId::Sha1,
            AlgorithmId::Rsa,
            Some(&attrs),
            &[0u8; 64],
        )
        .unwrap();
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_signer_info(&mut r).unwrap();
        assert_eq!(info.format, FormatType::Cms);
        assert_eq!(info.signed_attributes, Some(&attrs[..]));
    }

    #[test]
    fn x509_signature_roundtrip() {
        let sig = vec![0x11u8; 64];
        let mut w = BerWriter::new();
        write_x509_signature(&mut w, AlgorithmId::Rsa, AlgorithmId::Sha1, &sig).unwrap();
        assert_eq!(
            w.len(),
            sizeof_x509_signature(AlgorithmId::Rsa, AlgorithmId::Sha1, sig.len()).unwrap()
        );
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let parsed = read_x509_signature(&mut r).unwrap();
        assert_eq!(parsed.signature_algorithm, AlgorithmId::Rsa);
        assert_eq!(parsed.hash_algorithm, AlgorithmId::Sha1);
        assert_eq!(parsed.signature, sig);
    }
}
