//! Key-transport recipient info.  Two versions exist on the wire: the CMS
//! form (version 0) identifies the recipient by IssuerAndSerialNumber, the
//! extended form (version 2) by a 64-bit key ID.  The reader records which
//! one arrived so a round-trip can mirror it.

use super::{FormatType, CTAG_KT_SKI, KEYTRANS_EX_VERSION, KEYTRANS_VERSION};
use crate::algid::{
    read_algorithm_identifier, sizeof_algorithm_identifier, write_algorithm_identifier,
};
use crate::ber::{
    ctag_primitive, sizeof_object, BerReader, BerWriter, BER_SEQUENCE,
};
use crate::cert::spki::KEYID_SIZE;
use crate::error::{err, ErrorKind, Result};
use crate::oid::AlgorithmId;

/// Who the wrapped key is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientId<'a> {
    /// CMS version 0: raw IssuerAndSerialNumber SEQUENCE span.
    IssuerAndSerial(&'a [u8]),
    /// Extended version 2: SHA-1/64 of the recipient SubjectPublicKeyInfo.
    KeyId([u8; KEYID_SIZE]),
}

#[derive(Debug, Clone)]
pub struct KeyTransInfo<'a> {
    pub format: FormatType,
    pub recipient: RecipientId<'a>,
    pub algorithm: AlgorithmId,
    pub encrypted_key: &'a [u8],
}

pub fn sizeof_key_trans_info(
    recipient: &RecipientId<'_>,
    algorithm: AlgorithmId,
    encrypted_key_len: usize,
) -> Result<usize> {
    let data_length = sizeof_algorithm_identifier(algorithm, None, false, 0)?
        + sizeof_object(encrypted_key_len);
    Ok(match recipient {
        RecipientId::KeyId(_) => sizeof_object(
            crate::ber::sizeof_short_integer(KEYTRANS_EX_VERSION)
                + sizeof_object(KEYID_SIZE)
                + data_length,
        ),
        RecipientId::IssuerAndSerial(span) => sizeof_object(
            crate::ber::sizeof_short_integer(KEYTRANS_VERSION) + span.len() + data_length,
        ),
    })
}

pub fn write_key_trans_info(
    writer: &mut BerWriter,
    recipient: &RecipientId<'_>,
    algorithm: AlgorithmId,
    encrypted_key: &[u8],
) -> Result<()> {
    let data_length = sizeof_algorithm_identifier(algorithm, None, false, 0)?
        + sizeof_object(encrypted_key.len());
    match recipient {
        RecipientId::KeyId(key_id) => {
            writer.write_sequence(
                crate::ber::sizeof_short_integer(KEYTRANS_EX_VERSION)
                    + sizeof_object(KEYID_SIZE)
                    + data_length,
            );
            writer.write_short_integer(KEYTRANS_EX_VERSION);
            writer.write_octet_string_tagged(ctag_primitive(CTAG_KT_SKI), key_id);
        }
        RecipientId::IssuerAndSerial(span) => {
            writer.write_sequence(
                crate::ber::sizeof_short_integer(KEYTRANS_VERSION) + span.len() + data_length,
            );
            writer.write_short_integer(KEYTRANS_VERSION);
            writer.write_raw(span);
        }
    }
    write_algorithm_identifier(writer, algorithm, None, false, 0)?;
    writer.write_octet_string(encrypted_key);
    Ok(())
}

pub fn read_key_trans_info<'a>(reader: &mut BerReader<'a>) -> Result<KeyTransInfo<'a>> {
    reader.read_constructed(BER_SEQUENCE)?.definite()?;
    let version = reader.read_short_integer()?;
    if !(KEYTRANS_VERSION..=KEYTRANS_EX_VERSION).contains(&version) {
        return err(ErrorKind::BadData);
    }

    let (format, recipient) = if version == KEYTRANS_EX_VERSION {
        let id = reader.read_octet_string_tagged(ctag_primitive(CTAG_KT_SKI), KEYID_SIZE)?;
        if id.len() != KEYID_SIZE {
            return err(ErrorKind::BadData);
        }
        let mut key_id = [0u8; KEYID_SIZE];
        key_id.copy_from_slice(id);
        (FormatType::Cryptlib, RecipientId::KeyId(key_id))
    } else {
        // Keep the IssuerAndSerialNumber as an opaque span; the caller
        // matches it against candidate certificates byte-for-byte.
        let span = reader.read_raw_sequence()?;
        (FormatType::Cms, RecipientId::IssuerAndSerial(span))
    };

    let alg = read_algorithm_identifier(reader)?;
    if alg.sub.is_some() {
        return err(ErrorKind::BadData);
    }
    let encrypted_key = reader.read_octet_string(1024)?;
    Ok(KeyTransInfo { format, recipient, algorithm: alg.algorithm, encrypted_key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_form_roundtrip() {
        let key_id = [1, 2, 3, 4, 5, 6, 7, 8];
        let wrapped = [0x55u8; 64];
        let recipient = RecipientId::KeyId(key_id);

        let mut w = BerWriter::new();
        write_key_trans_info(&mut w, &recipient, AlgorithmId::Rsa, &wrapped).unwrap();
        assert_eq!(
            w.len(),
            sizeof_key_trans_info(&recipient, AlgorithmId::Rsa, wrapped.len()).unwrap()
        );
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_key_trans_info(&mut r).unwrap();
        assert_eq!(info.format, FormatType::Cryptlib);
        assert_eq!(info.recipient, recipient);
        assert_eq!(info.algorithm, AlgorithmId::Rsa);
        assert_eq!(info.encrypted_key, wrapped);
    }

    #[test]
    fn cms_form_preserves_issuer_and_serial_span() {
        // A minimal IssuerAndSerialNumber: SEQ { SEQ {}, INTEGER 7 }.
        let ias = [0x30, 0x05, 0x30, 0x00, 0x02, 0x01, 0x07];
        let recipient = RecipientId::IssuerAndSerial(&ias);
        let wrapped = [9u8; 64];

        let mut w = BerWriter::new();
        write_key_trans_info(&mut w, &recipient, AlgorithmId::Rsa, &wrapped).unwrap();
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_key_trans_info(&mut r).unwrap();
        assert_eq!(info.format, FormatType::Cms);
        match info.recipient {
            RecipientId::IssuerAndSerial(span) => assert_eq!(span, ias),
            _ => panic!("expected issuerAndSerialNumber"),
        }
    }
}
