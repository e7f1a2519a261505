//! Password-derived (KEK) recipient info.

use super::{CTAG_CK_DERIVATIONINFO, CTAG_CK_IV, KEK_VERSION};
use crate::algid::{
    read_algorithm_info, sizeof_algorithm_info, write_algorithm_info, AlgorithmInfo, MAX_IV_SIZE,
};
use crate::ber::{
    sizeof_object, sizeof_short_integer, BerReader, BerWriter, BER_SEQUENCE,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, OID_KEYWRAP, OID_PBKDF2};

/// Largest salt we accept, and the iteration-count sanity bound.
pub const MAX_SALT_SIZE: usize = 64;
pub const MAX_KEY_SETUP_ITERATIONS: u32 = 20_000;

/// PBKDF2 parameters for deriving the KEK from a password.  The wire form
/// carries the PBKDF2 OID; the PRF is HMAC-SHA1 and is not encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivationInfo {
    pub hash_algorithm: AlgorithmId,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

/// Decoded KEKRecipientInfo.  The encrypted key bytes are borrowed from the
/// input so they can go straight to the unwrap primitive.
#[derive(Debug, Clone)]
pub struct KekInfo<'a> {
    pub algorithm: AlgorithmInfo,
    pub derivation: Option<KeyDerivationInfo>,
    pub iv: Vec<u8>,
    pub encrypted_key: &'a [u8],
}

fn sizeof_derivation_content(derivation: &KeyDerivationInfo) -> Result<usize> {
    Ok(OID_PBKDF2.encoded_len()
        + sizeof_object(derivation.salt.len())
        + sizeof_short_integer(i64::from(derivation.iterations)))
}

fn sizeof_derivation(derivation: &KeyDerivationInfo) -> Result<usize> {
    Ok(sizeof_object(sizeof_derivation_content(derivation)?))
}

fn sizeof_parameter_block(
    algorithm: &AlgorithmInfo,
    derivation: Option<&KeyDerivationInfo>,
    iv: Option<&[u8]>,
) -> Result<usize> {
    let mut inner = sizeof_algorithm_info(algorithm);
    if let Some(derivation) = derivation {
        inner += sizeof_derivation(derivation)?;
    }
    if let Some(iv) = iv {
        inner += sizeof_object(iv.len());
    }
    Ok(OID_KEYWRAP.encoded_len() + sizeof_object(inner))
}

pub fn sizeof_kek_info(
    algorithm: &AlgorithmInfo,
    derivation: Option<&KeyDerivationInfo>,
    iv: Option<&[u8]>,
    encrypted_key_len: usize,
) -> Result<usize> {
    let parameter_size = sizeof_parameter_block(algorithm, derivation, iv)?;
    Ok(sizeof_object(
        sizeof_short_integer(KEK_VERSION)
            + sizeof_object(parameter_size)
            + sizeof_object(encrypted_key_len),
    ))
}

pub fn write_kek_info(
    writer: &mut BerWriter,
    algorithm: &AlgorithmInfo,
    derivation: Option<&KeyDerivationInfo>,
    iv: Option<&[u8]>,
    encrypted_key: &[u8],
) -> Result<()> {
    let parameter_size = sizeof_parameter_block(algorithm, derivation, iv)?;
    writer.write_ctag(
        super::CTAG_RI_KEK,
        sizeof_short_integer(KEK_VERSION)
            + sizeof_object(parameter_size)
            + sizeof_object(encrypted_key.len()),
    );
    writer.write_short_integer(KEK_VERSION);
    writer.write_sequence(parameter_size);
    writer.write_oid(&OID_KEYWRAP);
    let mut inner = sizeof_algorithm_info(algorithm);
    if let Some(derivation) = derivation {
        inner += sizeof_derivation(derivation)?;
    }
    if let Some(iv) = iv {
        inner += sizeof_object(iv.len());
    }
    writer.write_sequence(inner);
    write_algorithm_info(writer, algorithm);
    if let Some(derivation) = derivation {
        writer.write_ctag(CTAG_CK_DERIVATIONINFO, sizeof_derivation_content(derivation)?);
        writer.write_oid(&OID_PBKDF2);
        writer.write_octet_string(&derivation.salt);
        writer.write_short_integer(i64::from(derivation.iterations));
    }
    if let Some(iv) = iv {
        writer.write_octet_string_tagged(crate::ber::ctag_primitive(CTAG_CK_IV), iv);
    }
    writer.write_octet_string(encrypted_key);
    Ok(())
}

pub fn read_kek_info<'a>(reader: &mut BerReader<'a>) -> Result<KekInfo<'a>> {
    if reader
        .check_ctag(super::CTAG_RI_KEK)?
        .is_none()
    {
        return err(ErrorKind::BadData);
    }
    if reader.read_short_integer()? != KEK_VERSION {
        return err(ErrorKind::BadData);
    }
    reader.read_constructed(BER_SEQUENCE)?.definite()?;
    reader.read_expected_oid(&OID_KEYWRAP)?;
    reader.read_constructed(BER_SEQUENCE)?.definite()?;
    let algorithm = read_algorithm_info(reader)?;

    // Key derivation info: absent means a raw (non-derived) KEK.
    let mut derivation = None;
    if reader.check_ctag(CTAG_CK_DERIVATIONINFO)?.is_some() {
        reader.read_expected_oid(&OID_PBKDF2)?;
        let salt = reader.read_octet_string(MAX_SALT_SIZE)?.to_vec();
        let iterations = reader.read_short_integer()?;
        if iterations < 1 || iterations > i64::from(MAX_KEY_SETUP_ITERATIONS) {
            return err(ErrorKind::BadData);
        }
        derivation = Some(KeyDerivationInfo {
            hash_algorithm: AlgorithmId::Sha1,
            salt,
            iterations: iterations as u32,
        });
    }

    let mut iv = Vec::new();
    if let Some(len) = reader.check_ctag_primitive(CTAG_CK_IV)? {
        if len > MAX_IV_SIZE {
            return err(ErrorKind::BadData);
        }
        iv = reader.take(len)?.to_vec();
    }

    let encrypted_key = reader.read_octet_string(1024)?;
    Ok(KekInfo { algorithm, derivation, iv, encrypted_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::Mode;

    #[test]
    fn kek_info_roundtrip() {
        let algorithm = AlgorithmInfo {
            algorithm: AlgorithmId::TripleDes,
            mode: Mode::Cbc,
            params: Default::default(),
        };
        let derivation = KeyDerivationInfo {
            hash_algorithm: AlgorithmId::Sha1,
            salt: vec![9u8; 16],
            iterations: 500,
        };
        let iv = [3u8; 8];
        let wrapped = [0xAAu8; 24];

        let mut w = BerWriter::new();
        write_kek_info(&mut w, &algorithm, Some(&derivation), Some(&iv), &wrapped).unwrap();
        assert_eq!(
            w.len(),
            sizeof_kek_info(&algorithm, Some(&derivation), Some(&iv), wrapped.len()).unwrap()
        );

        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_kek_info(&mut r).unwrap();
        assert_eq!(info.algorithm, algorithm);
        assert_eq!(info.derivation.as_ref(), Some(&derivation));
        assert_eq!(info.iv, iv);
        assert_eq!(info.encrypted_key, wrapped);
    }

    #[test]
    fn iteration_count_bound_enforced() {
        let algorithm = AlgorithmInfo {
            algorithm: AlgorithmId::TripleDes,
            mode: Mode::Cbc,
            params: Default::default(),
        };
        let derivation = KeyDerivationInfo {
            hash_algorithm: AlgorithmId::Sha1,
            salt: vec![1u8; 8],
            iterations: MAX_KEY_SETUP_ITERATIONS + 1,
        };
        let mut w = BerWriter::new();
        write_kek_info(&mut w, &algorithm, Some(&derivation), None, &[0u8; 24]).unwrap();
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        assert_eq!(read_kek_info(&mut r).unwrap_err().kind(), ErrorKind::BadData);
    }
}
