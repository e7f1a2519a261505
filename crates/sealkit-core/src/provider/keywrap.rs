//! Plaintext layout of a wrapped session key: algorithm information, the
//! key octets, a check value, and random padding to a fixed granularity so
//! the wrapped blob leaks nothing about the key length.

use sha1::{Digest, Sha1};

use crate::algid::{read_algorithm_info, sizeof_algorithm_info, write_algorithm_info, AlgorithmInfo};
use crate::ber::{sizeof_object, BerReader, BerWriter};
use crate::error::{err, ErrorKind, Result};
use crate::secure::{constant_time_eq, secure_random, SecretBuffer};

const KEY_CHECKVALUE_SIZE: usize = 4;
const KEYINFO_PADSIZE: usize = 64;

fn key_check_value(algorithm: &AlgorithmInfo, key: &[u8]) -> [u8; KEY_CHECKVALUE_SIZE] {
    let mut header = BerWriter::new();
    write_algorithm_info(&mut header, algorithm);
    let mut hasher = Sha1::new();
    hasher.update(header.as_bytes());
    hasher.update(key);
    let digest = hasher.finalize();
    let mut check = [0u8; KEY_CHECKVALUE_SIZE];
    check.copy_from_slice(&digest[..KEY_CHECKVALUE_SIZE]);
    check
}

/// Serialize key material for wrapping.  The output is padded with random
/// octets to the next `KEYINFO_PADSIZE` boundary.
pub fn encode_key_material(algorithm: &AlgorithmInfo, key: &[u8]) -> Result<SecretBuffer> {
    let check = key_check_value(algorithm, key);
    let bare = sizeof_object(
        sizeof_algorithm_info(algorithm)
            + sizeof_object(key.len())
            + sizeof_object(KEY_CHECKVALUE_SIZE),
    );

    // Pad with a minimum-length octet string up to the boundary; the
    // padding does not have to be cryptographically strong, but a constant
    // string would be inadvisable.
    let mut pad_len = 0usize;
    if bare % KEYINFO_PADSIZE != 0 {
        let padded = (bare + 3 + KEYINFO_PADSIZE - 1) & !(KEYINFO_PADSIZE - 1);
        pad_len = padded - bare - 2;
    }

    let content = sizeof_algorithm_info(algorithm)
        + sizeof_object(key.len())
        + sizeof_object(KEY_CHECKVALUE_SIZE)
        + if pad_len > 0 { sizeof_object(pad_len) } else { 0 };
    let mut writer = BerWriter::new();
    writer.write_sequence(content);
    write_algorithm_info(&mut writer, algorithm);
    writer.write_octet_string(key);
    writer.write_octet_string(&check);
    if pad_len > 0 {
        let mut padding = vec![0u8; pad_len];
        secure_random(&mut padding)?;
        writer.write_octet_string(&padding);
    }
    let bytes = writer.into_bytes();
    let out = SecretBuffer::from_slice(&bytes);
    Ok(out)
}

/// Parse and check unwrapped key material.  A check-value mismatch means
/// the wrong unwrapping key was used.
pub fn decode_key_material(data: &[u8]) -> Result<(AlgorithmInfo, SecretBuffer)> {
    let mut reader = BerReader::new(data);
    reader.read_sequence()?.definite()?;
    let algorithm = read_algorithm_info(&mut reader)?;
    let key = reader.read_octet_string(crate::provider::MAX_KEY_SIZE)?;
    if key.len() < 5 {
        return err(ErrorKind::BadData);
    }
    let check = reader.read_octet_string(KEY_CHECKVALUE_SIZE)?;
    if !constant_time_eq(check, &key_check_value(&algorithm, key)) {
        return err(ErrorKind::WrongKey);
    }
    // Padding may follow; nothing to do with it.
    Ok((algorithm, SecretBuffer::from_slice(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::{AlgorithmId, Mode};

    fn algo() -> AlgorithmInfo {
        AlgorithmInfo {
            algorithm: AlgorithmId::TripleDes,
            mode: Mode::Cbc,
            params: Default::default(),
        }
    }

    #[test]
    fn material_roundtrip() {
        let key = [0x42u8; 24];
        let encoded = encode_key_material(&algo(), &key).unwrap();
        assert_eq!(encoded.len() % KEYINFO_PADSIZE, 0);
        let (algorithm, recovered) = decode_key_material(encoded.as_slice()).unwrap();
        assert_eq!(algorithm, algo());
        assert_eq!(recovered.as_slice(), key);
    }

    #[test]
    fn corrupted_check_value_is_wrong_key() {
        let key = [0x42u8; 24];
        let encoded = encode_key_material(&algo(), &key).unwrap();
        let mut bytes = encoded.as_slice().to_vec();
        // Flip a key byte; the check value no longer matches.
        bytes[12] ^= 0x80;
        assert_eq!(
            decode_key_material(&bytes).unwrap_err().kind(),
            ErrorKind::WrongKey
        );
    }
}
