//! AlgorithmIdentifier codecs: the X.509 form, the PKCS #7 cipher form with
//! its haphazard per-algorithm parameters, and the compact enumerated form
//! used inside key-wrap records.

use crate::ber::{
    sizeof_null, sizeof_object, sizeof_short_integer, BerReader, BerWriter, BER_INTEGER,
    BER_OBJECT_IDENTIFIER, BER_SEQUENCE,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{algorithm_to_oid, oid_to_algorithm, AlgorithmId, Mode, SubAlgorithm};

/// Largest IV any supported algorithm carries.
pub const MAX_IV_SIZE: usize = 16;

/// Magic INTEGER standing for a 128-bit key in RC2 parameters.
const RC2_KEYSIZE_MAGIC: i64 = 58;

/// Decoded `AlgorithmIdentifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmIdentifier {
    pub algorithm: AlgorithmId,
    pub sub: Option<AlgorithmId>,
    /// Historical SHA-0 rather than SHA-1.
    pub is_sha0: bool,
    /// Unconsumed parameter bytes remaining in the stream for the caller.
    pub extra_len: usize,
}

fn resolve_oid(
    algorithm: AlgorithmId,
    sub: Option<AlgorithmId>,
    is_sha0: bool,
) -> Result<&'static crate::oid::Oid> {
    if is_sha0 && (algorithm != AlgorithmId::Sha1 || sub.is_some()) {
        return err(ErrorKind::NoAlgorithm);
    }
    let sub = if is_sha0 {
        SubAlgorithm::Sha0
    } else {
        match sub {
            Some(hash) => SubAlgorithm::Hash(hash),
            None => SubAlgorithm::None,
        }
    };
    algorithm_to_oid(algorithm, sub).ok_or_else(|| ErrorKind::NoAlgorithm.into())
}

fn sizeof_algorithm_identifier_data(
    algorithm: AlgorithmId,
    sub: Option<AlgorithmId>,
    is_sha0: bool,
    extra_len: usize,
) -> Result<usize> {
    let oid = resolve_oid(algorithm, sub, is_sha0)?;
    let mut size = extra_len;
    if extra_len == 0 {
        size += sizeof_null();
    }
    Ok(size + oid.encoded_len())
}

pub fn sizeof_algorithm_identifier(
    algorithm: AlgorithmId,
    sub: Option<AlgorithmId>,
    is_sha0: bool,
    extra_len: usize,
) -> Result<usize> {
    Ok(sizeof_object(sizeof_algorithm_identifier_data(
        algorithm, sub, is_sha0, extra_len,
    )?))
}

/// Write the identifier; when `extra_len` is nonzero the caller emits that
/// many parameter bytes immediately afterwards, otherwise a NULL is written.
pub fn write_algorithm_identifier(
    writer: &mut BerWriter,
    algorithm: AlgorithmId,
    sub: Option<AlgorithmId>,
    is_sha0: bool,
    extra_len: usize,
) -> Result<()> {
    let oid = resolve_oid(algorithm, sub, is_sha0)?;
    writer.write_sequence(sizeof_algorithm_identifier_data(
        algorithm, sub, is_sha0, extra_len,
    )?);
    writer.write_oid(oid);
    if extra_len == 0 {
        writer.write_null();
    }
    Ok(())
}

pub fn read_algorithm_identifier(reader: &mut BerReader) -> Result<AlgorithmIdentifier> {
    let seq_len = reader.read_sequence()?.definite()?;
    let oid = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
    let (algorithm, sub) = oid_to_algorithm(oid).ok_or(ErrorKind::NoAlgorithm)?;
    let mut result = AlgorithmIdentifier {
        algorithm,
        sub: None,
        is_sha0: false,
        extra_len: 0,
    };
    match sub {
        SubAlgorithm::None => {}
        SubAlgorithm::Hash(hash) => result.sub = Some(hash),
        SubAlgorithm::Sha0 => result.is_sha0 = true,
        // Cipher OIDs belong to the PKCS #7 reader below.
        SubAlgorithm::Mode(_) => return err(ErrorKind::BadData),
    }
    let remaining = seq_len
        .checked_sub(oid.len())
        .ok_or(ErrorKind::BadData)?;
    if remaining == sizeof_null() {
        reader.read_null()?;
    } else {
        result.extra_len = remaining;
    }
    Ok(result)
}

/// Cipher parameters recovered from a PKCS #7
/// EncryptionAlgorithmIdentifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParams {
    pub algorithm: AlgorithmId,
    pub mode: Mode,
    pub iv: Vec<u8>,
}

/// Decode tolerating the registered legacy encodings; see the table in the
/// module source for which algorithm/mode combinations are representable.
pub fn read_crypt_algorithm_identifier(reader: &mut BerReader) -> Result<CipherParams> {
    reader.read_sequence()?.definite()?;
    let oid = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
    let (algorithm, sub) = oid_to_algorithm(oid).ok_or(ErrorKind::NoAlgorithm)?;
    let mode = match sub {
        SubAlgorithm::Mode(mode) => mode,
        _ => return err(ErrorKind::NoAlgorithm),
    };
    let mut params = CipherParams { algorithm, mode, iv: Vec::new() };

    match algorithm {
        AlgorithmId::Cast => {
            reader.read_sequence()?.definite()?;
            params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
            if reader.read_short_integer()? != 128 {
                return err(ErrorKind::NoAlgorithm);
            }
        }
        AlgorithmId::Des | AlgorithmId::TripleDes => match mode {
            Mode::Ecb => reader.read_null()?,
            Mode::Cbc => params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec(),
            _ => {
                reader.read_sequence()?.definite()?;
                params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
                if reader.read_short_integer()? != 64 {
                    return err(ErrorKind::NoMode);
                }
            }
        },
        AlgorithmId::Idea => match mode {
            Mode::Ecb => reader.read_null()?,
            _ => {
                reader.read_sequence()?.definite()?;
                if mode == Mode::Cfb {
                    // Skip the CFB r, k and j parameters.
                    for n in 0..3u8 {
                        if let Some(len) = reader.check_ctag_primitive(n)? {
                            let mut value = 0i64;
                            for _ in 0..len {
                                value = (value << 8) | i64::from(reader.read_byte()?);
                            }
                            if value != 64 {
                                return err(ErrorKind::NoMode);
                            }
                        }
                    }
                    if let Some(len) = reader.check_ctag_primitive(3)? {
                        if len > MAX_IV_SIZE {
                            return err(ErrorKind::BadData);
                        }
                        params.iv = reader.take(len)?.to_vec();
                        return Ok(params);
                    }
                    return err(ErrorKind::BadData);
                }
                if mode == Mode::Ofb && reader.peek_tag()? == BER_INTEGER {
                    // Skip the OFB j parameter.
                    if reader.read_short_integer()? != 64 {
                        return err(ErrorKind::NoMode);
                    }
                }
                params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
            }
        },
        AlgorithmId::Rc2 => {
            reader.read_sequence()?.definite()?;
            if reader.read_short_integer()? != RC2_KEYSIZE_MAGIC {
                return err(ErrorKind::NoAlgorithm);
            }
            if mode == Mode::Cbc {
                params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
            }
        }
        AlgorithmId::Rc4 => reader.read_null()?,
        AlgorithmId::Rc5 => {
            reader.read_sequence()?.definite()?;
            if reader.read_short_integer()? != 16 {
                return err(ErrorKind::NoAlgorithm);
            }
            if reader.read_short_integer()? != 12 {
                return err(ErrorKind::NoAlgorithm);
            }
            if reader.read_short_integer()? != 64 {
                return err(ErrorKind::NoAlgorithm);
            }
            params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
        }
        AlgorithmId::Skipjack => {
            reader.read_sequence()?.definite()?;
            params.iv = reader.read_octet_string(MAX_IV_SIZE)?.to_vec();
        }
        _ => return err(ErrorKind::NoAlgorithm),
    }
    Ok(params)
}

/// Emit the canonical encoding for the given cipher.  Combinations outside
/// the PKCS #7 OID collection fail with `NoAlgorithm`.
pub fn write_crypt_algorithm_identifier(
    writer: &mut BerWriter,
    algorithm: AlgorithmId,
    mode: Mode,
    iv: &[u8],
) -> Result<()> {
    let oid = algorithm_to_oid(algorithm, SubAlgorithm::Mode(mode))
        .ok_or(ErrorKind::NoAlgorithm)?;
    let oid_size = oid.encoded_len();
    let sizeof_iv = sizeof_object(iv.len());

    match algorithm {
        AlgorithmId::Cast => {
            let param_size = sizeof_iv + sizeof_short_integer(128);
            writer.write_sequence(oid_size + sizeof_object(param_size));
            writer.write_oid(oid);
            writer.write_sequence(param_size);
            writer.write_octet_string(iv);
            writer.write_short_integer(128);
        }
        AlgorithmId::Des | AlgorithmId::TripleDes => {
            let param_size = match mode {
                Mode::Ecb => sizeof_null(),
                Mode::Cbc => sizeof_iv,
                _ => sizeof_object(sizeof_iv + sizeof_short_integer(64)),
            };
            writer.write_sequence(oid_size + param_size);
            writer.write_oid(oid);
            match mode {
                Mode::Ecb => writer.write_null(),
                Mode::Cbc => writer.write_octet_string(iv),
                _ => {
                    writer.write_sequence(sizeof_iv + sizeof_short_integer(64));
                    writer.write_octet_string(iv);
                    writer.write_short_integer(64);
                }
            }
        }
        AlgorithmId::Idea => {
            let param_size = match mode {
                Mode::Ecb => sizeof_null(),
                _ => sizeof_object(sizeof_iv),
            };
            writer.write_sequence(oid_size + param_size);
            writer.write_oid(oid);
            if mode == Mode::Ecb {
                writer.write_null();
            } else {
                writer.write_sequence(sizeof_iv);
                if mode == Mode::Cfb {
                    writer.write_octet_string_tagged(crate::ber::ctag_primitive(3), iv);
                } else {
                    writer.write_octet_string(iv);
                }
            }
        }
        AlgorithmId::Rc2 => {
            let param_size = sizeof_short_integer(RC2_KEYSIZE_MAGIC)
                + if mode == Mode::Cbc { sizeof_iv } else { 0 };
            writer.write_sequence(oid_size + sizeof_object(param_size));
            writer.write_oid(oid);
            writer.write_sequence(param_size);
            writer.write_short_integer(RC2_KEYSIZE_MAGIC);
            if mode == Mode::Cbc {
                writer.write_octet_string(iv);
            }
        }
        AlgorithmId::Rc4 => {
            writer.write_sequence(oid_size + sizeof_null());
            writer.write_oid(oid);
            writer.write_null();
        }
        AlgorithmId::Rc5 => {
            let param_size = sizeof_short_integer(16)
                + sizeof_short_integer(12)
                + sizeof_short_integer(64)
                + sizeof_iv;
            writer.write_sequence(oid_size + sizeof_object(param_size));
            writer.write_oid(oid);
            writer.write_sequence(param_size);
            writer.write_short_integer(16);
            writer.write_short_integer(12);
            writer.write_short_integer(64);
            writer.write_octet_string(iv);
        }
        AlgorithmId::Skipjack => {
            writer.write_sequence(oid_size + sizeof_object(sizeof_iv));
            writer.write_oid(oid);
            writer.write_sequence(sizeof_iv);
            writer.write_octet_string(iv);
        }
        _ => return err(ErrorKind::NoAlgorithm),
    }
    Ok(())
}

pub fn sizeof_crypt_algorithm_identifier(
    algorithm: AlgorithmId,
    mode: Mode,
    iv_len: usize,
) -> Result<usize> {
    // Size via the length-predicting null sink; the parameter layouts are
    // too irregular to be worth a second size table.
    let mut sink = BerWriter::null();
    let iv = vec![0u8; iv_len];
    write_crypt_algorithm_identifier(&mut sink, algorithm, mode, &iv)?;
    Ok(sink.len())
}

/// Algorithm-specific tunables carried by the compact form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgoParams {
    #[default]
    None,
    Rc5 {
        rounds: u32,
    },
    Safer {
        use_sk_schedule: bool,
        rounds: u32,
    },
}

/// The compact enumerated `SEQUENCE { algo, mode, params? }` used inside
/// KEK records and key-agreement session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmInfo {
    pub algorithm: AlgorithmId,
    pub mode: Mode,
    pub params: AlgoParams,
}

fn sizeof_algo_params(params: AlgoParams) -> usize {
    match params {
        AlgoParams::None => 0,
        AlgoParams::Rc5 { rounds } => {
            sizeof_object(sizeof_short_integer(i64::from(rounds)))
        }
        AlgoParams::Safer { rounds, .. } => sizeof_object(
            crate::ber::sizeof_boolean() + sizeof_short_integer(i64::from(rounds)),
        ),
    }
}

pub fn sizeof_algorithm_info(info: &AlgorithmInfo) -> usize {
    sizeof_object(
        crate::ber::sizeof_enumerated(info.algorithm.wire_value())
            + crate::ber::sizeof_enumerated(info.mode.wire_value())
            + sizeof_algo_params(info.params),
    )
}

pub fn write_algorithm_info(writer: &mut BerWriter, info: &AlgorithmInfo) {
    writer.write_sequence(
        crate::ber::sizeof_enumerated(info.algorithm.wire_value())
            + crate::ber::sizeof_enumerated(info.mode.wire_value())
            + sizeof_algo_params(info.params),
    );
    writer.write_enumerated(info.algorithm.wire_value());
    writer.write_enumerated(info.mode.wire_value());
    match info.params {
        AlgoParams::None => {}
        AlgoParams::Rc5 { rounds } => {
            writer.write_sequence(sizeof_short_integer(i64::from(rounds)));
            writer.write_short_integer(i64::from(rounds));
        }
        AlgoParams::Safer { use_sk_schedule, rounds } => {
            writer.write_sequence(
                crate::ber::sizeof_boolean() + sizeof_short_integer(i64::from(rounds)),
            );
            writer.write_boolean(use_sk_schedule);
            writer.write_short_integer(i64::from(rounds));
        }
    }
}

pub fn read_algorithm_info(reader: &mut BerReader) -> Result<AlgorithmInfo> {
    let seq_start = reader.pos();
    let seq_len = reader.read_sequence()?.definite()?;
    let header_len = reader.pos() - seq_start;
    let algorithm = AlgorithmId::from_wire_value(reader.read_enumerated()?)
        .ok_or(ErrorKind::NoAlgorithm)?;
    let mode = Mode::from_wire_value(reader.read_enumerated()?).ok_or(ErrorKind::NoMode)?;
    let mut info = AlgorithmInfo { algorithm, mode, params: AlgoParams::None };
    let consumed = reader.pos() - seq_start - header_len;
    if consumed < seq_len {
        reader.read_sequence()?.definite()?;
        match algorithm {
            AlgorithmId::Rc5 => {
                let rounds = u32::try_from(reader.read_short_integer()?)
                    .map_err(|_| ErrorKind::BadData)?;
                info.params = AlgoParams::Rc5 { rounds };
            }
            AlgorithmId::Safer => {
                let use_sk_schedule = reader.read_boolean()?;
                let rounds = u32::try_from(reader.read_short_integer()?)
                    .map_err(|_| ErrorKind::BadData)?;
                info.params = AlgoParams::Safer { use_sk_schedule, rounds };
            }
            _ => return err(ErrorKind::NoAlgorithm),
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_identifier_roundtrip() {
        let mut w = BerWriter::new();
        write_algorithm_identifier(&mut w, AlgorithmId::Sha1, None, false, 0).unwrap();
        assert_eq!(
            w.len(),
            sizeof_algorithm_identifier(AlgorithmId::Sha1, None, false, 0).unwrap()
        );
        let mut r = BerReader::new(w.as_bytes());
        let alg = read_algorithm_identifier(&mut r).unwrap();
        assert_eq!(alg.algorithm, AlgorithmId::Sha1);
        assert!(!alg.is_sha0);
        assert_eq!(alg.extra_len, 0);
    }

    #[test]
    fn sha0_parameter_rides_the_sub_slot() {
        let mut w = BerWriter::new();
        write_algorithm_identifier(&mut w, AlgorithmId::Sha1, None, true, 0).unwrap();
        let mut r = BerReader::new(w.as_bytes());
        let alg = read_algorithm_identifier(&mut r).unwrap();
        assert_eq!(alg.algorithm, AlgorithmId::Sha1);
        assert!(alg.is_sha0);
    }

    #[test]
    fn hmac_fails_encoding_cleanly() {
        let mut w = BerWriter::new();
        let status = write_algorithm_identifier(&mut w, AlgorithmId::HmacSha1, None, false, 0);
        assert_eq!(status.unwrap_err().kind(), ErrorKind::NoAlgorithm);
    }

    #[test]
    fn des_cbc_cipher_roundtrip() {
        let iv = [0x11u8; 8];
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::TripleDes, Mode::Cbc, &iv).unwrap();
        assert_eq!(
            w.len(),
            sizeof_crypt_algorithm_identifier(AlgorithmId::TripleDes, Mode::Cbc, iv.len()).unwrap()
        );
        let mut r = BerReader::new(w.as_bytes());
        let params = read_crypt_algorithm_identifier(&mut r).unwrap();
        assert_eq!(params.algorithm, AlgorithmId::TripleDes);
        assert_eq!(params.mode, Mode::Cbc);
        assert_eq!(params.iv, iv);
    }

    #[test]
    fn des_cfb_carries_sixty_four() {
        let iv = [0x22u8; 8];
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::Des, Mode::Cfb, &iv).unwrap();
        let mut r = BerReader::new(w.as_bytes());
        let params = read_crypt_algorithm_identifier(&mut r).unwrap();
        assert_eq!(params.mode, Mode::Cfb);
        assert_eq!(params.iv, iv);
    }

    #[test]
    fn idea_cfb_uses_context_tagged_iv() {
        let iv = [0x33u8; 8];
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::Idea, Mode::Cfb, &iv).unwrap();
        let mut r = BerReader::new(w.as_bytes());
        let params = read_crypt_algorithm_identifier(&mut r).unwrap();
        assert_eq!(params.algorithm, AlgorithmId::Idea);
        assert_eq!(params.iv, iv);
    }

    #[test]
    fn maximum_length_iv_roundtrips() {
        let iv = [0x5Au8; MAX_IV_SIZE];
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::Skipjack, Mode::Cbc, &iv).unwrap();
        let mut r = BerReader::new(w.as_bytes());
        let params = read_crypt_algorithm_identifier(&mut r).unwrap();
        assert_eq!(params.iv, iv);

        // Anything longer is rejected outright on read.
        let oversize = [0u8; MAX_IV_SIZE + 1];
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::Skipjack, Mode::Cbc, &oversize)
            .unwrap();
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        assert!(read_crypt_algorithm_identifier(&mut r).is_err());
    }

    #[test]
    fn rc2_keysize_magic_enforced() {
        // Canonical RC2/CBC parameters with a wrong key-size magic.
        let mut w = BerWriter::new();
        write_crypt_algorithm_identifier(&mut w, AlgorithmId::Rc2, Mode::Cbc, &[0u8; 8]).unwrap();
        let mut bytes = w.into_bytes();
        // The magic rides immediately after the inner SEQUENCE header.
        let pos = bytes.iter().position(|&b| b == RC2_KEYSIZE_MAGIC as u8).unwrap();
        bytes[pos] = 42;
        let mut r = BerReader::new(&bytes);
        assert_eq!(
            read_crypt_algorithm_identifier(&mut r).unwrap_err().kind(),
            ErrorKind::NoAlgorithm
        );
    }

    #[test]
    fn algorithm_info_with_rc5_params() {
        let info = AlgorithmInfo {
            algorithm: AlgorithmId::Rc5,
            mode: Mode::Cbc,
            params: AlgoParams::Rc5 { rounds: 12 },
        };
        let mut w = BerWriter::new();
        write_algorithm_info(&mut w, &info);
        assert_eq!(w.len(), sizeof_algorithm_info(&info));
        let mut r = BerReader::new(w.as_bytes());
        assert_eq!(read_algorithm_info(&mut r).unwrap(), info);
    }
}
