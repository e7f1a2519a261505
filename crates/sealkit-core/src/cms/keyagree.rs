//! Key-agreement recipient info: the originator's public key plus the
//! session-key-encryption algorithm.  The de-envelope side materialises a
//! key-agreement context from the embedded SubjectPublicKeyInfo.

use super::{CTAG_RI_KEYAGREE, KEYAGREE_VERSION};
use crate::algid::{
    read_algorithm_info, sizeof_algorithm_info, write_algorithm_info, AlgorithmInfo,
};
use crate::ber::{sizeof_short_integer, BerReader, BerWriter};
use crate::cert::spki::PublicKeyInfo;
use crate::error::{err, ErrorKind, Result};

#[derive(Debug, Clone)]
pub struct KeyAgreeInfo {
    pub originator: PublicKeyInfo,
    pub session_algorithm: AlgorithmInfo,
}

pub fn sizeof_key_agree_info(
    originator: &PublicKeyInfo,
    session_algorithm: &AlgorithmInfo,
) -> Result<usize> {
    Ok(crate::ber::sizeof_object(
        sizeof_short_integer(KEYAGREE_VERSION)
            + originator.sizeof()?
            + sizeof_algorithm_info(session_algorithm),
    ))
}

pub fn write_key_agree_info(
    writer: &mut BerWriter,
    originator: &PublicKeyInfo,
    session_algorithm: &AlgorithmInfo,
) -> Result<()> {
    writer.write_ctag(
        CTAG_RI_KEYAGREE,
        sizeof_short_integer(KEYAGREE_VERSION)
            + originator.sizeof()?
            + sizeof_algorithm_info(session_algorithm),
    );
    writer.write_short_integer(KEYAGREE_VERSION);
    originator.write(writer)?;
    write_algorithm_info(writer, session_algorithm);
    Ok(())
}

pub fn read_key_agree_info(reader: &mut BerReader) -> Result<KeyAgreeInfo> {
    if reader.check_ctag(CTAG_RI_KEYAGREE)?.is_none() {
        return err(ErrorKind::BadData);
    }
    if reader.read_short_integer()? != KEYAGREE_VERSION {
        return err(ErrorKind::BadData);
    }
    let originator = PublicKeyInfo::read(reader)?;
    let session_algorithm = read_algorithm_info(reader)?;
    Ok(KeyAgreeInfo { originator, session_algorithm })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::spki::PublicKeyParts;
    use crate::oid::{AlgorithmId, Mode};

    #[test]
    fn key_agree_roundtrip() {
        let originator = PublicKeyInfo {
            parts: PublicKeyParts::Dh {
                p: vec![0xC7; 64],
                g: vec![0x02],
                y: vec![0x5A; 64],
            },
        };
        let session = AlgorithmInfo {
            algorithm: AlgorithmId::TripleDes,
            mode: Mode::Cbc,
            params: Default::default(),
        };
        let mut w = BerWriter::new();
        write_key_agree_info(&mut w, &originator, &session).unwrap();
        assert_eq!(w.len(), sizeof_key_agree_info(&originator, &session).unwrap());
        let bytes = w.into_bytes();
        let mut r = BerReader::new(&bytes);
        let info = read_key_agree_info(&mut r).unwrap();
        assert_eq!(info.originator, originator);
        assert_eq!(info.session_algorithm, session);
    }
}
