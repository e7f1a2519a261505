//! CMS content-info and encrypted-content-info headers.

use crate::algid::{
    read_crypt_algorithm_identifier, sizeof_crypt_algorithm_identifier,
    write_crypt_algorithm_identifier, CipherParams,
};
use crate::ber::{
    ctag, ctag_primitive, sizeof_object, BerReader, BerWriter, Length, BER_CONSTRUCTED,
    BER_OBJECT_IDENTIFIER, BER_OCTETSTRING, BER_SEQUENCE,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, Mode, Oid, OID_CMS_DATA};

/// What a content-info header resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Data,
    SignedData,
    EnvelopedData,
    EncryptedData,
    DigestedData,
}

/// Dispatch entry for header reading: the content OID, the selection it
/// maps to and an optional acceptable version range.
pub struct OidSelection {
    pub oid: &'static Oid,
    pub versions: Option<(i64, i64)>,
    pub selection: ContentKind,
}

/// Payload length recovered from a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSize {
    /// Content supplied externally (detached signature).
    Absent,
    Definite(usize),
    /// Indefinite encoding; ends at the matching EOC.
    Unknown,
}

/// Read `SEQUENCE { contentType, [0] EXPLICIT content? }` and dispatch on
/// the OID table.  `data` content is wrapped in an OCTET STRING, everything
/// else in a SEQUENCE.
pub fn read_cms_header(
    reader: &mut BerReader,
    selection: &[OidSelection],
) -> Result<(ContentKind, PayloadSize)> {
    let total_length = reader.read_constructed(BER_SEQUENCE)?;
    let oid = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
    let entry = selection
        .iter()
        .find(|e| e.oid.as_image() == oid)
        .ok_or(ErrorKind::BadData)?;
    let is_data = oid == OID_CMS_DATA.as_image();

    // Some Microsoft software wraps a lone OID in the indefinite form.
    if total_length == Length::Indefinite && reader.check_eoc() {
        return Ok((entry.selection, PayloadSize::Absent));
    }

    // Detached content: the header ends right after the OID.
    if let Length::Definite(total) = total_length {
        if total == oid.len() {
            return Ok((entry.selection, PayloadSize::Absent));
        }
    }

    // The [0] EXPLICIT content wrapper.
    if reader.read_tag()? != ctag(0) {
        return err(ErrorKind::BadData);
    }
    reader.read_length()?;
    let tag = reader.read_tag()?;
    if is_data {
        if tag != BER_OCTETSTRING && tag != (BER_OCTETSTRING | BER_CONSTRUCTED) {
            return err(ErrorKind::BadData);
        }
    } else if tag != BER_SEQUENCE {
        return err(ErrorKind::BadData);
    }
    let size = match reader.read_length()? {
        Length::Definite(len) => PayloadSize::Definite(len),
        Length::Indefinite => PayloadSize::Unknown,
    };

    // For non-data content the version number follows; check it when the
    // table entry declares a range.
    if !is_data {
        if let Some((min, max)) = entry.versions {
            let version = reader.read_short_integer()?;
            if version < min || version > max {
                return err(ErrorKind::BadData);
            }
        }
    }
    Ok((entry.selection, size))
}

/// Write a content-info header.  `data_size` of `None` selects the
/// indefinite form; zero writes a content-free header.
pub fn write_cms_header(writer: &mut BerWriter, oid: &Oid, data_size: Option<usize>) {
    let is_data = oid.as_image() == OID_CMS_DATA.as_image();
    match data_size {
        Some(size) => {
            writer.write_header(
                BER_SEQUENCE,
                oid.encoded_len()
                    + if size != 0 { sizeof_object(sizeof_object(size)) } else { 0 },
            );
            writer.write_oid(oid);
            if size == 0 {
                return;
            }
            writer.write_ctag(0, sizeof_object(size));
            writer.write_header(
                if is_data { BER_OCTETSTRING } else { BER_SEQUENCE },
                size,
            );
        }
        None => {
            writer.write_sequence_indef();
            writer.write_oid(oid);
            writer.write_ctag_indef(0);
            if is_data {
                writer.write_octet_string_indef();
            } else {
                writer.write_sequence_indef();
            }
        }
    }
}

/// Read an encryptedContentInfo header: content OID, cipher parameters and
/// the start of the encrypted payload.
pub fn read_cms_encr_header(
    reader: &mut BerReader,
    selection: &[OidSelection],
) -> Result<(ContentKind, PayloadSize, CipherParams)> {
    reader.read_constructed(BER_SEQUENCE)?;
    let oid = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
    let entry = selection
        .iter()
        .find(|e| e.oid.as_image() == oid)
        .ok_or(ErrorKind::BadData)?;
    let params = read_crypt_algorithm_identifier(reader)?;

    // The content may be implicitly tagged primitive or constructed
    // depending on who wrote it.
    let tag = reader.read_tag()?;
    if tag != ctag(0) && tag != ctag_primitive(0) {
        return err(ErrorKind::BadData);
    }
    let size = match reader.read_length()? {
        Length::Definite(len) => PayloadSize::Definite(len),
        Length::Indefinite => PayloadSize::Unknown,
    };
    Ok((entry.selection, size, params))
}

/// Encoded size of the encrypted-content header itself (payload excluded).
pub fn sizeof_cms_encr_header(
    content_oid: &Oid,
    data_size: Option<usize>,
    algorithm: AlgorithmId,
    mode: Mode,
    iv_len: usize,
) -> Result<usize> {
    let crypt_info_size = sizeof_crypt_algorithm_identifier(algorithm, mode, iv_len)?;
    match data_size {
        Some(size) => Ok(sizeof_object(
            content_oid.encoded_len() + crypt_info_size + sizeof_object(size),
        ) - size),
        // SEQ header + OID + AlgorithmIdentifier + [0] header.
        None => Ok(2 + content_oid.encoded_len() + crypt_info_size + 2),
    }
}

pub fn write_cms_encr_header(
    writer: &mut BerWriter,
    content_oid: &Oid,
    data_size: Option<usize>,
    algorithm: AlgorithmId,
    mode: Mode,
    iv: &[u8],
) -> Result<()> {
    let crypt_info_size = sizeof_crypt_algorithm_identifier(algorithm, mode, iv.len())?;
    match data_size {
        Some(size) => {
            writer.write_header(
                BER_SEQUENCE,
                content_oid.encoded_len() + crypt_info_size + sizeof_object(size),
            );
            writer.write_oid(content_oid);
            write_crypt_algorithm_identifier(writer, algorithm, mode, iv)?;
            writer.write_ctag_primitive(0, size);
        }
        None => {
            writer.write_sequence_indef();
            writer.write_oid(content_oid);
            write_crypt_algorithm_identifier(writer, algorithm, mode, iv)?;
            writer.write_ctag_indef(0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::{OID_CMS_ENCRYPTEDDATA, OID_CMS_ENVELOPEDDATA};

    static SELECTION: &[OidSelection] = &[
        OidSelection { oid: &OID_CMS_DATA, versions: None, selection: ContentKind::Data },
        OidSelection {
            oid: &OID_CMS_ENVELOPEDDATA,
            versions: Some((0, 2)),
            selection: ContentKind::EnvelopedData,
        },
    ];

    #[test]
    fn data_header_definite_roundtrip() {
        let mut w = BerWriter::new();
        write_cms_header(&mut w, &OID_CMS_DATA, Some(42));
        let mut r = BerReader::new(w.as_bytes());
        let (kind, size) = read_cms_header(&mut r, SELECTION).unwrap();
        assert_eq!(kind, ContentKind::Data);
        assert_eq!(size, PayloadSize::Definite(42));
    }

    #[test]
    fn data_header_indefinite_roundtrip() {
        let mut w = BerWriter::new();
        write_cms_header(&mut w, &OID_CMS_DATA, None);
        let mut r = BerReader::new(w.as_bytes());
        let (kind, size) = read_cms_header(&mut r, SELECTION).unwrap();
        assert_eq!(kind, ContentKind::Data);
        assert_eq!(size, PayloadSize::Unknown);
    }

    #[test]
    fn detached_content_header() {
        let mut w = BerWriter::new();
        write_cms_header(&mut w, &OID_CMS_DATA, Some(0));
        let mut r = BerReader::new(w.as_bytes());
        let (_, size) = read_cms_header(&mut r, SELECTION).unwrap();
        assert_eq!(size, PayloadSize::Absent);
    }

    #[test]
    fn unknown_content_oid_rejected() {
        let mut w = BerWriter::new();
        write_cms_header(&mut w, &OID_CMS_ENCRYPTEDDATA, Some(8));
        let mut r = BerReader::new(w.as_bytes());
        assert_eq!(
            read_cms_header(&mut r, SELECTION).unwrap_err().kind(),
            ErrorKind::BadData
        );
    }

    #[test]
    fn encrypted_content_header_roundtrip() {
        let iv = [7u8; 8];
        let mut w = BerWriter::new();
        write_cms_encr_header(
            &mut w,
            &OID_CMS_DATA,
            Some(100),
            AlgorithmId::TripleDes,
            Mode::Cbc,
            &iv,
        )
        .unwrap();
        let expected = sizeof_cms_encr_header(
            &OID_CMS_DATA,
            Some(100),
            AlgorithmId::TripleDes,
            Mode::Cbc,
            iv.len(),
        )
        .unwrap();
        assert_eq!(w.len(), expected);
        let mut r = BerReader::new(w.as_bytes());
        let (kind, size, params) = read_cms_encr_header(&mut r, SELECTION).unwrap();
        assert_eq!(kind, ContentKind::Data);
        assert_eq!(size, PayloadSize::Definite(100));
        assert_eq!(params.algorithm, AlgorithmId::TripleDes);
        assert_eq!(params.mode, Mode::Cbc);
        assert_eq!(params.iv, iv);
    }
}
