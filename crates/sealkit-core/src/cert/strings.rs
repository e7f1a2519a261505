//! DN string handling.  ASN.1 string tags are routinely misused on the
//! wire, so values are classified into the narrowest type that losslessly
//! represents them, and compared through a canonical form rather than
//! through their declared encoding.

use crate::ber::{
    BER_STRING_BMP, BER_STRING_IA5, BER_STRING_PRINTABLE, BER_STRING_T61, BER_STRING_UTF8,
};
use crate::error::{err, ErrorKind, Result};

/// String types preserved from / emitted to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringType {
    Printable,
    Ia5,
    T61,
    Bmp,
    /// Input-only: re-classified into one of the above on read.
    Utf8,
}

impl StringType {
    pub fn tag(self) -> u8 {
        match self {
            StringType::Printable => BER_STRING_PRINTABLE,
            StringType::Ia5 => BER_STRING_IA5,
            StringType::T61 => BER_STRING_T61,
            StringType::Bmp => BER_STRING_BMP,
            StringType::Utf8 => BER_STRING_UTF8,
        }
    }
}

const P: u8 = 1; // PrintableString
const I: u8 = 2; // IA5String/VisibleString/ISO646String
const PI: u8 = P | I;

/// Which 7-bit characters are valid in PrintableString and IA5String.
/// IA5String technically allows the control range as well, but nothing
/// useful lives there so it's treated as ISO646String.
#[rustfmt::skip]
static CHAR_FLAGS: [u8; 128] = [
    /* 00-0F */ 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    /* 10-1F */ 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    /* SP-/  */ PI, I, I, I, I, I, I, PI, PI, PI, I, PI, PI, PI, PI, PI,
    /* 0-?   */ PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, I, I, PI, I, PI,
    /* @-O   */ I, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI,
    /* P-_   */ PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, I, I, I, I, I,
    /* `-o   */ I, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI,
    /* p-DEL */ PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, PI, I, I, I, I, 0,
];

fn is_printable(ch: u32) -> bool {
    ch < 128 && CHAR_FLAGS[ch as usize] & P != 0
}

fn is_ia5(ch: u32) -> bool {
    ch < 128 && CHAR_FLAGS[ch as usize] & I != 0
}

/// An 8859-1 character representable in T61String: the low seven bits must
/// name an ISO646 character.
fn is_t61(ch: u32) -> bool {
    ch < 256 && CHAR_FLAGS[(ch & 0x7F) as usize] & I != 0
}

/// Narrowest type that losslessly holds the string.
pub fn classify(value: &str) -> Result<StringType> {
    let mut not_printable = false;
    let mut not_ia5 = false;
    if value.is_empty() {
        return err(ErrorKind::BadData);
    }
    for ch in value.chars() {
        let code = ch as u32;
        if code >= 128 {
            not_printable = true;
            not_ia5 = true;
            if !is_t61(code) {
                if code > 0xFFFF {
                    // Outside the BMP, unrepresentable in any supported type.
                    return err(ErrorKind::BadData);
                }
                return Ok(StringType::Bmp);
            }
        } else {
            if !is_printable(code) {
                not_printable = true;
            }
            if !is_ia5(code) {
                return err(ErrorKind::BadData);
            }
        }
    }
    Ok(if not_ia5 {
        StringType::T61
    } else if not_printable {
        StringType::Ia5
    } else {
        StringType::Printable
    })
}

/// Heuristic for Unicode stuffed into an 8-bit string type: if any byte is
/// not a plausible T61 character the value is treated as a BMPString.
fn looks_like_bmp(bytes: &[u8]) -> bool {
    if bytes.len() % 2 != 0 || bytes.is_empty() {
        return false;
    }
    if bytes.len() >= 2 && (bytes[..2] == [0xFE, 0xFF] || bytes[..2] == [0xFF, 0xFE]) {
        return true;
    }
    bytes.iter().any(|&b| CHAR_FLAGS[(b & 0x7F) as usize] & I == 0)
}

fn decode_bmp(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return err(ErrorKind::BadData);
    }
    let little_endian = bytes.len() >= 2 && bytes[..2] == [0xFF, 0xFE];
    let mut out = String::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let code = if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        };
        if code == 0xFEFF {
            continue; // BOM
        }
        out.push(char::from_u32(u32::from(code)).ok_or(ErrorKind::BadData)?);
    }
    if out.is_empty() {
        return err(ErrorKind::BadData);
    }
    Ok(out)
}

fn decode_latin1(bytes: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if !is_t61(u32::from(b)) {
            return err(ErrorKind::BadData);
        }
        out.push(char::from(b));
    }
    Ok(out)
}

/// Decode a wire string value and infer its actual (as opposed to declared)
/// type.  Returns the decoded text and the narrowest type; the caller keeps
/// the raw bytes alongside for byte-exact re-emission.
pub fn decode_wire_string(tag: u8, bytes: &[u8]) -> Result<(String, StringType)> {
    if bytes.is_empty() {
        return err(ErrorKind::BadData);
    }
    let value = match tag {
        BER_STRING_BMP => decode_bmp(bytes)?,
        BER_STRING_UTF8 => {
            std::str::from_utf8(bytes).map_err(|_| ErrorKind::BadData)?.to_owned()
        }
        BER_STRING_PRINTABLE | BER_STRING_IA5 | BER_STRING_T61 => {
            // Broken implementations stuff Unicode into T61Strings.
            if looks_like_bmp(bytes) {
                decode_bmp(bytes)?
            } else {
                decode_latin1(bytes)?
            }
        }
        _ => return err(ErrorKind::BadData),
    };
    let inferred = classify(&value)?;
    Ok((value, inferred))
}

/// Encode a value as the given string type.
pub fn encode_string(value: &str, string_type: StringType) -> Result<Vec<u8>> {
    match string_type {
        StringType::Bmp => {
            let mut out = Vec::with_capacity(value.len() * 2);
            for ch in value.chars() {
                let code = ch as u32;
                if code > 0xFFFF {
                    return err(ErrorKind::BadData);
                }
                out.extend_from_slice(&(code as u16).to_be_bytes());
            }
            Ok(out)
        }
        StringType::Utf8 => Ok(value.as_bytes().to_vec()),
        _ => {
            let mut out = Vec::with_capacity(value.len());
            for ch in value.chars() {
                let code = ch as u32;
                if code > 0xFF {
                    return err(ErrorKind::BadData);
                }
                out.push(code as u8);
            }
            Ok(out)
        }
    }
}

/// Canonical form for equality: BOMs stripped, runs of space and
/// non-breaking space collapsed (leading and trailing removed entirely),
/// ASCII case folded.  Non-ASCII characters compare by code point.
pub fn canonical(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;
    for ch in value.chars() {
        if ch == '\u{FEFF}' {
            continue;
        }
        if ch == ' ' || ch == '\u{A0}' {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// Canonical equality; symmetric and transitive by construction.
pub fn strings_equal(a: &str, b: &str) -> bool {
    canonical(a) == canonical(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowest_type_inference() {
        assert_eq!(classify("Dave Smith").unwrap(), StringType::Printable);
        assert_eq!(classify("dave@wetas.co.nz").unwrap(), StringType::Ia5);
        assert_eq!(classify("Mot\u{F6}rhead").unwrap(), StringType::T61);
        assert_eq!(classify("\u{0160}kofja Loka").unwrap(), StringType::Bmp);
    }

    #[test]
    fn whitespace_and_case_canonicalisation() {
        assert!(strings_equal("CN=Dave Smith ", "cn=dave  smith"));
        assert!(strings_equal("a\u{A0}\u{A0}b", "A b"));
        assert!(!strings_equal("Dave Smith", "Dave Smyth"));
    }

    #[test]
    fn bom_does_not_affect_equality() {
        assert!(strings_equal("\u{FEFF}Dave", "dave"));
    }

    #[test]
    fn unicode_in_t61_is_sniffed_out() {
        // "Ab" as UTF-16BE stuffed into a T61String.
        let bytes = [0x00, 0x41, 0x00, 0x62];
        let (value, ty) = decode_wire_string(BER_STRING_T61, &bytes).unwrap();
        assert_eq!(value, "Ab");
        assert_eq!(ty, StringType::Printable);
    }

    #[test]
    fn utf8_reclassified_on_read() {
        let (value, ty) = decode_wire_string(BER_STRING_UTF8, "plain".as_bytes()).unwrap();
        assert_eq!(value, "plain");
        assert_eq!(ty, StringType::Printable);
    }

    #[test]
    fn bmp_roundtrip() {
        let s = "\u{0160}KL";
        let encoded = encode_string(s, StringType::Bmp).unwrap();
        let (decoded, ty) = decode_wire_string(BER_STRING_BMP, &encoded).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(ty, StringType::Bmp);
    }
}
