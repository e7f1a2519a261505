//! Object identifiers and the algorithm table.
//!
//! OIDs were designed to be handled in encoded form, so we store and compare
//! the full DER image (tag, length, content) rather than decoding arcs.
//! Some OIDs name a pure algorithm, others an aWithB combination (signature
//! OIDs carry the hash in the sub-slot, cipher OIDs carry the mode).  Where
//! several OIDs decode to the same triple, the first table entry is the
//! canonical one and the only one ever encoded.

use std::borrow::Cow;
use std::fmt;

/// Closed enumeration of algorithms representable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmId {
    // Public-key
    Rsa,
    Dsa,
    Dh,
    Elgamal,
    // Conventional
    Des,
    TripleDes,
    Idea,
    Cast,
    Rc2,
    Rc4,
    Rc5,
    Blowfish,
    Safer,
    Skipjack,
    // Hash
    Md2,
    Md4,
    Md5,
    Sha1,
    Ripemd160,
    Mdc2,
    // MAC
    HmacMd5,
    HmacSha1,
    HmacRipemd160,
}

impl AlgorithmId {
    pub fn is_pkc(self) -> bool {
        matches!(self, AlgorithmId::Rsa | AlgorithmId::Dsa | AlgorithmId::Dh | AlgorithmId::Elgamal)
    }

    pub fn is_hash(self) -> bool {
        matches!(
            self,
            AlgorithmId::Md2
                | AlgorithmId::Md4
                | AlgorithmId::Md5
                | AlgorithmId::Sha1
                | AlgorithmId::Ripemd160
                | AlgorithmId::Mdc2
        )
    }

    pub fn is_mac(self) -> bool {
        matches!(self, AlgorithmId::HmacMd5 | AlgorithmId::HmacSha1 | AlgorithmId::HmacRipemd160)
    }

    pub fn is_conventional(self) -> bool {
        !self.is_pkc() && !self.is_hash() && !self.is_mac()
    }

    /// Wire enumeration value used by the cryptlib-format AlgorithmInfo
    /// records (KEK and key-agreement session parameters).
    pub fn wire_value(self) -> u32 {
        match self {
            AlgorithmId::Des => 100,
            AlgorithmId::TripleDes => 101,
            AlgorithmId::Idea => 102,
            AlgorithmId::Cast => 103,
            AlgorithmId::Rc2 => 104,
            AlgorithmId::Rc4 => 105,
            AlgorithmId::Rc5 => 106,
            AlgorithmId::Blowfish => 107,
            AlgorithmId::Safer => 108,
            AlgorithmId::Skipjack => 109,
            AlgorithmId::Dh => 200,
            AlgorithmId::Rsa => 201,
            AlgorithmId::Dsa => 202,
            AlgorithmId::Elgamal => 203,
            AlgorithmId::Md2 => 300,
            AlgorithmId::Md4 => 301,
            AlgorithmId::Md5 => 302,
            AlgorithmId::Sha1 => 303,
            AlgorithmId::Ripemd160 => 304,
            AlgorithmId::Mdc2 => 305,
            AlgorithmId::HmacMd5 => 400,
            AlgorithmId::HmacSha1 => 401,
            AlgorithmId::HmacRipemd160 => 402,
        }
    }

    pub fn from_wire_value(value: u32) -> Option<Self> {
        Some(match value {
            100 => AlgorithmId::Des,
            101 => AlgorithmId::TripleDes,
            102 => AlgorithmId::Idea,
            103 => AlgorithmId::Cast,
            104 => AlgorithmId::Rc2,
            105 => AlgorithmId::Rc4,
            106 => AlgorithmId::Rc5,
            107 => AlgorithmId::Blowfish,
            108 => AlgorithmId::Safer,
            109 => AlgorithmId::Skipjack,
            200 => AlgorithmId::Dh,
            201 => AlgorithmId::Rsa,
            202 => AlgorithmId::Dsa,
            203 => AlgorithmId::Elgamal,
            300 => AlgorithmId::Md2,
            301 => AlgorithmId::Md4,
            302 => AlgorithmId::Md5,
            303 => AlgorithmId::Sha1,
            304 => AlgorithmId::Ripemd160,
            305 => AlgorithmId::Mdc2,
            400 => AlgorithmId::HmacMd5,
            401 => AlgorithmId::HmacSha1,
            402 => AlgorithmId::HmacRipemd160,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    None,
    Ecb,
    Cbc,
    Cfb,
    Ofb,
    Stream,
    Pkc,
}

impl Mode {
    pub fn needs_iv(self) -> bool {
        matches!(self, Mode::Cbc | Mode::Cfb | Mode::Ofb)
    }

    pub fn wire_value(self) -> u32 {
        match self {
            Mode::None => 0,
            Mode::Ecb => 1,
            Mode::Cbc => 2,
            Mode::Cfb => 3,
            Mode::Ofb => 4,
            Mode::Stream => 5,
            Mode::Pkc => 6,
        }
    }

    pub fn from_wire_value(value: u32) -> Option<Self> {
        Some(match value {
            0 => Mode::None,
            1 => Mode::Ecb,
            2 => Mode::Cbc,
            3 => Mode::Cfb,
            4 => Mode::Ofb,
            5 => Mode::Stream,
            6 => Mode::Pkc,
            _ => return None,
        })
    }
}

/// What rides in an OID's sub-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAlgorithm {
    None,
    /// aWithB signature combination: the hash half.
    Hash(AlgorithmId),
    /// Cipher OID: the mode half.
    Mode(Mode),
    /// Historical SHA-0, disambiguated from SHA-1 by a flag.
    Sha0,
}

/// An object identifier held as its DER byte image (tag + length + content).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid(Cow<'static, [u8]>);

impl Oid {
    pub const fn img(image: &'static [u8]) -> Self {
        Oid(Cow::Borrowed(image))
    }

    pub fn from_image(image: &[u8]) -> Self {
        Oid(Cow::Owned(image.to_vec()))
    }

    /// Full encoded image, tag and length included.
    pub fn as_image(&self) -> &[u8] {
        &self.0
    }

    /// Content octets without the tag and length.
    pub fn content(&self) -> &[u8] {
        &self.0[2..]
    }

    pub fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn arcs(&self) -> Vec<u64> {
        let body = self.content();
        let mut arcs = Vec::new();
        if let Some(&first) = body.first() {
            arcs.push(u64::from(first / 40));
            arcs.push(u64::from(first % 40));
        }
        let mut value = 0u64;
        for &byte in &body[1.min(body.len())..] {
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                arcs.push(value);
                value = 0;
            }
        }
        arcs
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in self.arcs() {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", arc)?;
            first = false;
        }
        Ok(())
    }
}

// Content types
pub static OID_CMS_DATA: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x07\x01");
pub static OID_CMS_SIGNEDDATA: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x07\x02");
pub static OID_CMS_ENVELOPEDDATA: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x07\x03");
pub static OID_CMS_DIGESTEDDATA: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x07\x05");
pub static OID_CMS_ENCRYPTEDDATA: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x07\x06");
pub static OID_NS_CERTSEQ: Oid =
    Oid::img(b"\x06\x09\x60\x86\x48\x01\x86\xF8\x42\x02\x05");

// CMS attributes
pub static OID_CMS_CONTENTTYPE: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x09\x03");
pub static OID_CMS_MESSAGEDIGEST: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x09\x04");
pub static OID_CMS_SIGNINGTIME: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x09\x05");
pub static OID_ESS_SECURITYLABEL: Oid =
    Oid::img(b"\x06\x0B\x2A\x86\x48\x86\xF7\x0D\x01\x09\x10\x02\x02");

// Key management
pub static OID_KEYWRAP: Oid =
    Oid::img(b"\x06\x09\x2B\x06\x01\x04\x01\x97\x55\x03\x02");
pub static OID_PBKDF2: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x05\x09");

struct AlgoOidEntry {
    algorithm: AlgorithmId,
    sub: SubAlgorithm,
    oid: Oid,
}

macro_rules! entry {
    ($algo:expr, $sub:expr, $oid:expr) => {
        AlgoOidEntry { algorithm: $algo, sub: $sub, oid: Oid::img($oid) }
    };
}

/// OID ⇔ algorithm map.  For a given triple the first entry is the one
/// encoded; later aliases decode only.
static ALGO_OID_MAP: &[AlgoOidEntry] = &[
    // RSA and <hash>WithRSA
    entry!(AlgorithmId::Rsa, SubAlgorithm::None,
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x01\x01"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Md2),
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x01\x02"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Md4),
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x01\x03"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Md5),
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x01\x04"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x01\x05"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x06\x2B\x24\x03\x03\x01\x01"),
    entry!(AlgorithmId::Rsa, SubAlgorithm::Hash(AlgorithmId::Ripemd160),
           b"\x06\x06\x2B\x24\x03\x03\x01\x02"),
    // DSA and dsaWith<hash>
    entry!(AlgorithmId::Dsa, SubAlgorithm::None,
           b"\x06\x07\x2A\x86\x48\xCE\x38\x04\x01"),
    entry!(AlgorithmId::Dsa, SubAlgorithm::None,
           b"\x06\x05\x2B\x0E\x03\x02\x0C"),
    entry!(AlgorithmId::Dsa, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x07\x2A\x86\x48\xCE\x38\x04\x03"),
    entry!(AlgorithmId::Dsa, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x05\x2B\x0E\x03\x02\x1B"),
    entry!(AlgorithmId::Dsa, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x09\x60\x86\x48\x01\x65\x02\x01\x01\x02"),
    // Elgamal and elgamalWith<hash>
    entry!(AlgorithmId::Elgamal, SubAlgorithm::None,
           b"\x06\x09\x2B\x06\x01\x04\x01\x97\x55\x03\x01"),
    entry!(AlgorithmId::Elgamal, SubAlgorithm::Hash(AlgorithmId::Sha1),
           b"\x06\x0A\x2B\x06\x01\x04\x01\x97\x55\x03\x01\x01"),
    entry!(AlgorithmId::Elgamal, SubAlgorithm::Hash(AlgorithmId::Ripemd160),
           b"\x06\x0A\x2B\x06\x01\x04\x01\x97\x55\x03\x01\x02"),
    // DH.  PKCS #3 first, it can represent values without the X9.42 extras.
    entry!(AlgorithmId::Dh, SubAlgorithm::None,
           b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x03\x01"),
    entry!(AlgorithmId::Dh, SubAlgorithm::None,
           b"\x06\x07\x2A\x86\x48\xCE\x3E\x02\x01"),
    // Hash algorithms
    entry!(AlgorithmId::Md2, SubAlgorithm::None,
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x02\x02"),
    entry!(AlgorithmId::Md4, SubAlgorithm::None,
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x02\x04"),
    entry!(AlgorithmId::Md5, SubAlgorithm::None,
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x02\x05"),
    entry!(AlgorithmId::Sha1, SubAlgorithm::Sha0,
           b"\x06\x05\x2B\x0E\x03\x02\x12"),
    entry!(AlgorithmId::Sha1, SubAlgorithm::Sha0,
           b"\x06\x05\x2B\x0E\x02\x1A\x05"),
    entry!(AlgorithmId::Sha1, SubAlgorithm::None,
           b"\x06\x05\x2B\x0E\x03\x02\x1A"),
    entry!(AlgorithmId::Ripemd160, SubAlgorithm::None,
           b"\x06\x05\x2B\x24\x03\x02\x01"),
    entry!(AlgorithmId::Mdc2, SubAlgorithm::None,
           b"\x06\x05\x2B\x24\x03\x02\x05"),
    // Ciphers
    entry!(AlgorithmId::Cast, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x09\x2A\x86\x48\x86\xF6\x7D\x07\x42\x0A"),
    entry!(AlgorithmId::Des, SubAlgorithm::Mode(Mode::Ecb),
           b"\x06\x05\x2B\x0E\x03\x02\x06"),
    entry!(AlgorithmId::Des, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x05\x2B\x0E\x03\x02\x07"),
    entry!(AlgorithmId::Des, SubAlgorithm::Mode(Mode::Ofb),
           b"\x06\x05\x2B\x0E\x03\x02\x08"),
    entry!(AlgorithmId::Des, SubAlgorithm::Mode(Mode::Cfb),
           b"\x06\x05\x2B\x0E\x03\x02\x09"),
    entry!(AlgorithmId::TripleDes, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x07"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Ecb),
           b"\x06\x0B\x2B\x06\x01\x04\x01\x81\x3C\x07\x01\x01\x01"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Ecb),
           b"\x06\x06\x2B\x24\x03\x01\x02\x01"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x0B\x2B\x06\x01\x04\x01\x81\x3C\x07\x01\x01\x02"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x06\x2B\x24\x03\x01\x02\x02"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Ofb),
           b"\x06\x0B\x2B\x06\x01\x04\x01\x81\x3C\x07\x01\x01\x04"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Ofb),
           b"\x06\x06\x2B\x24\x03\x01\x02\x03"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Cfb),
           b"\x06\x0B\x2B\x06\x01\x04\x01\x81\x3C\x07\x01\x01\x03"),
    entry!(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Cfb),
           b"\x06\x06\x2B\x24\x03\x01\x02\x04"),
    entry!(AlgorithmId::Rc2, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x02"),
    entry!(AlgorithmId::Rc2, SubAlgorithm::Mode(Mode::Ecb),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x03"),
    entry!(AlgorithmId::Rc4, SubAlgorithm::Mode(Mode::Stream),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x04"),
    entry!(AlgorithmId::Rc5, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x09"),
    entry!(AlgorithmId::Rc5, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x08\x2A\x86\x48\x86\xF7\x0D\x03\x08"),
    entry!(AlgorithmId::Skipjack, SubAlgorithm::Mode(Mode::Cbc),
           b"\x06\x09\x60\x86\x48\x01\x65\x02\x01\x01\x04"),
];

/// Map an encoded OID to its algorithm and sub-algorithm.
pub fn oid_to_algorithm(oid: &[u8]) -> Option<(AlgorithmId, SubAlgorithm)> {
    ALGO_OID_MAP
        .iter()
        .find(|e| e.oid.as_image() == oid)
        .map(|e| (e.algorithm, e.sub))
}

/// Map an algorithm and sub-algorithm to its canonical OID.  A triple with
/// no entry is unrepresentable on the wire.
pub fn algorithm_to_oid(algorithm: AlgorithmId, sub: SubAlgorithm) -> Option<&'static Oid> {
    ALGO_OID_MAP
        .iter()
        .find(|e| e.algorithm == algorithm && e.sub == sub)
        .map(|e| &e.oid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_oid_wins_on_encode() {
        // Two OIDs decode to IDEA/CBC; the Ascom Tech one encodes.
        let oid = algorithm_to_oid(AlgorithmId::Idea, SubAlgorithm::Mode(Mode::Cbc)).unwrap();
        assert_eq!(
            oid.as_image(),
            b"\x06\x0B\x2B\x06\x01\x04\x01\x81\x3C\x07\x01\x01\x02"
        );
        let (algo, sub) = oid_to_algorithm(b"\x06\x06\x2B\x24\x03\x01\x02\x02").unwrap();
        assert_eq!(algo, AlgorithmId::Idea);
        assert_eq!(sub, SubAlgorithm::Mode(Mode::Cbc));
    }

    #[test]
    fn sha0_is_flagged() {
        let (algo, sub) = oid_to_algorithm(b"\x06\x05\x2B\x0E\x03\x02\x12").unwrap();
        assert_eq!(algo, AlgorithmId::Sha1);
        assert_eq!(sub, SubAlgorithm::Sha0);
        // Plain SHA-1 has no sub-slot value.
        let (_, sub) = oid_to_algorithm(b"\x06\x05\x2B\x0E\x03\x02\x1A").unwrap();
        assert_eq!(sub, SubAlgorithm::None);
    }

    #[test]
    fn hmac_is_unrepresentable() {
        assert!(algorithm_to_oid(AlgorithmId::HmacSha1, SubAlgorithm::None).is_none());
    }

    #[test]
    fn display_decodes_arcs() {
        assert_eq!(OID_CMS_DATA.to_string(), "1.2.840.113549.1.7.1");
    }
}
