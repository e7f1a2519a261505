//! X.509 SubjectPublicKeyInfo records, per-algorithm key components, key
//! IDs and the ad-hoc SSH RSA blob format.
//!
//! The DL-based algorithms split their components between the
//! AlgorithmIdentifier parameters (p, q, g) and the BIT STRING payload (y);
//! RSA carries everything in the payload.  Bignums travel as unsigned
//! big-endian byte strings.

use sha1::{Digest, Sha1};

use crate::algid::{
    read_algorithm_identifier, sizeof_algorithm_identifier, write_algorithm_identifier,
};
use crate::ber::{
    sizeof_object, sizeof_static_integer, BerReader, BerWriter, BER_BITSTRING, BER_SEQUENCE,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::AlgorithmId;

/// Largest PKC component in bytes (4096 bits).
pub const MAX_PKC_SIZE: usize = 512;

/// Truncated key ID length used by the cryptlib-variant wire records.
pub const KEYID_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyParts {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    Dsa { p: Vec<u8>, q: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
    Elgamal { p: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
    Dh { p: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
}

impl PublicKeyParts {
    pub fn algorithm(&self) -> AlgorithmId {
        match self {
            PublicKeyParts::Rsa { .. } => AlgorithmId::Rsa,
            PublicKeyParts::Dsa { .. } => AlgorithmId::Dsa,
            PublicKeyParts::Elgamal { .. } => AlgorithmId::Elgamal,
            PublicKeyParts::Dh { .. } => AlgorithmId::Dh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub parts: PublicKeyParts,
}

fn sizeof_parameters(parts: &PublicKeyParts) -> usize {
    match parts {
        PublicKeyParts::Rsa { .. } => 0,
        PublicKeyParts::Dsa { p, q, g, .. } => sizeof_object(
            sizeof_static_integer(p) + sizeof_static_integer(q) + sizeof_static_integer(g),
        ),
        PublicKeyParts::Elgamal { p, g, .. } | PublicKeyParts::Dh { p, g, .. } => {
            sizeof_object(sizeof_static_integer(p) + sizeof_static_integer(g))
        }
    }
}

fn sizeof_components(parts: &PublicKeyParts) -> usize {
    match parts {
        PublicKeyParts::Rsa { n, e } => {
            sizeof_object(sizeof_static_integer(n) + sizeof_static_integer(e))
        }
        PublicKeyParts::Dsa { y, .. }
        | PublicKeyParts::Elgamal { y, .. }
        | PublicKeyParts::Dh { y, .. } => sizeof_static_integer(y),
    }
}

impl PublicKeyInfo {
    pub fn algorithm(&self) -> AlgorithmId {
        self.parts.algorithm()
    }

    pub fn sizeof(&self) -> Result<usize> {
        let parameter_size = sizeof_parameters(&self.parts);
        let component_size = sizeof_components(&self.parts);
        Ok(sizeof_object(
            sizeof_algorithm_identifier(self.algorithm(), None, false, parameter_size)?
                + sizeof_object(component_size + 1),
        ))
    }

    pub fn write(&self, writer: &mut BerWriter) -> Result<()> {
        let parameter_size = sizeof_parameters(&self.parts);
        let component_size = sizeof_components(&self.parts);
        writer.write_header(
            BER_SEQUENCE,
            sizeof_algorithm_identifier(self.algorithm(), None, false, parameter_size)?
                + sizeof_object(component_size + 1),
        );
        write_algorithm_identifier(writer, self.algorithm(), None, false, parameter_size)?;
        match &self.parts {
            PublicKeyParts::Rsa { .. } => {}
            PublicKeyParts::Dsa { p, q, g, .. } => {
                writer.write_header(
                    BER_SEQUENCE,
                    sizeof_static_integer(p) + sizeof_static_integer(q) + sizeof_static_integer(g),
                );
                writer.write_static_integer(p);
                writer.write_static_integer(q);
                writer.write_static_integer(g);
            }
            PublicKeyParts::Elgamal { p, g, .. } | PublicKeyParts::Dh { p, g, .. } => {
                writer.write_header(
                    BER_SEQUENCE,
                    sizeof_static_integer(p) + sizeof_static_integer(g),
                );
                writer.write_static_integer(p);
                writer.write_static_integer(g);
            }
        }
        // BIT STRING wrapper with its spare-bits octet.
        writer.write_header(BER_BITSTRING, component_size + 1);
        writer.write_raw(&[0]);
        match &self.parts {
            PublicKeyParts::Rsa { n, e } => {
                writer.write_header(
                    BER_SEQUENCE,
                    sizeof_static_integer(n) + sizeof_static_integer(e),
                );
                writer.write_static_integer(n);
                writer.write_static_integer(e);
            }
            PublicKeyParts::Dsa { y, .. }
            | PublicKeyParts::Elgamal { y, .. }
            | PublicKeyParts::Dh { y, .. } => writer.write_static_integer(y),
        }
        Ok(())
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        let mut writer = BerWriter::new();
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn read(reader: &mut BerReader) -> Result<Self> {
        reader.read_sequence()?.definite()?;
        let alg = read_algorithm_identifier(reader)?;
        if alg.sub.is_some() || alg.is_sha0 {
            return err(ErrorKind::BadData);
        }

        // Parameter data rides in the AlgorithmIdentifier for the DL
        // algorithms.
        let mut params: Option<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)> = None;
        if alg.extra_len > 0 {
            reader.read_sequence()?.definite()?;
            match alg.algorithm {
                AlgorithmId::Dh => {
                    let p = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    let g = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    params = Some((p, g, None));
                }
                AlgorithmId::Dsa => {
                    let p = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    let q = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    let g = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    params = Some((p, g, Some(q)));
                }
                AlgorithmId::Elgamal => {
                    let p = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    let g = reader.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                    params = Some((p, g, None));
                }
                _ => return err(ErrorKind::BadData),
            }
        }

        // BIT STRING encapsulation of the key components.
        let bits = reader.read_bit_string(MAX_PKC_SIZE * 2 + 64)?;
        let mut inner = BerReader::new(bits);
        let parts = match alg.algorithm {
            AlgorithmId::Rsa => {
                inner.read_sequence()?.definite()?;
                let n = inner.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                let e = inner.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                PublicKeyParts::Rsa { n, e }
            }
            AlgorithmId::Dsa => {
                let (p, g, q) = params.ok_or(ErrorKind::BadData)?;
                let y = inner.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                PublicKeyParts::Dsa { p, q: q.ok_or(ErrorKind::BadData)?, g, y }
            }
            AlgorithmId::Elgamal => {
                let (p, g, _) = params.ok_or(ErrorKind::BadData)?;
                let y = inner.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                PublicKeyParts::Elgamal { p, g, y }
            }
            AlgorithmId::Dh => {
                let (p, g, _) = params.ok_or(ErrorKind::BadData)?;
                let y = inner.read_static_integer(MAX_PKC_SIZE)?.to_vec();
                PublicKeyParts::Dh { p, g, y }
            }
            _ => return err(ErrorKind::BadData),
        };
        Ok(PublicKeyInfo { parts })
    }

    /// SHA-1 over the DER-encoded SubjectPublicKeyInfo, not over the bare
    /// bit string: several DL algorithms use a lone INTEGER as the payload,
    /// which would make bare-payload IDs collide.
    pub fn key_id(&self) -> Result<[u8; 20]> {
        let der = self.to_der()?;
        let mut hasher = Sha1::new();
        hasher.update(&der);
        Ok(hasher.finalize().into())
    }

    /// 64-bit prefix used by the cryptlib-variant recipient and signer
    /// records.
    pub fn key_id64(&self) -> Result<[u8; KEYID_SIZE]> {
        let id = self.key_id()?;
        let mut out = [0u8; KEYID_SIZE];
        out.copy_from_slice(&id[..KEYID_SIZE]);
        Ok(out)
    }
}

/// Private key components for provider loading.  The record is a private
/// serialization, not a wire format: `SEQUENCE { n, e, d, p, q }`.
#[derive(Clone)]
pub struct RsaPrivateParts {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
    pub d: Vec<u8>,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
}

impl RsaPrivateParts {
    pub fn to_der(&self) -> Vec<u8> {
        let mut writer = BerWriter::new();
        let content = sizeof_static_integer(&self.n)
            + sizeof_static_integer(&self.e)
            + sizeof_static_integer(&self.d)
            + sizeof_static_integer(&self.p)
            + sizeof_static_integer(&self.q);
        writer.write_sequence(content);
        for part in [&self.n, &self.e, &self.d, &self.p, &self.q] {
            writer.write_static_integer(part);
        }
        writer.into_bytes()
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let mut reader = BerReader::new(bytes);
        reader.read_sequence()?.definite()?;
        Ok(RsaPrivateParts {
            n: reader.read_static_integer(MAX_PKC_SIZE)?.to_vec(),
            e: reader.read_static_integer(MAX_PKC_SIZE)?.to_vec(),
            d: reader.read_static_integer(MAX_PKC_SIZE)?.to_vec(),
            p: reader.read_static_integer(MAX_PKC_SIZE)?.to_vec(),
            q: reader.read_static_integer(MAX_PKC_SIZE)?.to_vec(),
        })
    }

    pub fn public(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            parts: PublicKeyParts::Rsa { n: self.n.clone(), e: self.e.clone() },
        }
    }
}

impl Drop for RsaPrivateParts {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.d.zeroize();
        self.p.zeroize();
        self.q.zeroize();
    }
}

fn bit_length(bytes: &[u8]) -> u32 {
    let mut bytes = bytes;
    while !bytes.is_empty() && bytes[0] == 0 {
        bytes = &bytes[1..];
    }
    match bytes.first() {
        None => 0,
        Some(&first) => (bytes.len() as u32 - 1) * 8 + (8 - first.leading_zeros()),
    }
}

fn high_bit_set(bytes: &[u8]) -> bool {
    bit_length(bytes) % 8 == 0 && !bytes.is_empty()
}

/// Read an SSH-format RSA public key: `(e_bits BE, e, n_bits BE, n)` where
/// the bit counts are 32-bit big-endian and a leading zero byte is present
/// when the value's high bit is set.
pub fn read_ssh_public_key(data: &[u8]) -> Result<(PublicKeyInfo, usize)> {
    fn get_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
        if data.len() < *pos + 4 {
            return err(ErrorKind::Underflow);
        }
        let v = u32::from_be_bytes([
            data[*pos],
            data[*pos + 1],
            data[*pos + 2],
            data[*pos + 3],
        ]);
        *pos += 4;
        Ok(v)
    }
    fn get_bytes<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
        if data.len() < *pos + len {
            return err(ErrorKind::Underflow);
        }
        let span = &data[*pos..*pos + len];
        *pos += len;
        Ok(span)
    }

    let mut pos = 0usize;
    let e_bits = get_u32(data, &mut pos)?;
    if !(2..=256).contains(&e_bits) {
        return err(ErrorKind::BadData);
    }
    let e = get_bytes(data, &mut pos, (e_bits as usize + 7) / 8)?.to_vec();
    let n_bits = get_u32(data, &mut pos)?;
    if !(512..=(MAX_PKC_SIZE as u32 * 8)).contains(&n_bits) {
        return err(ErrorKind::BadData);
    }
    let n = get_bytes(data, &mut pos, (n_bits as usize + 7) / 8)?.to_vec();
    Ok((PublicKeyInfo { parts: PublicKeyParts::Rsa { n, e } }, pos))
}

pub fn write_ssh_public_key(info: &PublicKeyInfo) -> Result<Vec<u8>> {
    let PublicKeyParts::Rsa { n, e } = &info.parts else {
        // The ad hoc formats all require an RSA key.
        return err(ErrorKind::NotAllowed);
    };
    let mut out = Vec::with_capacity(8 + n.len() + e.len() + 2);
    for value in [e, n] {
        let pad = high_bit_set(value);
        out.extend_from_slice(&(bit_length(value) + u32::from(pad) * 8).to_be_bytes());
        if pad {
            out.push(0);
        }
        out.extend_from_slice(value);
    }
    Ok(out)
}
