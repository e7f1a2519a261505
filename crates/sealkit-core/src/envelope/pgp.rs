//! Legacy OpenPGP-style framing: a reduced feature set where key-exchange
//! information is absent and the bulk cipher is derived directly from the
//! user's passphrase.  Only the symmetric-session packet and the RSA
//! public-key packet are spoken.

use crate::cert::spki::{PublicKeyInfo, PublicKeyParts};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, Mode};
use crate::provider::{CapabilityRegistry, ContextHandle};
use crate::secure::secure_random;

/// Old-format packet tags.
const PGP_CTB_PUBKEY: u8 = 0x99; // tag 6, two-byte length
const PGP_CTB_ENCRYPTED: u8 = 0xA5; // tag 9, two-byte length

const PGP_VERSION_3: u8 = 3;
const PGP_ALGO_RSA: u8 = 1;

/// Length of the random prefix ahead of the payload: one cipher block plus
/// two repeated check bytes.
const PREFIX_RANDOM: usize = 8;
const PREFIX_CHECK: usize = 2;
pub const PREFIX_LEN: usize = PREFIX_RANDOM + PREFIX_CHECK;

/// Turn a passphrase into the bulk IDEA/CFB context: the simple
/// key-derivation folds the passphrase through MD5 with no salt or
/// iteration count.
pub fn password_to_key(
    registry: &CapabilityRegistry,
    password: &[u8],
) -> Result<ContextHandle> {
    let key = registry.hash_buffer(AlgorithmId::Md5, password)?;
    let context = registry.create_context(AlgorithmId::Idea, Mode::Cfb)?;
    registry.load_key(&context, &key)?;
    Ok(context)
}

/// Packet header with a two-byte length.
pub fn write_packet_header(out: &mut Vec<u8>, ctb: u8, length: usize) -> Result<()> {
    if length > 0xFFFF {
        return err(ErrorKind::Overflow);
    }
    out.push(ctb);
    out.extend_from_slice(&(length as u16).to_be_bytes());
    Ok(())
}

/// Parse a packet header; returns `(ctb, length, header_size)`.
pub fn read_packet_header(data: &[u8]) -> Result<(u8, usize, usize)> {
    if data.is_empty() {
        return err(ErrorKind::Underflow);
    }
    let ctb = data[0];
    if ctb & 0x80 == 0 {
        return err(ErrorKind::BadData);
    }
    match ctb & 0x03 {
        0 => {
            if data.len() < 2 {
                return err(ErrorKind::Underflow);
            }
            Ok((ctb, data[1] as usize, 2))
        }
        1 => {
            if data.len() < 3 {
                return err(ErrorKind::Underflow);
            }
            Ok((ctb, u16::from_be_bytes([data[1], data[2]]) as usize, 3))
        }
        _ => err(ErrorKind::BadData),
    }
}

pub fn packet_tag(ctb: u8) -> u8 {
    (ctb >> 2) & 0x0F
}

/// The random prefix written ahead of the plaintext: eight random bytes
/// with the last two repeated, giving the decryptor a quick wrong-key
/// check.
pub fn make_prefix() -> Result<[u8; PREFIX_LEN]> {
    let mut prefix = [0u8; PREFIX_LEN];
    secure_random(&mut prefix[..PREFIX_RANDOM])?;
    prefix[PREFIX_RANDOM] = prefix[PREFIX_RANDOM - 2];
    prefix[PREFIX_RANDOM + 1] = prefix[PREFIX_RANDOM - 1];
    Ok(prefix)
}

pub fn check_prefix(prefix: &[u8]) -> Result<()> {
    if prefix.len() < PREFIX_LEN {
        return err(ErrorKind::Underflow);
    }
    if prefix[PREFIX_RANDOM] != prefix[PREFIX_RANDOM - 2]
        || prefix[PREFIX_RANDOM + 1] != prefix[PREFIX_RANDOM - 1]
    {
        return err(ErrorKind::WrongKey);
    }
    Ok(())
}

/// Symmetric-session packet CTB for a payload of known length.
pub fn encrypted_packet_header(payload_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(3);
    write_packet_header(&mut out, PGP_CTB_ENCRYPTED, PREFIX_LEN + payload_len)?;
    Ok(out)
}

pub fn is_encrypted_packet(ctb: u8) -> bool {
    packet_tag(ctb) == packet_tag(PGP_CTB_ENCRYPTED)
}

fn mpi_len(bytes: &[u8]) -> usize {
    2 + bytes.len()
}

fn write_mpi(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut bits = bytes.len() * 8;
    if let Some(&first) = bytes.first() {
        bits -= first.leading_zeros() as usize;
    }
    out.extend_from_slice(&(bits as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_mpi<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    if data.len() < *pos + 2 {
        return err(ErrorKind::Underflow);
    }
    let bits = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    *pos += 2;
    let len = (bits + 7) / 8;
    if data.len() < *pos + len {
        return err(ErrorKind::Underflow);
    }
    let span = &data[*pos..*pos + len];
    *pos += len;
    Ok(span)
}

/// Write a version-3 RSA public-key packet.
pub fn write_public_key_packet(info: &PublicKeyInfo, timestamp: u32) -> Result<Vec<u8>> {
    let PublicKeyParts::Rsa { n, e } = &info.parts else {
        return err(ErrorKind::NotAllowed);
    };
    let body_len = 1 + 4 + 2 + 1 + mpi_len(n) + mpi_len(e);
    let mut out = Vec::with_capacity(3 + body_len);
    write_packet_header(&mut out, PGP_CTB_PUBKEY, body_len)?;
    out.push(PGP_VERSION_3);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // validity, unlimited
    out.push(PGP_ALGO_RSA);
    write_mpi(&mut out, n);
    write_mpi(&mut out, e);
    Ok(out)
}

/// Parse a version-3 RSA public-key packet; returns the key and bytes
/// consumed.
pub fn read_public_key_packet(data: &[u8]) -> Result<(PublicKeyInfo, usize)> {
    let (ctb, length, header) = read_packet_header(data)?;
    if packet_tag(ctb) != packet_tag(PGP_CTB_PUBKEY) {
        return err(ErrorKind::BadData);
    }
    if data.len() < header + length {
        return err(ErrorKind::Underflow);
    }
    let body = &data[header..header + length];
    let mut pos = 0usize;
    if body.len() < 8 || body[0] != PGP_VERSION_3 {
        return err(ErrorKind::BadData);
    }
    pos += 1 + 4 + 2;
    if body[pos] != PGP_ALGO_RSA {
        return err(ErrorKind::NoAlgorithm);
    }
    pos += 1;
    let n = read_mpi(body, &mut pos)?.to_vec();
    let e = read_mpi(body, &mut pos)?.to_vec();
    Ok((
        PublicKeyInfo { parts: PublicKeyParts::Rsa { n, e } },
        header + length,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_check_catches_mismatch() {
        let prefix = make_prefix().unwrap();
        check_prefix(&prefix).unwrap();
        let mut bad = prefix;
        bad[PREFIX_RANDOM] ^= 0xFF;
        assert_eq!(check_prefix(&bad).unwrap_err().kind(), ErrorKind::WrongKey);
    }

    #[test]
    fn public_key_packet_roundtrip() {
        let info = crate::testkeys::rsa512_public_info();
        let packet = write_public_key_packet(&info, 0x5F00_0000).unwrap();
        let (parsed, consumed) = read_public_key_packet(&packet).unwrap();
        assert_eq!(consumed, packet.len());
        assert_eq!(parsed, info);
    }

    #[test]
    fn packet_header_forms() {
        let mut out = Vec::new();
        write_packet_header(&mut out, PGP_CTB_ENCRYPTED, 300).unwrap();
        let (ctb, len, header) = read_packet_header(&out).unwrap();
        assert!(is_encrypted_packet(ctb));
        assert_eq!(len, 300);
        assert_eq!(header, 3);
    }

    #[cfg(feature = "soft")]
    #[test]
    fn password_derives_idea_cfb_context() {
        let registry = crate::provider::CapabilityRegistry::software();
        let ctx = password_to_key(&registry, b"Password").unwrap();
        let q = registry.query_context(&ctx).unwrap();
        assert_eq!(q.algorithm, AlgorithmId::Idea);
        assert_eq!(q.mode, Mode::Cfb);
        assert!(q.key_loaded);
    }
}
