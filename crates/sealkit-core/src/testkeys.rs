//! Fixed key material for tests and interop checks.
//!
//! The 512-bit RSA key is the classic test key: small enough that loading
//! and signing stay fast in debug builds, large enough to exercise the real
//! code paths.  Never use it for anything but tests.

#![doc(hidden)]

use crate::cert::spki::{PublicKeyInfo, PublicKeyParts, RsaPrivateParts};

#[rustfmt::skip]
const RSA512_N: [u8; 64] = [
    0xE1, 0x95, 0x41, 0x17, 0xB4, 0xCB, 0xDC, 0xD0,
    0xCB, 0x9B, 0x11, 0x19, 0x9C, 0xED, 0x04, 0x6F,
    0xBD, 0x70, 0x2D, 0x5C, 0x8A, 0x32, 0xFF, 0x16,
    0x22, 0x57, 0x30, 0x3B, 0xD4, 0x59, 0x9C, 0x01,
    0xF0, 0xA3, 0x70, 0xA1, 0x6C, 0x16, 0xAC, 0xCC,
    0x8C, 0xAD, 0xB0, 0xA0, 0xAF, 0xC7, 0xCC, 0x49,
    0x4F, 0xD9, 0x5D, 0x32, 0x1C, 0x2A, 0xE8, 0x4E,
    0x15, 0xE1, 0x26, 0x6C, 0xC4, 0xB8, 0x94, 0xE1,
];

const RSA512_E: [u8; 1] = [0x11];

#[rustfmt::skip]
const RSA512_D: [u8; 64] = [
    0x13, 0xE7, 0x85, 0xBE, 0x53, 0xB7, 0xA2, 0x8A,
    0xE4, 0xC9, 0xEA, 0xEB, 0xAB, 0xF6, 0xCB, 0xAF,
    0x81, 0xA8, 0x04, 0x00, 0xA2, 0xC8, 0x43, 0xAF,
    0x21, 0x25, 0xCF, 0x8C, 0xCE, 0xF8, 0xD9, 0x0F,
    0x10, 0x78, 0x4C, 0x1A, 0x26, 0x5D, 0x90, 0x18,
    0x79, 0x90, 0x42, 0x83, 0x6E, 0xAE, 0x3E, 0x20,
    0x0B, 0x0C, 0x5B, 0x6B, 0x8E, 0x31, 0xE5, 0xCF,
    0xD6, 0xE0, 0xBB, 0x41, 0xC1, 0xB8, 0x2E, 0x17,
];

#[rustfmt::skip]
const RSA512_P: [u8; 32] = [
    0xED, 0xE4, 0x02, 0x90, 0xA4, 0xA4, 0x98, 0x0D,
    0x45, 0xA2, 0xF3, 0x96, 0x09, 0xED, 0x7B, 0x40,
    0xCD, 0xF6, 0x21, 0xCC, 0xC0, 0x1F, 0x83, 0x09,
    0x56, 0x37, 0x97, 0xFB, 0x05, 0x5B, 0x87, 0xB7,
];

#[rustfmt::skip]
const RSA512_Q: [u8; 32] = [
    0xF2, 0xC1, 0x64, 0xE8, 0x69, 0xF8, 0x5E, 0x54,
    0x8F, 0xFD, 0x20, 0x8E, 0x6A, 0x23, 0x90, 0xF2,
    0xAF, 0x57, 0x2F, 0x4D, 0x10, 0x80, 0x8E, 0x11,
    0x3C, 0x61, 0x44, 0x33, 0x2B, 0xE0, 0x58, 0x27,
];

pub fn rsa512_private_parts() -> RsaPrivateParts {
    RsaPrivateParts {
        n: RSA512_N.to_vec(),
        e: RSA512_E.to_vec(),
        d: RSA512_D.to_vec(),
        p: RSA512_P.to_vec(),
        q: RSA512_Q.to_vec(),
    }
}

pub fn rsa512_public_info() -> PublicKeyInfo {
    PublicKeyInfo {
        parts: PublicKeyParts::Rsa { n: RSA512_N.to_vec(), e: RSA512_E.to_vec() },
    }
}
