//! BER/DER tag-length-value codec for the subset of ASN.1 that CMS and
//! X.509 need.  DER on output, BER (including indefinite lengths) on input.

mod reader;
mod time;
mod writer;

pub use reader::{BerReader, Length};
pub use time::Time;
pub use writer::{
    sizeof_boolean, sizeof_enumerated, sizeof_length, sizeof_null, sizeof_object,
    sizeof_short_integer, sizeof_static_integer, BerWriter,
};

// Universal tags
pub const BER_BOOLEAN: u8 = 0x01;
pub const BER_INTEGER: u8 = 0x02;
pub const BER_BITSTRING: u8 = 0x03;
pub const BER_OCTETSTRING: u8 = 0x04;
pub const BER_NULL: u8 = 0x05;
pub const BER_OBJECT_IDENTIFIER: u8 = 0x06;
pub const BER_ENUMERATED: u8 = 0x0A;
pub const BER_STRING_UTF8: u8 = 0x0C;
pub const BER_STRING_PRINTABLE: u8 = 0x13;
pub const BER_STRING_T61: u8 = 0x14;
pub const BER_STRING_IA5: u8 = 0x16;
pub const BER_TIME_UTC: u8 = 0x17;
pub const BER_TIME_GENERALIZED: u8 = 0x18;
pub const BER_STRING_BMP: u8 = 0x1E;
pub const BER_CONSTRUCTED: u8 = 0x20;
pub const BER_SEQUENCE: u8 = 0x30;
pub const BER_SET: u8 = 0x31;

/// Constructed context-specific tag `[n]`.
pub const fn ctag(n: u8) -> u8 {
    0xA0 | n
}

/// Primitive context-specific tag `[n]`.
pub const fn ctag_primitive(n: u8) -> u8 {
    0x80 | n
}
