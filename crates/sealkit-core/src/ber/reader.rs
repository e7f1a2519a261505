use super::time::Time;
use super::*;
use crate::error::{err, ErrorKind, Result};

/// Length field of a TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Definite(usize),
    Indefinite,
}

impl Length {
    /// Definite value or `BadData` where the indefinite form is not allowed.
    pub fn definite(self) -> Result<usize> {
        match self {
            Length::Definite(len) => Ok(len),
            Length::Indefinite => err(ErrorKind::BadData),
        }
    }
}

/// Incremental reader over a byte slice.  Running off the end of the input
/// is `Underflow` (the caller may be able to supply more data); a malformed
/// identifier or length is `BadData`.
#[derive(Clone)]
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BerReader { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        if self.remaining() < count {
            return err(ErrorKind::Underflow);
        }
        self.pos += count;
        Ok(())
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return err(ErrorKind::Underflow);
        }
        let span = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(span)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or(ErrorKind::Underflow)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_byte(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| ErrorKind::Underflow.into())
    }

    /// Read an identifier octet.  High-tag-number form is not used by any
    /// format we speak and is rejected as malformed.
    pub fn read_tag(&mut self) -> Result<u8> {
        let tag = self.read_byte()?;
        if tag & 0x1F == 0x1F {
            return err(ErrorKind::BadData);
        }
        Ok(tag)
    }

    pub fn peek_tag(&self) -> Result<u8> {
        let tag = self.peek_byte()?;
        if tag & 0x1F == 0x1F {
            return err(ErrorKind::BadData);
        }
        Ok(tag)
    }

    pub fn read_length(&mut self) -> Result<Length> {
        let first = self.read_byte()?;
        if first == 0x80 {
            return Ok(Length::Indefinite);
        }
        if first & 0x80 == 0 {
            return Ok(Length::Definite(first as usize));
        }
        let count = (first & 0x7F) as usize;
        if count > 8 {
            return err(ErrorKind::BadData);
        }
        let mut value: u64 = 0;
        for _ in 0..count {
            value = (value << 8) | u64::from(self.read_byte()?);
        }
        if value > usize::MAX as u64 {
            return err(ErrorKind::Overflow);
        }
        Ok(Length::Definite(value as usize))
    }

    /// Consume an end-of-contents marker if one is next.
    pub fn check_eoc(&mut self) -> bool {
        if self.remaining() >= 2 && self.data[self.pos] == 0 && self.data[self.pos + 1] == 0 {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn expect_tag(&mut self, expected: u8) -> Result<()> {
        if self.read_tag()? != expected {
            return err(ErrorKind::BadData);
        }
        Ok(())
    }

    pub fn read_constructed(&mut self, tag: u8) -> Result<Length> {
        self.expect_tag(tag)?;
        self.read_length()
    }

    pub fn read_sequence(&mut self) -> Result<Length> {
        self.read_constructed(BER_SEQUENCE)
    }

    pub fn read_set(&mut self) -> Result<Length> {
        self.read_constructed(BER_SET)
    }

    /// If the next tag is the given context-specific constructed tag,
    /// consume it and return its length.
    pub fn check_ctag(&mut self, n: u8) -> Result<Option<Length>> {
        if self.is_empty() {
            return Ok(None);
        }
        if self.peek_byte()? == ctag(n) {
            self.pos += 1;
            return Ok(Some(self.read_length()?));
        }
        Ok(None)
    }

    pub fn check_ctag_primitive(&mut self, n: u8) -> Result<Option<usize>> {
        if self.is_empty() {
            return Ok(None);
        }
        if self.peek_byte()? == ctag_primitive(n) {
            self.pos += 1;
            return Ok(Some(self.read_length()?.definite()?));
        }
        Ok(None)
    }

    /// Read a small INTEGER into an i64.
    pub fn read_short_integer(&mut self) -> Result<i64> {
        self.expect_tag(BER_INTEGER)?;
        self.read_integer_body()
    }

    fn read_integer_body(&mut self) -> Result<i64> {
        let len = self.read_length()?.definite()?;
        if len == 0 || len > 8 {
            return err(ErrorKind::BadData);
        }
        let bytes = self.take(len)?;
        let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in bytes {
            value = (value << 8) | i64::from(b);
        }
        Ok(value)
    }

    pub fn read_enumerated(&mut self) -> Result<u32> {
        self.expect_tag(BER_ENUMERATED)?;
        let value = self.read_integer_body()?;
        u32::try_from(value).map_err(|_| ErrorKind::BadData.into())
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        self.expect_tag(BER_BOOLEAN)?;
        if self.read_length()?.definite()? != 1 {
            return err(ErrorKind::BadData);
        }
        Ok(self.read_byte()? != 0)
    }

    pub fn read_null(&mut self) -> Result<()> {
        self.expect_tag(BER_NULL)?;
        if self.read_length()?.definite()? != 0 {
            return err(ErrorKind::BadData);
        }
        Ok(())
    }

    /// Arbitrary-precision INTEGER as unsigned big-endian bytes with the
    /// sign-padding octet stripped.
    pub fn read_static_integer(&mut self, max_len: usize) -> Result<&'a [u8]> {
        self.expect_tag(BER_INTEGER)?;
        self.read_static_integer_data(max_len)
    }

    pub fn read_static_integer_data(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let mut len = self.read_length()?.definite()?;
        if len == 0 {
            return err(ErrorKind::BadData);
        }
        // A leading zero is sign padding, skip it.
        if self.peek_byte()? == 0 && len > 1 {
            self.pos += 1;
            len -= 1;
        }
        if len > max_len {
            return err(ErrorKind::Overflow);
        }
        self.take(len)
    }

    pub fn read_octet_string(&mut self, max_len: usize) -> Result<&'a [u8]> {
        self.expect_tag(BER_OCTETSTRING)?;
        self.read_string_data(max_len)
    }

    pub fn read_octet_string_tagged(&mut self, tag: u8, max_len: usize) -> Result<&'a [u8]> {
        self.expect_tag(tag)?;
        self.read_string_data(max_len)
    }

    pub fn read_string_data(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let len = self.read_length()?.definite()?;
        if len > max_len {
            return err(ErrorKind::Overflow);
        }
        self.take(len)
    }

    /// BIT STRING contents with the spare-bits octet consumed; only whole
    /// byte strings are used by the formats we speak.
    pub fn read_bit_string(&mut self, max_len: usize) -> Result<&'a [u8]> {
        self.expect_tag(BER_BITSTRING)?;
        let len = self.read_length()?.definite()?;
        if len == 0 || len - 1 > max_len {
            return err(ErrorKind::BadData);
        }
        if self.read_byte()? != 0 {
            return err(ErrorKind::BadData);
        }
        self.take(len - 1)
    }

    /// Read a complete primitive object as its raw TLV image.
    pub fn read_raw_object(&mut self, expected_tag: u8, max_len: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        let tag = self.read_tag()?;
        if tag != expected_tag {
            self.pos = start;
            return err(ErrorKind::BadData);
        }
        let len = self.read_length()?.definite()?;
        self.skip(len)?;
        let image = &self.data[start..self.pos];
        if image.len() > max_len {
            return err(ErrorKind::Overflow);
        }
        Ok(image)
    }

    /// Read a complete SEQUENCE as its raw TLV image (definite length
    /// only).  Used where an encoded span is matched byte-for-byte rather
    /// than decomposed, e.g. IssuerAndSerialNumber.
    pub fn read_raw_sequence(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        self.expect_tag(BER_SEQUENCE)?;
        let len = self.read_length()?.definite()?;
        self.skip(len)?;
        Ok(&self.data[start..self.pos])
    }

    /// Read an OID and check it against an expected encoded image.
    pub fn read_expected_oid(&mut self, expected: &crate::oid::Oid) -> Result<()> {
        let image = self.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
        if image != expected.as_image() {
            return err(ErrorKind::BadData);
        }
        Ok(())
    }

    /// Skip over one complete object of any type (definite lengths only).
    pub fn read_universal(&mut self) -> Result<()> {
        self.read_tag()?;
        let len = self.read_length()?.definite()?;
        self.skip(len)
    }

    pub fn read_utc_time(&mut self) -> Result<Time> {
        self.expect_tag(BER_TIME_UTC)?;
        let len = self.read_length()?.definite()?;
        Time::parse_utc(self.take(len)?)
    }

    pub fn read_generalized_time(&mut self) -> Result<Time> {
        self.expect_tag(BER_TIME_GENERALIZED)?;
        let len = self.read_length()?.definite()?;
        Time::parse_generalized(self.take(len)?)
    }

    /// Validity times may use either encoding.
    pub fn read_time(&mut self) -> Result<Time> {
        match self.peek_tag()? {
            BER_TIME_UTC => self.read_utc_time(),
            BER_TIME_GENERALIZED => self.read_generalized_time(),
            _ => err(ErrorKind::BadData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        let mut r = BerReader::new(&[0x30, 0x03, 1, 2, 3]);
        assert_eq!(r.read_sequence().unwrap(), Length::Definite(3));

        let mut r = BerReader::new(&[0x30, 0x82, 0x01, 0x00]);
        assert_eq!(r.read_sequence().unwrap(), Length::Definite(256));

        let mut r = BerReader::new(&[0x30, 0x80, 0x00, 0x00]);
        assert_eq!(r.read_sequence().unwrap(), Length::Indefinite);
        assert!(r.check_eoc());
    }

    #[test]
    fn truncated_input_is_underflow() {
        let mut r = BerReader::new(&[0x04, 0x05, 1, 2]);
        assert_eq!(
            r.read_octet_string(16).unwrap_err().kind(),
            ErrorKind::Underflow
        );
    }

    #[test]
    fn high_tag_number_is_bad_data() {
        let mut r = BerReader::new(&[0x1F, 0x81, 0x00]);
        assert_eq!(r.read_tag().unwrap_err().kind(), ErrorKind::BadData);
    }

    #[test]
    fn negative_short_integer() {
        let mut r = BerReader::new(&[0x02, 0x01, 0xFF]);
        assert_eq!(r.read_short_integer().unwrap(), -1);
    }

    #[test]
    fn static_integer_strips_sign_padding() {
        let mut r = BerReader::new(&[0x02, 0x03, 0x00, 0x80, 0x01]);
        assert_eq!(r.read_static_integer(8).unwrap(), &[0x80, 0x01]);
    }
}
