//! CMS signed attributes: a SET OF Attribute in DER sort order.  The
//! default set (content-type, signing-time, message-digest) is appended
//! automatically unless disabled; an ESS security label can ride along.

use crate::ber::{
    sizeof_object, BerReader, BerWriter, Time, BER_OBJECT_IDENTIFIER, BER_SEQUENCE, BER_SET,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{
    Oid, OID_CMS_CONTENTTYPE, OID_CMS_MESSAGEDIGEST, OID_CMS_SIGNINGTIME, OID_ESS_SECURITYLABEL,
};

/// ESS security classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unmarked,
    Unclassified,
    Restricted,
    Confidential,
    Secret,
    TopSecret,
}

impl Classification {
    pub fn value(self) -> i64 {
        match self {
            Classification::Unmarked => 0,
            Classification::Unclassified => 1,
            Classification::Restricted => 2,
            Classification::Confidential => 3,
            Classification::Secret => 4,
            Classification::TopSecret => 5,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        Some(match value {
            0 => Classification::Unmarked,
            1 => Classification::Unclassified,
            2 => Classification::Restricted,
            3 => Classification::Confidential,
            4 => Classification::Secret,
            5 => Classification::TopSecret,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityLabel {
    pub policy: Oid,
    pub classification: Option<Classification>,
}

/// One `Attribute { OID, SET OF value }`; values are held as encoded DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub oid: Oid,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    fn encode(&self) -> Vec<u8> {
        let values_len: usize = self.values.iter().map(|v| v.len()).sum();
        let content = self.oid.encoded_len() + sizeof_object(values_len);
        let mut writer = BerWriter::new();
        writer.write_sequence(content);
        writer.write_oid(&self.oid);
        writer.write_header(BER_SET, values_len);
        for value in &self.values {
            writer.write_raw(value);
        }
        writer.into_bytes()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CmsAttributes {
    attributes: Vec<Attribute>,
}

impl CmsAttributes {
    pub fn new() -> Self {
        CmsAttributes { attributes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.oid == *oid)
    }

    /// Attributes in their stored order; parsed sets keep wire order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Add an attribute with a single encoded value.  Signed attributes
    /// carry at most one attribute per type.
    pub fn add(&mut self, oid: Oid, value: Vec<u8>) -> Result<()> {
        if self.get(&oid).is_some() {
            return err(ErrorKind::DataDuplicate);
        }
        self.attributes.push(Attribute { oid, values: vec![value] });
        Ok(())
    }

    pub fn add_content_type(&mut self, content_type: &Oid) -> Result<()> {
        self.add(OID_CMS_CONTENTTYPE.clone(), content_type.as_image().to_vec())
    }

    pub fn add_signing_time(&mut self, time: &Time) -> Result<()> {
        let mut writer = BerWriter::new();
        writer.write_utc_time(time);
        self.add(OID_CMS_SIGNINGTIME.clone(), writer.into_bytes())
    }

    pub fn add_message_digest(&mut self, digest: &[u8]) -> Result<()> {
        let mut writer = BerWriter::new();
        writer.write_octet_string(digest);
        self.add(OID_CMS_MESSAGEDIGEST.clone(), writer.into_bytes())
    }

    pub fn add_security_label(&mut self, label: &SecurityLabel) -> Result<()> {
        let mut content = label.policy.encoded_len();
        if let Some(classification) = label.classification {
            content += crate::ber::sizeof_short_integer(classification.value());
        }
        let mut writer = BerWriter::new();
        writer.write_header(BER_SET, content);
        writer.write_oid(&label.policy);
        if let Some(classification) = label.classification {
            writer.write_short_integer(classification.value());
        }
        self.add(OID_ESS_SECURITYLABEL.clone(), writer.into_bytes())
    }

    /// Append the default attribute set for the given content type and
    /// digest, skipping anything already present.
    pub fn add_defaults(&mut self, content_type: &Oid, digest: &[u8]) -> Result<()> {
        if self.get(&OID_CMS_CONTENTTYPE).is_none() {
            self.add_content_type(content_type)?;
        }
        if self.get(&OID_CMS_SIGNINGTIME).is_none() {
            self.add_signing_time(&Time::now())?;
        }
        if self.get(&OID_CMS_MESSAGEDIGEST).is_none() {
            self.add_message_digest(digest)?;
        }
        Ok(())
    }

    /// Encoded attribute sequence in DER SET-OF order (sorted by encoding),
    /// without the outer tag.  This is what rides inside the signer-info's
    /// `[0]` wrapper.
    pub fn encode_content(&self) -> Vec<u8> {
        let mut encoded: Vec<Vec<u8>> = self.attributes.iter().map(Attribute::encode).collect();
        encoded.sort();
        encoded.concat()
    }

    /// The full SET TLV as hashed for signing: per CMS the implicit `[0]`
    /// is replaced by the SET tag.
    pub fn encode_for_hashing(&self) -> Vec<u8> {
        let content = self.encode_content();
        let mut writer = BerWriter::new();
        writer.write_header(BER_SET, content.len());
        writer.write_raw(&content);
        writer.into_bytes()
    }

    /// Parse the content of a signed-attributes wrapper.
    pub fn parse(content: &[u8]) -> Result<Self> {
        let mut reader = BerReader::new(content);
        let mut attributes = Vec::new();
        while !reader.is_empty() {
            reader.read_constructed(BER_SEQUENCE)?.definite()?;
            let oid = Oid::from_image(reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?);
            let set_len = reader.read_set()?.definite()?;
            let end = reader.pos() + set_len;
            let mut values = Vec::new();
            while reader.pos() < end {
                let start = reader.pos();
                reader.read_universal()?;
                values.push(content[start..reader.pos()].to_vec());
            }
            if reader.pos() != end {
                return err(ErrorKind::BadData);
            }
            attributes.push(Attribute { oid, values });
        }
        Ok(CmsAttributes { attributes })
    }

    /// Decoded content-type attribute, if present.
    pub fn content_type(&self) -> Option<Oid> {
        let attr = self.get(&OID_CMS_CONTENTTYPE)?;
        let value = attr.values.first()?;
        let mut reader = BerReader::new(value);
        let image = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32).ok()?;
        Some(Oid::from_image(image))
    }

    /// Decoded message-digest attribute, if present.
    pub fn message_digest(&self) -> Option<Vec<u8>> {
        let attr = self.get(&OID_CMS_MESSAGEDIGEST)?;
        let value = attr.values.first()?;
        let mut reader = BerReader::new(value);
        reader.read_octet_string(64).ok().map(<[u8]>::to_vec)
    }

    pub fn signing_time(&self) -> Option<Time> {
        let attr = self.get(&OID_CMS_SIGNINGTIME)?;
        let value = attr.values.first()?;
        let mut reader = BerReader::new(value);
        reader.read_utc_time().ok()
    }

    pub fn security_label(&self) -> Option<SecurityLabel> {
        let attr = self.get(&OID_ESS_SECURITYLABEL)?;
        let value = attr.values.first()?;
        let mut reader = BerReader::new(value);
        let set_len = reader.read_set().ok()?.definite().ok()?;
        let end = reader.pos() + set_len;
        let policy =
            Oid::from_image(reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32).ok()?);
        let mut classification = None;
        if reader.pos() < end {
            classification = Classification::from_value(reader.read_short_integer().ok()?);
        }
        Some(SecurityLabel { policy, classification })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::OID_CMS_DATA;

    #[test]
    fn default_set_is_three_attributes_in_der_order() {
        let mut attrs = CmsAttributes::new();
        attrs.add_defaults(&OID_CMS_DATA, &[0x44u8; 20]).unwrap();
        assert_eq!(attrs.len(), 3);

        let parsed = CmsAttributes::parse(&attrs.encode_content()).unwrap();
        let oids: Vec<_> = parsed.attributes.iter().map(|a| a.oid.clone()).collect();
        // The length octet dominates the lexicographic comparison, giving
        // content-type, signing-time, message-digest.
        assert_eq!(oids[0], OID_CMS_CONTENTTYPE);
        assert_eq!(oids[1], OID_CMS_SIGNINGTIME);
        assert_eq!(oids[2], OID_CMS_MESSAGEDIGEST);
    }

    #[test]
    fn encoding_is_sorted_regardless_of_insertion_order() {
        let mut a = CmsAttributes::new();
        a.add_message_digest(&[1u8; 20]).unwrap();
        a.add_content_type(&OID_CMS_DATA).unwrap();
        let mut b = CmsAttributes::new();
        b.add_content_type(&OID_CMS_DATA).unwrap();
        b.add_message_digest(&[1u8; 20]).unwrap();
        assert_eq!(a.encode_content(), b.encode_content());
    }

    #[test]
    fn duplicate_attribute_rejected() {
        let mut attrs = CmsAttributes::new();
        attrs.add_content_type(&OID_CMS_DATA).unwrap();
        assert_eq!(
            attrs.add_content_type(&OID_CMS_DATA).unwrap_err().kind(),
            ErrorKind::DataDuplicate
        );
    }

    #[test]
    fn security_label_roundtrip() {
        // policy 1.3.6.1.4.1.9999.1, classification Secret
        let policy = Oid::from_image(b"\x06\x08\x2B\x06\x01\x04\x01\xCE\x0F\x01");
        let label = SecurityLabel {
            policy: policy.clone(),
            classification: Some(Classification::Secret),
        };
        let mut attrs = CmsAttributes::new();
        attrs.add_security_label(&label).unwrap();
        let parsed = CmsAttributes::parse(&attrs.encode_content()).unwrap();
        assert_eq!(parsed.security_label().unwrap(), label);
    }

    #[test]
    fn accessors_decode_values() {
        let mut attrs = CmsAttributes::new();
        attrs.add_defaults(&OID_CMS_DATA, &[0x20u8; 20]).unwrap();
        assert_eq!(attrs.content_type().unwrap(), OID_CMS_DATA);
        assert_eq!(attrs.message_digest().unwrap(), vec![0x20u8; 20]);
        assert!(attrs.signing_time().is_some());
    }
}
