//! X.509 certificate engine: DN handling, public-key info, certificate
//! parse/assemble, chain ordering and constraint checking.

pub mod chain;
pub mod dn;
pub mod spki;
pub mod strings;
pub mod trust;

use crate::algid::{
    read_algorithm_identifier, sizeof_algorithm_identifier, write_algorithm_identifier,
};
use crate::ber::{
    ctag, sizeof_object, sizeof_static_integer, BerReader, BerWriter, Time, BER_BOOLEAN,
    BER_OBJECT_IDENTIFIER,
};
use crate::cms::signature::{
    read_x509_signature, sizeof_x509_signature, write_x509_signature,
};
use crate::error::{err, ErrorKind, Result};
use crate::oid::{AlgorithmId, Oid};
use crate::provider::{CapabilityRegistry, ContextHandle};

use dn::{DistinguishedName, DnEmitForm, OID_EMAIL_ADDRESS, OID_RFC822_MAILBOX};
use spki::PublicKeyInfo;

pub static OID_EXT_SUBJECT_KEY_ID: Oid = Oid::img(b"\x06\x03\x55\x1D\x0E");
pub static OID_EXT_KEY_USAGE: Oid = Oid::img(b"\x06\x03\x55\x1D\x0F");
pub static OID_EXT_SUBJECT_ALT_NAME: Oid = Oid::img(b"\x06\x03\x55\x1D\x11");
pub static OID_EXT_ISSUER_ALT_NAME: Oid = Oid::img(b"\x06\x03\x55\x1D\x12");
pub static OID_EXT_BASIC_CONSTRAINTS: Oid = Oid::img(b"\x06\x03\x55\x1D\x13");
pub static OID_EXT_NAME_CONSTRAINTS: Oid = Oid::img(b"\x06\x03\x55\x1D\x1E");
pub static OID_EXT_CERT_POLICIES: Oid = Oid::img(b"\x06\x03\x55\x1D\x20");
pub static OID_EXT_AUTHORITY_KEY_ID: Oid = Oid::img(b"\x06\x03\x55\x1D\x23");
pub static OID_EXT_POLICY_CONSTRAINTS: Oid = Oid::img(b"\x06\x03\x55\x1D\x24");

/// One alternative name.  Only the forms the engine acts on are decoded;
/// everything else is skipped on read.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneralName {
    Rfc822(String),
    Dns(String),
    Uri(String),
    Directory(DistinguishedName),
}

impl GeneralName {
    fn read_all(reader: &mut BerReader, length: usize) -> Result<Vec<GeneralName>> {
        let end = reader.pos() + length;
        let mut names = Vec::new();
        while reader.pos() < end {
            let tag = reader.read_tag()?;
            let len = reader.read_length()?.definite()?;
            match tag & 0x1F {
                1 => names.push(GeneralName::Rfc822(ascii_string(reader.take(len)?)?)),
                2 => names.push(GeneralName::Dns(ascii_string(reader.take(len)?)?)),
                4 => {
                    // directoryName is EXPLICIT.
                    let dn = DistinguishedName::read(reader)?;
                    names.push(GeneralName::Directory(dn));
                }
                6 => names.push(GeneralName::Uri(ascii_string(reader.take(len)?)?)),
                _ => reader.skip(len)?,
            }
        }
        Ok(names)
    }

    fn write(&self, writer: &mut BerWriter) -> Result<()> {
        match self {
            GeneralName::Rfc822(s) => {
                writer.write_octet_string_tagged(crate::ber::ctag_primitive(1), s.as_bytes())
            }
            GeneralName::Dns(s) => {
                writer.write_octet_string_tagged(crate::ber::ctag_primitive(2), s.as_bytes())
            }
            GeneralName::Uri(s) => {
                writer.write_octet_string_tagged(crate::ber::ctag_primitive(6), s.as_bytes())
            }
            GeneralName::Directory(dn) => {
                writer.write_ctag(4, dn.sizeof(DnEmitForm::Original)?);
                dn.write(writer, None, DnEmitForm::Original)?;
            }
        }
        Ok(())
    }

    fn sizeof(&self) -> Result<usize> {
        Ok(match self {
            GeneralName::Rfc822(s) | GeneralName::Dns(s) | GeneralName::Uri(s) => {
                sizeof_object(s.len())
            }
            GeneralName::Directory(dn) => {
                sizeof_object(dn.sizeof(DnEmitForm::Original)?)
            }
        })
    }
}

fn ascii_string(bytes: &[u8]) -> Result<String> {
    if !bytes.is_ascii() {
        return err(ErrorKind::BadData);
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Decoded forms of the extensions the engine acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedExtension {
    BasicConstraints { ca: bool, path_len: Option<u32> },
    KeyUsage(u16),
    SubjectKeyIdentifier(Vec<u8>),
    AuthorityKeyIdentifier(Vec<u8>),
    SubjectAltName(Vec<GeneralName>),
    IssuerAltName(Vec<GeneralName>),
    NameConstraints { permitted: Vec<GeneralName>, excluded: Vec<GeneralName> },
    CertificatePolicies(Vec<Oid>),
    PolicyConstraints { require_explicit_policy: Option<u32>, inhibit_policy_mapping: Option<u32> },
}

/// Attribute-bag entry: criticality, OID, encoded value, decoded form for
/// recognized extensions.
#[derive(Debug, Clone)]
pub struct Extension {
    pub oid: Oid,
    pub critical: bool,
    pub value: Vec<u8>,
    pub decoded: Option<DecodedExtension>,
}

fn decode_extension(oid: &Oid, value: &[u8]) -> Option<DecodedExtension> {
    let mut reader = BerReader::new(value);
    let result = if *oid == OID_EXT_BASIC_CONSTRAINTS {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let end = reader.pos() + len;
        let mut ca = false;
        let mut path_len = None;
        if reader.pos() < end && reader.peek_tag().ok()? == BER_BOOLEAN {
            ca = reader.read_boolean().ok()?;
        }
        if reader.pos() < end {
            path_len = u32::try_from(reader.read_short_integer().ok()?).ok();
        }
        DecodedExtension::BasicConstraints { ca, path_len }
    } else if *oid == OID_EXT_KEY_USAGE {
        let bits = reader.read_bit_string(2).ok()?;
        let mut usage = 0u16;
        for (i, &b) in bits.iter().enumerate().take(2) {
            usage |= u16::from(b) << (8 * (1 - i));
        }
        DecodedExtension::KeyUsage(usage)
    } else if *oid == OID_EXT_SUBJECT_KEY_ID {
        DecodedExtension::SubjectKeyIdentifier(reader.read_octet_string(64).ok()?.to_vec())
    } else if *oid == OID_EXT_AUTHORITY_KEY_ID {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let end = reader.pos() + len;
        let mut key_id = Vec::new();
        if reader.pos() < end {
            if let Ok(Some(id_len)) = reader.check_ctag_primitive(0) {
                key_id = reader.take(id_len).ok()?.to_vec();
            }
        }
        DecodedExtension::AuthorityKeyIdentifier(key_id)
    } else if *oid == OID_EXT_SUBJECT_ALT_NAME || *oid == OID_EXT_ISSUER_ALT_NAME {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let names = GeneralName::read_all(&mut reader, len).ok()?;
        if *oid == OID_EXT_SUBJECT_ALT_NAME {
            DecodedExtension::SubjectAltName(names)
        } else {
            DecodedExtension::IssuerAltName(names)
        }
    } else if *oid == OID_EXT_NAME_CONSTRAINTS {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let end = reader.pos() + len;
        let mut permitted = Vec::new();
        let mut excluded = Vec::new();
        for (n, out) in [(0u8, &mut permitted), (1u8, &mut excluded)] {
            if reader.pos() < end {
                if let Ok(Some(sub_len)) = reader.check_ctag(n) {
                    let sub_len = sub_len.definite().ok()?;
                    let sub_end = reader.pos() + sub_len;
                    while reader.pos() < sub_end {
                        // GeneralSubtree ::= SEQUENCE { base, [0] min?, [1] max? }
                        let tree_len = reader.read_sequence().ok()?.definite().ok()?;
                        let tree_end = reader.pos() + tree_len;
                        let remaining = tree_end - reader.pos();
                        let mut names = GeneralName::read_all(&mut reader, remaining).ok()?;
                        out.append(&mut names);
                        reader.seek(tree_end);
                    }
                }
            }
        }
        DecodedExtension::NameConstraints { permitted, excluded }
    } else if *oid == OID_EXT_CERT_POLICIES {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let end = reader.pos() + len;
        let mut policies = Vec::new();
        while reader.pos() < end {
            let info_len = reader.read_sequence().ok()?.definite().ok()?;
            let info_end = reader.pos() + info_len;
            let image = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32).ok()?;
            policies.push(Oid::from_image(image));
            reader.seek(info_end); // qualifiers are recognized but unused
        }
        DecodedExtension::CertificatePolicies(policies)
    } else if *oid == OID_EXT_POLICY_CONSTRAINTS {
        let len = reader.read_sequence().ok()?.definite().ok()?;
        let end = reader.pos() + len;
        let mut require = None;
        let mut inhibit = None;
        if reader.pos() < end {
            if let Ok(Some(vl)) = reader.check_ctag_primitive(0) {
                require = read_small_uint(&mut reader, vl);
            }
        }
        if reader.pos() < end {
            if let Ok(Some(vl)) = reader.check_ctag_primitive(1) {
                inhibit = read_small_uint(&mut reader, vl);
            }
        }
        DecodedExtension::PolicyConstraints {
            require_explicit_policy: require,
            inhibit_policy_mapping: inhibit,
        }
    } else {
        return None;
    };
    Some(result)
}

fn read_small_uint(reader: &mut BerReader, len: usize) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..len.min(4) {
        value = (value << 8) | u32::from(reader.read_byte().ok()?);
    }
    Some(value)
}

/// Encode a decoded extension back into its value bytes; used by the
/// builder so callers work with typed values.
pub fn encode_extension_value(decoded: &DecodedExtension) -> Result<Vec<u8>> {
    let mut w = BerWriter::new();
    match decoded {
        DecodedExtension::BasicConstraints { ca, path_len } => {
            let mut content = 0;
            if *ca {
                content += crate::ber::sizeof_boolean();
            }
            if let Some(n) = path_len {
                content += crate::ber::sizeof_short_integer(i64::from(*n));
            }
            w.write_sequence(content);
            if *ca {
                w.write_boolean(true);
            }
            if let Some(n) = path_len {
                w.write_short_integer(i64::from(*n));
            }
        }
        DecodedExtension::KeyUsage(bits) => {
            w.write_bit_string(&bits.to_be_bytes());
        }
        DecodedExtension::SubjectKeyIdentifier(id) => w.write_octet_string(id),
        DecodedExtension::AuthorityKeyIdentifier(id) => {
            w.write_sequence(sizeof_object(id.len()));
            w.write_octet_string_tagged(crate::ber::ctag_primitive(0), id);
        }
        DecodedExtension::SubjectAltName(names) | DecodedExtension::IssuerAltName(names) => {
            let mut content = 0;
            for name in names {
                content += name.sizeof()?;
            }
            w.write_sequence(content);
            for name in names {
                name.write(&mut w)?;
            }
        }
        DecodedExtension::NameConstraints { permitted, excluded } => {
            let mut lists = Vec::new();
            for (n, names) in [(0u8, permitted), (1u8, excluded)] {
                if names.is_empty() {
                    continue;
                }
                let mut trees = 0;
                for name in names {
                    trees += sizeof_object(name.sizeof()?);
                }
                lists.push((n, trees));
            }
            let total: usize = lists.iter().map(|(_, t)| sizeof_object(*t)).sum();
            w.write_sequence(total);
            for (n, trees) in lists {
                w.write_ctag(n, trees);
                let names = if n == 0 { permitted } else { excluded };
                for name in names {
                    w.write_sequence(name.sizeof()?);
                    name.write(&mut w)?;
                }
            }
        }
        DecodedExtension::CertificatePolicies(policies) => {
            let content: usize =
                policies.iter().map(|p| sizeof_object(p.encoded_len())).sum();
            w.write_sequence(content);
            for policy in policies {
                w.write_sequence(policy.encoded_len());
                w.write_oid(policy);
            }
        }
        DecodedExtension::PolicyConstraints { require_explicit_policy, inhibit_policy_mapping } => {
            let mut content = 0;
            for value in [require_explicit_policy, inhibit_policy_mapping].into_iter().flatten() {
                content += sizeof_object(uint_len(*value));
            }
            w.write_sequence(content);
            for (n, value) in [(0u8, require_explicit_policy), (1u8, inhibit_policy_mapping)] {
                if let Some(v) = value {
                    let bytes = v.to_be_bytes();
                    let skip = uint_skip(*v);
                    w.write_octet_string_tagged(crate::ber::ctag_primitive(n), &bytes[skip..]);
                }
            }
        }
    }
    Ok(w.into_bytes())
}

fn uint_len(value: u32) -> usize {
    4 - uint_skip(value)
}

fn uint_skip(value: u32) -> usize {
    (value.leading_zeros() / 8).min(3) as usize
}

/// A parsed or assembled certificate.  Once signed it is immutable; the
/// retained encoding re-emits byte-identical DER.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub serial: Vec<u8>,
    pub signature_algorithm: AlgorithmId,
    pub signature_hash: AlgorithmId,
    pub issuer: DistinguishedName,
    pub subject: DistinguishedName,
    pub not_before: Time,
    pub not_after: Time,
    pub spki: PublicKeyInfo,
    pub extensions: Vec<Extension>,
    pub self_signed: bool,
    encoded: Vec<u8>,
    tbs_range: (usize, usize),
    signature: Vec<u8>,
    issuer_dn_der: Vec<u8>,
    subject_dn_der: Vec<u8>,
}

impl Certificate {
    /// Parse one certificate; returns it and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Certificate, usize)> {
        let mut reader = BerReader::new(data);
        let outer_len = reader.read_sequence()?.definite()?;
        let total = reader.pos() + outer_len;
        if total > data.len() {
            return err(ErrorKind::Underflow);
        }

        let tbs_start = reader.pos();
        let tbs_len = reader.read_sequence()?.definite()?;
        let tbs_content_end = reader.pos() + tbs_len;
        let tbs_range = (tbs_start, (reader.pos() - tbs_start) + tbs_len);

        // version [0] EXPLICIT, absent for v1.
        if reader.peek_tag()? == ctag(0) {
            reader.read_constructed(ctag(0))?.definite()?;
            reader.read_short_integer()?;
        }
        let serial = reader.read_static_integer(64)?.to_vec();
        let inner_sig = read_algorithm_identifier(&mut reader)?;
        if inner_sig.extra_len > 0 {
            reader.skip(inner_sig.extra_len)?;
        }

        let issuer_dn_start = reader.pos();
        let issuer = DistinguishedName::read(&mut reader)?;
        let issuer_dn_der = data[issuer_dn_start..reader.pos()].to_vec();

        reader.read_sequence()?.definite()?;
        let not_before = reader.read_time()?;
        let not_after = reader.read_time()?;

        let subject_dn_start = reader.pos();
        let subject = DistinguishedName::read(&mut reader)?;
        let subject_dn_der = data[subject_dn_start..reader.pos()].to_vec();

        let spki = PublicKeyInfo::read(&mut reader)?;

        // Skip issuerUniqueID/subjectUniqueID, decode extensions.
        let mut extensions = Vec::new();
        while reader.pos() < tbs_content_end {
            let tag = reader.peek_tag()?;
            if tag == ctag(3) {
                reader.read_constructed(ctag(3))?.definite()?;
                let ext_len = reader.read_sequence()?.definite()?;
                let ext_end = reader.pos() + ext_len;
                while reader.pos() < ext_end {
                    reader.read_sequence()?.definite()?;
                    let oid =
                        Oid::from_image(reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?);
                    let mut critical = false;
                    if reader.peek_tag()? == BER_BOOLEAN {
                        critical = reader.read_boolean()?;
                    }
                    let value = reader.read_octet_string(4096)?.to_vec();
                    let decoded = decode_extension(&oid, &value);
                    extensions.push(Extension { oid, critical, value, decoded });
                }
            } else {
                reader.read_universal()?;
            }
        }
        reader.seek(tbs_content_end);

        let sig = read_x509_signature(&mut reader)?;
        let consumed = reader.pos();
        if consumed != total {
            return err(ErrorKind::BadData);
        }

        let self_signed = subject == issuer;
        Ok((
            Certificate {
                serial,
                signature_algorithm: sig.signature_algorithm,
                signature_hash: sig.hash_algorithm,
                issuer,
                subject,
                not_before,
                not_after,
                spki,
                extensions,
                self_signed,
                encoded: data[..consumed].to_vec(),
                tbs_range,
                signature: sig.signature.to_vec(),
                issuer_dn_der,
                subject_dn_der,
            },
            consumed,
        ))
    }

    /// The certificate's own DER; byte-identical to the input it was parsed
    /// from.
    pub fn to_der(&self) -> &[u8] {
        &self.encoded
    }

    pub fn tbs_bytes(&self) -> &[u8] {
        &self.encoded[self.tbs_range.0..self.tbs_range.0 + self.tbs_range.1]
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Raw DER of the issuer and subject names, for byte-compare chaining.
    pub fn issuer_dn_der(&self) -> &[u8] {
        &self.issuer_dn_der
    }

    pub fn subject_dn_der(&self) -> &[u8] {
        &self.subject_dn_der
    }

    pub fn find_extension(&self, oid: &Oid) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.oid == *oid)
    }

    pub fn basic_constraints(&self) -> Option<(bool, Option<u32>)> {
        match self.find_extension(&OID_EXT_BASIC_CONSTRAINTS)?.decoded {
            Some(DecodedExtension::BasicConstraints { ca, path_len }) => Some((ca, path_len)),
            _ => None,
        }
    }

    pub fn path_len_constraint(&self) -> Option<u32> {
        self.basic_constraints().and_then(|(_, p)| p)
    }

    pub fn name_constraints(&self) -> Option<(&[GeneralName], &[GeneralName])> {
        match &self.find_extension(&OID_EXT_NAME_CONSTRAINTS)?.decoded {
            Some(DecodedExtension::NameConstraints { permitted, excluded }) => {
                Some((permitted, excluded))
            }
            _ => None,
        }
    }

    pub fn require_explicit_policy(&self) -> Option<u32> {
        match self.find_extension(&OID_EXT_POLICY_CONSTRAINTS)?.decoded {
            Some(DecodedExtension::PolicyConstraints { require_explicit_policy, .. }) => {
                require_explicit_policy
            }
            _ => None,
        }
    }

    pub fn policies(&self) -> Option<&[Oid]> {
        match &self.find_extension(&OID_EXT_CERT_POLICIES)?.decoded {
            Some(DecodedExtension::CertificatePolicies(p)) => Some(p),
            _ => None,
        }
    }

    pub fn subject_alt_names(&self) -> &[GeneralName] {
        match self
            .find_extension(&OID_EXT_SUBJECT_ALT_NAME)
            .and_then(|e| e.decoded.as_ref())
        {
            Some(DecodedExtension::SubjectAltName(names)) => names,
            _ => &[],
        }
    }

    /// `IssuerAndSerialNumber ::= SEQUENCE { issuer Name, serial INTEGER }`
    /// built from the retained issuer DN bytes.
    pub fn issuer_and_serial_der(&self) -> Vec<u8> {
        let mut writer = BerWriter::new();
        writer.write_sequence(self.issuer_dn_der.len() + sizeof_static_integer(&self.serial));
        writer.write_raw(&self.issuer_dn_der);
        writer.write_static_integer(&self.serial);
        writer.into_bytes()
    }

    pub fn matches_issuer_and_serial(&self, span: &[u8]) -> bool {
        self.issuer_and_serial_der() == span
    }

    pub fn key_id64(&self) -> Result<[u8; spki::KEYID_SIZE]> {
        self.spki.key_id64()
    }

    /// Verify this certificate's signature against an issuer public-key
    /// context.
    pub fn verify_signature(
        &self,
        registry: &CapabilityRegistry,
        issuer_key: &ContextHandle,
    ) -> Result<()> {
        let hash = registry.hash_buffer(self.signature_hash, self.tbs_bytes())?;
        registry.verify(issuer_key, self.signature_hash, &hash, &self.signature)
    }
}

/// Builder for an unsigned certificate: constructed blank, attributes
/// added, then signed into an immutable `Certificate`.
pub struct CertificateBuilder {
    pub serial: Vec<u8>,
    pub issuer: DistinguishedName,
    pub subject: DistinguishedName,
    pub not_before: Time,
    pub not_after: Time,
    pub spki: PublicKeyInfo,
    pub extensions: Vec<Extension>,
}

impl CertificateBuilder {
    pub fn new(
        subject: DistinguishedName,
        issuer: DistinguishedName,
        serial: Vec<u8>,
        not_before: Time,
        not_after: Time,
        spki: PublicKeyInfo,
    ) -> Self {
        CertificateBuilder {
            serial,
            issuer,
            subject,
            not_before,
            not_after,
            spki,
            extensions: Vec::new(),
        }
    }

    pub fn add_extension(&mut self, oid: Oid, critical: bool, decoded: DecodedExtension) -> Result<()> {
        if self.extensions.iter().any(|e| e.oid == oid) {
            return err(ErrorKind::DataDuplicate);
        }
        let value = encode_extension_value(&decoded)?;
        self.extensions.push(Extension { oid, critical, value, decoded: Some(decoded) });
        Ok(())
    }

    /// Migrate an email address found in a DN to subjectAltName.rfc822Name.
    /// Already present in the altName means the DN copy is dropped
    /// silently.
    fn convert_email_address(&mut self) -> Result<()> {
        let index = self
            .subject
            .find_by_oid(&OID_EMAIL_ADDRESS)
            .or_else(|| self.subject.find_by_oid(&OID_RFC822_MAILBOX));
        let Some(index) = index else {
            return Ok(());
        };
        let email = self.subject.remove_at(index).value;

        // Merge into an existing subjectAltName or create one.
        if let Some(ext) = self
            .extensions
            .iter_mut()
            .find(|e| e.oid == OID_EXT_SUBJECT_ALT_NAME)
        {
            if let Some(DecodedExtension::SubjectAltName(names)) = &mut ext.decoded {
                let already = names.iter().any(|n| match n {
                    GeneralName::Rfc822(existing) => {
                        strings::strings_equal(existing, &email)
                    }
                    _ => false,
                });
                if !already {
                    names.push(GeneralName::Rfc822(email));
                }
                ext.value = encode_extension_value(ext.decoded.as_ref().unwrap())?;
            }
            return Ok(());
        }
        let decoded = DecodedExtension::SubjectAltName(vec![GeneralName::Rfc822(email)]);
        let value = encode_extension_value(&decoded)?;
        self.extensions.push(Extension {
            oid: OID_EXT_SUBJECT_ALT_NAME.clone(),
            critical: false,
            value,
            decoded: Some(decoded),
        });
        Ok(())
    }

    fn sizeof_extensions(&self) -> usize {
        let mut inner = 0;
        for ext in &self.extensions {
            let mut content = ext.oid.encoded_len() + sizeof_object(ext.value.len());
            if ext.critical {
                content += crate::ber::sizeof_boolean();
            }
            inner += sizeof_object(content);
        }
        inner
    }

    fn write_tbs(
        &self,
        writer: &mut BerWriter,
        signature_algorithm: AlgorithmId,
        hash_algorithm: AlgorithmId,
    ) -> Result<()> {
        let version_size = sizeof_object(crate::ber::sizeof_short_integer(2));
        let validity_size = sizeof_object(2 * sizeof_object(13));
        let sig_id_size =
            sizeof_algorithm_identifier(signature_algorithm, Some(hash_algorithm), false, 0)?;
        let ext_inner = self.sizeof_extensions();
        let ext_size = if self.extensions.is_empty() {
            0
        } else {
            sizeof_object(sizeof_object(ext_inner))
        };
        let content = version_size
            + sizeof_static_integer(&self.serial)
            + sig_id_size
            + self.issuer.sizeof(DnEmitForm::Original)?
            + validity_size
            + self.subject.sizeof(DnEmitForm::Original)?
            + self.spki.sizeof()?
            + ext_size;

        writer.write_sequence(content);
        writer.write_ctag(0, crate::ber::sizeof_short_integer(2));
        writer.write_short_integer(2);
        writer.write_static_integer(&self.serial);
        write_algorithm_identifier(writer, signature_algorithm, Some(hash_algorithm), false, 0)?;
        self.issuer.write(writer, None, DnEmitForm::Original)?;
        writer.write_sequence(2 * sizeof_object(13));
        writer.write_utc_time(&self.not_before);
        writer.write_utc_time(&self.not_after);
        self.subject.write(writer, None, DnEmitForm::Original)?;
        self.spki.write(writer)?;
        if !self.extensions.is_empty() {
            writer.write_ctag(3, sizeof_object(ext_inner));
            writer.write_sequence(ext_inner);
            for ext in &self.extensions {
                let mut content = ext.oid.encoded_len() + sizeof_object(ext.value.len());
                if ext.critical {
                    content += crate::ber::sizeof_boolean();
                }
                writer.write_sequence(content);
                writer.write_oid(&ext.oid);
                if ext.critical {
                    writer.write_boolean(true);
                }
                writer.write_octet_string(&ext.value);
            }
        }
        Ok(())
    }

    /// Sign the TBS with the given key and freeze the certificate.
    pub fn sign(
        mut self,
        registry: &CapabilityRegistry,
        sign_key: &ContextHandle,
        hash_algorithm: AlgorithmId,
    ) -> Result<Certificate> {
        self.subject.check(true, false)?;
        self.convert_email_address()?;

        let signature_algorithm = AlgorithmId::Rsa;
        let mut tbs = BerWriter::new();
        self.write_tbs(&mut tbs, signature_algorithm, hash_algorithm)?;
        let tbs_bytes = tbs.into_bytes();

        let hash = registry.hash_buffer(hash_algorithm, &tbs_bytes)?;
        let signature = registry.sign(sign_key, hash_algorithm, &hash)?;

        let sig_size = sizeof_x509_signature(signature_algorithm, hash_algorithm, signature.len())?;
        let mut writer = BerWriter::new();
        writer.write_sequence(tbs_bytes.len() + sig_size);
        let tbs_start = writer.len();
        writer.write_raw(&tbs_bytes);
        write_x509_signature(&mut writer, signature_algorithm, hash_algorithm, &signature)?;
        let encoded = writer.into_bytes();

        let issuer_dn_der = self.issuer.to_der(DnEmitForm::Original)?;
        let subject_dn_der = self.subject.to_der(DnEmitForm::Original)?;
        let self_signed = self.subject == self.issuer;
        Ok(Certificate {
            serial: self.serial,
            signature_algorithm,
            signature_hash: hash_algorithm,
            issuer: self.issuer,
            subject: self.subject,
            not_before: self.not_before,
            not_after: self.not_after,
            spki: self.spki,
            extensions: self.extensions,
            self_signed,
            encoded,
            tbs_range: (tbs_start, tbs_bytes.len()),
            signature,
            issuer_dn_der,
            subject_dn_der,
        })
    }
}
