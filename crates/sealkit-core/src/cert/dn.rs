//! Distinguished names: an ordered sequence of RDNs, each a set of AVAs.
//! Recognized component types are kept in the fixed C < SP < L < O < OU < CN
//! order; anything else is carried in insertion order.

use crate::ber::{
    sizeof_object, BerReader, BerWriter, Length, BER_OBJECT_IDENTIFIER, BER_SEQUENCE, BER_SET,
};
use crate::cert::strings::{self, StringType};
use crate::error::{err, ErrorKind, Result};
use crate::oid::Oid;

/// Longest DN component value in characters.
pub const MAX_TEXT_SIZE: usize = 64;

/// Recognized DN component types, in sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DnKind {
    Country,
    StateOrProvince,
    Locality,
    Organization,
    OrganizationalUnit,
    CommonName,
}

pub struct DnComponentInfo {
    pub kind: Option<DnKind>,
    pub oid: Oid,
    /// Whether IA5String is acceptable on the wire for this component.
    pub ia5_ok: bool,
}

macro_rules! dn_oid {
    ($kind:expr, $oid:expr, $ia5:expr) => {
        DnComponentInfo { kind: $kind, oid: Oid::img($oid), ia5_ok: $ia5 }
    };
}

/// Component table.  The useful components come first; the rest can be read
/// and written but carry no dedicated accessor.
pub static DN_COMPONENTS: &[DnComponentInfo] = &[
    dn_oid!(Some(DnKind::CommonName), b"\x06\x03\x55\x04\x03", false),
    dn_oid!(Some(DnKind::Country), b"\x06\x03\x55\x04\x06", false),
    dn_oid!(Some(DnKind::Locality), b"\x06\x03\x55\x04\x07", false),
    dn_oid!(Some(DnKind::StateOrProvince), b"\x06\x03\x55\x04\x08", false),
    dn_oid!(Some(DnKind::Organization), b"\x06\x03\x55\x04\x0A", false),
    dn_oid!(Some(DnKind::OrganizationalUnit), b"\x06\x03\x55\x04\x0B", false),
    // Non-useful components
    dn_oid!(None, b"\x06\x03\x55\x04\x01", false), // aliasObjectName
    dn_oid!(None, b"\x06\x03\x55\x04\x02", false), // knowledgeInformation
    dn_oid!(None, b"\x06\x03\x55\x04\x04", false), // surname
    dn_oid!(None, b"\x06\x03\x55\x04\x05", false), // serialNumber
    dn_oid!(None, b"\x06\x03\x55\x04\x09", false), // streetAddress
    dn_oid!(None, b"\x06\x03\x55\x04\x0C", false), // title
    dn_oid!(None, b"\x06\x03\x55\x04\x0D", false), // description
    dn_oid!(None, b"\x06\x03\x55\x04\x0E", false), // searchGuide
    dn_oid!(None, b"\x06\x03\x55\x04\x0F", false), // businessCategory
    dn_oid!(None, b"\x06\x03\x55\x04\x10", false), // postalAddress
    dn_oid!(None, b"\x06\x03\x55\x04\x11", false), // postalCode
    dn_oid!(None, b"\x06\x03\x55\x04\x12", false), // postOfficeBox
    dn_oid!(None, b"\x06\x03\x55\x04\x13", false), // physicalDeliveryOfficeName
    dn_oid!(None, b"\x06\x03\x55\x04\x14", false), // telephoneNumber
    dn_oid!(None, b"\x06\x03\x55\x04\x2A", false), // givenName
    dn_oid!(None, b"\x06\x03\x55\x04\x2B", false), // initials
    dn_oid!(None, b"\x06\x03\x55\x04\x2C", false), // generationQualifier
    dn_oid!(None, b"\x06\x03\x55\x04\x2D", false), // uniqueIdentifier
    dn_oid!(None, b"\x06\x03\x55\x04\x2E", false), // dnQualifier
    dn_oid!(None, b"\x06\x09\x09\x92\x26\x89\x93\xF2\x2C\x01\x03", true), // rfc822Mailbox
    dn_oid!(None, b"\x06\x0A\x09\x92\x26\x89\x93\xF2\x2C\x64\x01\x01", true), // domainComponent
    dn_oid!(None, b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x09\x01", true), // emailAddress
];

pub static OID_EMAIL_ADDRESS: Oid =
    Oid::img(b"\x06\x09\x2A\x86\x48\x86\xF7\x0D\x01\x09\x01");
pub static OID_RFC822_MAILBOX: Oid =
    Oid::img(b"\x06\x09\x09\x92\x26\x89\x93\xF2\x2C\x01\x03");

fn component_index_by_kind(kind: DnKind) -> usize {
    DN_COMPONENTS
        .iter()
        .position(|c| c.kind == Some(kind))
        .expect("component table covers every recognized kind")
}

fn component_index_by_oid(oid: &[u8]) -> Option<usize> {
    DN_COMPONENTS.iter().position(|c| c.oid.as_image() == oid)
}

fn sort_order(kind: DnKind) -> u8 {
    match kind {
        DnKind::Country => 0,
        DnKind::StateOrProvince => 1,
        DnKind::Locality => 2,
        DnKind::Organization => 3,
        DnKind::OrganizationalUnit => 4,
        DnKind::CommonName => 5,
    }
}

/// ISO 3166 alpha-2 codes accepted for C=.
#[rustfmt::skip]
static COUNTRY_CODES: &[&str] = &[
    "AD", "AE", "AF", "AG", "AI", "AL", "AM", "AN", "AO", "AQ",
    "AR", "AS", "AT", "AU", "AW", "AZ", "BA", "BB", "BD", "BE",
    "BF", "BG", "BH", "BI", "BJ", "BM", "BN", "BO", "BR", "BS",
    "BT", "BV", "BW", "BY", "BZ", "CA", "CC", "CF", "CG", "CH",
    "CI", "CK", "CL", "CM", "CN", "CO", "CR", "CU", "CV", "CX",
    "CY", "CZ", "DE", "DJ", "DK", "DM", "DO", "DZ", "EC", "EE",
    "EG", "EH", "ER", "ES", "ET", "FI", "FJ", "FK", "FM", "FO",
    "FR", "FX", "GA", "GB", "GD", "GE", "GF", "GH", "GI", "GL",
    "GM", "GN", "GP", "GQ", "GR", "GS", "GT", "GU", "GW", "GY",
    "HK", "HM", "HN", "HR", "HT", "HU", "ID", "IE", "IL", "IN",
    "IO", "IQ", "IR", "IS", "IT", "JM", "JO", "JP", "KE", "KG",
    "KH", "KI", "KM", "KN", "KP", "KR", "KW", "KY", "KZ", "LA",
    "LB", "LC", "LI", "LK", "LR", "LS", "LT", "LU", "LV", "LY",
    "MA", "MC", "MD", "MG", "MH", "MK", "ML", "MM", "MN", "MO",
    "MP", "MQ", "MR", "MS", "MT", "MU", "MV", "MW", "MX", "MY",
    "MZ", "NA", "NC", "NE", "NF", "NG", "NI", "NL", "NO", "NP",
    "NR", "NU", "NZ", "OM", "PA", "PE", "PF", "PG", "PH", "PK",
    "PL", "PM", "PN", "PR", "PT", "PW", "PY", "QA", "RE", "RO",
    "RU", "RW", "SA", "SB", "SC", "SD", "SE", "SG", "SH", "SI",
    "SJ", "SK", "SL", "SM", "SN", "SO", "SR", "ST", "SV", "SY",
    "SZ", "TC", "TD", "TF", "TG", "TH", "TJ", "TK", "TM", "TN",
    "TO", "TP", "TR", "TT", "TV", "TW", "TZ", "UA", "UG", "UM",
    "US", "UY", "UZ", "VA", "VC", "VE", "VG", "VI", "VN", "VU",
    "WF", "WS", "YE", "YT", "YU", "ZA", "ZM", "ZR", "ZW",
];

fn check_country_code(code: &str) -> bool {
    COUNTRY_CODES.contains(&code)
}

/// Which value to emit for components read off the wire: the bytes as they
/// arrived, or the normalized form.  Broken peers check for their own
/// broken encodings coming back, so the raw form is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnEmitForm {
    #[default]
    Original,
    Normalized,
}

/// One attribute-value assertion.
#[derive(Debug, Clone)]
pub struct Ava {
    component: usize,
    pub value: String,
    pub string_type: StringType,
    /// As-encoded tag and bytes for values read off the wire.
    raw: Option<(u8, Vec<u8>)>,
    /// Set when the next AVA belongs to the same RDN.
    pub is_continued: bool,
    rdn_data_size: usize,
    ava_data_size: usize,
}

impl Ava {
    pub fn kind(&self) -> Option<DnKind> {
        DN_COMPONENTS[self.component].kind
    }

    pub fn type_oid(&self) -> &Oid {
        &DN_COMPONENTS[self.component].oid
    }
}

/// An ordered DN.  Equality comparison runs over the canonical string
/// forms; encoding preserves the original bytes unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct DistinguishedName {
    avas: Vec<Ava>,
}

impl DistinguishedName {
    pub fn new() -> Self {
        DistinguishedName { avas: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.avas.is_empty()
    }

    pub fn components(&self) -> &[Ava] {
        &self.avas
    }

    /// Add a caller-supplied component, sorted into the canonical position.
    /// A second component of the same recognized type is rejected.
    pub fn add_component(&mut self, kind: DnKind, value: &str) -> Result<()> {
        if value.chars().count() > MAX_TEXT_SIZE {
            return err(ErrorKind::Overflow);
        }
        if kind == DnKind::Country && value.chars().count() != 2 {
            return err(ErrorKind::BadData);
        }
        let mut value = value.to_owned();
        if kind == DnKind::Country {
            value.make_ascii_uppercase();
            if !check_country_code(&value) {
                return err(ErrorKind::BadData);
            }
        }
        let string_type = strings::classify(&value)?;

        // Find the insertion point, checking for duplicates on the way.
        let mut insert_at = self.avas.len();
        for (i, ava) in self.avas.iter().enumerate() {
            match ava.kind() {
                Some(existing) if existing == kind => return err(ErrorKind::DataDuplicate),
                Some(existing) if sort_order(existing) > sort_order(kind) => {
                    insert_at = i;
                    break;
                }
                // Foreign components sort after every recognized one.
                None => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        self.avas.insert(
            insert_at,
            Ava {
                component: component_index_by_kind(kind),
                value,
                string_type,
                raw: None,
                is_continued: false,
                rdn_data_size: 0,
                ava_data_size: 0,
            },
        );
        Ok(())
    }

    /// Append a component read from an external certificate; wire order is
    /// preserved rather than re-sorted.
    fn append_wire_component(
        &mut self,
        component: usize,
        value: String,
        string_type: StringType,
        raw: (u8, Vec<u8>),
        is_continued: bool,
    ) -> Result<()> {
        let max = if string_type == StringType::Bmp { MAX_TEXT_SIZE * 2 } else { MAX_TEXT_SIZE };
        if raw.1.len() > max {
            return err(ErrorKind::Overflow);
        }
        self.avas.push(Ava {
            component,
            value,
            string_type,
            raw: Some(raw),
            is_continued,
            rdn_data_size: 0,
            ava_data_size: 0,
        });
        Ok(())
    }

    pub fn find(&self, kind: DnKind) -> Option<&Ava> {
        self.avas.iter().find(|ava| ava.kind() == Some(kind))
    }

    pub fn find_by_oid(&self, oid: &Oid) -> Option<usize> {
        self.avas
            .iter()
            .position(|ava| ava.type_oid().as_image() == oid.as_image())
    }

    pub fn remove_at(&mut self, index: usize) -> Ava {
        let removed = self.avas.remove(index);
        // Keep the RDN grouping coherent if the removed AVA closed one.
        if index > 0 && !removed.is_continued {
            if let Some(prev) = self.avas.get_mut(index - 1) {
                prev.is_continued = false;
            }
        }
        removed
    }

    pub fn delete_component(&mut self, kind: DnKind) -> Result<()> {
        match self.avas.iter().position(|ava| ava.kind() == Some(kind)) {
            Some(index) => {
                self.remove_at(index);
                Ok(())
            }
            None => err(ErrorKind::DataNotFound),
        }
    }

    /// Component-wise equality over canonical string forms.  With
    /// `substring` set, a DN that is a proper prefix of the other matches,
    /// which is what constraint checking needs.
    pub fn matches(&self, other: &DistinguishedName, substring: bool) -> bool {
        let mut a = self.avas.iter();
        let mut b = other.avas.iter();
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) => {
                    if x.type_oid().as_image() != y.type_oid().as_image() {
                        return false;
                    }
                    if !strings::strings_equal(&x.value, &y.value) {
                        return false;
                    }
                }
                (None, None) => return true,
                (None, Some(_)) => return substring,
                (Some(_), None) => return false,
            }
        }
    }

    /// Make sure critical components are present and valid.  Filter DNs
    /// (constraints) may omit the CN, CA-bound requests may omit the C.
    pub fn check(&self, check_cn: bool, check_c: bool) -> Result<()> {
        let mut has_country = false;
        let mut has_common_name = false;
        for ava in &self.avas {
            match ava.kind() {
                Some(DnKind::Country) => {
                    if !check_country_code(&ava.value.to_ascii_uppercase()) {
                        return err(ErrorKind::BadData);
                    }
                    has_country = true;
                }
                Some(DnKind::CommonName) => has_common_name = true,
                _ => {}
            }
        }
        if (check_c && !has_country) || (check_cn && !has_common_name) {
            return err(ErrorKind::NotInitialized);
        }
        Ok(())
    }

    fn emit_bytes(&self, ava: &Ava, form: DnEmitForm) -> Result<(u8, Vec<u8>)> {
        if form == DnEmitForm::Original {
            if let Some((tag, bytes)) = &ava.raw {
                return Ok((*tag, bytes.clone()));
            }
        }
        let info = &DN_COMPONENTS[ava.component];
        let string_type = match ava.string_type {
            StringType::Ia5 if !info.ia5_ok => StringType::T61,
            other => other,
        };
        Ok((string_type.tag(), strings::encode_string(&ava.value, string_type)?))
    }

    /// Compute per-AVA and per-RDN encoded sizes; returns the total DN
    /// content length.
    fn pre_encode(&mut self, form: DnEmitForm) -> Result<usize> {
        let mut total = 0;
        let mut i = 0;
        while i < self.avas.len() {
            let rdn_start = i;
            let mut rdn_data_size = 0;
            loop {
                let (_, bytes) = self.emit_bytes(&self.avas[i], form)?;
                let ava_data_size =
                    self.avas[i].type_oid().encoded_len() + sizeof_object(bytes.len());
                self.avas[i].ava_data_size = ava_data_size;
                self.avas[i].rdn_data_size = 0;
                rdn_data_size += sizeof_object(ava_data_size);
                let continued = self.avas[i].is_continued;
                i += 1;
                if !continued || i >= self.avas.len() {
                    break;
                }
            }
            self.avas[rdn_start].rdn_data_size = rdn_data_size;
            total += sizeof_object(rdn_data_size);
        }
        Ok(total)
    }

    pub fn sizeof(&self, form: DnEmitForm) -> Result<usize> {
        let mut copy = self.clone();
        Ok(sizeof_object(copy.pre_encode(form)?))
    }

    /// Write the DN.  `tag` replaces the outer SEQUENCE with a constructed
    /// context tag when given.
    pub fn write(&self, writer: &mut BerWriter, tag: Option<u8>, form: DnEmitForm) -> Result<()> {
        let mut copy = self.clone();
        let size = copy.pre_encode(form)?;
        match tag {
            Some(n) => writer.write_ctag(n, size),
            None => writer.write_header(BER_SEQUENCE, size),
        }
        for ava in &copy.avas {
            if ava.rdn_data_size != 0 {
                writer.write_header(BER_SET, ava.rdn_data_size);
            }
            writer.write_header(BER_SEQUENCE, ava.ava_data_size);
            writer.write_oid(ava.type_oid());
            let (string_tag, bytes) = copy.emit_bytes(ava, form)?;
            writer.write_character_string(string_tag, &bytes);
        }
        Ok(())
    }

    pub fn to_der(&self, form: DnEmitForm) -> Result<Vec<u8>> {
        let mut writer = BerWriter::new();
        self.write(&mut writer, None, form)?;
        Ok(writer.into_bytes())
    }

    /// Read a DN.  Unknown component OIDs are rejected; chances are any OID
    /// that peculiar is an error.
    pub fn read(reader: &mut BerReader) -> Result<Self> {
        let length = reader.read_sequence()?.definite()?;
        Self::read_content(reader, length)
    }

    pub fn read_tagged(reader: &mut BerReader, tag: u8) -> Result<Self> {
        let length = reader.read_constructed(tag)?.definite()?;
        Self::read_content(reader, length)
    }

    fn read_content(reader: &mut BerReader, length: usize) -> Result<Self> {
        let mut dn = DistinguishedName::new();
        let end = reader.pos() + length;
        while reader.pos() < end {
            let rdn_length = reader.read_set()?.definite()?;
            let rdn_end = reader.pos() + rdn_length;
            while reader.pos() < rdn_end {
                reader.read_sequence()?.definite()?;
                let oid = reader.read_raw_object(BER_OBJECT_IDENTIFIER, 32)?;
                let component = component_index_by_oid(oid).ok_or(ErrorKind::BadData)?;
                let string_tag = reader.read_tag()?;
                let value_len = match reader.read_length()? {
                    Length::Definite(len) => len,
                    Length::Indefinite => return err(ErrorKind::BadData),
                };
                let bytes = reader.take(value_len)?.to_vec();
                let (value, inferred) = strings::decode_wire_string(string_tag, &bytes)?;
                let is_continued = reader.pos() < rdn_end;
                dn.append_wire_component(
                    component,
                    value,
                    inferred,
                    (string_tag, bytes),
                    is_continued,
                )?;
            }
            if reader.pos() != rdn_end {
                return err(ErrorKind::BadData);
            }
        }
        if reader.pos() != end {
            return err(ErrorKind::BadData);
        }
        Ok(dn)
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other, false)
    }
}

impl Eq for DistinguishedName {}

#[cfg(test)]
mod tests {
    use super::*;

    fn dave() -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.add_component(DnKind::CommonName, "Dave Smith ").unwrap();
        dn.add_component(DnKind::Organization, "Dave's Wetaburgers").unwrap();
        dn
    }

    #[test]
    fn sort_order_is_canonical() {
        let mut dn = DistinguishedName::new();
        dn.add_component(DnKind::CommonName, "Dave Smith").unwrap();
        dn.add_component(DnKind::Country, "nz").unwrap();
        dn.add_component(DnKind::Organization, "Wetaburgers").unwrap();
        let kinds: Vec<_> = dn.components().iter().map(|a| a.kind().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![DnKind::Country, DnKind::Organization, DnKind::CommonName]
        );
        // Country is upper-cased per ISO 3166.
        assert_eq!(dn.find(DnKind::Country).unwrap().value, "NZ");
    }

    #[test]
    fn duplicate_component_rejected() {
        let mut dn = dave();
        assert_eq!(
            dn.add_component(DnKind::CommonName, "Someone Else")
                .unwrap_err()
                .kind(),
            ErrorKind::DataDuplicate
        );
    }

    #[test]
    fn bad_country_code_rejected() {
        let mut dn = DistinguishedName::new();
        assert!(dn.add_component(DnKind::Country, "XX").is_err());
        assert!(dn.add_component(DnKind::Country, "USA").is_err());
    }

    #[test]
    fn canonical_equality() {
        let mut other = DistinguishedName::new();
        other.add_component(DnKind::CommonName, "dave  smith").unwrap();
        other
            .add_component(DnKind::Organization, "Dave's Wetaburgers")
            .unwrap();
        assert_eq!(dave(), other);
        assert!(dave().matches(&other, false));
        assert!(other.matches(&dave(), false));
    }

    #[test]
    fn substring_match_for_constraints() {
        let mut parent = DistinguishedName::new();
        parent.add_component(DnKind::Country, "US").unwrap();
        parent.add_component(DnKind::Organization, "Wetaburgers").unwrap();
        let mut child = parent.clone();
        child.add_component(DnKind::CommonName, "Dave").unwrap();
        assert!(parent.matches(&child, true));
        assert!(!parent.matches(&child, false));
    }

    #[test]
    fn der_roundtrip_preserves_bytes() {
        let dn = dave();
        let der = dn.to_der(DnEmitForm::Normalized).unwrap();
        let mut reader = BerReader::new(&der);
        let parsed = DistinguishedName::read(&mut reader).unwrap();
        assert_eq!(parsed, dn);
        // A reparsed DN re-emits its original bytes by default.
        assert_eq!(parsed.to_der(DnEmitForm::Original).unwrap(), der);
    }

    #[test]
    fn sizeof_matches_write() {
        let dn = dave();
        let der = dn.to_der(DnEmitForm::Normalized).unwrap();
        assert_eq!(der.len(), dn.sizeof(DnEmitForm::Normalized).unwrap());
    }
}
