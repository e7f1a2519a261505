//! Certificate chains: ordering an unordered bag into leaf-to-root form,
//! walking the chain for trust, and propagating path/name/policy
//! constraints.
//!
//! Chaining uses DN equality on the encoded bytes only.  Key identifier
//! extensions are read but not relied on for topology; too many of the
//! chains in circulation get them wrong for that to be safe.

use std::sync::Arc;

use crate::ber::{sizeof_object, BerReader, BerWriter, Length};
use crate::cert::trust::TrustStore;
use crate::cert::{Certificate, GeneralName, OID_EXT_BASIC_CONSTRAINTS, OID_EXT_CERT_POLICIES,
    OID_EXT_NAME_CONSTRAINTS, OID_EXT_POLICY_CONSTRAINTS};
use crate::cms::header::{read_cms_header, ContentKind, OidSelection};
use crate::error::{err, Error, ErrorKind, ErrorLocus, Result};
use crate::oid::{Mode, OID_CMS_DATA, OID_CMS_SIGNEDDATA};
use crate::provider::CapabilityRegistry;
use tracing::{debug, warn};

/// Longest chain we accept.
pub const MAX_CHAIN_LENGTH: usize = 16;

/// Locus detail codes for trust-walk failures.
pub const DETAIL_MISSING_CERTIFICATE: i64 = 1;
pub const DETAIL_ROOT_NOT_TRUSTED: i64 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChainOptions {
    /// Accept a self-signed root that is not an explicit trust anchor.
    pub trust_chain_root: bool,
    /// Chain came from a trusted private store; skip signature checks.
    pub data_only: bool,
}

/// Leaf-to-root certificate sequence, canonicalised on construction.
#[derive(Debug, Clone)]
pub struct CertChain {
    certs: Vec<Arc<Certificate>>,
}

impl CertChain {
    /// Order an unordered bag of certificates.  The leaf is found by
    /// descending `issuer == subject` links; unused certificates are
    /// discarded.
    pub fn from_unordered(bag: Vec<Arc<Certificate>>) -> Result<CertChain> {
        if bag.is_empty() {
            return err(ErrorKind::DataNotFound);
        }
        if bag.len() > MAX_CHAIN_LENGTH {
            return err(ErrorKind::Overflow);
        }
        let leaf_index = find_leaf(&bag);
        let leaf = Arc::clone(&bag[leaf_index]);
        Self::from_leaf(leaf, bag, Some(leaf_index))
    }

    /// Order a bag around a known leaf.
    pub fn from_leaf(
        leaf: Arc<Certificate>,
        bag: Vec<Arc<Certificate>>,
        leaf_index: Option<usize>,
    ) -> Result<CertChain> {
        let mut used = vec![false; bag.len()];
        if let Some(index) = leaf_index {
            used[index] = true;
        } else {
            // The leaf may also appear in the bag; don't chain it to itself.
            for (i, cert) in bag.iter().enumerate() {
                if Arc::ptr_eq(cert, &leaf) {
                    used[i] = true;
                }
            }
        }
        let mut certs = vec![leaf];
        loop {
            let parent_dn = certs.last().expect("nonempty").issuer_dn_der().to_vec();
            let current_self_signed = certs.last().expect("nonempty").self_signed;
            if current_self_signed {
                break;
            }
            let next = bag.iter().enumerate().find(|(i, cert)| {
                !used[*i] && cert.subject_dn_der() == parent_dn.as_slice()
            });
            match next {
                Some((i, cert)) => {
                    used[i] = true;
                    if certs.len() >= MAX_CHAIN_LENGTH {
                        return err(ErrorKind::Overflow);
                    }
                    certs.push(Arc::clone(cert));
                }
                None => break,
            }
        }
        // Anything left in the bag is a dead branch and gets dropped here.
        Ok(CertChain { certs })
    }

    pub fn certs(&self) -> &[Arc<Certificate>] {
        &self.certs
    }

    pub fn leaf(&self) -> &Arc<Certificate> {
        &self.certs[0]
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Verify the chain: trust resolution, per-link signatures, and the
    /// constraint checks.  `chain[i].subject == chain[i-1].issuer` holds by
    /// construction; everything else is checked here.
    pub fn check(
        &self,
        registry: &CapabilityRegistry,
        trust: &TrustStore,
        options: ChainOptions,
    ) -> Result<()> {
        // An implicitly trusted leaf needs nothing further.
        if trust.is_trusted(self.leaf().subject_dn_der()) {
            return Ok(());
        }

        // Walk up from the leaf's issuer looking for an explicitly trusted
        // key.
        let mut trusted_key = None;
        let mut trusted_index = self.certs.len();
        for (i, cert) in self.certs.iter().enumerate() {
            if let Some(key) = trust.trusted_key(cert.issuer_dn_der())? {
                trusted_key = Some(key);
                trusted_index = i;
                break;
            }
        }

        debug!(
            chain_len = self.certs.len(),
            trusted_index,
            "walking certificate chain"
        );
        let mut start_trusted = true;
        if trusted_key.is_none() {
            let top = self.certs.last().expect("nonempty");
            if top.self_signed && options.trust_chain_root {
                // A self-signed root is present but not anchored; continue
                // without the trust flag.
                trusted_index = self.certs.len() - 1;
                trusted_key = Some(top.spki.clone());
                start_trusted = false;
            } else {
                warn!(
                    self_signed = top.self_signed,
                    "chain terminates at an untrusted certificate"
                );
                let locus = ErrorLocus {
                    cert_index: Some(self.certs.len() - 1),
                    attribute: None,
                    detail: Some(if top.self_signed {
                        DETAIL_ROOT_NOT_TRUSTED
                    } else {
                        DETAIL_MISSING_CERTIFICATE
                    }),
                };
                let kind = if top.self_signed {
                    ErrorKind::InvalidConstraint
                } else {
                    ErrorKind::DataNotFound
                };
                return Err(Error::with_locus(kind, locus));
            }
        }

        // Walk down from the trust point, verifying each link and the
        // constraints each certificate imposes on everything below it.
        // For an unanchored self-signed root the first check is the root's
        // own signature.
        let trusted_key = trusted_key.expect("resolved above");
        let make_context = |key: &crate::cert::spki::PublicKeyInfo| -> Result<_> {
            let context = registry.create_context(key.algorithm(), Mode::Pkc)?;
            registry.load_key(&context, &key.to_der()?)?;
            Ok(context)
        };
        let mut index = trusted_index;
        let mut issuer_info = if start_trusted {
            trusted_key
        } else {
            self.certs[index].spki.clone()
        };
        loop {
            let subject = &self.certs[index];
            if !options.data_only {
                let key_context = make_context(&issuer_info)?;
                subject.verify_signature(registry, &key_context).map_err(|e| {
                    Error::with_locus(
                        e.kind(),
                        ErrorLocus { cert_index: Some(index), attribute: None, detail: None },
                    )
                })?;
            }
            self.check_constraints(index)?;
            if index == 0 {
                break;
            }
            issuer_info = subject.spki.clone();
            index -= 1;
        }
        Ok(())
    }

    /// Check path-length, name and policy constraints carried by the
    /// certificate at `position` against everything below it.  Checks run
    /// on demand rather than through a running constraint set; chains are
    /// short and constraints rare.
    fn check_constraints(&self, position: usize) -> Result<()> {
        let issuer = &self.certs[position];

        // Path length: with a constraint of n, the immediate subject may
        // have no more than n certificates below it.
        if let Some(path_len) = issuer.path_len_constraint() {
            if !issuer.self_signed && position > 0 {
                let below_subject = position - 1;
                if below_subject > path_len as usize {
                    return Err(constraint_error(position, &OID_EXT_BASIC_CONSTRAINTS));
                }
            }
        }
        if position == 0 {
            return Ok(());
        }

        let name_constraints = issuer.name_constraints();
        let issuer_policies = issuer.policies();
        let require_explicit = issuer.require_explicit_policy();
        if name_constraints.is_none() && require_explicit.is_none() {
            return Ok(());
        }

        let mut policy_skip = require_explicit.map(i64::from);
        for below in (0..position).rev() {
            let subject = &self.certs[below];

            // A second requireExplicitPolicy below the first that
            // contradicts it is a constraint violation.
            if let (Some(first), Some(second)) =
                (require_explicit, subject.require_explicit_policy())
            {
                if first != second {
                    return Err(constraint_error(below, &OID_EXT_POLICY_CONSTRAINTS));
                }
            }

            if let Some((permitted, excluded)) = name_constraints {
                if name_matches_any(subject, excluded) {
                    return Err(constraint_error(below, &OID_EXT_NAME_CONSTRAINTS));
                }
                if !permitted.is_empty() && !name_matches_any(subject, permitted) {
                    return Err(constraint_error(below, &OID_EXT_NAME_CONSTRAINTS));
                }
            }

            if let Some(skip) = &mut policy_skip {
                if *skip > 0 {
                    *skip -= 1;
                } else {
                    let ok = match (issuer_policies, subject.policies()) {
                        // Policy mapping is recognized but not applied; the
                        // subject must carry one of the issuer's policies
                        // verbatim.
                        (Some(issuer_set), Some(subject_set)) => {
                            subject_set.iter().any(|p| issuer_set.contains(p))
                        }
                        (None, Some(_)) => true,
                        _ => false,
                    };
                    if !ok {
                        return Err(constraint_error(below, &OID_EXT_CERT_POLICIES));
                    }
                }
            }
        }
        Ok(())
    }

    /// DER-encode the chain as PKCS #7 `SignedData` bagging (version 1,
    /// empty digest algorithms, data content, `[0]` certificates, empty
    /// signer infos).
    pub fn write_pkcs7(&self, writer: &mut BerWriter) {
        let cert_seq_len: usize = self.certs.iter().map(|c| c.to_der().len()).sum();
        let inner = crate::ber::sizeof_short_integer(1)
            + sizeof_object(0)
            + sizeof_object(OID_CMS_DATA.encoded_len())
            + sizeof_object(cert_seq_len)
            + sizeof_object(0);
        let length = OID_CMS_SIGNEDDATA.encoded_len() + sizeof_object(sizeof_object(inner));

        writer.write_sequence(length);
        writer.write_oid(&OID_CMS_SIGNEDDATA);
        writer.write_ctag(0, sizeof_object(inner));
        writer.write_sequence(inner);
        writer.write_short_integer(1);
        writer.write_set(0);
        writer.write_sequence(OID_CMS_DATA.encoded_len());
        writer.write_oid(&OID_CMS_DATA);
        writer.write_ctag(0, cert_seq_len);
        for cert in &self.certs {
            writer.write_raw(cert.to_der());
        }
        writer.write_set(0);
    }

    /// The bare CMS certificate-set form used inside SignedData.
    pub fn write_cert_set(&self, writer: &mut BerWriter) {
        let cert_seq_len: usize = self.certs.iter().map(|c| c.to_der().len()).sum();
        writer.write_ctag(0, cert_seq_len);
        for cert in &self.certs {
            writer.write_raw(cert.to_der());
        }
    }

    pub fn sizeof_cert_set(&self) -> usize {
        sizeof_object(self.certs.iter().map(|c| c.to_der().len()).sum())
    }

    /// Read a PKCS #7 chain, ordering and discarding as for any other bag.
    pub fn read_pkcs7(reader: &mut BerReader) -> Result<CertChain> {
        static SELECTION: &[OidSelection] = &[OidSelection {
            oid: &OID_CMS_SIGNEDDATA,
            versions: None,
            selection: ContentKind::SignedData,
        }];
        let (_, _) = read_cms_header(reader, SELECTION)?;
        reader.read_short_integer()?; // version
        let digest_algos = reader.read_set()?.definite()?;
        reader.skip(digest_algos)?;
        reader.read_sequence()?.definite()?;
        reader.read_expected_oid(&OID_CMS_DATA)?;
        reader.check_eoc();
        let length = match reader.read_constructed(crate::ber::ctag(0))? {
            Length::Definite(len) => len,
            Length::Indefinite => return err(ErrorKind::BadData),
        };
        Self::read_cert_bag(reader, length)
    }

    /// Read a sequence of concatenated certificates.
    pub fn read_cert_bag(reader: &mut BerReader, length: usize) -> Result<CertChain> {
        let end = reader.pos() + length;
        let mut bag = Vec::new();
        while reader.pos() < end {
            let span_start = reader.pos();
            let remaining = end - span_start;
            let data = reader.take(remaining)?;
            let (cert, consumed) = Certificate::parse(data)?;
            reader.seek(span_start + consumed);
            if bag.len() >= MAX_CHAIN_LENGTH {
                return err(ErrorKind::Overflow);
            }
            bag.push(Arc::new(cert));
        }
        CertChain::from_unordered(bag)
    }
}

fn constraint_error(cert_index: usize, attribute: &crate::oid::Oid) -> Error {
    Error::with_locus(
        ErrorKind::InvalidConstraint,
        ErrorLocus {
            cert_index: Some(cert_index),
            attribute: Some(attribute.clone()),
            detail: None,
        },
    )
}

/// Find the leaf: starting anywhere, repeatedly look for a certificate
/// issued by the current one; when none exists the current one is the
/// leaf.
fn find_leaf(bag: &[Arc<Certificate>]) -> usize {
    let mut used = vec![false; bag.len()];
    let mut current = 0usize;
    used[0] = true;
    loop {
        let subject_dn = bag[current].subject_dn_der();
        let next = bag
            .iter()
            .enumerate()
            .find(|(i, cert)| !used[*i] && cert.issuer_dn_der() == subject_dn);
        match next {
            Some((i, _)) => {
                used[i] = true;
                current = i;
            }
            None => return current,
        }
    }
}

/// Whether any of the subject's names fall within any of the given
/// subtrees.  Directory constraints match by DN prefix, the text forms by
/// case-insensitive tail.
fn name_matches_any(cert: &Certificate, subtrees: &[GeneralName]) -> bool {
    subtrees.iter().any(|subtree| match subtree {
        GeneralName::Directory(constraint) => constraint.matches(&cert.subject, true),
        GeneralName::Rfc822(tail) => cert.subject_alt_names().iter().any(|n| match n {
            GeneralName::Rfc822(name) => ends_with_fold(name, tail),
            _ => false,
        }),
        GeneralName::Dns(tail) => cert.subject_alt_names().iter().any(|n| match n {
            GeneralName::Dns(name) => ends_with_fold(name, tail),
            _ => false,
        }),
        GeneralName::Uri(tail) => cert.subject_alt_names().iter().any(|n| match n {
            GeneralName::Uri(name) => ends_with_fold(name, tail),
            _ => false,
        }),
    })
}

fn ends_with_fold(name: &str, tail: &str) -> bool {
    name.to_ascii_lowercase().ends_with(&tail.to_ascii_lowercase())
}

/// Verify a lone certificate against a trust store, walking whatever chain
/// accompanies it.
pub fn verify_with_trust(
    chain: &CertChain,
    registry: &CapabilityRegistry,
    trust: &TrustStore,
    options: ChainOptions,
) -> Result<()> {
    chain.check(registry, trust, options)
}
