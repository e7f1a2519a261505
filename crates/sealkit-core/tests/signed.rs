//! Signed-data envelopes: CMS signer infos with authenticated attributes,
//! the extended key-ID form, and detached signatures.

use std::sync::Arc;

use sealkit_core::ber::Time;
use sealkit_core::cert::dn::{DistinguishedName, DnKind};
use sealkit_core::cert::CertificateBuilder;
use sealkit_core::cms::attributes::{Classification, CmsAttributes, SecurityLabel};
use sealkit_core::envelope::{Envelope, EnvelopeInfo, EnvelopeMode, PkcObject};
use sealkit_core::error::ErrorKind;
use sealkit_core::oid::{
    Oid, OID_CMS_CONTENTTYPE, OID_CMS_MESSAGEDIGEST, OID_CMS_SIGNINGTIME,
};
use sealkit_core::oid::{AlgorithmId, Mode};
use sealkit_core::provider::{CapabilityRegistry, ContextHandle};
use sealkit_core::testkeys;
use sealkit_core::{Certificate, FormatType};

const TEST_DATA: &[u8] = b"Some test data\0";

fn drain(envelope: &mut Envelope) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = envelope.pop(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    out
}

fn signer_setup(registry: &CapabilityRegistry) -> (Arc<Certificate>, ContextHandle) {
    let key = testkeys::rsa512_private_parts();
    let private = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry.load_key(&private, &key.to_der()).unwrap();

    let mut dn = DistinguishedName::new();
    dn.add_component(DnKind::Country, "NZ").unwrap();
    dn.add_component(DnKind::Organization, "Dave's Wetaburgers").unwrap();
    dn.add_component(DnKind::CommonName, "Dave Smith").unwrap();

    let builder = CertificateBuilder::new(
        dn.clone(),
        dn,
        vec![0x01, 0x02],
        Time::new(2024, 1, 1, 0, 0, 0).unwrap(),
        Time::new(2034, 1, 1, 0, 0, 0).unwrap(),
        key.public(),
    );
    let cert = builder.sign(registry, &private, AlgorithmId::Sha1).unwrap();
    (Arc::new(cert), private)
}

fn security_label() -> SecurityLabel {
    SecurityLabel {
        // 1.3.6.1.4.1.9999.1
        policy: Oid::from_image(b"\x06\x08\x2B\x06\x01\x04\x01\xCE\x0F\x01"),
        classification: Some(Classification::Secret),
    }
}

#[test]
fn cms_signed_data_with_security_label() {
    let registry = CapabilityRegistry::software();
    let (cert, private) = signer_setup(&registry);

    let mut attributes = CmsAttributes::new();
    attributes.add_security_label(&security_label()).unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cms, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Signature(PkcObject::Certificate {
        certificate: Arc::clone(&cert),
        context: private,
    }))
    .unwrap();
    env.add_info(EnvelopeInfo::SignatureExtraData(attributes)).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Cms, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);

    // The certificate travelled with the message; verification uses it.
    de.verify_signature().unwrap();
    let attributes = de.signature_attributes().expect("signing attributes");
    assert_eq!(attributes.security_label().unwrap(), security_label());
    assert!(attributes.signing_time().is_some());
}

#[test]
fn default_attribute_set_is_exactly_three_in_der_order() {
    let registry = CapabilityRegistry::software();
    let (cert, private) = signer_setup(&registry);

    let mut env = Envelope::new(registry.clone(), FormatType::Cms, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Signature(PkcObject::Certificate {
        certificate: cert,
        context: private,
    }))
    .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Cms, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    let _ = drain(&mut de);
    de.verify_signature().unwrap();

    let entry = de
        .content_list()
        .entries()
        .iter()
        .find(|e| e.signed_attribute_bytes().is_some())
        .expect("signer info with attributes");
    let parsed = CmsAttributes::parse(entry.signed_attribute_bytes().unwrap()).unwrap();
    let oids: Vec<_> = parsed.iter().map(|a| a.oid.clone()).collect();
    assert_eq!(
        oids,
        vec![
            OID_CMS_CONTENTTYPE.clone(),
            OID_CMS_SIGNINGTIME.clone(),
            OID_CMS_MESSAGEDIGEST.clone()
        ]
    );
}

#[test]
fn extended_signature_roundtrip_by_key_id() {
    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();
    let private = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry.load_key(&private, &key.to_der()).unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Signature(PkcObject::Context(private)))
        .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);

    // No certs travel in this form; the caller supplies the public key.
    let public = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&public, &key.public().to_der().unwrap())
        .unwrap();
    de.add_info(EnvelopeInfo::Signature(PkcObject::Context(public)))
        .unwrap();
}

#[test]
fn tampered_content_fails_verification() {
    let registry = CapabilityRegistry::software();
    let (cert, private) = signer_setup(&registry);

    let mut env = Envelope::new(registry.clone(), FormatType::Cms, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Signature(PkcObject::Certificate {
        certificate: cert,
        context: private,
    }))
    .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let mut enveloped = drain(&mut env);

    // Flip one payload byte: locate the content bytes and tamper.
    let offset = enveloped
        .windows(TEST_DATA.len())
        .position(|w| w == TEST_DATA)
        .expect("payload present in clear");
    enveloped[offset] ^= 0x01;

    let mut de = Envelope::new(registry, FormatType::Cms, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    assert_eq!(
        de.verify_signature().unwrap_err().kind(),
        ErrorKind::BadSignature
    );
    // The cached result answers repeat queries.
    assert_eq!(
        de.verify_signature().unwrap_err().kind(),
        ErrorKind::BadSignature
    );
}

#[test]
fn detached_signature_roundtrip() {
    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();
    let private = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry.load_key(&private, &key.to_der()).unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DetachedSignature(true)).unwrap();
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Signature(PkcObject::Context(private)))
        .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let signature_envelope = drain(&mut env);

    // The content must not appear in the detached envelope.
    assert!(signature_envelope
        .windows(TEST_DATA.len())
        .all(|w| w != TEST_DATA));

    let mut de = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    de.add_info(EnvelopeInfo::DetachedSignature(true)).unwrap();
    de.push(&signature_envelope).unwrap();
    // The detached content arrives out of band.
    de.push(TEST_DATA).unwrap();
    de.flush().unwrap();

    let public = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&public, &key.public().to_der().unwrap())
        .unwrap();
    de.add_info(EnvelopeInfo::Signature(PkcObject::Context(public)))
        .unwrap();
}

#[test]
fn standalone_hash_without_signature_is_rejected() {
    let registry = CapabilityRegistry::software();
    let hash = registry.create_context(AlgorithmId::Sha1, Mode::None).unwrap();
    let mut env = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::Hash(hash)).unwrap();
    assert_eq!(
        env.push(TEST_DATA).unwrap_err().kind(),
        ErrorKind::NotInitialized
    );
}
