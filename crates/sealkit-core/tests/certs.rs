//! Certificate engine: DER fidelity, chain ordering, constraint checks and
//! trust resolution.

use std::sync::Arc;

use sealkit_core::ber::Time;
use sealkit_core::cert::chain::{CertChain, ChainOptions, DETAIL_ROOT_NOT_TRUSTED};
use sealkit_core::cert::dn::{DistinguishedName, DnKind};
use sealkit_core::cert::trust::TrustStore;
use sealkit_core::cert::{
    CertificateBuilder, DecodedExtension, GeneralName, OID_EXT_BASIC_CONSTRAINTS,
    OID_EXT_NAME_CONSTRAINTS,
};
use sealkit_core::error::ErrorKind;
use sealkit_core::oid::{AlgorithmId, Mode};
use sealkit_core::provider::{CapabilityRegistry, ContextHandle};
use sealkit_core::testkeys;
use sealkit_core::Certificate;

fn dn(country: &str, org: &str, cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.add_component(DnKind::Country, country).unwrap();
    dn.add_component(DnKind::Organization, org).unwrap();
    dn.add_component(DnKind::CommonName, cn).unwrap();
    dn
}

fn signer(registry: &CapabilityRegistry) -> ContextHandle {
    let context = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&context, &testkeys::rsa512_private_parts().to_der())
        .unwrap();
    context
}

fn make_cert(
    registry: &CapabilityRegistry,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    serial: u8,
    path_len: Option<Option<u32>>,
) -> Arc<Certificate> {
    let key = testkeys::rsa512_private_parts();
    let mut builder = CertificateBuilder::new(
        subject,
        issuer,
        vec![serial],
        Time::new(2024, 1, 1, 0, 0, 0).unwrap(),
        Time::new(2034, 1, 1, 0, 0, 0).unwrap(),
        key.public(),
    );
    if let Some(path_len) = path_len {
        builder
            .add_extension(
                OID_EXT_BASIC_CONSTRAINTS.clone(),
                true,
                DecodedExtension::BasicConstraints { ca: true, path_len },
            )
            .unwrap();
    }
    let context = signer(registry);
    Arc::new(builder.sign(registry, &context, AlgorithmId::Sha1).unwrap())
}

fn three_cert_chain(registry: &CapabilityRegistry) -> Vec<Arc<Certificate>> {
    let root_dn = dn("US", "Wetaburgers", "Wetaburgers Root CA");
    let mid_dn = dn("US", "Wetaburgers", "Wetaburgers Issuing CA");
    let leaf_dn = dn("US", "Wetaburgers", "Dave Smith");
    vec![
        make_cert(registry, leaf_dn, mid_dn.clone(), 3, None),
        make_cert(registry, mid_dn, root_dn.clone(), 2, Some(None)),
        make_cert(registry, root_dn.clone(), root_dn, 1, Some(None)),
    ]
}

#[test]
fn certificate_reparse_is_byte_identical() {
    let registry = CapabilityRegistry::software();
    let cert = make_cert(
        &registry,
        dn("NZ", "Dave's Wetaburgers", "Dave Smith"),
        dn("NZ", "Dave's Wetaburgers", "Dave Smith"),
        7,
        Some(Some(0)),
    );
    let der = cert.to_der().to_vec();
    let (parsed, consumed) = Certificate::parse(&der).unwrap();
    assert_eq!(consumed, der.len());
    assert_eq!(parsed.to_der(), der.as_slice());
    assert!(parsed.self_signed);
    assert_eq!(parsed.serial, vec![7]);
    assert_eq!(parsed.path_len_constraint(), Some(0));
}

#[test]
fn chain_orders_shuffled_input_and_discards_strays() {
    let registry = CapabilityRegistry::software();
    let chain = three_cert_chain(&registry);
    let unrelated = make_cert(
        &registry,
        dn("DE", "Unrelated GmbH", "Unrelated"),
        dn("DE", "Unrelated GmbH", "Unrelated"),
        9,
        None,
    );

    // Shuffle to [1, 0, 2] and append the stray.
    let bag = vec![
        Arc::clone(&chain[1]),
        Arc::clone(&chain[0]),
        Arc::clone(&chain[2]),
        unrelated,
    ];
    let ordered = CertChain::from_unordered(bag).unwrap();
    assert_eq!(ordered.len(), 3);
    for (ordered, expected) in ordered.certs().iter().zip(&chain) {
        assert_eq!(ordered.to_der(), expected.to_der());
    }
}

#[test]
fn chain_verifies_against_trusted_root() {
    let registry = CapabilityRegistry::software();
    let certs = three_cert_chain(&registry);
    let chain = CertChain::from_unordered(certs.clone()).unwrap();

    let mut trust = TrustStore::new();
    trust.add_trusted_cert(&certs[2], "root anchor").unwrap();
    chain
        .check(&registry, &trust, ChainOptions::default())
        .unwrap();
}

#[test]
fn untrusted_self_signed_root_is_flagged() {
    let registry = CapabilityRegistry::software();
    let certs = three_cert_chain(&registry);
    let chain = CertChain::from_unordered(certs).unwrap();

    let trust = TrustStore::new();
    let error = chain
        .check(&registry, &trust, ChainOptions::default())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidConstraint);
    let locus = error.locus.expect("locus recorded");
    assert_eq!(locus.detail, Some(DETAIL_ROOT_NOT_TRUSTED));

    // The trust-chain-root option accepts it instead.
    chain
        .check(
            &registry,
            &trust,
            ChainOptions { trust_chain_root: true, ..Default::default() },
        )
        .unwrap();
}

#[test]
fn path_length_zero_rejects_intermediates_below() {
    let registry = CapabilityRegistry::software();
    let root_dn = dn("US", "Wetaburgers", "Root CA");
    let ca1_dn = dn("US", "Wetaburgers", "Policy CA");
    let ca2_dn = dn("US", "Wetaburgers", "Issuing CA");
    let leaf_dn = dn("US", "Wetaburgers", "Dave Smith");

    let certs = vec![
        make_cert(&registry, leaf_dn, ca2_dn.clone(), 4, None),
        make_cert(&registry, ca2_dn, ca1_dn.clone(), 3, Some(None)),
        // pathLen 0: nothing below this CA may itself be an issuer.
        make_cert(&registry, ca1_dn, root_dn.clone(), 2, Some(Some(0))),
        make_cert(&registry, root_dn.clone(), root_dn, 1, Some(None)),
    ];
    let chain = CertChain::from_unordered(certs.clone()).unwrap();

    let mut trust = TrustStore::new();
    trust.add_trusted_cert(&certs[3], "root anchor").unwrap();
    let error = chain
        .check(&registry, &trust, ChainOptions::default())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidConstraint);
    let locus = error.locus.expect("locus recorded");
    assert_eq!(locus.attribute, Some(OID_EXT_BASIC_CONSTRAINTS.clone()));
    assert_eq!(locus.cert_index, Some(2));
}

#[test]
fn excluded_subtree_rejects_matching_subject() {
    let registry = CapabilityRegistry::software();
    let root_dn = dn("US", "Wetaburgers", "Root CA");
    let ca_dn = dn("US", "Wetaburgers", "Issuing CA");
    let leaf_dn = dn("US", "Wetaburgers", "Dave Smith");

    // The issuing CA excludes its own organisation: everything below it
    // lands in the excluded subtree.
    let mut excluded = DistinguishedName::new();
    excluded.add_component(DnKind::Country, "US").unwrap();
    excluded.add_component(DnKind::Organization, "Wetaburgers").unwrap();

    let key = testkeys::rsa512_private_parts();
    let mut builder = CertificateBuilder::new(
        ca_dn.clone(),
        root_dn.clone(),
        vec![2],
        Time::new(2024, 1, 1, 0, 0, 0).unwrap(),
        Time::new(2034, 1, 1, 0, 0, 0).unwrap(),
        key.public(),
    );
    builder
        .add_extension(
            OID_EXT_NAME_CONSTRAINTS.clone(),
            true,
            DecodedExtension::NameConstraints {
                permitted: Vec::new(),
                excluded: vec![GeneralName::Directory(excluded)],
            },
        )
        .unwrap();
    let context = signer(&registry);
    let ca = Arc::new(builder.sign(&registry, &context, AlgorithmId::Sha1).unwrap());

    let certs = vec![
        make_cert(&registry, leaf_dn, ca_dn, 3, None),
        ca,
        make_cert(&registry, root_dn.clone(), root_dn, 1, Some(None)),
    ];
    let chain = CertChain::from_unordered(certs.clone()).unwrap();

    let mut trust = TrustStore::new();
    trust.add_trusted_cert(&certs[2], "root anchor").unwrap();
    let error = chain
        .check(&registry, &trust, ChainOptions::default())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidConstraint);
    assert_eq!(
        error.locus.unwrap().attribute,
        Some(OID_EXT_NAME_CONSTRAINTS.clone())
    );
}

#[test]
fn email_component_migrates_to_alt_name() {
    use sealkit_core::cert::dn::OID_EMAIL_ADDRESS;
    use sealkit_core::cert::spki::PublicKeyInfo;

    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();

    // Stuff an emailAddress into the DN the way legacy software does: via
    // the wire form, since the typed API has no accessor for it.
    let mut subject = dn("NZ", "Dave's Wetaburgers", "Dave Smith");
    let mut der = subject.to_der(Default::default()).unwrap();
    {
        // Append an RDN: SET { SEQ { emailAddress-OID, IA5String } }.
        let email = b"dave@wetaburgers.example";
        let mut rdn = Vec::new();
        rdn.extend_from_slice(&[0x31, (email.len() + 17) as u8]);
        rdn.extend_from_slice(&[0x30, (email.len() + 15) as u8]);
        rdn.extend_from_slice(OID_EMAIL_ADDRESS.as_image());
        rdn.extend_from_slice(&[0x16, email.len() as u8]);
        rdn.extend_from_slice(email);
        der[1] += rdn.len() as u8; // short-form outer length holds here
        der.extend_from_slice(&rdn);
        let mut reader = sealkit_core::ber::BerReader::new(&der);
        subject = DistinguishedName::read(&mut reader).unwrap();
    }

    let builder = CertificateBuilder::new(
        subject.clone(),
        subject,
        vec![5],
        Time::new(2024, 1, 1, 0, 0, 0).unwrap(),
        Time::new(2034, 1, 1, 0, 0, 0).unwrap(),
        PublicKeyInfo { parts: key.public().parts.clone() },
    );
    let context = signer(&registry);
    let cert = builder.sign(&registry, &context, AlgorithmId::Sha1).unwrap();

    // The email moved out of the DN into subjectAltName.rfc822Name.
    assert!(cert.subject.find_by_oid(&OID_EMAIL_ADDRESS).is_none());
    assert!(cert.subject_alt_names().iter().any(|name| match name {
        GeneralName::Rfc822(value) => value == "dave@wetaburgers.example",
        _ => false,
    }));
}

#[test]
fn pkcs7_chain_bagging_roundtrip() {
    let registry = CapabilityRegistry::software();
    let certs = three_cert_chain(&registry);
    let chain = CertChain::from_unordered(certs).unwrap();

    let mut writer = sealkit_core::ber::BerWriter::new();
    chain.write_pkcs7(&mut writer);
    let encoded = writer.into_bytes();

    let mut reader = sealkit_core::ber::BerReader::new(&encoded);
    let parsed = CertChain::read_pkcs7(&mut reader).unwrap();
    assert_eq!(parsed.len(), chain.len());
    for (a, b) in parsed.certs().iter().zip(chain.certs()) {
        assert_eq!(a.to_der(), b.to_der());
    }
}

#[test]
fn key_generation_task_polls_to_completion() {
    use sealkit_core::provider::KeyGenStatus;

    let registry = CapabilityRegistry::software();
    let mut task = registry
        .generate_key(AlgorithmId::TripleDes, Mode::Cbc, 0)
        .unwrap();
    let context = loop {
        match task.poll_status() {
            KeyGenStatus::Pending => std::thread::yield_now(),
            KeyGenStatus::Done(context) => break context,
            other => {
                let _ = other;
                panic!("key generation failed")
            }
        }
    };
    let q = registry.query_context(&context).unwrap();
    assert!(q.key_loaded);

    // Unknown mechanisms fail fast instead of spawning.
    assert_eq!(
        registry
            .generate_key(AlgorithmId::Skipjack, Mode::Cbc, 0)
            .unwrap_err()
            .kind(),
        ErrorKind::NoAlgorithm
    );
}
