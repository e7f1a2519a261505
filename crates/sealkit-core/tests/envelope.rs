//! Envelope / de-envelope round trips over the CMS and PGP framings.

use sealkit_core::envelope::{Envelope, EnvelopeInfo, EnvelopeMode, PkcObject};
use sealkit_core::error::ErrorKind;
use sealkit_core::oid::{AlgorithmId, Mode};
use sealkit_core::provider::CapabilityRegistry;
use sealkit_core::testkeys;
use sealkit_core::FormatType;

use rand::{Rng, RngCore, SeedableRng};

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

/// Push in random-sized chunks, resolving key material when the envelope
/// asks for it.
fn push_chunked(
    envelope: &mut Envelope,
    data: &[u8],
    chunk_bound: usize,
    mut resolve: impl FnMut(&mut Envelope),
) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EA1);
    let mut pos = 0;
    while pos < data.len() {
        let len = rng.gen_range(1..=chunk_bound.min(data.len() - pos));
        match envelope.push(&data[pos..pos + len]) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::ResourceRequired => resolve(envelope),
            Err(e) => panic!("push failed: {e:?}"),
        }
        pos += len;
    }
    match envelope.flush() {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::ResourceRequired => {
            resolve(envelope);
            envelope.flush().unwrap();
        }
        Err(e) => panic!("flush failed: {e:?}"),
    }
}

#[test]
fn password_envelope_roundtrip() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    match de.push(&enveloped) {
        Err(e) if e.kind() == ErrorKind::ResourceRequired => {}
        other => panic!("expected a resource request, got {other:?}"),
    }
    de.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn wrong_password_fails_with_wrong_key() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    assert_eq!(
        de.add_info(EnvelopeInfo::Password(b"NotThePassword"))
            .unwrap_err()
            .kind(),
        ErrorKind::WrongKey
    );
    // The right password still resolves afterwards.
    de.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn key_transport_roundtrip() {
    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();

    // Session cipher: 3DES/CFB.
    let session = registry
        .create_context(AlgorithmId::TripleDes, Mode::Cfb)
        .unwrap();
    let mut session_key = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut session_key);
    registry.load_key(&session, &session_key).unwrap();

    let public = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&public, &key.public().to_der().unwrap())
        .unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::SessionKey(session)).unwrap();
    env.add_info(EnvelopeInfo::PublicKey(PkcObject::Context(public)))
        .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    // De-envelope pushing in small random chunks.
    let registry2 = registry.clone();
    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    push_chunked(&mut de, &enveloped, 7, move |de| {
        let private = registry2.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
        registry2
            .load_key(&private, &testkeys::rsa512_private_parts().to_der())
            .unwrap();
        de.add_info(EnvelopeInfo::PrivateKey(PkcObject::Context(private)))
            .unwrap();
    });
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn streaming_roundtrip_with_random_chunks() {
    let registry = CapabilityRegistry::software();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut data = vec![0u8; 300_000];
    rng.fill_bytes(&mut data);

    let session = registry
        .create_context(AlgorithmId::TripleDes, Mode::Cbc)
        .unwrap();
    registry.load_key(&session, &[0x6Bu8; 24]).unwrap();

    // No declared size: indefinite-length encoding throughout.
    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::SessionKey(session)).unwrap();
    let mut pos = 0;
    while pos < data.len() {
        let len = rng.gen_range(1..=8192.min(data.len() - pos));
        env.push(&data[pos..pos + len]).unwrap();
        pos += len;
    }
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let registry2 = registry.clone();
    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    push_chunked(&mut de, &enveloped, 8192, move |de| {
        let session = registry2
            .create_context(AlgorithmId::TripleDes, Mode::Cbc)
            .unwrap();
        registry2.load_key(&session, &[0x6Bu8; 24]).unwrap();
        de.add_info(EnvelopeInfo::SessionKey(session)).unwrap();
    });
    assert_eq!(drain(&mut de), data);
}

#[test]
fn zero_byte_envelope_is_well_formed() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.flush().unwrap();
    let enveloped = drain(&mut env);
    assert!(!enveloped.is_empty());

    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), b"");
}

#[test]
fn plain_data_roundtrip_definite() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    de.push(&enveloped).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn session_key_answer_to_kek_request_is_wrong_key() {
    let registry = CapabilityRegistry::software();

    let session = registry
        .create_context(AlgorithmId::TripleDes, Mode::Cbc)
        .unwrap();
    registry.load_key(&session, &[0x31u8; 24]).unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::SessionKey(session)).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    // Supplying a session key of the wrong algorithm must be caught.
    let wrong = registry.create_context(AlgorithmId::Des, Mode::Cbc).unwrap();
    registry.load_key(&wrong, &[0x55u8; 8]).unwrap();
    assert_eq!(
        de.add_info(EnvelopeInfo::SessionKey(wrong)).unwrap_err().kind(),
        ErrorKind::WrongKey
    );
}

#[test]
fn envelope_is_poisoned_after_error() {
    let registry = CapabilityRegistry::software();
    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    assert_eq!(
        de.push(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err().kind(),
        ErrorKind::BadData
    );
    // Subsequent pushes report the poisoned state, not the original code.
    assert_eq!(
        de.push(b"more").unwrap_err().kind(),
        ErrorKind::IncompleteOperation
    );
}

#[test]
fn datasize_must_match_pushed_bytes() {
    let registry = CapabilityRegistry::software();
    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(100)).unwrap();
    env.push(b"short").unwrap();
    assert_eq!(env.flush().unwrap_err().kind(), ErrorKind::IncompleteOperation);

    let mut env = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(4)).unwrap();
    assert_eq!(
        env.push(b"too much data").unwrap_err().kind(),
        ErrorKind::Overflow
    );
}

#[test]
fn issuer_and_serial_resolution() {
    use sealkit_core::ber::Time;
    use sealkit_core::cert::CertificateBuilder;
    use sealkit_core::cert::dn::{DistinguishedName, DnKind};
    use std::sync::Arc;

    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();
    let private = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry.load_key(&private, &key.to_der()).unwrap();

    let mut issuer_dn = DistinguishedName::new();
    issuer_dn.add_component(DnKind::Country, "US").unwrap();
    issuer_dn.add_component(DnKind::Organization, "VeriSign").unwrap();
    issuer_dn
        .add_component(
            DnKind::CommonName,
            "Class 1 Public Primary Certification Authority",
        )
        .unwrap();

    let builder = CertificateBuilder::new(
        issuer_dn.clone(),
        issuer_dn,
        vec![0x42],
        Time::new(2024, 1, 1, 0, 0, 0).unwrap(),
        Time::new(2034, 1, 1, 0, 0, 0).unwrap(),
        key.public(),
    );
    let cert = Arc::new(builder.sign(&registry, &private, AlgorithmId::Sha1).unwrap());

    // CMS-format envelope: the recipient is named by issuerAndSerialNumber.
    let public = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&public, &cert.spki.to_der().unwrap())
        .unwrap();
    let mut env = Envelope::new(registry.clone(), FormatType::Cms, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::PublicKey(PkcObject::Certificate {
        certificate: Arc::clone(&cert),
        context: public,
    }))
    .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    // The supplied private key resolves without the caller naming a key ID.
    let mut de = Envelope::new(registry, FormatType::Cms, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    de.add_info(EnvelopeInfo::PrivateKey(PkcObject::Context(private)))
        .unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);

    // The requirement record carried the issuerAndSerialNumber on the way.
    let entry = de.content_list().entries();
    let _ = entry;
}

#[test]
fn password_unlocks_private_key_from_keyset() {
    use sealkit_core::keystore::MemoryKeyStore;
    use std::sync::Arc;

    let registry = CapabilityRegistry::software();
    let key = testkeys::rsa512_private_parts();

    let public = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
    registry
        .load_key(&public, &key.public().to_der().unwrap())
        .unwrap();

    let mut env = Envelope::new(registry.clone(), FormatType::Cryptlib, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::PublicKey(PkcObject::Context(public)))
        .unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    // The private key sits password-protected in the decryption keyset.
    let mut keyset = MemoryKeyStore::new(registry.clone());
    keyset.add_private_key(
        key.public().key_id64().unwrap(),
        &key.to_der(),
        Some(b"KeysetPassword"),
        None,
    );

    let mut de = Envelope::new(registry, FormatType::Cryptlib, EnvelopeMode::Deenvelope);
    de.add_info(EnvelopeInfo::KeysetDecrypt(Arc::new(keyset))).unwrap();
    let _ = de.push(&enveloped);
    // A password supplied while a private-key entry is pending unlocks
    // that key rather than deriving a KEK.
    assert_eq!(
        de.add_info(EnvelopeInfo::Password(b"wrong")).unwrap_err().kind(),
        ErrorKind::WrongKey
    );
    de.add_info(EnvelopeInfo::Password(b"KeysetPassword")).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn pgp_password_roundtrip() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Pgp, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Pgp, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    de.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn pgp_session_key_and_password_are_fungible() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Pgp, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    // Supply the equivalent raw key instead of the password: same effect.
    let mut de = Envelope::new(registry.clone(), FormatType::Pgp, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    let key = registry.hash_buffer(AlgorithmId::Md5, b"Password").unwrap();
    let context = registry.create_context(AlgorithmId::Idea, Mode::Cfb).unwrap();
    registry.load_key(&context, &key).unwrap();
    de.add_info(EnvelopeInfo::Key(context)).unwrap();
    de.flush().unwrap();
    assert_eq!(drain(&mut de), TEST_DATA);
}

#[test]
fn pgp_wrong_password_fails_prefix_check() {
    let registry = CapabilityRegistry::software();

    let mut env = Envelope::new(registry.clone(), FormatType::Pgp, EnvelopeMode::Envelope);
    env.add_info(EnvelopeInfo::DataSize(TEST_DATA.len())).unwrap();
    env.add_info(EnvelopeInfo::Password(b"Password")).unwrap();
    env.push(TEST_DATA).unwrap();
    env.flush().unwrap();
    let enveloped = drain(&mut env);

    let mut de = Envelope::new(registry, FormatType::Pgp, EnvelopeMode::Deenvelope);
    let _ = de.push(&enveloped);
    de.add_info(EnvelopeInfo::Password(b"WrongPassword")).unwrap();
    assert_eq!(de.flush().unwrap_err().kind(), ErrorKind::WrongKey);
}
