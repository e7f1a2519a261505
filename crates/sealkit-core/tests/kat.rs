//! Known-answer tests for the wire encodings.

use hex_literal::hex;

use sealkit_core::algid::write_crypt_algorithm_identifier;
use sealkit_core::ber::BerWriter;
use sealkit_core::cms::header::write_cms_header;
use sealkit_core::oid::{AlgorithmId, Mode, OID_CMS_DATA};

#[test]
fn kat_des_ede3_cbc_algorithm_identifier() {
    let iv = hex!("0102030405060708");
    let mut w = BerWriter::new();
    write_crypt_algorithm_identifier(&mut w, AlgorithmId::TripleDes, Mode::Cbc, &iv).unwrap();
    // SEQUENCE { des-EDE3-CBC (1 2 840 113549 3 7), OCTET STRING iv }
    let expected = hex!(
        "3014"
        "06082a864886f70d0307"
        "04080102030405060708"
    );
    assert_eq!(w.as_bytes(), expected);
}

#[test]
fn kat_data_content_info_header() {
    let mut w = BerWriter::new();
    write_cms_header(&mut w, &OID_CMS_DATA, Some(5));
    // SEQUENCE { data (1 2 840 113549 1 7 1), [0] { OCTET STRING (5) } }
    let expected = hex!(
        "3014"
        "06092a864886f70d010701"
        "a007"
        "0405"
    );
    assert_eq!(w.as_bytes(), expected);
}

#[cfg(feature = "soft")]
#[test]
fn kat_provider_hashes() {
    use sealkit_core::provider::CapabilityRegistry;

    let registry = CapabilityRegistry::software();
    assert_eq!(
        registry.hash_buffer(AlgorithmId::Sha1, b"abc").unwrap(),
        hex!("a9993e364706816aba3e25717850c26c9cd0d89d")
    );
    assert_eq!(
        registry.hash_buffer(AlgorithmId::Md5, b"abc").unwrap(),
        hex!("900150983cd24fb0d6963f7d28e17f72")
    );
    assert_eq!(
        registry.hash_buffer(AlgorithmId::Ripemd160, b"abc").unwrap(),
        hex!("8eb208f7e05d987a9b044a8e98c6b087f15a0bfc")
    );
}

#[test]
fn kat_rsa512_key_id() {
    // The key ID is SHA-1 over the DER SubjectPublicKeyInfo, truncated to
    // 64 bits for the wire records.
    let info = sealkit_core::testkeys::rsa512_public_info();
    let id = info.key_id().unwrap();
    let id64 = info.key_id64().unwrap();
    assert_eq!(&id[..8], id64);
    // Stable across runs and encodings.
    let again = sealkit_core::testkeys::rsa512_public_info().key_id().unwrap();
    assert_eq!(id, again);
}
