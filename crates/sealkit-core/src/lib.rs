//! Cryptographic message library: CMS/PKCS #7 enveloping over a BER/DER
//! codec, an X.509 certificate chain engine, and the action-list scheduler
//! that drives them.
//!
//! The crate is organised leaves-first: `ber` and `oid` carry the codec,
//! `cms` the typed message objects, `cert` the certificate engine,
//! `envelope` the streaming pipeline and `provider` the capability façade
//! over whatever crypto backend services the contexts.

pub mod algid;
pub mod ber;
pub mod cert;
pub mod cms;
pub mod envelope;
pub mod error;
pub mod keystore;
pub mod oid;
pub mod provider;
pub mod secure;

#[doc(hidden)]
pub mod testkeys;

pub use cert::chain::{CertChain, ChainOptions, MAX_CHAIN_LENGTH};
pub use cert::dn::{DistinguishedName, DnEmitForm, DnKind};
pub use cert::trust::TrustStore;
pub use cert::{Certificate, CertificateBuilder};
pub use cms::FormatType;
pub use envelope::{Envelope, EnvelopeInfo, EnvelopeMode, PkcObject};
pub use error::{Error, ErrorKind, ErrorLocus, Result};
pub use oid::{AlgorithmId, Mode, Oid};
pub use provider::{CapabilityRegistry, ContextHandle, CryptoProvider, KeyGenStatus, KeyGenTask};
pub use secure::SecretBuffer;
