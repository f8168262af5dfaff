//! Loads the signing key and its certificate chain from a PKCS #12 keystore.
//!
//! The keystore is opened, decrypted and closed on every call; nothing is
//! cached between calls. Callers signing at high frequency may keep the
//! returned [`CertificateBundle`] for the duration of one operation.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{Id, PKey, Private};
use openssl::provider::Provider;
use openssl::x509::{X509NameRef, X509Ref, X509VerifyResult, X509};
use serde::Serialize;

use crate::{Error, Result};

/// Opaque handle to the private key of a keystore entry.
///
/// It can not be cloned, and its debug representation never shows the key.
/// Drop it as soon as the signing call is done.
pub struct SigningKey(PKey<Private>);

impl SigningKey {
    pub(crate) fn id(&self) -> Id {
        self.0.id()
    }

    /// PKCS #8 DER encoding of the key, for handing it to the signature
    /// implementation. The caller must not keep it around.
    pub(crate) fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        self.0
            .private_key_to_pkcs8()
            .map_err(|_| Error::SigningKeyError("key can not be exported".to_string()))
    }

    /// Human readable algorithm name, for logs and diagnostics.
    pub fn algorithm(&self) -> &'static str {
        match self.0.id() {
            Id::RSA => "RSA",
            Id::EC => "EC",
            Id::ED25519 => "Ed25519",
            Id::DSA => "DSA",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey({}, <redacted>)", self.algorithm())
    }
}

/// Private key plus certificate chain, leaf first.
#[derive(Debug)]
pub struct CertificateBundle {
    key: SigningKey,
    chain: Vec<X509>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateBundle {
    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// End-entity certificate followed by its issuers.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// The end-entity certificate.
    pub fn certificate(&self) -> &X509Ref {
        // Never empty: the bundle is only built with a leaf certificate.
        &self.chain[0]
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn is_currently_valid(&self) -> bool {
        let now = Utc::now();
        self.not_before <= now && now <= self.not_after
    }

    /// Common name of the end-entity certificate subject.
    pub fn signer_name(&self) -> Option<String> {
        common_name(self.certificate().subject_name())
    }

    pub fn certificate_infos(&self) -> Result<Vec<CertificateInfo>> {
        self.chain
            .iter()
            .map(|cert| CertificateInfo::from_x509(cert))
            .collect()
    }
}

/// Display and audit metadata of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    /// Hexadecimal serial number.
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    pub fn from_x509(cert: &X509Ref) -> Result<Self> {
        Ok(Self {
            subject: format_name(cert.subject_name()),
            issuer: format_name(cert.issuer_name()),
            common_name: common_name(cert.subject_name()),
            serial_number: cert.serial_number().to_bn()?.to_hex_str()?.to_string(),
            not_before: asn1_to_chrono(cert.not_before())?,
            not_after: asn1_to_chrono(cert.not_after())?,
        })
    }
}

pub struct CertificateStore;

impl CertificateStore {
    /// Loads the first key entry of the keystore and its chain.
    ///
    /// Fails closed: a missing file, a wrong password or a keystore without
    /// a key never produce a bundle.
    pub fn load(path: impl AsRef<Path>, password: &str) -> Result<CertificateBundle> {
        let parsed = open_keystore(path.as_ref(), password)?;
        let (key, chain) = key_entry(parsed)?;

        let leaf = &chain[0];
        let not_before = asn1_to_chrono(leaf.not_before())?;
        let not_after = asn1_to_chrono(leaf.not_after())?;
        let bundle = CertificateBundle {
            key: SigningKey(key),
            chain,
            not_before,
            not_after,
        };

        if !bundle.is_currently_valid() {
            warn!(
                "signing certificate {:?} is outside its validity window ({} - {})",
                bundle.signer_name(),
                bundle.not_before,
                bundle.not_after
            );
        }
        debug!(
            "loaded {} key with a chain of {} certificate(s)",
            bundle.key.algorithm(),
            bundle.chain.len()
        );
        Ok(bundle)
    }

    /// The certificate chain of the first key entry, without the key.
    pub fn chain(path: impl AsRef<Path>, password: &str) -> Result<Vec<X509>> {
        let parsed = open_keystore(path.as_ref(), password)?;
        let (_key, chain) = key_entry(parsed)?;
        Ok(chain)
    }
}

/// Relative paths are taken from the current working directory.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn open_keystore(path: &Path, password: &str) -> Result<ParsedPkcs12_2> {
    let full_path = resolve_path(path)?;
    if !full_path.is_file() {
        return Err(Error::CertificateNotFound(full_path));
    }

    let der = std::fs::read(&full_path)?;
    let pkcs12 = Pkcs12::from_der(&der).map_err(|_| Error::KeystoreFormat)?;
    load_legacy_providers();
    pkcs12.parse2(password).map_err(parse_error)
}

lazy_static! {
    // Keystores exported by Windows or built with BouncyCastle encrypt their
    // certificates with RC2-40, which OpenSSL 3 only has in the legacy
    // provider. Loading a provider turns off the implicit default one, so
    // both are loaded, and kept for the life of the process.
    static ref PKCS12_PROVIDERS: Vec<Provider> = ["default", "legacy"]
        .into_iter()
        .filter_map(|name| match Provider::load(None, name) {
            Ok(provider) => Some(provider),
            Err(e) => {
                debug!("OpenSSL provider {name:?} not loaded: {e}");
                None
            }
        })
        .collect();
}

pub(crate) fn load_legacy_providers() {
    lazy_static::initialize(&PKCS12_PROVIDERS);
}

/// A MAC or decryption failure means a wrong password; a cipher OpenSSL
/// does not offer is reported as such.
fn parse_error(stack: ErrorStack) -> Error {
    let unsupported = stack
        .errors()
        .iter()
        .filter_map(|e| e.reason())
        .any(|reason| reason.to_ascii_lowercase().contains("unsupported"));
    if unsupported {
        Error::UnsupportedAlgorithm(format!("keystore encryption: {stack}"))
    } else {
        Error::InvalidPassword
    }
}

/// Splits a decrypted keystore into the key and the chain ordered leaf first.
fn key_entry(parsed: ParsedPkcs12_2) -> Result<(PKey<Private>, Vec<X509>)> {
    let key = parsed.pkey.ok_or(Error::NoPrivateKeyEntry)?;
    let leaf = parsed.cert.ok_or(Error::NoPrivateKeyEntry)?;
    if !leaf.public_key()?.public_eq(&key) {
        return Err(Error::NoPrivateKeyEntry);
    }

    let others = parsed
        .ca
        .map(|stack| stack.into_iter().collect())
        .unwrap_or_default();
    Ok((key, order_chain(leaf, others)))
}

/// Follows the issuer links from the leaf. Certificates that are not part
/// of the path are kept at the end, in store order.
fn order_chain(leaf: X509, mut others: Vec<X509>) -> Vec<X509> {
    let mut chain = vec![leaf];
    while let Some(current) = chain.last() {
        if current.issued(current) == X509VerifyResult::OK {
            // Self-signed, the path ends here.
            break;
        }
        let Some(pos) = others
            .iter()
            .position(|candidate| candidate.issued(current) == X509VerifyResult::OK)
        else {
            break;
        };
        chain.push(others.remove(pos));
    }
    chain.append(&mut others);
    chain
}

/// Returns the first common name entry of a distinguished name.
fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// One line representation, e.g. `CN=Jane Doe, O=Registry Office`, most
/// specific attribute first.
fn format_name(name: &X509NameRef) -> String {
    let parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .map(str::to_string)
                .unwrap_or_else(|_| entry.object().to_string());
            let value = entry
                .data()
                .as_utf8()
                .map(|v| v.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect();
    parts.into_iter().rev().collect::<Vec<_>>().join(", ")
}

fn asn1_to_chrono(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::MalformedPdfStructure("certificate time out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_key, issue_certificate, write_keystore, KeyKind};
    use openssl::hash::MessageDigest;
    use openssl::stack::Stack;
    use tempfile::tempdir;

    #[test]
    fn loads_key_and_leaf_certificate() {
        let dir = tempdir().unwrap();
        let path = write_keystore(dir.path(), "Jane Doe", "secret", KeyKind::Rsa);

        let bundle = CertificateStore::load(&path, "secret").unwrap();
        assert_eq!(bundle.signer_name().as_deref(), Some("Jane Doe"));
        assert_eq!(bundle.chain().len(), 1);
        assert_eq!(bundle.key().algorithm(), "RSA");
        assert!(bundle.is_currently_valid());

        let debug = format!("{:?}", bundle.key());
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn wrong_password_is_reported_as_such() {
        let dir = tempdir().unwrap();
        let path = write_keystore(dir.path(), "Jane Doe", "secret", KeyKind::Rsa);

        let err = CertificateStore::load(&path, "not the password").unwrap_err();
        assert!(matches!(err, Error::InvalidPassword), "{err:?}");
    }

    #[test]
    fn missing_file_is_reported_with_its_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.p12");

        match CertificateStore::load(&path, "secret").unwrap_err() {
            Error::CertificateNotFound(reported) => assert_eq!(reported, path),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn garbage_file_is_not_a_keystore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.p12");
        std::fs::write(&path, b"this is not DER").unwrap();

        let err = CertificateStore::load(&path, "secret").unwrap_err();
        assert!(matches!(err, Error::KeystoreFormat), "{err:?}");
    }

    #[test]
    fn keystore_without_key_has_no_private_key_entry() {
        let dir = tempdir().unwrap();
        let key = generate_key(KeyKind::Rsa);
        let cert = issue_certificate("Trusted Only", &key, None, 7);
        let mut ca = Stack::new().unwrap();
        ca.push(cert).unwrap();
        let pkcs12 = Pkcs12::builder().ca(ca).build2("secret").unwrap();
        let path = dir.path().join("trust-only.p12");
        std::fs::write(&path, pkcs12.to_der().unwrap()).unwrap();

        let err = CertificateStore::load(&path, "secret").unwrap_err();
        assert!(matches!(err, Error::NoPrivateKeyEntry), "{err:?}");
    }

    #[test]
    fn legacy_encrypted_keystore_loads() {
        let dir = tempdir().unwrap();
        let key = generate_key(KeyKind::Rsa);
        let cert = issue_certificate("Legacy Clerk", &key, None, 9);

        // RC2-40 certificates and 3DES key, as `openssl pkcs12 -legacy`
        // writes them.
        load_legacy_providers();
        let pkcs12 = Pkcs12::builder()
            .name("legacy")
            .pkey(&key)
            .cert(&cert)
            .cert_algorithm(Nid::PBE_WITHSHA1AND40BITRC2_CBC)
            .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
            .mac_md(MessageDigest::sha1())
            .build2("pw")
            .unwrap();
        let path = dir.path().join("legacy.p12");
        std::fs::write(&path, pkcs12.to_der().unwrap()).unwrap();

        let bundle = CertificateStore::load(&path, "pw").unwrap();
        assert_eq!(bundle.signer_name().as_deref(), Some("Legacy Clerk"));

        let err = CertificateStore::load(&path, "wrong").unwrap_err();
        assert!(matches!(err, Error::InvalidPassword), "{err:?}");
    }

    #[test]
    fn chain_is_ordered_leaf_first() {
        let dir = tempdir().unwrap();
        let root_key = generate_key(KeyKind::Rsa);
        let root = issue_certificate("Root CA", &root_key, None, 1);
        let intermediate_key = generate_key(KeyKind::Rsa);
        let intermediate =
            issue_certificate("Intermediate CA", &intermediate_key, Some((&root, &root_key)), 2);
        let leaf_key = generate_key(KeyKind::P256);
        let leaf = issue_certificate(
            "Clerk",
            &leaf_key,
            Some((&intermediate, &intermediate_key)),
            3,
        );

        // Store order deliberately differs from the issuing path.
        let mut ca = Stack::new().unwrap();
        ca.push(root).unwrap();
        ca.push(intermediate).unwrap();
        let pkcs12 = Pkcs12::builder()
            .name("clerk")
            .pkey(&leaf_key)
            .cert(&leaf)
            .ca(ca)
            .build2("secret")
            .unwrap();
        let path = dir.path().join("chain.p12");
        std::fs::write(&path, pkcs12.to_der().unwrap()).unwrap();

        let names: Vec<_> = CertificateStore::chain(&path, "secret")
            .unwrap()
            .iter()
            .map(|cert| common_name(cert.subject_name()).unwrap())
            .collect();
        assert_eq!(names, ["Clerk", "Intermediate CA", "Root CA"]);

        let infos = crate::load_certificate_chain(&path, "secret").unwrap();
        assert_eq!(infos[0].subject, "CN=Clerk, O=Registry Office");
        assert_eq!(infos[0].issuer, "CN=Intermediate CA, O=Registry Office");
        assert_eq!(infos[0].serial_number, "03");
    }
}
