//! Builds the detached CMS `SignedData` stored in a signature's `/Contents`.
//!
//! The message digest is computed by the caller over the two signed byte
//! ranges; the document bytes themselves never reach this module.

use cms::builder::{create_signing_time_attribute, SignedDataBuilder, SignerInfoBuilder};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use const_oid::db::rfc5911::ID_DATA;
use const_oid::db::rfc5912::ID_SHA_256;
use der::{Decode, Encode};
use log::debug;
use openssl::pkey::Id;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{Keypair, Signer};
use sha2::Sha256;
use x509_cert::spki::{
    AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, EncodePublicKey,
    SignatureBitStringEncoding,
};
use x509_cert::Certificate;

use crate::certificate_store::CertificateBundle;
use crate::{Error, Result};

/// Length of a SHA-256 digest, the only digest used when signing.
pub const DIGEST_LEN: usize = 32;

pub struct SignatureComposer<'a> {
    bundle: &'a CertificateBundle,
}

impl<'a> SignatureComposer<'a> {
    pub fn new(bundle: &'a CertificateBundle) -> Self {
        Self { bundle }
    }

    /// Signs a SHA-256 digest, returning the DER encoded `ContentInfo`.
    ///
    /// The signer is identified by issuer and serial number; the whole chain
    /// is embedded and a signing-time attribute is added.
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.len() != DIGEST_LEN {
            return Err(Error::SigningKeyError(format!(
                "expected a {DIGEST_LEN} byte SHA-256 digest, got {} bytes",
                digest.len()
            )));
        }

        let chain = self
            .bundle
            .chain()
            .iter()
            .map(|cert| Ok(Certificate::from_der(&cert.to_der()?)?))
            .collect::<Result<Vec<Certificate>>>()?;
        let leaf = &chain[0];
        let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: leaf.tbs_certificate.issuer.clone(),
            serial_number: leaf.tbs_certificate.serial_number.clone(),
        });

        let key = self.bundle.key();
        let mut pkcs8 = key.to_pkcs8_der()?;
        let signed = match key.id() {
            Id::RSA => {
                let private = rsa::RsaPrivateKey::from_pkcs8_der(&pkcs8);
                pkcs8.fill(0);
                let private = private.map_err(key_error)?;
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(private);
                build_signed_data::<_, rsa::pkcs1v15::Signature>(&signer, sid, &chain, digest)
            }
            Id::EC => {
                let private = p256::ecdsa::SigningKey::from_pkcs8_der(&pkcs8);
                pkcs8.fill(0);
                let signer = private.map_err(|_| {
                    Error::UnsupportedAlgorithm(
                        "only P-256 elliptic curve keys are supported".to_string(),
                    )
                })?;
                build_signed_data::<_, p256::ecdsa::DerSignature>(&signer, sid, &chain, digest)
            }
            _ => {
                pkcs8.fill(0);
                Err(Error::UnsupportedAlgorithm(format!(
                    "{} signing keys",
                    key.algorithm()
                )))
            }
        }?;

        debug!(
            "composed {} byte CMS signature with {} key",
            signed.len(),
            key.algorithm()
        );
        Ok(signed)
    }
}

fn build_signed_data<S, Sig>(
    signer: &S,
    sid: SignerIdentifier,
    chain: &[Certificate],
    digest: &[u8],
) -> Result<Vec<u8>>
where
    S: Keypair + DynSignatureAlgorithmIdentifier + Signer<Sig>,
    S::VerifyingKey: EncodePublicKey,
    Sig: SignatureBitStringEncoding,
{
    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: ID_SHA_256,
        parameters: None,
    };
    // Detached: the content is absent, only its type is recorded.
    let content = EncapsulatedContentInfo {
        econtent_type: ID_DATA,
        econtent: None,
    };

    let mut signer_info = SignerInfoBuilder::new(
        signer,
        sid,
        digest_algorithm.clone(),
        &content,
        Some(digest),
    )
    .map_err(builder_error)?;
    signer_info
        .add_signed_attribute(create_signing_time_attribute().map_err(builder_error)?)
        .map_err(builder_error)?;

    let mut builder = SignedDataBuilder::new(&content);
    builder
        .add_digest_algorithm(digest_algorithm)
        .map_err(builder_error)?;
    for cert in chain {
        builder
            .add_certificate(CertificateChoices::Certificate(cert.clone()))
            .map_err(builder_error)?;
    }
    let content_info = builder
        .add_signer_info::<S, Sig>(signer_info)
        .map_err(builder_error)?
        .build()
        .map_err(builder_error)?;

    Ok(content_info.to_der()?)
}

fn builder_error(e: cms::builder::Error) -> Error {
    Error::SigningKeyError(format!("{e:?}"))
}

fn key_error<E>(_: E) -> Error {
    Error::SigningKeyError("private key can not be decoded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_store::CertificateStore;
    use crate::test_support::{write_keystore, KeyKind};
    use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use sha2::Digest;
    use tempfile::tempdir;

    fn sign_and_check(kind: KeyKind) {
        let dir = tempdir().unwrap();
        let path = write_keystore(dir.path(), "Signing Clerk", "pass", kind);
        let bundle = CertificateStore::load(&path, "pass").unwrap();

        let content = b"%PDF-1.7 pretend these are the signed ranges";
        let digest = Sha256::digest(content);
        let der = SignatureComposer::new(&bundle).sign(&digest).unwrap();

        let pkcs7 = Pkcs7::from_der(&der).unwrap();
        let store = X509StoreBuilder::new().unwrap().build();
        let certs = Stack::new().unwrap();
        let flags = Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY;
        pkcs7
            .verify(&certs, &store, Some(&content[..]), None, flags)
            .unwrap();

        // A different content must not verify against the same blob.
        assert!(pkcs7
            .verify(&certs, &store, Some(&b"tampered"[..]), None, flags)
            .is_err());

        let signers = pkcs7.signers(&certs, Pkcs7Flags::empty()).unwrap();
        assert_eq!(signers.len(), 1);
    }

    #[test]
    fn signs_with_rsa_key() {
        sign_and_check(KeyKind::Rsa);
    }

    #[test]
    fn signs_with_p256_key() {
        sign_and_check(KeyKind::P256);
    }

    #[test]
    fn rejects_digest_of_wrong_length() {
        let dir = tempdir().unwrap();
        let path = write_keystore(dir.path(), "Signing Clerk", "pass", KeyKind::Rsa);
        let bundle = CertificateStore::load(&path, "pass").unwrap();

        let err = SignatureComposer::new(&bundle).sign(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::SigningKeyError(_)));
    }
}
