//! OpenSSL module for checking the CMS blob of a signature.
//!
//! [`OpenSslVerifier`] checks that the blob's signature is correct for the
//! signed byte ranges, using the signer certificate embedded in the blob.
//! The certificate chain is not validated against any trust anchor.

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;

use crate::certificate_store::CertificateInfo;
use crate::verifier::Pkcs7Verifier;
use crate::{Error, Result};

/// OpenSSL implementation of the signature verifier.
pub struct OpenSslVerifier {
    // Required by the OpenSSL API, but never consulted: verification runs
    // with NOVERIFY.
    ca_store: X509Store,
    intermediaries: Stack<X509>,
}

impl OpenSslVerifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ca_store: X509StoreBuilder::new()?.build(),
            intermediaries: Stack::new()?,
        })
    }

    fn parse(pkcs7_der: &[u8]) -> Result<Pkcs7> {
        Pkcs7::from_der(pkcs7_der).map_err(|_| {
            Error::CorruptSignatureField("signature is not a PKCS #7 structure".to_string())
        })
    }
}

impl Pkcs7Verifier for OpenSslVerifier {
    fn signer(&self, pkcs7_der: &[u8]) -> Result<CertificateInfo> {
        let pkcs7 = Self::parse(pkcs7_der)?;
        let signers = pkcs7.signers(&self.intermediaries, Pkcs7Flags::empty())?;
        let cert = signers.iter().next().ok_or_else(|| {
            Error::CorruptSignatureField("signature has no signer certificate".to_string())
        })?;
        CertificateInfo::from_x509(cert)
    }

    fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> Result<()> {
        // Unfortunately OpenSSL requires a contiguous array of bytes to verify
        // the signature, so we must allocate and copy the slices.
        let mut contiguous = Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
        contiguous.extend_from_slice(signed_data[0]);
        contiguous.extend_from_slice(signed_data[1]);

        let pkcs7 = Self::parse(pkcs7_der)?;
        pkcs7.verify(
            &self.intermediaries,
            &self.ca_store,
            Some(&contiguous),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )?;
        Ok(())
    }
}
