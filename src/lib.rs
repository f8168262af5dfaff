#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod appearance;
pub mod certificate_store;
pub mod composer;
pub mod config;
mod document;
pub mod incremental_writer;
pub mod openssl;
pub mod placement;
mod serialize;
pub mod verifier;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::info;
use thiserror::Error;

pub use appearance::SignatureImage;
pub use certificate_store::{CertificateBundle, CertificateInfo, CertificateStore, SigningKey};
pub use composer::SignatureComposer;
pub use config::SigningConfig;
pub use document::SignableDocument;
pub use incremental_writer::{
    prepare_signature, PlaceholderOffsets, PreparedSignature, SignatureAppearance,
    DEFAULT_PLACEHOLDER_SIZE,
};
pub use placement::{locate, Placement};
pub use verifier::{SignatureVerifier, VerificationResult};

/// Field name used for signatures when the caller does not choose one.
pub const DEFAULT_FIELD_NAME: &str = "digital_signature";

#[derive(Error, Debug)]
pub enum Error {
    #[error("certificate file not found: {}", .0.display())]
    CertificateNotFound(PathBuf),
    #[error("keystore can not be decrypted with the given password")]
    InvalidPassword,
    #[error("keystore holds no private key entry")]
    NoPrivateKeyEntry,
    #[error("keystore is not a PKCS #12 file")]
    KeystoreFormat,
    #[error("input is not a PDF document")]
    UnsupportedDocumentFormat,
    #[error("page has no usable geometry to place a signature")]
    PlacementNotFound,
    #[error("signature needs {needed} bytes but only {reserved} were reserved")]
    SignatureTooLarge { needed: usize, reserved: usize },
    #[error("signature placeholder does not match the recorded byte range")]
    ByteRangeMismatch,
    #[error("signing key is unusable: {0}")]
    SigningKeyError(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("corrupt signature field: {0}")]
    CorruptSignatureField(String),
    #[error("malformed PDF structure: {0}")]
    MalformedPdfStructure(String),
    #[error("invalid signature image: {0}")]
    SignatureImage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cryptographic backend error")]
    Crypto(#[from] ::openssl::error::ErrorStack),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl From<lopdf::Error> for Error {
    fn from(e: lopdf::Error) -> Self {
        Error::MalformedPdfStructure(e.to_string())
    }
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::CorruptSignatureField(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tunables of a signing operation.
#[derive(Debug, Clone)]
pub struct SignOptions<'a> {
    pub reason: &'a str,
    pub location: &'a str,
    /// Name of the signature form field. Made unique if the document already
    /// has a field with the same name.
    pub field_name: &'a str,
    /// Handwritten signature graphic drawn next to the description.
    pub image: Option<&'a SignatureImage>,
    /// Bytes reserved for the CMS blob inside `/Contents`.
    pub placeholder_size: usize,
    pub width: f32,
    pub height: f32,
}

impl Default for SignOptions<'_> {
    fn default() -> Self {
        Self {
            reason: "",
            location: "",
            field_name: DEFAULT_FIELD_NAME,
            image: None,
            placeholder_size: DEFAULT_PLACEHOLDER_SIZE,
            width: placement::DEFAULT_WIDTH,
            height: placement::DEFAULT_HEIGHT,
        }
    }
}

/// Signs a PDF with the first key found in a PKCS #12 keystore.
///
/// The signature is visible on the last page, placed below the existing
/// content. The returned buffer starts with the unmodified `pdf_bytes`; on
/// error nothing is returned and the input is untouched.
pub fn sign_pdf(
    pdf_bytes: &[u8],
    signature_image: Option<&SignatureImage>,
    reason: &str,
    location: &str,
    certificate_path: impl AsRef<Path>,
    certificate_password: &str,
) -> Result<Vec<u8>> {
    let bundle = CertificateStore::load(certificate_path, certificate_password)?;
    let options = SignOptions {
        reason,
        location,
        image: signature_image,
        ..Default::default()
    };
    sign_pdf_with(pdf_bytes, &options, &bundle)
}

/// Same as [`sign_pdf`], with an already loaded bundle and custom options.
pub fn sign_pdf_with(
    pdf_bytes: &[u8],
    options: &SignOptions,
    bundle: &CertificateBundle,
) -> Result<Vec<u8>> {
    let document = SignableDocument::parse(pdf_bytes)?;
    let placement = placement::locate_with_size(&document, options.width, options.height)?;

    let signer_name = bundle.signer_name().unwrap_or_else(|| "Unknown".to_string());
    let appearance = SignatureAppearance {
        signer_name: &signer_name,
        reason: options.reason,
        location: options.location,
        signing_time: Utc::now(),
        image: options.image,
        placeholder_size: options.placeholder_size,
    };

    let prepared = prepare_signature(&document, &placement, options.field_name, &appearance)?;
    let digest = prepared.digest();
    let cms = SignatureComposer::new(bundle).sign(&digest)?;
    let field_name = prepared.field_name().to_string();
    let signed = prepared.finalize(&cms)?;

    info!(
        "signed document as {signer_name:?} in field {field_name:?} ({} -> {} bytes)",
        pdf_bytes.len(),
        signed.len()
    );
    Ok(signed)
}

/// Tells whether the document has at least one signed signature field.
///
/// Input that can not be parsed as a PDF has no signatures.
pub fn has_digital_signature(pdf_bytes: &[u8]) -> bool {
    match document::load_document(pdf_bytes) {
        Ok(doc) => verifier::signature_fields(&doc)
            .map(|fields| !fields.is_empty())
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Verifies every signature of the document, one result per signature field.
pub fn get_signature_info(pdf_bytes: &[u8]) -> Result<Vec<VerificationResult>> {
    SignatureVerifier::new()?.verify(pdf_bytes)
}

/// Describes the certificate chain of the first key entry of a keystore.
pub fn load_certificate_chain(
    certificate_path: impl AsRef<Path>,
    certificate_password: &str,
) -> Result<Vec<CertificateInfo>> {
    CertificateStore::chain(certificate_path, certificate_password)?
        .iter()
        .map(|cert| CertificateInfo::from_x509(cert))
        .collect()
}
